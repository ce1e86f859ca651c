//! Master Server Client
//!
//! Line-based TCP link to a master (or stats) server. The link registers
//! the game port on every connect, forwards inbound lines to the server
//! loop and writes outbound lines. Lost connections are retried after
//! 30 s × attempt, giving up after 10 consecutive failures.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::network::bans::Ipv4Net;

/// Base reconnect delay, multiplied by the attempt number.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Consecutive failed attempts before giving up.
pub const MAX_ATTEMPTS: u32 = 10;

/// Master link errors.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// Socket failure.
    #[error("Master connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The server loop went away.
    #[error("Master event channel closed")]
    Closed,
}

/// Which link an event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MasterLink {
    /// Registration, global bans, auth.
    Master,
    /// Stats reporting and stats-domain auth.
    Stats,
}

/// Something happened on a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MasterEvent {
    /// Connected and registration sent.
    Connected,
    /// Inbound line, without the newline.
    Line(String),
    /// Connection lost.
    Disconnected,
}

/// Owner's side of a link.
#[derive(Debug)]
pub struct MasterHandle {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
    port: u16,
}

impl MasterHandle {
    /// Queue a line. Lines queued while disconnected are discarded on the
    /// next connect.
    pub fn send(&self, line: impl Into<String>) -> bool {
        self.outbound.send(line.into()).is_ok()
    }

    /// Sender for providers that write to this link.
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Send `regserv` again.
    pub fn register(&self) -> bool {
        self.send(format!("regserv {}", self.port))
    }

    /// True once the link has given up.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MasterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a link to `addr`, registering game port `port`.
pub fn spawn(
    link: MasterLink,
    addr: String,
    port: u16,
    events: mpsc::UnboundedSender<(MasterLink, MasterEvent)>,
) -> MasterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(link, addr, port, rx, events));
    MasterHandle {
        outbound: tx,
        task,
        port,
    }
}

async fn write_line(w: &mut OwnedWriteHalf, line: &str) -> Result<(), MasterError> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    Ok(())
}

async fn run(
    link: MasterLink,
    addr: String,
    port: u16,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<(MasterLink, MasterEvent)>,
) {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                attempt = 0;
                info!("Connected to {:?} server at {}", link, addr);
                match session(link, stream, port, &mut outbound, &events).await {
                    Ok(()) => return,
                    Err(MasterError::Closed) => return,
                    Err(e) => warn!("{:?} link lost: {}", link, e),
                }
                if events.send((link, MasterEvent::Disconnected)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("Cannot connect to {:?} server at {}: {}", link, addr, e),
        }
        attempt += 1;
        if attempt > MAX_ATTEMPTS {
            error!("Giving up on {:?} server at {} after {} attempts", link, addr, MAX_ATTEMPTS);
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY * attempt).await;
    }
}

/// One connected period. `Ok` when the owner dropped the handle.
async fn session(
    link: MasterLink,
    stream: TcpStream,
    port: u16,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<(MasterLink, MasterEvent)>,
) -> Result<(), MasterError> {
    while outbound.try_recv().is_ok() {}
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write_line(&mut write, &format!("regserv {}", port)).await?;
    events
        .send((link, MasterEvent::Connected))
        .map_err(|_| MasterError::Closed)?;

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    debug!(?link, line = %line, "master line");
                    events
                        .send((link, MasterEvent::Line(line)))
                        .map_err(|_| MasterError::Closed)?;
                }
                None => {
                    return Err(MasterError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            },
            out = outbound.recv() => match out {
                Some(line) => write_line(&mut write, &line).await?,
                None => return Ok(()),
            },
        }
    }
}

// =============================================================================
// INBOUND LINES
// =============================================================================

/// Master lines the server itself acts on. Auth replies go to the auth
/// providers instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MasterReply {
    /// Registration accepted.
    Registered,
    /// Registration refused.
    RegistrationFailed(String),
    /// Add a global ban.
    AddGlobalBan(Ipv4Net),
    /// Drop all global bans.
    ClearGlobalBans,
    /// Extensions the server supports.
    Supports(Vec<String>),
    /// Stats accepted.
    StatsAccepted,
    /// Stats refused.
    StatsRejected(String),
}

impl MasterReply {
    /// Parse a line. `None` for lines not meant for the server.
    pub fn parse(line: &str) -> Option<MasterReply> {
        let (cmd, rest) = match line.trim().split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (line.trim(), ""),
        };
        match cmd {
            "succreg" => Some(MasterReply::Registered),
            "failreg" => Some(MasterReply::RegistrationFailed(rest.to_string())),
            "addgban" => rest.parse().ok().map(MasterReply::AddGlobalBan),
            "cleargbans" => Some(MasterReply::ClearGlobalBans),
            "supports" => Some(MasterReply::Supports(
                rest.split_whitespace().map(str::to_string).collect(),
            )),
            "succstats" => Some(MasterReply::StatsAccepted),
            "failstats" => Some(MasterReply::StatsRejected(rest.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_replies() {
        assert_eq!(MasterReply::parse("succreg"), Some(MasterReply::Registered));
        assert_eq!(
            MasterReply::parse("failreg too many servers"),
            Some(MasterReply::RegistrationFailed("too many servers".into()))
        );
        assert_eq!(
            MasterReply::parse("addgban 10.0.0.0/8"),
            Some(MasterReply::AddGlobalBan("10.0.0.0/8".parse().unwrap()))
        );
        assert_eq!(MasterReply::parse("addgban garbage"), None);
        assert_eq!(
            MasterReply::parse("supports succstats"),
            Some(MasterReply::Supports(vec!["succstats".into()]))
        );
        assert_eq!(MasterReply::parse("chalauth 1 +ab"), None);
    }

    #[tokio::test]
    async fn test_link_registers_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = spawn(MasterLink::Master, addr, 28785, events_tx);

        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "regserv 28785");
        assert_eq!(events.recv().await.unwrap(), (MasterLink::Master, MasterEvent::Connected));

        write.write_all(b"succreg\n").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            (MasterLink::Master, MasterEvent::Line("succreg".into()))
        );

        assert!(handle.send("reqauth 1 bob"));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "reqauth 1 bob");

        drop(write);
        drop(lines);
        assert_eq!(
            events.recv().await.unwrap(),
            (MasterLink::Master, MasterEvent::Disconnected)
        );
    }
}
