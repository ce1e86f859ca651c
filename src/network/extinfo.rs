//! Server Info Queries
//!
//! Server browsers query a UDP socket at the game port + 1. Every reply
//! starts with the request bytes echoed back.
//!
//! ```text
//!   request          reply (after the echo)
//!   <n != 0>         clients, attrs, protocol, mode, secs left, max clients,
//!                    mastermode, [paused, speed], map, description
//!   0 0 [m]          -1, 105, uptime secs, [mod id]
//!   0 1 <cn | -1>    -1, 105, 0|1 (error), then one packet of ids (-10, cn*)
//!                    and one packet per player (-11, stats...)
//!   0 2              -1, 105, 0|1 (teamless), mode, secs left,
//!                    (team, score, -1)*
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::packet::Packet;
use crate::game::mode::GameMode;
use crate::network::clients::ClientManager;
use crate::network::protocol::{MasterMode, EXTINFO_VERSION, PROTOCOL_VERSION};
use crate::network::transport::TransportError;

const EXT_UPTIME: i32 = 0;
const EXT_PLAYERSTATS: i32 = 1;
const EXT_TEAMSCORE: i32 = 2;

const EXT_ACK: i32 = -1;
const EXT_NO_ERROR: i32 = 0;
const EXT_ERROR: i32 = 1;
const EXT_PLAYERSTATS_RESP_IDS: i32 = -10;
const EXT_PLAYERSTATS_RESP_STATS: i32 = -11;

/// Identifies this server implementation in uptime replies.
pub const SERVER_MOD_ID: i32 = -9;

/// Game speed reported while paused.
const GAME_SPEED: i32 = 100;

/// A query waiting for the server loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoRequest {
    /// Sender.
    pub addr: SocketAddr,
    /// Raw request.
    pub data: Vec<u8>,
}

/// State a reply is built from.
pub struct InfoView<'a> {
    /// Connected clients.
    pub clients: &'a ClientManager,
    /// Running mode.
    pub mode: &'a GameMode,
    /// Current map.
    pub map: &'a str,
    /// Server description.
    pub description: &'a str,
    /// Access policy.
    pub mastermode: MasterMode,
    /// Time since start.
    pub uptime: Duration,
}

/// The query socket.
pub struct InfoSocket {
    socket: Arc<UdpSocket>,
}

impl InfoSocket {
    /// Bind and start forwarding requests.
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::UnboundedReceiver<InfoRequest>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server info queries on {}", addr);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (len, addr) = match reader.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("info query receive failed: {}", e);
                        continue;
                    }
                };
                let req = InfoRequest {
                    addr,
                    data: buf[..len].to_vec(),
                };
                if tx.send(req).is_err() {
                    return;
                }
            }
        });
        Ok((Self { socket }, rx))
    }

    /// Answer a request.
    pub fn reply(&self, req: &InfoRequest, view: &InfoView<'_>) {
        for p in respond(&req.data, view) {
            if let Err(e) = self.socket.try_send_to(p.as_bytes(), req.addr) {
                debug!(addr = %req.addr, "info reply failed: {}", e);
            }
        }
    }
}

/// Build the replies to one request. Empty for malformed requests.
pub fn respond(request: &[u8], view: &InfoView<'_>) -> Vec<Packet> {
    let mut req = Packet::from_bytes(request.to_vec());
    let mut header = Packet::from_bytes(request.to_vec());
    let Some(first) = req.get_int() else {
        return Vec::new();
    };
    if first != 0 {
        basic_info(&mut header, view);
        return vec![header];
    }
    header.put_int(EXT_ACK).put_int(EXTINFO_VERSION);
    match req.get_int() {
        Some(EXT_UPTIME) => {
            header.put_int(view.uptime.as_secs() as i32);
            if req.get_int().map_or(false, |m| m > 0) {
                header.put_int(SERVER_MOD_ID);
            }
            vec![header]
        }
        Some(EXT_PLAYERSTATS) => player_stats(header, req.get_int().unwrap_or(-1), view),
        Some(EXT_TEAMSCORE) => {
            team_scores(&mut header, view);
            vec![header]
        }
        _ => Vec::new(),
    }
}

fn basic_info(p: &mut Packet, view: &InfoView<'_>) {
    let paused = view.mode.is_paused();
    p.put_int(view.clients.joined().count() as i32)
        .put_int(if paused { 7 } else { 5 })
        .put_int(PROTOCOL_VERSION)
        .put_int(view.mode.id().0)
        .put_int(view.mode.time_left().as_secs() as i32)
        .put_int(view.clients.max_clients() as i32)
        .put_int(view.mastermode.code());
    if paused {
        p.put_int(1).put_int(GAME_SPEED);
    }
    p.put_string(view.map).put_string(view.description);
}

fn player_stats(mut header: Packet, cn: i32, view: &InfoView<'_>) -> Vec<Packet> {
    let valid = cn == -1
        || u32::try_from(cn)
            .ok()
            .and_then(|cn| view.clients.get(cn))
            .map_or(false, |c| c.joined);
    if !valid {
        header.put_int(EXT_ERROR);
        return vec![header];
    }
    header.put_int(EXT_NO_ERROR);

    let players: Vec<_> = view
        .clients
        .joined()
        .filter(|c| cn == -1 || c.cn as i32 == cn)
        .collect();

    let mut ids = Packet::new();
    ids.put_packet(&header).put_int(EXT_PLAYERSTATS_RESP_IDS);
    for c in &players {
        ids.put_int(c.cn as i32);
    }
    let mut out = vec![ids];

    for c in players {
        let mut p = Packet::new();
        p.put_packet(&header)
            .put_int(EXT_PLAYERSTATS_RESP_STATS)
            .put_int(c.cn as i32)
            .put_int(c.ping)
            .put_string(&c.name)
            .put_string(&c.team)
            .put_int(c.state.frags)
            .put_int(c.state.flags)
            .put_int(c.state.deaths)
            .put_int(c.state.teamkills)
            .put_int(c.state.accuracy())
            .put_int(c.state.reported_health())
            .put_int(c.state.armour)
            .put_int(c.state.selected_weapon.id())
            .put_int(c.role.code())
            .put_int(c.state.life.id());
        let ip = c.ipv4().map_or([0; 4], |ip| ip.octets());
        p.put_bytes(&ip[..3]);
        out.push(p);
    }
    out
}

fn team_scores(p: &mut Packet, view: &InfoView<'_>) {
    let teams = view.mode.teams();
    p.put_int(if teams.is_teamed() { EXT_NO_ERROR } else { EXT_ERROR })
        .put_int(view.mode.id().0)
        .put_int(view.mode.time_left().as_secs() as i32);
    if !teams.is_teamed() {
        return;
    }
    for team in teams.teams() {
        let score = if view.mode.flags().is_some() {
            team.score
        } else {
            team.frags
        };
        p.put_string(&team.name).put_int(score).put_int(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mode::testing::Harness;
    use crate::game::mode::{ModeId, ModeSettings};
    use crate::network::protocol::Role;

    fn view<'a>(h: &'a Harness, mode: &'a GameMode) -> InfoView<'a> {
        InfoView {
            clients: &h.clients,
            mode,
            map: "hallo",
            description: "test",
            mastermode: MasterMode::Open,
            uptime: Duration::from_secs(42),
        }
    }

    #[test]
    fn test_basic_info() {
        let h = Harness::new(2);
        let mode = GameMode::new(ModeId::INSTA, &ModeSettings::default()).unwrap();
        let replies = respond(&[1], &view(&h, &mode));
        assert_eq!(replies.len(), 1);
        let mut p = Packet::from_bytes(replies[0].as_bytes().to_vec());
        let ints: Vec<i32> = (0..8).map(|_| p.get_int().unwrap()).collect();
        assert_eq!(ints, vec![1, 2, 5, 259, 3, 600, 16, 0]);
        assert_eq!(p.get_string().as_deref(), Some("hallo"));
        assert_eq!(p.get_string().as_deref(), Some("test"));
    }

    #[test]
    fn test_uptime() {
        let h = Harness::new(0);
        let mode = GameMode::new(ModeId::FFA, &ModeSettings::default()).unwrap();
        let r = respond(&[0, 0], &view(&h, &mode));
        assert_eq!(r[0].as_bytes(), &[0, 0, 0xFF, 105, 42]);
        let r = respond(&[0, 0, 1], &view(&h, &mode));
        assert_eq!(r[0].as_bytes(), &[0, 0, 1, 0xFF, 105, 42, SERVER_MOD_ID as u8]);
    }

    #[test]
    fn test_player_stats() {
        let mut h = Harness::new(2);
        h.clients.get_mut(1).unwrap().role = Role::Admin;
        let mode = GameMode::new(ModeId::FFA, &ModeSettings::default()).unwrap();

        let r = respond(&[0, 1, 0xFF], &view(&h, &mode));
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].as_bytes(), &[0, 1, 0xFF, 0xFF, 105, 0, 0xF6, 0, 1]);
        let stats = r[2].as_bytes();
        assert_eq!(&stats[..7], &[0, 1, 0xFF, 0xFF, 105, 0, 0xF5]);
        assert_eq!(&stats[stats.len() - 3..], &[10, 0, 0]);

        let r = respond(&[0, 1, 1], &view(&h, &mode));
        assert_eq!(r.len(), 2);
        let r = respond(&[0, 1, 9], &view(&h, &mode));
        assert_eq!(r[0].as_bytes(), &[0, 1, 9, 0xFF, 105, 1]);
    }

    #[test]
    fn test_team_scores() {
        let h = Harness::new(0);
        let ffa = GameMode::new(ModeId::FFA, &ModeSettings::default()).unwrap();
        let r = respond(&[0, 2], &view(&h, &ffa));
        assert_eq!(r[0].as_bytes(), &[0, 2, 0xFF, 105, 1, 0, 0x80, 0x58, 0x02]);

        let ctf = GameMode::new(ModeId::CTF, &ModeSettings::default()).unwrap();
        let r = respond(&[0, 2], &view(&h, &ctf));
        let mut p = Packet::from_bytes(r[0].as_bytes().to_vec());
        for _ in 0..4 {
            p.get_int();
        }
        assert_eq!(p.get_int(), Some(0));
        assert_eq!(p.get_int(), Some(11));
        assert_eq!(p.get_int(), Some(600));
        assert_eq!(p.get_string().as_deref(), Some("good"));
    }

    #[test]
    fn test_malformed() {
        let h = Harness::new(0);
        let mode = GameMode::new(ModeId::FFA, &ModeSettings::default()).unwrap();
        assert!(respond(&[], &view(&h, &mode)).is_empty());
        assert!(respond(&[0, 7], &view(&h, &mode)).is_empty());
    }
}
