//! Position and Client-Frame Relay
//!
//! Clients publish positions and client frames at their own pace; a flush
//! every 33 ms forwards them in batches.
//!
//! ```text
//!   positions (channel 0, unreliable)     only the newest per client
//!   ┌─────┬─────┬─────┐
//!   │ P0  │ P1  │ P2  │   combined buffer, ascending cn
//!   └─────┴─────┴─────┘
//!   to 1:  P0 ++ P2      prefix before own payload + suffix after it
//!
//!   client frames (channel 1, reliable)   everything since the last flush
//!   Client(cn) len payload   for each other client with pending frames
//! ```
//!
//! Publishing never blocks on the network: it only appends under the
//! relay's mutex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::packet::Packet;
use crate::network::protocol::{Msg, MESSAGE_CHANNEL, POSITION_CHANNEL};

/// Flush interval.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(33);

/// Delivers one datagram: channel, payload, reliable.
pub type Sender = Box<dyn Fn(u8, &[u8], bool) + Send>;

#[derive(Default)]
struct RelayState {
    senders: BTreeMap<u32, Sender>,
    positions: BTreeMap<u32, Vec<u8>>,
    frames: BTreeMap<u32, Vec<u8>>,
}

/// Shared relay. Cloning yields another handle to the same relay.
#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<Mutex<RelayState>>,
}

/// Publishes one client's positions.
pub struct PositionPublisher {
    cn: u32,
    state: Arc<Mutex<RelayState>>,
}

impl PositionPublisher {
    /// Replace the pending position.
    pub fn publish(&self, payload: &[u8]) {
        if let Ok(mut s) = self.state.lock() {
            if s.senders.contains_key(&self.cn) {
                s.positions.insert(self.cn, payload.to_vec());
            }
        }
    }
}

/// Publishes one client's reliable client frames.
pub struct FramePublisher {
    cn: u32,
    state: Arc<Mutex<RelayState>>,
}

impl FramePublisher {
    /// Append to the pending frames.
    pub fn publish(&self, payload: &[u8]) {
        if let Ok(mut s) = self.state.lock() {
            if s.senders.contains_key(&self.cn) {
                s.frames.entry(self.cn).or_default().extend_from_slice(payload);
            }
        }
    }
}

impl Relay {
    /// Empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Returns `None` if `cn` is already registered.
    pub fn add(&self, cn: u32, sender: Sender) -> Option<(PositionPublisher, FramePublisher)> {
        let mut s = self.state.lock().ok()?;
        if s.senders.contains_key(&cn) {
            return None;
        }
        s.senders.insert(cn, sender);
        Some((
            PositionPublisher { cn, state: Arc::clone(&self.state) },
            FramePublisher { cn, state: Arc::clone(&self.state) },
        ))
    }

    /// Unregister a client and drop whatever it had pending.
    pub fn remove(&self, cn: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.senders.remove(&cn);
            s.positions.remove(&cn);
            s.frames.remove(&cn);
        }
    }

    /// True if nothing is waiting to be flushed.
    pub fn is_idle(&self) -> bool {
        self.state
            .lock()
            .map_or(true, |s| s.positions.is_empty() && s.frames.is_empty())
    }

    /// Forward everything pending and clear the buffers.
    pub fn flush(&self) {
        let Ok(mut s) = self.state.lock() else { return };
        let s = &mut *s;
        if !s.positions.is_empty() {
            Self::flush_positions(&s.senders, &s.positions);
            s.positions.clear();
        }
        if !s.frames.is_empty() {
            Self::flush_frames(&s.senders, &s.frames);
            s.frames.clear();
        }
    }

    fn flush_positions(senders: &BTreeMap<u32, Sender>, positions: &BTreeMap<u32, Vec<u8>>) {
        let mut combined = Vec::new();
        let mut spans = BTreeMap::new();
        for (&cn, payload) in positions {
            spans.insert(cn, (combined.len(), combined.len() + payload.len()));
            combined.extend_from_slice(payload);
        }
        for (cn, send) in senders {
            let (start, end) = spans.get(cn).copied().unwrap_or((combined.len(), combined.len()));
            if end - start == combined.len() {
                continue;
            }
            let mut out = Vec::with_capacity(combined.len() - (end - start));
            out.extend_from_slice(&combined[..start]);
            out.extend_from_slice(&combined[end..]);
            send(POSITION_CHANNEL, &out, false);
        }
    }

    fn flush_frames(senders: &BTreeMap<u32, Sender>, frames: &BTreeMap<u32, Vec<u8>>) {
        let chunks: Vec<(u32, Packet)> = frames
            .iter()
            .map(|(&cn, payload)| {
                let mut p = Packet::with_capacity(payload.len() + 8);
                p.put_int(Msg::Client.code())
                    .put_int(cn as i32)
                    .put_uint(payload.len() as u32)
                    .put_bytes(payload);
                (cn, p)
            })
            .collect();
        for (cn, send) in senders {
            let mut out = Packet::new();
            for (_, chunk) in chunks.iter().filter(|(from, _)| from != cn) {
                out.put_packet(chunk);
            }
            if !out.is_empty() {
                send(MESSAGE_CHANNEL, out.as_bytes(), true);
            }
        }
    }

    /// Flush every 33 ms until the task is aborted.
    pub fn spawn_flusher(&self) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                relay.flush();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Outbox = Arc<Mutex<Vec<(u8, Vec<u8>, bool)>>>;

    fn recorder() -> (Outbox, Sender) {
        let out: Outbox = Arc::default();
        let sink = Arc::clone(&out);
        let sender: Sender = Box::new(move |ch, data: &[u8], rel| {
            sink.lock().unwrap().push((ch, data.to_vec(), rel));
        });
        (out, sender)
    }

    fn setup(n: u32) -> (Relay, Vec<Outbox>, Vec<(PositionPublisher, FramePublisher)>) {
        let relay = Relay::new();
        let mut boxes = Vec::new();
        let mut pubs = Vec::new();
        for cn in 0..n {
            let (out, sender) = recorder();
            pubs.push(relay.add(cn, sender).unwrap());
            boxes.push(out);
        }
        (relay, boxes, pubs)
    }

    #[test]
    fn test_position_batching() {
        let (relay, boxes, pubs) = setup(3);
        pubs[0].0.publish(b"AA");
        pubs[1].0.publish(b"BBB");
        pubs[2].0.publish(b"C");
        relay.flush();

        assert_eq!(*boxes[0].lock().unwrap(), vec![(0, b"BBBC".to_vec(), false)]);
        assert_eq!(*boxes[1].lock().unwrap(), vec![(0, b"AAC".to_vec(), false)]);
        assert_eq!(*boxes[2].lock().unwrap(), vec![(0, b"AABBB".to_vec(), false)]);
        assert!(relay.is_idle());

        relay.flush();
        assert_eq!(boxes[0].lock().unwrap().len(), 1);
    }

    #[test]
    fn test_only_latest_position_is_sent() {
        let (relay, boxes, pubs) = setup(2);
        pubs[0].0.publish(b"old");
        pubs[0].0.publish(b"new");
        relay.flush();
        assert_eq!(*boxes[1].lock().unwrap(), vec![(0, b"new".to_vec(), false)]);
        // the publisher itself gets nothing
        assert!(boxes[0].lock().unwrap().is_empty());
    }

    #[test]
    fn test_client_frames() {
        let (relay, boxes, pubs) = setup(3);
        pubs[1].1.publish(&[5, 104, 105, 0]);
        pubs[1].1.publish(&[20, 4]);
        pubs[2].1.publish(&[32, 50]);
        relay.flush();

        let to0 = boxes[0].lock().unwrap().clone();
        assert_eq!(
            to0,
            vec![(1, vec![88, 1, 6, 5, 104, 105, 0, 20, 4, 88, 2, 2, 32, 50], true)]
        );
        let to1 = boxes[1].lock().unwrap().clone();
        assert_eq!(to1, vec![(1, vec![88, 2, 2, 32, 50], true)]);
        assert!(relay.is_idle());
    }

    #[test]
    fn test_add_twice_and_remove() {
        let relay = Relay::new();
        let (_, s1) = recorder();
        let (_, s2) = recorder();
        let pubs = relay.add(0, s1).unwrap();
        assert!(relay.add(0, s2).is_none());

        pubs.0.publish(b"x");
        pubs.1.publish(b"y");
        relay.remove(0);
        assert!(relay.is_idle());
        // publishing after removal is dropped
        pubs.0.publish(b"x");
        assert!(relay.is_idle());
    }

    #[test]
    fn test_each_recipient_gets_every_other_position_once() {
        for n in 1..6u32 {
            let (relay, boxes, pubs) = setup(n);
            for (cn, (pos, _)) in pubs.iter().enumerate() {
                pos.publish(&[cn as u8; 3]);
            }
            relay.flush();
            for (cn, out) in boxes.iter().enumerate() {
                let out = out.lock().unwrap();
                if n == 1 {
                    assert!(out.is_empty());
                    continue;
                }
                let data = &out[0].1;
                assert_eq!(data.len(), 3 * (n as usize - 1));
                assert!(!data.contains(&(cn as u8)));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_task() {
        let (relay, boxes, pubs) = setup(2);
        let task = relay.spawn_flusher();
        pubs[0].0.publish(b"p");
        tokio::time::sleep(FLUSH_INTERVAL * 2).await;
        assert_eq!(boxes[1].lock().unwrap().len(), 1);
        task.abort();
    }
}
