//! The routing core.
//!
//! [`Router`] is synchronous and lives behind a single mutex: every peer
//! task locks it for the whole handling of one frame, which is the
//! cluster's run-to-completion contract. The async shell in the parent
//! module owns the sockets; the router only sees frame bodies and per-peer
//! outbound queues.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use otp_proto::{msgtypes, Channel, DatagramIter, CONTROL_MESSAGE};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub type PeerId = u64;

struct Peer {
    tx: mpsc::Sender<Bytes>,
    /// Channels in registration order; replay on disconnect walks this.
    channels: Vec<Channel>,
}

pub struct Router {
    peers: HashMap<PeerId, Peer>,
    participants: HashMap<Channel, PeerId>,
    queue: VecDeque<(Channel, Bytes)>,
    queue_limit: usize,
    post_removes: HashMap<Channel, VecDeque<Bytes>>,
}

impl Router {
    pub fn new(queue_limit: usize) -> Self {
        Self {
            peers: HashMap::new(),
            participants: HashMap::new(),
            queue: VecDeque::new(),
            queue_limit,
            post_removes: HashMap::new(),
        }
    }

    pub fn add_peer(&mut self, peer: PeerId, tx: mpsc::Sender<Bytes>) {
        self.peers.insert(peer, Peer { tx, channels: Vec::new() });
    }

    /// Channel currently bound to a participant?
    pub fn has_participant(&self, channel: Channel) -> bool {
        self.participants.contains_key(&channel)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle one frame received from `peer`. Control frames apply
    /// immediately; routed frames join the flush queue.
    pub fn handle_frame(&mut self, peer: PeerId, frame: Bytes) {
        self.process(Some(peer), frame);
    }

    fn process(&mut self, peer: Option<PeerId>, frame: Bytes) {
        let mut it = DatagramIter::new(&frame);
        let header = (|| -> otp_proto::Result<(u8, Channel)> {
            Ok((it.read_u8()?, it.read_u64()?))
        })();
        let (count, dst) = match header {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                return;
            }
        };

        if count == 1 && dst == CONTROL_MESSAGE {
            self.handle_control(peer, it, &frame);
        } else {
            self.enqueue(dst, frame);
        }
    }

    fn handle_control(&mut self, peer: Option<PeerId>, mut it: DatagramIter<'_>, frame: &Bytes) {
        let parsed = (|| -> otp_proto::Result<(u16, Channel)> {
            Ok((it.read_u16()?, it.read_u64()?))
        })();
        let (ctl_type, channel) = match parsed {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Dropping truncated control frame");
                return;
            }
        };

        match ctl_type {
            msgtypes::CONTROL_SET_CHANNEL => self.bind(peer, channel),
            msgtypes::CONTROL_REMOVE_CHANNEL => self.remove_channel(channel),
            msgtypes::CONTROL_ADD_POST_REMOVE => {
                // The rest of the frame is the pre-serialized inner datagram.
                let offset = frame.len() - it.remaining();
                let inner = frame.slice(offset..);
                self.post_removes.entry(channel).or_default().push_back(inner);
            }
            msgtypes::CONTROL_CLEAR_POST_REMOVE => {
                self.post_removes.remove(&channel);
            }
            msgtypes::CONTROL_SET_CON_NAME
            | msgtypes::CONTROL_SET_CON_URL
            | msgtypes::CONTROL_ADD_RANGE
            | msgtypes::CONTROL_REMOVE_RANGE => {
                debug!(ctl_type, channel, "Accepted inert control message");
            }
            other => {
                warn!(ctl_type = other, "Unknown control message type");
            }
        }
    }

    fn bind(&mut self, peer: Option<PeerId>, channel: Channel) {
        let Some(peer) = peer else {
            debug!(channel, "Ignoring channel bind during post-remove replay");
            return;
        };
        if let Some(bound) = self.participants.get(&channel) {
            if *bound != peer {
                warn!(channel, bound_peer = bound, "Rejecting bind of already-bound channel");
            }
            return;
        }
        let Some(record) = self.peers.get_mut(&peer) else {
            return;
        };
        self.participants.insert(channel, peer);
        record.channels.push(channel);
    }

    /// Replay the channel's post-removes, then unbind it.
    fn remove_channel(&mut self, channel: Channel) {
        self.replay_post_removes(channel);
        if let Some(peer) = self.participants.remove(&channel) {
            if let Some(record) = self.peers.get_mut(&peer) {
                record.channels.retain(|c| *c != channel);
            }
        }
    }

    fn replay_post_removes(&mut self, channel: Channel) {
        // Taken out before iterating: nested removals replay each queue
        // exactly once.
        let Some(pending) = self.post_removes.remove(&channel) else {
            return;
        };
        let owner = self.participants.get(&channel).copied();
        debug!(channel, count = pending.len(), "Replaying post-remove datagrams");
        for inner in pending {
            self.process(owner, inner);
        }
    }

    fn enqueue(&mut self, dst: Channel, frame: Bytes) {
        if dst == 0 {
            return;
        }
        if self.queue.len() >= self.queue_limit {
            warn!(dst, queued = self.queue.len(), "Routed-message queue full, dropping");
            return;
        }
        self.queue.push_back((dst, frame));
    }

    /// Drain the routed-message queue in FIFO order into peer writers.
    /// Forwarding is best-effort: unknown destinations are dropped, and a
    /// closed peer writer disconnects that peer.
    pub fn flush(&mut self) {
        let mut dead = Vec::new();

        while let Some((dst, frame)) = self.queue.pop_front() {
            let Some(peer) = self.participants.get(&dst) else {
                continue;
            };
            let Some(record) = self.peers.get(peer) else {
                continue;
            };
            match record.tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(dst, peer, "Peer outbound queue full, dropping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    if !dead.contains(peer) {
                        dead.push(*peer);
                    }
                }
            }
        }

        for peer in dead {
            warn!(peer, "Peer writer closed, cleaning up");
            self.disconnect(peer);
        }
    }

    /// Tear a peer down as if it had closed gracefully: replay each of its
    /// channels' post-removes in registration order, then drop the
    /// bindings and the peer record.
    pub fn disconnect(&mut self, peer: PeerId) {
        let Some(record) = self.peers.get(&peer) else {
            return;
        };
        let channels = record.channels.clone();

        for channel in channels {
            self.replay_post_removes(channel);
            if self.participants.get(&channel) == Some(&peer) {
                self.participants.remove(&channel);
            }
        }
        self.peers.remove(&peer);
    }
}
