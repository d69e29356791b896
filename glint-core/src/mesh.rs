//! Peer and mesh state machine: owns all per-peer session state and the
//! protocol's reaction to every packet type.
//!
//! Host-driven and single-threaded: the driver polls `next_outgoing` for
//! the frame to display, calls `check_retries` on a periodic tick, and
//! feeds every scanned string to `on_scanned`. No call blocks, and the
//! peer table is never mutated except through these operations. Time is
//! the logical tick advanced by `check_retries`; nothing here reads a
//! wall clock.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::chunk::{self, ChunkAssembler};
use crate::identity::{self, CryptoError, DeviceId, Keypair, PublicKey};
use crate::packet::{MessageKind, Packet, PacketBody};
use crate::sack::{AckRange, AckRanges};
use crate::wire;

/// Ticks a displayed packet waits before it is eligible for retransmission.
pub const DEFAULT_RETRY_TIMEOUT_TICKS: u64 = 10;
/// Retransmissions before a pending packet is declared failed.
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Body shown for a chat whose payload could not be decrypted. The packet
/// is acked regardless of payload fate, so the message must still exist.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[undecryptable message]";

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceId),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Delivery state of one sent packet. `Acked` and `Failed` are terminal;
/// a record never returns to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Pending,
    Acked,
    Failed,
}

#[derive(Debug, Clone)]
struct SentRecord {
    packet: Packet,
    /// Tick of the last confirmed display; 0 means never shown.
    displayed_tick: u64,
    retries: u32,
    status: SendStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One logical application message, joined to delivery tracking through
/// its packet number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub direction: Direction,
    pub peer: DeviceId,
    pub text: String,
    pub tick: u64,
    pub encrypted: bool,
    pub pn: Option<u64>,
}

/// Events surfaced to the driver, drained in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerDiscovered { peer: DeviceId },
    PeerUpdated { peer: DeviceId },
    PacketSent { peer: DeviceId, pn: u64 },
    PacketReceived { peer: DeviceId, pn: u64 },
    PacketAcked { peer: DeviceId, pn: u64 },
    PacketFailed { peer: DeviceId, pn: u64 },
    Chat(ChatMessage),
    OfferReceived { peer: DeviceId, offer: String },
    Error { message: String },
}

/// Per-sent-packet view for `delivery_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub pn: u64,
    pub status: SendStatus,
    pub retries: u32,
}

/// Per-remote-device session state. Key status is one-way: a peer goes
/// `unkeyed -> active` at most once, and the presence of the session key
/// is the sole signal of active status.
pub struct Peer {
    id: DeviceId,
    name: Option<String>,
    public_key: Option<PublicKey>,
    session_key: Option<[u8; 32]>,
    last_seen: u64,
    /// What we have received from them.
    received: AckRanges,
    /// What they have told us they received; replaced wholesale on every
    /// inbound SACK (the sender's own report is authoritative).
    acked_by_peer: AckRanges,
    sent: BTreeMap<u64, SentRecord>,
    pending_offer: Option<String>,
    ack_due: bool,
    /// Pure-ack frame awaiting display; caching it keeps its packet
    /// number stable across polls.
    ack_frame: Option<Packet>,
}

impl Peer {
    fn new(id: DeviceId, tick: u64) -> Self {
        Peer {
            id,
            name: None,
            public_key: None,
            session_key: None,
            last_seen: tick,
            received: AckRanges::new(),
            acked_by_peer: AckRanges::new(),
            sent: BTreeMap::new(),
            pending_offer: None,
            ack_due: false,
            ack_frame: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.session_key.is_some()
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn received(&self) -> &AckRanges {
        &self.received
    }

    pub fn acked_by_peer(&self) -> &AckRanges {
        &self.acked_by_peer
    }

    pub fn pending_offer(&self) -> Option<&str> {
        self.pending_offer.as_deref()
    }
}

/// The mesh state machine.
pub struct Mesh {
    keypair: Keypair,
    name: Option<String>,
    peers: BTreeMap<DeviceId, Peer>,
    /// Next outbound packet number, shared across all peers and every
    /// packet type except beacons. Monotonic, never reused.
    next_pn: u64,
    chat_log: Vec<ChatMessage>,
    events: VecDeque<MeshEvent>,
    assembler: ChunkAssembler,
    /// Logical clock, advanced by `check_retries`. Starts at 1 so that a
    /// displayed tick of 0 can mean "never shown".
    tick: u64,
    retry_timeout: u64,
    retry_budget: u32,
    beacon: Packet,
    /// Wrapping chunk-stream counter, so interleaved retransmissions
    /// reassemble cleanly on the peer.
    next_stream: u8,
}

impl Mesh {
    pub fn new(keypair: Keypair, name: Option<String>) -> Self {
        let beacon = Packet::beacon(keypair.device_id(), name.clone());
        Mesh {
            keypair,
            name,
            peers: BTreeMap::new(),
            next_pn: 1,
            chat_log: Vec::new(),
            events: VecDeque::new(),
            assembler: ChunkAssembler::new(),
            tick: 1,
            retry_timeout: DEFAULT_RETRY_TIMEOUT_TICKS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            beacon,
            next_stream: 0,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn set_retry_timeout(&mut self, ticks: u64) {
        self.retry_timeout = ticks.max(1);
    }

    pub fn set_retry_budget(&mut self, retries: u32) {
        self.retry_budget = retries;
    }

    /// Feed one scanned string: a chunk frame goes to the assembler, a
    /// bare frame is decoded directly. Malformed input is dropped here —
    /// a photographed frame may be garbage and that is never an error
    /// worth surfacing.
    pub fn on_scanned(&mut self, input: &str) {
        let frame = if chunk::is_chunk_frame(input) {
            match self.assembler.add(input) {
                Ok(Some(reassembled)) => reassembled,
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "dropping chunk frame");
                    return;
                }
            }
        } else {
            input.to_string()
        };
        match wire::decode(&frame) {
            Ok(packet) => self.process(packet),
            Err(e) => debug!(error = %e, "dropping undecodable frame"),
        }
    }

    /// Handle one decoded inbound packet.
    pub fn process(&mut self, packet: Packet) {
        let our = self.device_id();
        if packet.src == our {
            return;
        }
        if matches!(packet.dst, Some(dst) if dst != our) {
            return;
        }
        if let PacketBody::Beacon { name } = packet.body {
            self.on_beacon(packet.src, name);
            return;
        }
        let src = packet.src;
        if !self.peers.contains_key(&src) {
            self.peers.insert(src, Peer::new(src, self.tick));
            info!(peer = %src, "peer discovered");
            self.events.push_back(MeshEvent::PeerDiscovered { peer: src });
        }
        let duplicate;
        {
            let Some(peer) = self.peers.get_mut(&src) else {
                return;
            };
            peer.last_seen = self.tick;
            duplicate = peer.received.contains(packet.pn);
            peer.received.insert(packet.pn);
            // Pure acks are not themselves acknowledged, or two idle
            // devices would trade acks forever.
            if !matches!(packet.body, PacketBody::Ack) {
                peer.ack_due = true;
            }
        }
        self.events.push_back(MeshEvent::PacketReceived {
            peer: src,
            pn: packet.pn,
        });
        if !packet.acks.is_empty() {
            self.absorb_acks(src, &packet.acks);
        }
        if duplicate {
            debug!(peer = %src, pn = packet.pn, "duplicate packet, re-acking only");
            return;
        }
        match packet.body {
            PacketBody::Initial { public_key, name } => self.on_initial(src, public_key, name),
            PacketBody::Data {
                kind,
                encrypted,
                payload,
            } => self.on_data(src, packet.pn, kind, encrypted, payload),
            PacketBody::Ack | PacketBody::Beacon { .. } => {}
        }
    }

    fn on_beacon(&mut self, src: DeviceId, name: Option<String>) {
        match self.peers.get_mut(&src) {
            Some(peer) => {
                peer.last_seen = self.tick;
                if name.is_some() {
                    peer.name = name;
                }
                self.events.push_back(MeshEvent::PeerUpdated { peer: src });
            }
            None => {
                let mut peer = Peer::new(src, self.tick);
                peer.name = name;
                self.peers.insert(src, peer);
                info!(peer = %src, "peer discovered");
                self.events.push_back(MeshEvent::PeerDiscovered { peer: src });
            }
        }
    }

    /// SACK ranges arrive on every packet type, not only pure acks.
    fn absorb_acks(&mut self, src: DeviceId, ranges: &[AckRange]) {
        let Some(peer) = self.peers.get_mut(&src) else {
            return;
        };
        // Last write wins: the peer's report of its own received set is
        // authoritative and monotonic from its perspective. A peer that
        // restarts and regresses its ranges is a documented protocol
        // assumption, not something to second-guess here.
        match AckRanges::from_sorted(ranges) {
            Some(acked) => peer.acked_by_peer = acked,
            None => return,
        }
        let mut newly_acked = Vec::new();
        for (pn, record) in peer.sent.iter_mut() {
            if record.status == SendStatus::Pending && peer.acked_by_peer.contains(*pn) {
                record.status = SendStatus::Acked;
                newly_acked.push(*pn);
            }
        }
        for pn in newly_acked {
            self.events.push_back(MeshEvent::PacketAcked { peer: src, pn });
        }
    }

    /// The only path into `active` key status. On success the reciprocal
    /// `Initial` goes out immediately, carrying our current receive SACK:
    /// that bidirectional push is what gives later messages 0-RTT
    /// encryption without a blocking handshake round.
    fn on_initial(&mut self, src: DeviceId, public_key: PublicKey, name: Option<String>) {
        let already_active = self
            .peers
            .get(&src)
            .is_some_and(|p| p.session_key.is_some());
        if already_active {
            if let Some(peer) = self.peers.get_mut(&src) {
                if name.is_some() && peer.name != name {
                    peer.name = name;
                    self.events.push_back(MeshEvent::PeerUpdated { peer: src });
                }
            }
            return;
        }
        match self.keypair.session_key(&public_key) {
            Ok(key) => {
                if let Some(peer) = self.peers.get_mut(&src) {
                    peer.public_key = Some(public_key);
                    peer.session_key = Some(key);
                    if name.is_some() {
                        peer.name = name;
                    }
                }
                info!(peer = %src, "key exchange complete");
                self.events.push_back(MeshEvent::PeerUpdated { peer: src });
                self.queue_initial(src);
            }
            Err(e) => {
                warn!(peer = %src, error = %e, "rejected peer key material");
                self.events.push_back(MeshEvent::Error {
                    message: format!("key agreement with {src} failed: {e}"),
                });
            }
        }
    }

    fn on_data(
        &mut self,
        src: DeviceId,
        pn: u64,
        kind: MessageKind,
        encrypted: bool,
        payload: String,
    ) {
        let text = if encrypted {
            let key = self.peers.get(&src).and_then(|p| p.session_key);
            match key {
                Some(key) => match identity::open_text(&key, &payload) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        self.events.push_back(MeshEvent::Error {
                            message: format!("decryption failed for packet {pn} from {src}: {e}"),
                        });
                        None
                    }
                },
                None => {
                    self.events.push_back(MeshEvent::Error {
                        message: format!("encrypted packet {pn} from {src} but no session key"),
                    });
                    None
                }
            }
        } else {
            Some(payload)
        };
        match kind {
            MessageKind::Chat => {
                // The placeholder keeps the message in the log even when
                // the payload is lost; the pn was acked either way.
                let message = ChatMessage {
                    direction: Direction::Received,
                    peer: src,
                    text: text.unwrap_or_else(|| UNDECRYPTABLE_PLACEHOLDER.to_string()),
                    tick: self.tick,
                    encrypted,
                    pn: Some(pn),
                };
                self.chat_log.push(message.clone());
                self.events.push_back(MeshEvent::Chat(message));
            }
            MessageKind::Offer => {
                let Some(offer) = text else { return };
                if let Some(peer) = self.peers.get_mut(&src) {
                    peer.pending_offer = Some(offer.clone());
                }
                self.events.push_back(MeshEvent::OfferReceived { peer: src, offer });
            }
        }
    }

    /// Queue a chat message. Allocates the packet number, piggybacks the
    /// peer's current receive SACK, encrypts when the peer is active, and
    /// silently queues our `Initial` first when it is not (0-RTT). The
    /// returned packet number correlates with later `PacketAcked` /
    /// `PacketFailed` events.
    pub fn send_chat(&mut self, peer_id: DeviceId, text: &str) -> Result<u64, MeshError> {
        let pn = self.send_data(peer_id, MessageKind::Chat, text)?;
        let encrypted = self
            .peers
            .get(&peer_id)
            .is_some_and(|p| p.session_key.is_some());
        self.chat_log.push(ChatMessage {
            direction: Direction::Sent,
            peer: peer_id,
            text: text.to_string(),
            tick: self.tick,
            encrypted,
            pn: Some(pn),
        });
        Ok(pn)
    }

    /// Queue a connection-upgrade offer. Same path as chat, without a
    /// chat-log entry; the remote side stores it and surfaces an event,
    /// nothing more.
    pub fn send_offer(&mut self, peer_id: DeviceId, offer: &str) -> Result<u64, MeshError> {
        self.send_data(peer_id, MessageKind::Offer, offer)
    }

    fn send_data(
        &mut self,
        peer_id: DeviceId,
        kind: MessageKind,
        text: &str,
    ) -> Result<u64, MeshError> {
        let Some(peer) = self.peers.get(&peer_id) else {
            return Err(MeshError::UnknownPeer(peer_id));
        };
        let session_key = peer.session_key;
        if session_key.is_none() && !self.initial_pending(peer_id) {
            self.queue_initial(peer_id);
        }
        let (payload, encrypted) = match session_key {
            Some(key) => (identity::seal_text(&key, text)?, true),
            None => (text.to_string(), false),
        };
        Ok(self.queue_packet(
            peer_id,
            PacketBody::Data {
                kind,
                encrypted,
                payload,
            },
        ))
    }

    fn initial_pending(&self, peer_id: DeviceId) -> bool {
        self.peers.get(&peer_id).is_some_and(|p| {
            p.sent.values().any(|r| {
                r.status == SendStatus::Pending
                    && matches!(r.packet.body, PacketBody::Initial { .. })
            })
        })
    }

    fn queue_initial(&mut self, dst: DeviceId) {
        let body = PacketBody::Initial {
            public_key: self.keypair.public_key().clone(),
            name: self.name.clone(),
        };
        self.queue_packet(dst, body);
    }

    fn queue_packet(&mut self, dst: DeviceId, body: PacketBody) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        let src = self.device_id();
        if let Some(peer) = self.peers.get_mut(&dst) {
            let acks = peer.received.ranges().to_vec();
            let packet = Packet {
                src,
                dst: Some(dst),
                pn,
                acks,
                body,
            };
            peer.sent.insert(
                pn,
                SentRecord {
                    packet,
                    displayed_tick: 0,
                    retries: 0,
                    status: SendStatus::Pending,
                },
            );
            // This packet carries the SACK itself; a bare ack would be
            // redundant now.
            peer.ack_due = false;
            peer.ack_frame = None;
        }
        pn
    }

    /// The packet the driver should display next, in strict priority
    /// order: packets due for retransmission (oldest display first, so a
    /// backlog cannot starve retries), then never-displayed pending
    /// packets (lowest pn first), then a due pure ack, then the cached
    /// minimal beacon. Computing the candidate is not a transmission
    /// attempt; accounting happens in `mark_displayed`.
    pub fn next_outgoing(&mut self) -> Packet {
        let mut retry: Option<(u64, u64, DeviceId)> = None;
        let mut fresh: Option<(u64, DeviceId)> = None;
        for (id, peer) in &self.peers {
            for (pn, record) in &peer.sent {
                if record.status != SendStatus::Pending {
                    continue;
                }
                if record.displayed_tick == 0 {
                    if fresh.is_none_or(|(best_pn, _)| *pn < best_pn) {
                        fresh = Some((*pn, *id));
                    }
                } else if self.tick.saturating_sub(record.displayed_tick) >= self.retry_timeout
                    && record.retries < self.retry_budget
                {
                    let candidate = (record.displayed_tick, *pn, *id);
                    if retry.is_none_or(|best| (candidate.0, candidate.1) < (best.0, best.1)) {
                        retry = Some(candidate);
                    }
                }
            }
        }
        if let Some((_, pn, id)) = retry {
            if let Some(record) = self.peers.get(&id).and_then(|p| p.sent.get(&pn)) {
                return record.packet.clone();
            }
        }
        if let Some((pn, id)) = fresh {
            if let Some(record) = self.peers.get(&id).and_then(|p| p.sent.get(&pn)) {
                return record.packet.clone();
            }
        }
        if let Some(id) = self
            .peers
            .values()
            .find(|p| p.ack_due)
            .map(|p| p.id)
        {
            // Reuse the cached pn if this ack was already built, but
            // refresh its ranges; it has never been displayed.
            let pn = match self.peers.get(&id).and_then(|p| p.ack_frame.as_ref()) {
                Some(frame) => frame.pn,
                None => {
                    let pn = self.next_pn;
                    self.next_pn += 1;
                    pn
                }
            };
            let src = self.device_id();
            if let Some(peer) = self.peers.get_mut(&id) {
                let packet = Packet {
                    src,
                    dst: Some(id),
                    pn,
                    acks: peer.received.ranges().to_vec(),
                    body: PacketBody::Ack,
                };
                peer.ack_frame = Some(packet.clone());
                return packet;
            }
        }
        self.beacon.clone()
    }

    /// The next candidate packet rendered down to displayable frames:
    /// encoded to the wire form and chunked on a fresh stream id. The
    /// host shows the frames, then confirms with `mark_displayed` on the
    /// returned packet.
    pub fn next_display(&mut self) -> Result<(Packet, Vec<String>), chunk::ChunkError> {
        let packet = self.next_outgoing();
        let encoded = wire::encode(&packet);
        let stream = self.next_stream;
        self.next_stream = (self.next_stream + 1) % chunk::MAX_STREAMS;
        let frames = chunk::chunk(&encoded, stream)?;
        Ok((packet, frames))
    }

    /// Confirm that a frame was actually shown. Only now does the retry
    /// clock start (or a retry get counted): a candidate that was never
    /// rendered must not burn the retry budget.
    pub fn mark_displayed(&mut self, packet: &Packet) {
        if packet.is_beacon() {
            return;
        }
        let Some(dst) = packet.dst else {
            return;
        };
        if matches!(packet.body, PacketBody::Ack) {
            let mut shown = false;
            if let Some(peer) = self.peers.get_mut(&dst) {
                if peer.ack_frame.as_ref().map(|f| f.pn) == Some(packet.pn) {
                    peer.ack_frame = None;
                    peer.ack_due = false;
                    shown = true;
                }
            }
            if shown {
                self.events.push_back(MeshEvent::PacketSent {
                    peer: dst,
                    pn: packet.pn,
                });
            }
            return;
        }
        let tick = self.tick;
        let mut shown = false;
        if let Some(record) = self
            .peers
            .get_mut(&dst)
            .and_then(|p| p.sent.get_mut(&packet.pn))
        {
            if record.status == SendStatus::Pending {
                if record.displayed_tick > 0 {
                    record.retries += 1;
                }
                record.displayed_tick = tick;
                shown = true;
            }
        }
        if shown {
            self.events.push_back(MeshEvent::PacketSent {
                peer: dst,
                pn: packet.pn,
            });
        }
    }

    /// Advance the logical clock and fail every pending packet whose
    /// retry budget is spent and whose timeout has elapsed again. Runs as
    /// its own pass so failure detection does not depend on anyone
    /// polling for frames.
    pub fn check_retries(&mut self) {
        self.tick += 1;
        let mut failed = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            for (pn, record) in peer.sent.iter_mut() {
                if record.status == SendStatus::Pending
                    && record.displayed_tick > 0
                    && self.tick - record.displayed_tick >= self.retry_timeout
                    && record.retries >= self.retry_budget
                {
                    record.status = SendStatus::Failed;
                    failed.push((*id, *pn));
                }
            }
        }
        for (peer, pn) in failed {
            warn!(peer = %peer, pn, "packet failed after retry budget");
            self.events.push_back(MeshEvent::PacketFailed { peer, pn });
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer(&self, id: DeviceId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Delivery tracking for every packet still of interest toward one
    /// peer.
    pub fn delivery_status(&self, peer_id: DeviceId) -> Result<Vec<DeliveryStatus>, MeshError> {
        let peer = self
            .peers
            .get(&peer_id)
            .ok_or(MeshError::UnknownPeer(peer_id))?;
        Ok(peer
            .sent
            .values()
            .map(|r| DeliveryStatus {
                pn: r.packet.pn,
                status: r.status,
                retries: r.retries,
            })
            .collect())
    }

    /// Chat history, optionally filtered to one peer.
    pub fn chat_history(&self, peer: Option<DeviceId>) -> Vec<&ChatMessage> {
        self.chat_log
            .iter()
            .filter(|m| peer.is_none_or(|p| m.peer == p))
            .collect()
    }

    /// Drain queued events in emission order.
    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }
}
