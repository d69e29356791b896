//! Glint packet model: typed packets and version.

use crate::identity::{DeviceId, PublicKey};
use crate::sack::AckRange;

/// Canonical wire version character. Earlier wire formats are superseded
/// and rejected on decode.
pub const WIRE_VERSION: char = '3';

/// Application message kinds carried by `Data` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A chat text message.
    Chat,
    /// A connection-upgrade offer (stored, never acted on automatically).
    Offer,
}

/// Type-specific packet fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// Minimal presence announcement. Exempt from packet-number
    /// bookkeeping: always pn 0, always broadcast, never acked.
    Beacon { name: Option<String> },
    /// Key exchange: the sender's public key, pushed lazily on first
    /// contact rather than eagerly at discovery.
    Initial {
        public_key: PublicKey,
        name: Option<String>,
    },
    /// Application payload. `payload` is opaque to the codec; when
    /// `encrypted` it is base64(nonce || ciphertext).
    Data {
        kind: MessageKind,
        encrypted: bool,
        payload: String,
    },
    /// Pure acknowledgment; carries only the SACK ranges of the header.
    Ack,
}

/// An immutable protocol packet.
///
/// `pn` is drawn from one monotonically increasing counter per sending
/// device, shared across all peers and packet types except `Beacon`, and
/// never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub src: DeviceId,
    /// `None` means broadcast.
    pub dst: Option<DeviceId>,
    pub pn: u64,
    /// Ranges the sender has received from the addressed peer.
    pub acks: Vec<AckRange>,
    pub body: PacketBody,
}

impl Packet {
    /// The minimal idle frame for a device.
    pub fn beacon(src: DeviceId, name: Option<String>) -> Self {
        Packet {
            src,
            dst: None,
            pn: 0,
            acks: Vec::new(),
            body: PacketBody::Beacon { name },
        }
    }

    pub fn is_beacon(&self) -> bool {
        matches!(self.body, PacketBody::Beacon { .. })
    }
}
