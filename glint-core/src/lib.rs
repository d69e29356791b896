//! Glint protocol core.
//! Host-driven: no I/O; the host feeds scanned strings and ticks, and
//! polls for the frame to display next.

pub mod chunk;
pub mod identity;
pub mod mesh;
pub mod packet;
pub mod sack;
pub mod wire;

pub use chunk::{chunk, is_chunk_frame, ChunkAssembler, ChunkError};
pub use identity::{
    load_or_create, CryptoError, DeviceId, IdentityStore, Keypair, PublicKey, IDENTITY_STORE_KEY,
};
pub use mesh::{
    ChatMessage, DeliveryStatus, Direction, Mesh, MeshError, MeshEvent, Peer, SendStatus,
};
pub use packet::{MessageKind, Packet, PacketBody, WIRE_VERSION};
pub use sack::{AckRange, AckRanges};
pub use wire::{decode, encode, DecodeError, BROADCAST};
