#![forbid(unsafe_code)]
//! Shared protocol pieces for sequenced UDP port knocking.
//!
//! A knock is a single authenticated datagram naming its position in a
//! sequence. The ports a sequence must hit are not configured anywhere:
//! both ends derive them from a shared secret and the current wall-clock
//! minute, see [`ports::derive_ports`].

pub mod auth;
pub mod clock;
pub mod error;
pub mod packet;
pub mod ports;
pub mod registry;

pub use auth::{KeyMaterial, Sealer, SigningKey, Verifier};
pub use error::{AuthError, ProtoError};
pub use packet::{Ack, ClientId, Knock, Packet, PacketType, SessionId, MAGIC};
pub use registry::{Registry, TrustedClient};
