//! Port sequence rotation.
//!
//! `MD5(secret || unix_minute)` is folded into a 64-bit seed for a
//! deterministic generator; ports are drawn from it until `count` distinct
//! values in `(1025, 65535)` have been collected. Client and server agree on
//! the sequence as long as they share the secret and the wall-clock minute.

use md5::{Digest, Md5};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::clock;
use crate::error::ProtoError;

/// Exclusive bounds.
const MIN_PORT: u16 = 1025;
const MAX_PORT: u16 = 65535;

/// Sequence indices travel as one byte.
pub const MAX_PORT_COUNT: usize = u8::MAX as usize + 1;

/// Ordered knock ports for the current minute.
pub fn derive_ports(secret: &str, count: usize) -> Result<Vec<u16>, ProtoError> {
    derive_ports_at(secret, count, clock::unix_minute(clock::now_unix()))
}

pub fn derive_ports_at(secret: &str, count: usize, minute: u64) -> Result<Vec<u16>, ProtoError> {
    if count > MAX_PORT_COUNT {
        return Err(ProtoError::PortCount(count));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed(secret, minute));
    let mut ports = Vec::with_capacity(count);
    while ports.len() != count {
        let port: u16 = rng.gen_range(0..=MAX_PORT);
        if port > MIN_PORT && port < MAX_PORT && !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}

fn seed(secret: &str, minute: u64) -> u64 {
    let mut hasher = Md5::new();
    hasher.update(secret.as_bytes());
    hasher.update(minute.to_string().as_bytes());
    let digest = hasher.finalize();

    let (high, low) = digest.split_at(8);
    let high = u64::from_be_bytes(high.try_into().unwrap_or_default());
    let low = u64::from_be_bytes(low.try_into().unwrap_or_default());
    high ^ low
}
