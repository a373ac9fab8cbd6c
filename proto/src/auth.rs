//! Knock authentication envelope.
//!
//! A sealed knock is `encoded_knock || tag` where the tag covers
//! `magic || type_id || fields`. Two backends exist: HMAC-SHA256 with a key
//! shared between client and server, and ML-DSA-65 signatures where the
//! server only holds each client's public key. The backend is picked by the
//! key material a client was registered with.

use hmac::{Hmac, Mac};
use pqcrypto_mldsa::mldsa65;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

use crate::error::{AuthError, ProtoError};
use crate::packet::{Knock, Packet};
use crate::registry::Registry;

type HmacSha256 = Hmac<Sha256>;

pub const HMAC_TAG_LEN: usize = 32;

/// Forward clock skew tolerated on knock timestamps.
pub const DEFAULT_MAX_SKEW_SECS: u32 = 10;

/// What the verifier holds for a client.
#[derive(Clone)]
pub enum KeyMaterial {
    Shared(Vec<u8>),
    Public(mldsa65::PublicKey),
}

impl KeyMaterial {
    pub fn public_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        mldsa65::PublicKey::from_bytes(bytes)
            .map(KeyMaterial::Public)
            .map_err(|_| ProtoError::InvalidKey)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KeyMaterial::Shared(key) => key.clone(),
            KeyMaterial::Public(pk) => pk.as_bytes().to_vec(),
        }
    }
}

// Never print key bytes
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Shared(_) => f.write_str("KeyMaterial::Shared(..)"),
            KeyMaterial::Public(_) => f.write_str("KeyMaterial::Public(..)"),
        }
    }
}

/// What a client signs with.
#[derive(Clone)]
pub enum SigningKey {
    Shared(Vec<u8>),
    Secret(mldsa65::SecretKey),
}

impl SigningKey {
    pub fn secret_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        mldsa65::SecretKey::from_bytes(bytes)
            .map(SigningKey::Secret)
            .map_err(|_| ProtoError::InvalidKey)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningKey::Shared(_) => f.write_str("SigningKey::Shared(..)"),
            SigningKey::Secret(_) => f.write_str("SigningKey::Secret(..)"),
        }
    }
}

fn hmac(key: &[u8]) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(key).map_err(|_| AuthError::InvalidKey)
}

/// Client side of the envelope.
#[derive(Debug, Clone)]
pub struct Sealer {
    key: SigningKey,
}

impl Sealer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn seal(&self, knock: &Knock) -> Result<Vec<u8>, AuthError> {
        let mut out = Packet::Knock(*knock).encode().to_vec();
        match &self.key {
            SigningKey::Shared(key) => {
                let mut mac = hmac(key)?;
                mac.update(&out);
                let tag = mac.finalize().into_bytes();
                out.extend_from_slice(&tag);
            }
            SigningKey::Secret(sk) => {
                let sig = mldsa65::detached_sign(&out, sk);
                out.extend_from_slice(sig.as_bytes());
            }
        }
        Ok(out)
    }
}

/// Server side of the envelope. Read-only against the registry: accepting a
/// knock does not move its watermark, the consumer does that with
/// [`Registry::advance`].
#[derive(Debug, Clone)]
pub struct Verifier {
    registry: Arc<Registry>,
    max_skew: u32,
}

impl Verifier {
    pub fn new(registry: Arc<Registry>, max_skew_secs: u32) -> Self {
        Self {
            registry,
            max_skew: max_skew_secs,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decode and authenticate one datagram. Checks run in order and the
    /// first failure wins: structure, known client, nonce above watermark,
    /// timestamp not from the future, tag.
    pub fn open(&self, datagram: &[u8], now: u32) -> Result<Knock, AuthError> {
        let knock = match Packet::decode(datagram)? {
            Packet::Knock(knock) => knock,
            _ => return Err(AuthError::Unauthenticated),
        };
        let signed_len = Packet::Knock(knock).encoded_len();
        let (signed, tag) = datagram.split_at(signed_len);

        self.registry
            .with_client(&knock.client_id(), |client| {
                if knock.nonce() <= client.largest_nonce {
                    return Err(AuthError::Replay {
                        nonce: knock.nonce(),
                        watermark: client.largest_nonce,
                    });
                }
                if knock.timestamp() > now.saturating_add(self.max_skew) {
                    return Err(AuthError::FromFuture {
                        timestamp: knock.timestamp(),
                        now,
                    });
                }
                verify_tag(&client.key, signed, tag)
            })
            .ok_or(AuthError::UnknownClient)??;

        Ok(knock)
    }
}

fn verify_tag(key: &KeyMaterial, signed: &[u8], tag: &[u8]) -> Result<(), AuthError> {
    match key {
        KeyMaterial::Shared(key) => {
            if tag.len() != HMAC_TAG_LEN {
                return Err(AuthError::BadTag);
            }
            let mut mac = hmac(key)?;
            mac.update(signed);
            mac.verify_slice(tag).map_err(|_| AuthError::BadTag)
        }
        KeyMaterial::Public(pk) => {
            let sig = mldsa65::DetachedSignature::from_bytes(tag).map_err(|_| AuthError::BadTag)?;
            mldsa65::verify_detached_signature(&sig, signed, pk).map_err(|_| AuthError::BadTag)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ClientId;
    use crate::registry::TrustedClient;

    const NOW: u32 = 1_700_000_000;

    fn id() -> ClientId {
        "com1".parse().unwrap()
    }

    fn hmac_pair(watermark: u32) -> (Sealer, Verifier) {
        let key = b"0123456789abcdef0123456789abcdef".to_vec();
        let registry = Registry::new([TrustedClient::new(
            id(),
            KeyMaterial::Shared(key.clone()),
            watermark,
        )]);
        (
            Sealer::new(SigningKey::Shared(key)),
            Verifier::new(Arc::new(registry), DEFAULT_MAX_SKEW_SECS),
        )
    }

    fn knock(nonce: u32) -> Knock {
        Knock::new(id(), nonce, NOW, 0, 2).unwrap()
    }

    #[test]
    fn hmac_seal_then_open() {
        let (sealer, verifier) = hmac_pair(0);
        let sealed = sealer.seal(&knock(1)).unwrap();
        assert_eq!(sealed.len(), 23 + HMAC_TAG_LEN);
        assert_eq!(verifier.open(&sealed, NOW), Ok(knock(1)));
        // open never moves the watermark
        assert_eq!(verifier.registry().watermark(&id()), Some(0));
    }

    #[test]
    fn every_flipped_bit_is_rejected() {
        let (sealer, verifier) = hmac_pair(0);
        let sealed = sealer.seal(&knock(100)).unwrap();
        for bit in 0..sealed.len() * 8 {
            let mut tampered = sealed.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);
            assert!(verifier.open(&tampered, NOW).is_err(), "bit {} accepted", bit);
        }
    }

    #[test]
    fn replay_after_acceptance() {
        let (sealer, verifier) = hmac_pair(0);
        let sealed = sealer.seal(&knock(7)).unwrap();
        verifier.open(&sealed, NOW).unwrap();
        verifier.registry().advance(&id(), 7).unwrap();

        assert_eq!(
            verifier.open(&sealed, NOW),
            Err(AuthError::Replay {
                nonce: 7,
                watermark: 7
            })
        );
        let older = sealer.seal(&knock(3)).unwrap();
        assert!(matches!(verifier.open(&older, NOW), Err(AuthError::Replay { .. })));
    }

    #[test]
    fn unknown_client_and_wrong_key() {
        let (_, verifier) = hmac_pair(0);
        let stranger = Knock::new("evil".parse().unwrap(), 1, NOW, 0, 0).unwrap();
        let sealed = Sealer::new(SigningKey::Shared(b"whatever".to_vec()))
            .seal(&stranger)
            .unwrap();
        assert_eq!(verifier.open(&sealed, NOW), Err(AuthError::UnknownClient));

        let sealed = Sealer::new(SigningKey::Shared(b"wrong key".to_vec()))
            .seal(&knock(1))
            .unwrap();
        assert_eq!(verifier.open(&sealed, NOW), Err(AuthError::BadTag));
    }

    #[test]
    fn future_timestamps_beyond_skew() {
        let (sealer, verifier) = hmac_pair(0);
        let ahead = Knock::new(id(), 1, NOW + 11, 0, 0).unwrap();
        assert!(matches!(
            verifier.open(&sealer.seal(&ahead).unwrap(), NOW),
            Err(AuthError::FromFuture { .. })
        ));
        let within = Knock::new(id(), 1, NOW + 10, 0, 0).unwrap();
        assert!(verifier.open(&sealer.seal(&within).unwrap(), NOW).is_ok());
    }

    #[test]
    fn missing_or_short_tag() {
        let (sealer, verifier) = hmac_pair(0);
        let sealed = sealer.seal(&knock(1)).unwrap();
        assert_eq!(verifier.open(&sealed[..23], NOW), Err(AuthError::BadTag));
        assert_eq!(verifier.open(&sealed[..40], NOW), Err(AuthError::BadTag));
        assert!(matches!(
            verifier.open(&sealed[..20], NOW),
            Err(AuthError::Malformed(ProtoError::InsufficientData { .. }))
        ));
    }

    #[test]
    fn non_knock_packets_are_unauthenticated() {
        let (_, verifier) = hmac_pair(0);
        let nonce = Packet::Nonce(None).encode();
        assert_eq!(verifier.open(&nonce, NOW), Err(AuthError::Unauthenticated));
    }

    #[test]
    fn signature_backend() {
        let (pk, sk) = mldsa65::keypair();
        let registry = Registry::new([TrustedClient::new(id(), KeyMaterial::Public(pk), 0)]);
        let verifier = Verifier::new(Arc::new(registry), DEFAULT_MAX_SKEW_SECS);
        let sealer = Sealer::new(SigningKey::Secret(sk));

        let mut sealed = sealer.seal(&knock(1)).unwrap();
        assert_eq!(verifier.open(&sealed, NOW), Ok(knock(1)));

        // flip a bit in the nonce field, then in the signature
        sealed[18] ^= 0x01;
        assert!(verifier.open(&sealed, NOW).is_err());
        sealed[18] ^= 0x01;
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert_eq!(verifier.open(&sealed, NOW), Err(AuthError::BadTag));
    }

    #[test]
    fn key_material_parsing() {
        assert_eq!(
            KeyMaterial::public_from_bytes(&[0u8; 12]).unwrap_err(),
            ProtoError::InvalidKey
        );
        let (pk, _) = mldsa65::keypair();
        let parsed = KeyMaterial::public_from_bytes(pk.as_bytes()).unwrap();
        assert_eq!(parsed.to_bytes(), pk.as_bytes());
        assert!(SigningKey::secret_from_bytes(b"short").is_err());
    }
}
