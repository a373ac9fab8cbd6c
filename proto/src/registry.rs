//! Trusted clients and their replay watermarks.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::auth::KeyMaterial;
use crate::error::AuthError;
use crate::packet::ClientId;

#[derive(Debug, Clone)]
pub struct TrustedClient {
    pub id: ClientId,
    pub key: KeyMaterial,
    /// Largest nonce accepted so far; only strictly larger nonces pass.
    pub largest_nonce: u32,
}

impl TrustedClient {
    pub fn new(id: ClientId, key: KeyMaterial, largest_nonce: u32) -> Self {
        Self {
            id,
            key,
            largest_nonce,
        }
    }
}

/// Shared by every listener (reads) and the consumer (watermark writes).
#[derive(Debug, Default)]
pub struct Registry {
    clients: RwLock<HashMap<ClientId, TrustedClient>>,
}

impl Registry {
    pub fn new(clients: impl IntoIterator<Item = TrustedClient>) -> Self {
        let clients = clients.into_iter().map(|c| (c.id, c)).collect();
        Self {
            clients: RwLock::new(clients),
        }
    }

    pub fn len(&self) -> usize {
        self.read(|clients| clients.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn watermark(&self, id: &ClientId) -> Option<u32> {
        self.read(|clients| clients.get(id).map(|c| c.largest_nonce))
    }

    /// Runs `f` against the client under the read lock.
    pub fn with_client<R>(&self, id: &ClientId, f: impl FnOnce(&TrustedClient) -> R) -> Option<R> {
        self.read(|clients| clients.get(id).map(f))
    }

    /// Checks and moves the watermark in one step under the write lock, so two
    /// copies of the same knock can never both be accepted.
    pub fn advance(&self, id: &ClientId, nonce: u32) -> Result<(), AuthError> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        let client = clients.get_mut(id).ok_or(AuthError::UnknownClient)?;
        if nonce <= client.largest_nonce {
            return Err(AuthError::Replay {
                nonce,
                watermark: client.largest_nonce,
            });
        }
        client.largest_nonce = nonce;
        Ok(())
    }

    /// Clients ordered by id, for persistence.
    pub fn snapshot(&self) -> Vec<TrustedClient> {
        let mut clients: Vec<_> = self.read(|clients| clients.values().cloned().collect());
        clients.sort_by_key(|c| c.id);
        clients
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<ClientId, TrustedClient>) -> R) -> R {
        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        f(&clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new([
            TrustedClient::new("com1".parse().unwrap(), KeyMaterial::Shared(b"k1".to_vec()), 5),
            TrustedClient::new("com2".parse().unwrap(), KeyMaterial::Shared(b"k2".to_vec()), 0),
        ])
    }

    #[test]
    fn advance_is_strict() {
        let reg = registry();
        let id: ClientId = "com1".parse().unwrap();
        assert_eq!(
            reg.advance(&id, 5),
            Err(AuthError::Replay {
                nonce: 5,
                watermark: 5
            })
        );
        assert_eq!(reg.advance(&id, 6), Ok(()));
        assert_eq!(reg.watermark(&id), Some(6));
        assert!(reg.advance(&id, 6).is_err());
    }

    #[test]
    fn unknown_client() {
        let reg = registry();
        let id: ClientId = "nope".parse().unwrap();
        assert_eq!(reg.advance(&id, 1), Err(AuthError::UnknownClient));
        assert_eq!(reg.watermark(&id), None);
    }

    #[test]
    fn snapshot_is_sorted() {
        let reg = registry();
        let ids: Vec<String> = reg.snapshot().iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, ["com1", "com2"]);
        assert_eq!(reg.len(), 2);
    }
}
