//! Per-client knock assembly.
//!
//! Knocks arrive in any order. A session maps sequence index to the local
//! port the knock landed on; once the indices form `0..=max_sequence` the
//! session is complete and the consumer removes it, whatever the verdict.

use std::collections::{BTreeMap, HashMap};

use seqknock_proto::{ClientId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Knocked {
    port: u16,
    max_sequence: u8,
}

#[derive(Debug, Clone)]
pub struct KnockSession {
    id: SessionId,
    knocks: BTreeMap<u8, Knocked>,
}

impl KnockSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            knocks: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Last write wins per index, so a resent knock replaces its earlier copy.
    pub fn record(&mut self, sequence: u8, max_sequence: u8, port: u16) {
        self.knocks.insert(sequence, Knocked { port, max_sequence });
    }

    /// Indices are exactly `0, 1, .., n` and knock `n` declares itself last.
    pub fn is_complete(&self) -> bool {
        let mut expected: u16 = 0;
        let mut last = None;
        for (&sequence, knocked) in &self.knocks {
            if u16::from(sequence) != expected {
                return false;
            }
            expected += 1;
            last = Some((sequence, knocked.max_sequence));
        }
        matches!(last, Some((sequence, max)) if sequence == max)
    }

    /// Ports in sequence order.
    pub fn knock_sequence(&self) -> Vec<u16> {
        self.knocks.values().map(|k| k.port).collect()
    }
}

/// Sessions keyed by client. Owned by the consumer task alone.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<ClientId, KnockSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ClientId) -> Option<&KnockSession> {
        self.sessions.get(id)
    }

    pub fn get_or_create(
        &mut self,
        id: ClientId,
        new_id: impl FnOnce() -> SessionId,
    ) -> &mut KnockSession {
        self.sessions
            .entry(id)
            .or_insert_with(|| KnockSession::new(new_id()))
    }

    pub fn remove(&mut self, id: &ClientId) -> Option<KnockSession> {
        self.sessions.remove(id)
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> KnockSession {
        KnockSession::new(SessionId([1; 16]))
    }

    // Every permutation of n items, Heap's algorithm
    fn permutations(items: Vec<(u8, u16)>) -> Vec<Vec<(u8, u16)>> {
        fn heap(k: usize, items: &mut Vec<(u8, u16)>, out: &mut Vec<Vec<(u8, u16)>>) {
            if k <= 1 {
                out.push(items.clone());
                return;
            }
            heap(k - 1, items, out);
            for i in 0..k - 1 {
                let j = if k % 2 == 0 { i } else { 0 };
                items.swap(j, k - 1);
                heap(k - 1, items, out);
            }
        }
        let mut items = items;
        let mut out = Vec::new();
        let n = items.len();
        heap(n, &mut items, &mut out);
        out
    }

    #[test]
    fn empty_session_is_incomplete() {
        let s = session();
        assert!(!s.is_complete());
        assert!(s.knock_sequence().is_empty());
    }

    #[test]
    fn assembly_is_order_independent() {
        let knocks: Vec<(u8, u16)> = vec![(0, 4000), (1, 5000), (2, 6000), (3, 7000)];
        let max = 3;
        let perms = permutations(knocks.clone());
        assert_eq!(perms.len(), 24);

        for perm in perms {
            let mut s = session();
            for (i, &(seq, port)) in perm.iter().enumerate() {
                assert!(!s.is_complete(), "complete before knock {} of {:?}", i, perm);
                s.record(seq, max, port);
            }
            assert!(s.is_complete(), "incomplete after {:?}", perm);
            assert_eq!(s.knock_sequence(), vec![4000, 5000, 6000, 7000]);
        }
    }

    #[test]
    fn gaps_are_incomplete() {
        let mut s = session();
        s.record(0, 2, 1);
        s.record(2, 2, 3);
        assert!(!s.is_complete());
        s.record(1, 2, 2);
        assert!(s.is_complete());
    }

    #[test]
    fn last_knock_must_declare_itself_last() {
        let mut s = session();
        s.record(0, 3, 1);
        s.record(1, 3, 2);
        assert!(!s.is_complete());

        // single knock sequence
        let mut s = session();
        s.record(0, 0, 9);
        assert!(s.is_complete());
    }

    #[test]
    fn resend_overwrites_index() {
        let mut s = session();
        s.record(0, 1, 1111);
        s.record(0, 1, 2222);
        s.record(1, 1, 3333);
        assert_eq!(s.knock_sequence(), vec![2222, 3333]);
    }

    #[test]
    fn table_creates_once() {
        let mut table = SessionTable::new();
        let id: ClientId = "com1".parse().unwrap();
        let mut created = 0;
        table.get_or_create(id, || {
            created += 1;
            SessionId([2; 16])
        });
        table
            .get_or_create(id, || {
                created += 1;
                SessionId([3; 16])
            })
            .record(0, 0, 1);
        assert_eq!(created, 1);
        assert_eq!(table.get(&id).unwrap().id(), SessionId([2; 16]));
        assert!(table.remove(&id).is_some());
        assert!(table.get(&id).is_none());
    }
}
