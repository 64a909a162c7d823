//! Event schema and invariants over the key-value store
//!
//! The primary table maps the relay-local quadID to the stored
//! record; every secondary index maps a composite key back to the
//! quadID.  All mutation happens inside the writer's transaction.
use crate::error::{Error, Result};
use crate::event::Event;
use crate::store::{KeyRange, Store};
use heed::{RoTxn, RwTxn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Tag values longer than this are not indexed (they remain part of
/// the stored event and still match by direct filter evaluation).
pub const MAX_INDEXED_TAG_SIZE: usize = 255;

/// Result of attempting to install one event.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Outcome {
    /// Event was stored under a fresh quadID.
    Stored(u64),
    /// The event id is already present; nothing was written.
    Duplicate,
    /// Event was stored and displaced an older replaceable version.
    Replaced(u64),
    /// A newer version of this replaceable event exists; nothing was
    /// written.
    Shadowed,
}

impl Outcome {
    /// The quadID assigned by this outcome, when one was.
    #[must_use]
    pub fn quad_id(&self) -> Option<u64> {
        match self {
            Outcome::Stored(q) | Outcome::Replaced(q) => Some(*q),
            Outcome::Duplicate | Outcome::Shadowed => None,
        }
    }
}

/// Index key construction.  Keys are big-endian compositions so that
/// LMDB's byte order is (field, created_at, quadID) order.
pub(crate) mod keys {
    fn ts(created_at: i64) -> [u8; 8] {
        // negative timestamps sort with zero; admission windows make
        // them unreachable in practice
        (created_at.max(0) as u64).to_be_bytes()
    }

    pub fn pubkey_kind(pubkey: &[u8; 32], kind: u16, created_at: i64, quad: u64) -> [u8; 50] {
        let mut k = [0u8; 50];
        k[..32].copy_from_slice(pubkey);
        k[32..34].copy_from_slice(&kind.to_be_bytes());
        k[34..42].copy_from_slice(&ts(created_at));
        k[42..50].copy_from_slice(&quad.to_be_bytes());
        k
    }

    pub fn pubkey(pubkey: &[u8; 32], created_at: i64, quad: u64) -> [u8; 48] {
        let mut k = [0u8; 48];
        k[..32].copy_from_slice(pubkey);
        k[32..40].copy_from_slice(&ts(created_at));
        k[40..48].copy_from_slice(&quad.to_be_bytes());
        k
    }

    pub fn kind(kind: u16, created_at: i64, quad: u64) -> [u8; 18] {
        let mut k = [0u8; 18];
        k[..2].copy_from_slice(&kind.to_be_bytes());
        k[2..10].copy_from_slice(&ts(created_at));
        k[10..18].copy_from_slice(&quad.to_be_bytes());
        k
    }

    pub fn created_at(created_at: i64, quad: u64) -> [u8; 16] {
        let mut k = [0u8; 16];
        k[..8].copy_from_slice(&ts(created_at));
        k[8..16].copy_from_slice(&quad.to_be_bytes());
        k
    }

    pub fn tag(letter: u8, value: &str, created_at: i64, quad: u64) -> Vec<u8> {
        let mut k = Vec::with_capacity(2 + value.len() + 1 + 16);
        k.push(letter);
        k.push(0);
        k.extend_from_slice(value.as_bytes());
        k.push(0);
        k.extend_from_slice(&ts(created_at));
        k.extend_from_slice(&quad.to_be_bytes());
        k
    }

    pub fn replaceable(pubkey: &[u8; 32], kind: u16, d_value: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(34 + d_value.len());
        k.extend_from_slice(pubkey);
        k.extend_from_slice(&kind.to_be_bytes());
        k.extend_from_slice(d_value.as_bytes());
        k
    }

    /// Prefix of a tag-index key selecting one (letter, value) pair.
    pub fn tag_prefix(letter: u8, value: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(3 + value.len());
        k.push(letter);
        k.push(0);
        k.extend_from_slice(value.as_bytes());
        k.push(0);
        k
    }
}

/// Decode a quadID from an 8-byte index value.
pub(crate) fn quad_from(b: &[u8]) -> u64 {
    let mut q = [0u8; 8];
    q.copy_from_slice(&b[..8]);
    u64::from_be_bytes(q)
}

/// Encode the primary record: received_at followed by the event JSON.
fn encode_record(received_at: u64, event: &Event) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(event)?;
    let mut v = Vec::with_capacity(8 + json.len());
    v.extend_from_slice(&received_at.to_be_bytes());
    v.extend_from_slice(&json);
    Ok(v)
}

/// Decode a primary record into (received_at, event).
fn decode_record(raw: &[u8]) -> Result<(u64, Event)> {
    if raw.len() < 8 {
        return Err(Error::InternalError("truncated event record".into()));
    }
    let received_at = quad_from(&raw[..8]);
    let event: Event = serde_json::from_slice(&raw[8..])?;
    Ok((received_at, event))
}

/// Schema operations over the [`Store`].
#[derive(Clone)]
pub struct EventStore {
    store: Store,
}

impl EventStore {
    #[must_use]
    pub fn new(store: Store) -> Self {
        EventStore { store }
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The highest quadID in the primary table, or zero when empty.
    /// The writer recomputes this at startup to recover its counter.
    pub fn max_quad(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.store.events.last(txn)?.map_or(0, |(k, _)| quad_from(k)))
    }

    /// Install a validated event into the open write transaction.
    ///
    /// `last_quad` is the writer's allocation counter; a stored event
    /// advances it.  Ephemeral events must not be passed here.
    pub fn install(
        &self,
        txn: &mut RwTxn,
        event: &Event,
        received_at: u64,
        last_quad: &mut u64,
    ) -> Result<Outcome> {
        let id = event.id_bytes()?;
        // 1. duplicate id: no writes.
        if self.store.by_id.get(txn, &id)?.is_some() {
            return Ok(Outcome::Duplicate);
        }
        let pubkey = event.pubkey_bytes()?;

        // 2. replaceable kinds keep a single winner per key.
        let mut replaced = false;
        let mut replaceable_key = None;
        if event.is_replaceable() || event.is_param_replaceable() {
            let d = event.distinct_param().unwrap_or_default();
            let rkey = keys::replaceable(&pubkey, event.kind, &d);
            // decode the winner's position before mutating
            let prev_quad = self.store.replaceable.get(txn, &rkey)?.map(quad_from);
            if let Some(prev_quad) = prev_quad {
                if let Some((_, prev)) = self.get_by_quad(txn, prev_quad)? {
                    if prev.created_at > event.created_at
                        || (prev.created_at == event.created_at && prev.id > event.id)
                    {
                        return Ok(Outcome::Shadowed);
                    }
                    self.delete_by_quad(txn, prev_quad)?;
                    replaced = true;
                }
            }
            replaceable_key = Some(rkey);
        }

        // 3. allocate the next position in the log.
        let quad = *last_quad + 1;
        *last_quad = quad;
        let quad_bytes = quad.to_be_bytes();

        // 4. primary row plus one row per index.
        self.store
            .events
            .put(txn, &quad_bytes, &encode_record(received_at, event)?)?;
        self.store.by_id.put(txn, &id, &quad_bytes)?;
        self.store.by_pubkey_kind.put(
            txn,
            &keys::pubkey_kind(&pubkey, event.kind, event.created_at, quad),
            &quad_bytes,
        )?;
        self.store.by_pubkey.put(
            txn,
            &keys::pubkey(&pubkey, event.created_at, quad),
            &quad_bytes,
        )?;
        self.store.by_kind.put(
            txn,
            &keys::kind(event.kind, event.created_at, quad),
            &quad_bytes,
        )?;
        self.store.by_created_at.put(
            txn,
            &keys::created_at(event.created_at, quad),
            &quad_bytes,
        )?;
        for (letter, value) in event.index_tags() {
            if value.len() > MAX_INDEXED_TAG_SIZE {
                continue;
            }
            self.store.by_tag.put(
                txn,
                &keys::tag(letter, value, event.created_at, quad),
                &quad_bytes,
            )?;
        }
        if let Some(rkey) = replaceable_key {
            self.store.replaceable.put(txn, &rkey, &quad_bytes)?;
        }

        // deletion requests remove what they name, and are themselves
        // stored so deletion can be re-broadcast.
        if event.is_deletion() {
            self.process_deletion(txn, event, &pubkey)?;
        }

        if replaced {
            Ok(Outcome::Replaced(quad))
        } else {
            Ok(Outcome::Stored(quad))
        }
    }

    /// Remove each event named by an `e` tag of a deletion request,
    /// when it was authored by the same pubkey.  Deletion requests
    /// themselves are never deleted this way.
    fn process_deletion(&self, txn: &mut RwTxn, event: &Event, pubkey: &[u8; 32]) -> Result<()> {
        for target in event.tag_values_by_name("e") {
            let target_id = match hex::decode(&target) {
                Ok(b) if b.len() == 32 => b,
                _ => continue,
            };
            let quad = match self.store.by_id.get(txn, &target_id)? {
                Some(v) => quad_from(v),
                None => continue,
            };
            if let Some((_, named)) = self.get_by_quad(txn, quad)? {
                if named.is_deletion() {
                    continue;
                }
                if named.pubkey_bytes()? == *pubkey {
                    debug!("deleting event {} per deletion request", named.get_event_id_prefix());
                    self.delete_by_quad(txn, quad)?;
                }
            }
        }
        Ok(())
    }

    /// Delete an event and every index row that references it.
    /// Returns false when the quadID names nothing.
    pub fn delete_by_quad(&self, txn: &mut RwTxn, quad: u64) -> Result<bool> {
        let (_, event) = match self.get_by_quad(txn, quad)? {
            Some(r) => r,
            None => return Ok(false),
        };
        let id = event.id_bytes()?;
        let pubkey = event.pubkey_bytes()?;
        let quad_bytes = quad.to_be_bytes();

        self.store.by_id.delete(txn, &id)?;
        self.store.by_pubkey_kind.delete(
            txn,
            &keys::pubkey_kind(&pubkey, event.kind, event.created_at, quad),
        )?;
        self.store
            .by_pubkey
            .delete(txn, &keys::pubkey(&pubkey, event.created_at, quad))?;
        self.store
            .by_kind
            .delete(txn, &keys::kind(event.kind, event.created_at, quad))?;
        self.store
            .by_created_at
            .delete(txn, &keys::created_at(event.created_at, quad))?;
        for (letter, value) in event.index_tags() {
            if value.len() > MAX_INDEXED_TAG_SIZE {
                continue;
            }
            self.store
                .by_tag
                .delete(txn, &keys::tag(letter, value, event.created_at, quad))?;
        }
        if event.is_replaceable() || event.is_param_replaceable() {
            let d = event.distinct_param().unwrap_or_default();
            let rkey = keys::replaceable(&pubkey, event.kind, &d);
            // only clear the winner slot if it still points at us
            let winner = self.store.replaceable.get(txn, &rkey)?.map(quad_from);
            if winner == Some(quad) {
                self.store.replaceable.delete(txn, &rkey)?;
            }
        }
        self.store.events.delete(txn, &quad_bytes)?;
        trace!("deleted quad {}", quad);
        Ok(true)
    }

    /// Fetch the record at a log position.
    pub fn get_by_quad(&self, txn: &RoTxn, quad: u64) -> Result<Option<(u64, Event)>> {
        match self.store.events.get(txn, &quad.to_be_bytes())? {
            Some(raw) => Ok(Some(decode_record(raw)?)),
            None => Ok(None),
        }
    }

    /// Look up the quadID of an event id, if stored.
    pub fn get_quad_by_id(&self, txn: &RoTxn, id: &[u8]) -> Result<Option<u64>> {
        Ok(self.store.by_id.get(txn, id)?.map(quad_from))
    }

    /// All stored events with quadID in `(after, upto]`, in log order.
    pub fn scan_quad_range(&self, txn: &RoTxn, after: u64, upto: u64) -> Result<Vec<(u64, Event)>> {
        if upto <= after {
            return Ok(Vec::new());
        }
        let lower = (after + 1).to_be_bytes();
        let upper = upto.to_be_bytes();
        let range = KeyRange::inclusive(&lower, &upper);
        let mut out = Vec::new();
        for row in self.store.events.range(txn, &range)? {
            let (k, v) = row?;
            let (_, event) = decode_record(v)?;
            out.push((quad_from(k), event));
        }
        Ok(out)
    }
}

/// Short-lived holding area for ephemeral events.  These never touch
/// the store; the buffer lets monitor registration catch up on
/// ephemeral events fanned out between a scan snapshot and the
/// subscription hand-off.  A background task sweeps expired entries.
#[derive(Clone, Default)]
pub struct EphemeralBuffer {
    inner: Arc<Mutex<VecDeque<EphemeralEntry>>>,
}

struct EphemeralEntry {
    expires_at: u64,
    quad: u64,
    event: Arc<Event>,
}

impl EphemeralBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered ephemeral event.  Quads are appended in
    /// allocation order, so the deque stays sorted.
    pub fn push(&self, quad: u64, event: Arc<Event>, now: u64, retention_seconds: u64) {
        let mut q = self.inner.lock().expect("ephemeral lock");
        q.push_back(EphemeralEntry {
            expires_at: now + retention_seconds,
            quad,
            event,
        });
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep(&self, now: u64) -> usize {
        let mut q = self.inner.lock().expect("ephemeral lock");
        let before = q.len();
        while let Some(front) = q.front() {
            if front.expires_at <= now {
                q.pop_front();
            } else {
                break;
            }
        }
        before - q.len()
    }

    /// Entries with quadID in `(after, upto]`, oldest first.
    #[must_use]
    pub fn range(&self, after: u64, upto: u64) -> Vec<(u64, Arc<Event>)> {
        let q = self.inner.lock().expect("ephemeral lock");
        q.iter()
            .filter(|e| e.quad > after && e.quad <= upto)
            .map(|e| (e.quad, e.event.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ephemeral lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn test_store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path(), 16).unwrap();
        (dir, EventStore::new(store))
    }

    fn test_event(id_byte: u8, pubkey_byte: u8, kind: u16, created_at: i64) -> Event {
        Event {
            id: hex::encode([id_byte; 32]),
            pubkey: hex::encode([pubkey_byte; 32]),
            created_at,
            kind,
            tags: vec![],
            content: "test".into(),
            sig: hex::encode([0u8; 64]),
        }
    }

    fn install_one(es: &EventStore, event: &Event, last_quad: &mut u64) -> Outcome {
        let mut txn = es.store().txn_rw().unwrap();
        let outcome = es.install(&mut txn, event, 1000, last_quad).unwrap();
        txn.commit().unwrap();
        outcome
    }

    #[test]
    fn quad_ids_strictly_increase() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let mut prev = 0;
        for i in 1..=5u8 {
            let outcome = install_one(&es, &test_event(i, 1, 1, 1000 + i as i64), &mut last_quad);
            let quad = outcome.quad_id().unwrap();
            assert!(quad > prev);
            prev = quad;
        }
        let txn = es.store().txn_ro().unwrap();
        assert_eq!(es.max_quad(&txn).unwrap(), 5);
    }

    #[test]
    fn duplicate_id_not_rewritten() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let e = test_event(7, 1, 1, 1000);
        assert_eq!(install_one(&es, &e, &mut last_quad), Outcome::Stored(1));
        assert_eq!(install_one(&es, &e, &mut last_quad), Outcome::Duplicate);
        let txn = es.store().txn_ro().unwrap();
        assert_eq!(es.store().num_events(&txn).unwrap(), 1);
    }

    #[test]
    fn counter_recovery_matches_primary() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        install_one(&es, &test_event(1, 1, 1, 1000), &mut last_quad);
        install_one(&es, &test_event(2, 1, 1, 1001), &mut last_quad);
        let txn = es.store().txn_ro().unwrap();
        assert_eq!(es.max_quad(&txn).unwrap(), last_quad);
    }

    #[test]
    fn replaceable_newer_wins() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        // scenario: kind-0 events for one pubkey, created 100 then 50
        let first = test_event(1, 9, 0, 100);
        let older = test_event(2, 9, 0, 50);
        assert_eq!(install_one(&es, &first, &mut last_quad), Outcome::Stored(1));
        assert_eq!(install_one(&es, &older, &mut last_quad), Outcome::Shadowed);
        let txn = es.store().txn_ro().unwrap();
        assert_eq!(es.store().num_events(&txn).unwrap(), 1);
        let (_, kept) = es.get_by_quad(&txn, 1).unwrap().unwrap();
        assert_eq!(kept.id, first.id);
    }

    #[test]
    fn replaceable_replaces_older() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let older = test_event(1, 9, 0, 50);
        let newer = test_event(2, 9, 0, 100);
        assert_eq!(install_one(&es, &older, &mut last_quad), Outcome::Stored(1));
        assert_eq!(install_one(&es, &newer, &mut last_quad), Outcome::Replaced(2));
        let txn = es.store().txn_ro().unwrap();
        assert_eq!(es.store().num_events(&txn).unwrap(), 1);
        // the loser's index rows are gone with it
        assert!(es
            .get_quad_by_id(&txn, &older.id_bytes().unwrap())
            .unwrap()
            .is_none());
        assert!(es
            .get_quad_by_id(&txn, &newer.id_bytes().unwrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn replaceable_tie_breaks_on_greater_id() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let low_id = test_event(1, 9, 0, 100);
        let high_id = test_event(2, 9, 0, 100);
        assert_eq!(install_one(&es, &high_id, &mut last_quad), Outcome::Stored(1));
        // same created_at, lexicographically smaller id loses
        assert_eq!(install_one(&es, &low_id, &mut last_quad), Outcome::Shadowed);
        let txn = es.store().txn_ro().unwrap();
        let (_, kept) = es.get_by_quad(&txn, 1).unwrap().unwrap();
        assert_eq!(kept.id, high_id.id);
    }

    #[test]
    fn param_replaceable_keyed_on_d_tag() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let mut a = test_event(1, 9, 30_000, 100);
        a.tags = vec![vec!["d".into(), "alpha".into()]];
        let mut b = test_event(2, 9, 30_000, 100);
        b.tags = vec![vec!["d".into(), "beta".into()]];
        let mut a2 = test_event(3, 9, 30_000, 200);
        a2.tags = vec![vec!["d".into(), "alpha".into()]];
        assert_eq!(install_one(&es, &a, &mut last_quad), Outcome::Stored(1));
        // distinct d-value coexists
        assert_eq!(install_one(&es, &b, &mut last_quad), Outcome::Stored(2));
        // same d-value replaces
        assert_eq!(install_one(&es, &a2, &mut last_quad), Outcome::Replaced(3));
        let txn = es.store().txn_ro().unwrap();
        assert_eq!(es.store().num_events(&txn).unwrap(), 2);
    }

    #[test]
    fn deletion_removes_same_author_events() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let target = test_event(1, 9, 1, 100);
        let other_author = test_event(2, 8, 1, 100);
        install_one(&es, &target, &mut last_quad);
        install_one(&es, &other_author, &mut last_quad);

        let mut deletion = test_event(3, 9, 5, 200);
        deletion.tags = vec![
            vec!["e".into(), target.id.clone()],
            vec!["e".into(), other_author.id.clone()],
        ];
        assert_eq!(install_one(&es, &deletion, &mut last_quad), Outcome::Stored(3));

        let txn = es.store().txn_ro().unwrap();
        // the author's own event is gone
        assert!(es
            .get_quad_by_id(&txn, &target.id_bytes().unwrap())
            .unwrap()
            .is_none());
        // another author's event is untouched
        assert!(es
            .get_quad_by_id(&txn, &other_author.id_bytes().unwrap())
            .unwrap()
            .is_some());
        // the deletion itself is stored for re-broadcast
        assert!(es
            .get_quad_by_id(&txn, &deletion.id_bytes().unwrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn deletion_cannot_remove_deletions() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        let mut first_del = test_event(1, 9, 5, 100);
        first_del.tags = vec![vec!["e".into(), hex::encode([0x42; 32])]];
        install_one(&es, &first_del, &mut last_quad);

        let mut second_del = test_event(2, 9, 5, 200);
        second_del.tags = vec![vec!["e".into(), first_del.id.clone()]];
        install_one(&es, &second_del, &mut last_quad);

        let txn = es.store().txn_ro().unwrap();
        assert!(es
            .get_quad_by_id(&txn, &first_del.id_bytes().unwrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn scan_quad_range_bounds() {
        let (_dir, es) = test_store();
        let mut last_quad = 0;
        for i in 1..=5u8 {
            install_one(&es, &test_event(i, 1, 1, 1000), &mut last_quad);
        }
        let txn = es.store().txn_ro().unwrap();
        let rows = es.scan_quad_range(&txn, 2, 4).unwrap();
        let quads: Vec<u64> = rows.iter().map(|(q, _)| *q).collect();
        assert_eq!(quads, vec![3, 4]);
        assert!(es.scan_quad_range(&txn, 4, 4).unwrap().is_empty());
    }

    #[test]
    fn ephemeral_buffer_sweep_and_range() {
        let buf = EphemeralBuffer::new();
        let e = Arc::new(test_event(1, 1, 20_001, 100));
        buf.push(10, e.clone(), 1000, 300);
        buf.push(11, e, 1100, 300);
        assert_eq!(buf.range(9, 11).len(), 2);
        assert_eq!(buf.range(10, 11).len(), 1);
        // nothing expired yet
        assert_eq!(buf.sweep(1200), 0);
        // first entry expires at 1300
        assert_eq!(buf.sweep(1300), 1);
        assert_eq!(buf.len(), 1);
    }
}

