//! Ordered key-value store on LMDB
//!
//! One writer, many snapshot readers.  All tables are keyed on raw
//! big-endian byte compositions so the store's lexicographic order is
//! the index order.
use crate::error::Result;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn, WithTls};
use std::fs;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Number of named tables (primary plus secondary indices).
const MAX_DBS: u32 = 8;

/// A range over borrowed byte slices that implements
/// `RangeBounds<[u8]>`.  Needed because the `Bytes` codec has an
/// unsized item type.
pub struct KeyRange<'a> {
    start: Bound<&'a [u8]>,
    end: Bound<&'a [u8]>,
}

impl<'a> KeyRange<'a> {
    /// Range including both endpoints.
    #[must_use]
    pub fn inclusive(start: &'a [u8], end: &'a [u8]) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    /// Range excluding the upper endpoint.
    #[must_use]
    pub fn upper_exclusive(start: &'a [u8], end: &'a [u8]) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Excluded(end),
        }
    }

    /// Range with no upper bound.
    #[must_use]
    pub fn lower_only(start: &'a [u8]) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Unbounded,
        }
    }
}

impl<'a> RangeBounds<[u8]> for KeyRange<'a> {
    fn start_bound(&self) -> Bound<&[u8]> {
        self.start
    }
    fn end_bound(&self) -> Bound<&[u8]> {
        self.end
    }
}

/// Handle to the relay's memory-mapped store and its tables.
#[derive(Clone)]
pub struct Store {
    env: Arc<Env>,
    /// Primary table: quadID(8) → received_at(8) ‖ event JSON
    pub(crate) events: Database<Bytes, Bytes>,
    /// id(32) → quadID(8)
    pub(crate) by_id: Database<Bytes, Bytes>,
    /// pubkey(32) ‖ kind(2) ‖ created_at(8) ‖ quadID(8) → quadID(8)
    pub(crate) by_pubkey_kind: Database<Bytes, Bytes>,
    /// pubkey(32) ‖ created_at(8) ‖ quadID(8) → quadID(8)
    pub(crate) by_pubkey: Database<Bytes, Bytes>,
    /// kind(2) ‖ created_at(8) ‖ quadID(8) → quadID(8)
    pub(crate) by_kind: Database<Bytes, Bytes>,
    /// created_at(8) ‖ quadID(8) → quadID(8)
    pub(crate) by_created_at: Database<Bytes, Bytes>,
    /// letter(1) ‖ 0x00 ‖ value ‖ 0x00 ‖ created_at(8) ‖ quadID(8) → quadID(8)
    pub(crate) by_tag: Database<Bytes, Bytes>,
    /// pubkey(32) ‖ kind(2) ‖ d-value → quadID(8)
    pub(crate) replaceable: Database<Bytes, Bytes>,
}

impl Store {
    /// Open (or create) the store under the given directory.
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: u64) -> Result<Self> {
        fs::create_dir_all(&path)?;
        let mut env_builder = EnvOpenOptions::new();
        env_builder.max_dbs(MAX_DBS);
        env_builder.map_size((map_size_mb as usize) * 1024 * 1024);
        let env = unsafe { env_builder.open(&path)? };

        let mut wtxn = env.write_txn()?;
        let events = env.create_database(&mut wtxn, Some("events"))?;
        let by_id = env.create_database(&mut wtxn, Some("by_id"))?;
        let by_pubkey_kind = env.create_database(&mut wtxn, Some("by_pubkey_kind"))?;
        let by_pubkey = env.create_database(&mut wtxn, Some("by_pubkey"))?;
        let by_kind = env.create_database(&mut wtxn, Some("by_kind"))?;
        let by_created_at = env.create_database(&mut wtxn, Some("by_created_at"))?;
        let by_tag = env.create_database(&mut wtxn, Some("by_tag"))?;
        let replaceable = env.create_database(&mut wtxn, Some("replaceable"))?;
        wtxn.commit()?;
        info!(
            "opened store at {:?} (map size {} MB)",
            path.as_ref(),
            map_size_mb
        );

        Ok(Self {
            env: Arc::new(env),
            events,
            by_id,
            by_pubkey_kind,
            by_pubkey,
            by_kind,
            by_created_at,
            by_tag,
            replaceable,
        })
    }

    /// Begin a snapshot-isolated read transaction.  Never blocks the
    /// writer.
    pub fn txn_ro(&self) -> Result<RoTxn<'_, WithTls>> {
        Ok(self.env.read_txn()?)
    }

    /// Begin the write transaction.  Only the writer thread may call
    /// this; LMDB serializes writers internally.
    pub fn txn_rw(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Number of events in the primary table.
    pub fn num_events(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.events.len(txn)?)
    }

    /// Classify a store error: fatal errors (exhausted map, I/O)
    /// terminate the writer, everything else is retryable.
    #[must_use]
    pub fn is_fatal(err: &heed::Error) -> bool {
        match err {
            heed::Error::Io(_) => true,
            heed::Error::Mdb(e) => matches!(
                e,
                heed::MdbError::MapFull | heed::MdbError::Panic | heed::MdbError::Corrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_put_get() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = Store::open(dir.path(), 16)?;
        let mut txn = store.txn_rw()?;
        store.events.put(&mut txn, b"k1", b"v1")?;
        txn.commit()?;
        let txn = store.txn_ro()?;
        assert_eq!(store.events.get(&txn, b"k1")?, Some(&b"v1"[..]));
        assert_eq!(store.num_events(&txn)?, 1);
        Ok(())
    }

    #[test]
    fn reverse_range_order() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = Store::open(dir.path(), 16)?;
        let mut txn = store.txn_rw()?;
        for k in [b"a1", b"a2", b"a3", b"b1"] {
            store.by_created_at.put(&mut txn, k, b"")?;
        }
        txn.commit()?;
        let txn = store.txn_ro()?;
        let range = KeyRange::inclusive(b"a1", b"a3");
        let keys: Vec<Vec<u8>> = store
            .by_created_at
            .rev_range(&txn, &range)?
            .map(|r| r.map(|(k, _)| k.to_vec()))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(keys, vec![b"a3".to_vec(), b"a2".to_vec(), b"a1".to_vec()]);
        Ok(())
    }

    #[test]
    fn upper_exclusive_range() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = Store::open(dir.path(), 16)?;
        let mut txn = store.txn_rw()?;
        for k in [b"a1", b"a2", b"a3"] {
            store.by_kind.put(&mut txn, k, b"")?;
        }
        txn.commit()?;
        let txn = store.txn_ro()?;
        let range = KeyRange::upper_exclusive(b"a1", b"a3");
        let n = store.by_kind.range(&txn, &range)?.count();
        assert_eq!(n, 2);
        Ok(())
    }
}
