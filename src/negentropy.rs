//! Range-based set reconciliation
//!
//! Two relays holding sorted `(created_at, id)` sets exchange range
//! fingerprints, recursively splitting ranges that differ and
//! swapping literal id lists once ranges are small, converging on the
//! symmetric difference in O(√n) bandwidth.
use crate::conn::Outbound;
use crate::error::{Error, Result};
use crate::event_store::{quad_from, EventStore};
use crate::store::KeyRange;
use crate::subscription::ReqFilter;
use bitcoin_hashes::{sha256, Hash};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol version byte; the only version this relay speaks.
pub const PROTOCOL_VERSION: u8 = 0x61;
/// Event ids are full 32-byte hashes.
pub const ID_SIZE: usize = 32;
/// Fingerprints are the truncated hash of the range accumulator.
pub const FINGERPRINT_SIZE: usize = 16;
/// Ranges splitting produces this many sub-ranges.
const BUCKETS: usize = 16;
/// Breathing room kept under the frame size limit for one more range.
const FRAME_HEADROOM: usize = 200;

const MODE_SKIP: u64 = 0;
const MODE_FINGERPRINT: u64 = 1;
const MODE_ID_LIST: u64 = 2;

/// One element of the reconciled set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Item {
    pub timestamp: u64,
    pub id: [u8; ID_SIZE],
}

/// A range boundary: a timestamp plus an id prefix.  Items sort
/// relative to bounds by timestamp, then by id against the prefix.
#[derive(Clone, PartialEq, Eq, Debug)]
struct NegBound {
    timestamp: u64,
    id_prefix: Vec<u8>,
}

impl NegBound {
    fn zero() -> Self {
        NegBound {
            timestamp: 0,
            id_prefix: Vec::new(),
        }
    }

    fn infinity() -> Self {
        NegBound {
            timestamp: u64::MAX,
            id_prefix: Vec::new(),
        }
    }
}

fn item_less_than_bound(item: &Item, bound: &NegBound) -> bool {
    if item.timestamp != bound.timestamp {
        return item.timestamp < bound.timestamp;
    }
    let k = bound.id_prefix.len().min(ID_SIZE);
    item.id[..k] < bound.id_prefix[..k]
}

/// Big-endian base-128 varint with a continuation bit.
fn encode_varint(mut n: u64, out: &mut Vec<u8>) {
    if n == 0 {
        out.push(0);
        return;
    }
    let mut bytes = [0u8; 10];
    let mut len = 0;
    while n != 0 {
        bytes[len] = (n & 0x7f) as u8;
        n >>= 7;
        len += 1;
    }
    for i in (1..len).rev() {
        out.push(bytes[i] | 0x80);
    }
    out.push(bytes[0]);
}

fn decode_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut res: u64 = 0;
    loop {
        if *pos >= buf.len() {
            return Err(Error::NegentropyError("truncated varint"));
        }
        let b = buf[*pos];
        *pos += 1;
        res = res
            .checked_shl(7)
            .ok_or(Error::NegentropyError("varint overflow"))?
            | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            return Ok(res);
        }
    }
}

/// Delta codec for bound timestamps; a fresh one is used per message
/// direction.  Zero is reserved for infinity.
#[derive(Default)]
struct TimestampCodec {
    last: u64,
}

impl TimestampCodec {
    fn encode(&mut self, t: u64, out: &mut Vec<u8>) {
        if t == u64::MAX {
            encode_varint(0, out);
            return;
        }
        let delta = t - self.last;
        self.last = t;
        encode_varint(delta + 1, out);
    }

    fn decode(&mut self, buf: &[u8], pos: &mut usize) -> Result<u64> {
        let raw = decode_varint(buf, pos)?;
        if raw == 0 {
            return Ok(u64::MAX);
        }
        let t = self.last + raw - 1;
        self.last = t;
        Ok(t)
    }
}

fn encode_bound(bound: &NegBound, codec: &mut TimestampCodec, out: &mut Vec<u8>) {
    codec.encode(bound.timestamp, out);
    encode_varint(bound.id_prefix.len() as u64, out);
    out.extend_from_slice(&bound.id_prefix);
}

fn decode_bound(buf: &[u8], pos: &mut usize, codec: &mut TimestampCodec) -> Result<NegBound> {
    let timestamp = codec.decode(buf, pos)?;
    let len = decode_varint(buf, pos)? as usize;
    if len > ID_SIZE {
        return Err(Error::NegentropyError("bound prefix too long"));
    }
    if *pos + len > buf.len() {
        return Err(Error::NegentropyError("truncated bound prefix"));
    }
    let id_prefix = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(NegBound {
        timestamp,
        id_prefix,
    })
}

/// Fixed-width accumulator over item ids: 256-bit little-endian
/// addition, so adjacent range accumulators concatenate by addition.
#[derive(Clone)]
pub struct Accumulator {
    buf: [u8; ID_SIZE],
}

impl Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Accumulator { buf: [0; ID_SIZE] }
    }

    pub fn add(&mut self, id: &[u8; ID_SIZE]) {
        let mut carry = 0u16;
        for i in 0..ID_SIZE {
            let sum = u16::from(self.buf[i]) + u16::from(id[i]) + carry;
            self.buf[i] = (sum & 0xff) as u8;
            carry = sum >> 8;
        }
        // addition is modulo 2^256: the final carry drops
    }

    /// Domain-separated digest over the accumulator and the item
    /// count, truncated.
    #[must_use]
    pub fn fingerprint(&self, n: u64) -> [u8; FINGERPRINT_SIZE] {
        let mut input = Vec::with_capacity(ID_SIZE + 10);
        input.extend_from_slice(&self.buf);
        encode_varint(n, &mut input);
        let digest = sha256::Hash::hash(&input);
        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&digest.as_ref()[..FINGERPRINT_SIZE]);
        out
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// One side of a reconciliation session.
pub struct Negentropy {
    items: Vec<Item>,
    sealed: bool,
    is_initiator: bool,
    frame_size_limit: usize,
}

impl Negentropy {
    #[must_use]
    pub fn new(frame_size_limit: usize) -> Self {
        Negentropy {
            items: Vec::new(),
            sealed: false,
            is_initiator: false,
            frame_size_limit,
        }
    }

    pub fn insert(&mut self, timestamp: u64, id: [u8; ID_SIZE]) -> Result<()> {
        if self.sealed {
            return Err(Error::NegentropyError("already sealed"));
        }
        self.items.push(Item { timestamp, id });
        Ok(())
    }

    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::NegentropyError("already sealed"));
        }
        self.items.sort_unstable();
        self.items.dedup();
        self.sealed = true;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn fingerprint_of(&self, lower: usize, upper: usize) -> [u8; FINGERPRINT_SIZE] {
        let mut acc = Accumulator::new();
        for item in &self.items[lower..upper] {
            acc.add(&item.id);
        }
        acc.fingerprint((upper - lower) as u64)
    }

    /// First index at or after `from` whose item is not below `bound`.
    fn upper_index(&self, from: usize, bound: &NegBound) -> usize {
        let mut idx = from;
        while idx < self.items.len() && item_less_than_bound(&self.items[idx], bound) {
            idx += 1;
        }
        idx
    }

    /// Begin a session as the initiating side, producing the first
    /// message.
    pub fn initiate(&mut self) -> Result<Vec<u8>> {
        if !self.sealed {
            return Err(Error::NegentropyError("not sealed"));
        }
        self.is_initiator = true;
        let mut out = vec![PROTOCOL_VERSION];
        let mut codec = TimestampCodec::default();
        self.split_range(0, self.items.len(), &NegBound::infinity(), &mut codec, &mut out);
        Ok(out)
    }

    /// Respond to a message from the initiating side.
    pub fn reconcile(&mut self, query: &[u8]) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Error::NegentropyError("initiator cannot respond"));
        }
        let mut have = Vec::new();
        let mut need = Vec::new();
        self.reconcile_aux(query, &mut have, &mut need)
    }

    /// Process a response on the initiating side.  Ids the peer lacks
    /// accumulate in `have_ids`, ids we lack in `need_ids`.  Returns
    /// `None` once the sets have converged.
    pub fn reconcile_with_ids(
        &mut self,
        query: &[u8],
        have_ids: &mut Vec<[u8; ID_SIZE]>,
        need_ids: &mut Vec<[u8; ID_SIZE]>,
    ) -> Result<Option<Vec<u8>>> {
        if !self.is_initiator {
            return Err(Error::NegentropyError("responder cannot continue"));
        }
        let out = self.reconcile_aux(query, have_ids, need_ids)?;
        if out.len() == 1 {
            // nothing left to compare
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn reconcile_aux(
        &mut self,
        query: &[u8],
        have_ids: &mut Vec<[u8; ID_SIZE]>,
        need_ids: &mut Vec<[u8; ID_SIZE]>,
    ) -> Result<Vec<u8>> {
        if !self.sealed {
            return Err(Error::NegentropyError("not sealed"));
        }
        if query.is_empty() || query[0] != PROTOCOL_VERSION {
            return Err(Error::NegentropyError(
                "unsupported negentropy protocol version",
            ));
        }
        let mut pos = 1;
        let mut codec_in = TimestampCodec::default();
        let mut codec_out = TimestampCodec::default();
        let mut out = vec![PROTOCOL_VERSION];

        let mut prev_bound = NegBound::zero();
        let mut prev_index: usize = 0;
        let mut skip = false;

        while pos < query.len() {
            let curr_bound = decode_bound(query, &mut pos, &mut codec_in)?;
            let mode = decode_varint(query, &mut pos)?;
            let lower = prev_index;
            let upper = self.upper_index(lower, &curr_bound);

            match mode {
                MODE_SKIP => {
                    skip = true;
                }
                MODE_FINGERPRINT => {
                    if pos + FINGERPRINT_SIZE > query.len() {
                        return Err(Error::NegentropyError("truncated fingerprint"));
                    }
                    let mut their_fp = [0u8; FINGERPRINT_SIZE];
                    their_fp.copy_from_slice(&query[pos..pos + FINGERPRINT_SIZE]);
                    pos += FINGERPRINT_SIZE;

                    if their_fp == self.fingerprint_of(lower, upper) {
                        skip = true;
                    } else {
                        flush_skip(&mut skip, &prev_bound, &mut codec_out, &mut out);
                        self.split_range(lower, upper, &curr_bound, &mut codec_out, &mut out);
                    }
                }
                MODE_ID_LIST => {
                    let n = decode_varint(query, &mut pos)? as usize;
                    if pos + n * ID_SIZE > query.len() {
                        return Err(Error::NegentropyError("truncated id list"));
                    }
                    let mut theirs: Vec<[u8; ID_SIZE]> = Vec::with_capacity(n);
                    for _ in 0..n {
                        let mut id = [0u8; ID_SIZE];
                        id.copy_from_slice(&query[pos..pos + ID_SIZE]);
                        pos += ID_SIZE;
                        theirs.push(id);
                    }

                    if self.is_initiator {
                        // terminal exchange: compute the symmetric
                        // difference for this range
                        skip = true;
                        let their_set: HashSet<[u8; ID_SIZE]> = theirs.iter().copied().collect();
                        let our_set: HashSet<[u8; ID_SIZE]> =
                            self.items[lower..upper].iter().map(|i| i.id).collect();
                        for item in &self.items[lower..upper] {
                            if !their_set.contains(&item.id) {
                                have_ids.push(item.id);
                            }
                        }
                        for id in theirs {
                            if !our_set.contains(&id) {
                                need_ids.push(id);
                            }
                        }
                    } else {
                        // answer with our literal ids so the peer can
                        // compute the difference
                        flush_skip(&mut skip, &prev_bound, &mut codec_out, &mut out);
                        encode_bound(&curr_bound, &mut codec_out, &mut out);
                        encode_varint(MODE_ID_LIST, &mut out);
                        encode_varint((upper - lower) as u64, &mut out);
                        for item in &self.items[lower..upper] {
                            out.extend_from_slice(&item.id);
                        }
                    }
                }
                _ => return Err(Error::NegentropyError("unexpected mode")),
            }

            // when the frame fills up, cover everything remaining
            // with a single fingerprint and let the next round-trip
            // descend into it; every message must still tile the
            // whole bound space
            if self.frame_size_limit > 0
                && out.len() >= self.frame_size_limit.saturating_sub(FRAME_HEADROOM)
                && pos < query.len()
            {
                flush_skip(&mut skip, &curr_bound, &mut codec_out, &mut out);
                let fp = self.fingerprint_of(upper, self.items.len());
                encode_bound(&NegBound::infinity(), &mut codec_out, &mut out);
                encode_varint(MODE_FINGERPRINT, &mut out);
                out.extend_from_slice(&fp);
                return Ok(out);
            }

            prev_index = upper;
            prev_bound = curr_bound;
        }
        Ok(out)
    }

    /// Emit either fingerprints of sub-ranges or, for small ranges,
    /// the literal id list.
    fn split_range(
        &self,
        lower: usize,
        upper: usize,
        upper_bound: &NegBound,
        codec_out: &mut TimestampCodec,
        out: &mut Vec<u8>,
    ) {
        let num_elems = upper - lower;
        if num_elems < BUCKETS * 2 {
            encode_bound(upper_bound, codec_out, out);
            encode_varint(MODE_ID_LIST, out);
            encode_varint(num_elems as u64, out);
            for item in &self.items[lower..upper] {
                out.extend_from_slice(&item.id);
            }
            return;
        }
        let items_per_bucket = num_elems / BUCKETS;
        let buckets_with_extra = num_elems % BUCKETS;
        let mut curr = lower;
        for i in 0..BUCKETS {
            let bucket_size = items_per_bucket + usize::from(i < buckets_with_extra);
            let fp = self.fingerprint_of(curr, curr + bucket_size);
            curr += bucket_size;
            let bound = if i == BUCKETS - 1 {
                upper_bound.clone()
            } else {
                minimal_bound(&self.items[curr - 1], &self.items[curr])
            };
            encode_bound(&bound, codec_out, out);
            encode_varint(MODE_FINGERPRINT, out);
            out.extend_from_slice(&fp);
        }
    }
}

fn flush_skip(
    skip: &mut bool,
    prev_bound: &NegBound,
    codec_out: &mut TimestampCodec,
    out: &mut Vec<u8>,
) {
    if *skip {
        *skip = false;
        encode_bound(prev_bound, codec_out, out);
        encode_varint(MODE_SKIP, out);
    }
}

/// The smallest bound separating two adjacent sorted items.
fn minimal_bound(prev: &Item, curr: &Item) -> NegBound {
    if curr.timestamp != prev.timestamp {
        NegBound {
            timestamp: curr.timestamp,
            id_prefix: Vec::new(),
        }
    } else {
        let mut shared = 0;
        while shared < ID_SIZE && prev.id[shared] == curr.id[shared] {
            shared += 1;
        }
        NegBound {
            timestamp: curr.timestamp,
            id_prefix: curr.id[..(shared + 1).min(ID_SIZE)].to_vec(),
        }
    }
}

// ---------------------------------------------------------------
// Wire commands
// ---------------------------------------------------------------

/// NEG-OPEN command: subscription id, filter, and the initiating
/// message in hex.
#[derive(Debug, Clone, PartialEq)]
pub struct NegOpenCmd {
    pub sub_id: String,
    pub filter: ReqFilter,
    pub initial: Vec<u8>,
}

impl<'de> Deserialize<'de> for NegOpenCmd {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut v: Value = Deserialize::deserialize(deserializer)?;
        let parts = v
            .as_array_mut()
            .ok_or_else(|| serde::de::Error::custom("not array"))?;
        if parts.len() != 4 {
            return Err(serde::de::Error::custom("wrong number of fields"));
        }
        if parts[0].as_str() != Some("NEG-OPEN") {
            return Err(serde::de::Error::custom("missing NEG-OPEN command"));
        }
        let sub_id = parts[1]
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("missing subscription id"))?
            .to_owned();
        let filter: ReqFilter = serde_json::from_value(parts[2].take())
            .map_err(|_| serde::de::Error::custom("could not parse filter"))?;
        let initial = parts[3]
            .as_str()
            .and_then(|h| hex::decode(h).ok())
            .ok_or_else(|| serde::de::Error::custom("invalid hex message"))?;
        Ok(NegOpenCmd {
            sub_id,
            filter,
            initial,
        })
    }
}

/// NEG-MSG command: subscription id and a protocol message in hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegMsgCmd {
    pub sub_id: String,
    pub message: Vec<u8>,
}

impl<'de> Deserialize<'de> for NegMsgCmd {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Value = Deserialize::deserialize(deserializer)?;
        let parts = v
            .as_array()
            .ok_or_else(|| serde::de::Error::custom("not array"))?;
        if parts.len() != 3 {
            return Err(serde::de::Error::custom("wrong number of fields"));
        }
        if parts[0].as_str() != Some("NEG-MSG") {
            return Err(serde::de::Error::custom("missing NEG-MSG command"));
        }
        let sub_id = parts[1]
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("missing subscription id"))?
            .to_owned();
        let message = parts[2]
            .as_str()
            .and_then(|h| hex::decode(h).ok())
            .ok_or_else(|| serde::de::Error::custom("invalid hex message"))?;
        Ok(NegMsgCmd { sub_id, message })
    }
}

/// NEG-CLOSE command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegCloseCmd {
    pub sub_id: String,
}

impl<'de> Deserialize<'de> for NegCloseCmd {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Value = Deserialize::deserialize(deserializer)?;
        let parts = v
            .as_array()
            .ok_or_else(|| serde::de::Error::custom("not array"))?;
        if parts.len() != 2 {
            return Err(serde::de::Error::custom("wrong number of fields"));
        }
        if parts[0].as_str() != Some("NEG-CLOSE") {
            return Err(serde::de::Error::custom("missing NEG-CLOSE command"));
        }
        let sub_id = parts[1]
            .as_str()
            .ok_or_else(|| serde::de::Error::custom("missing subscription id"))?
            .to_owned();
        Ok(NegCloseCmd { sub_id })
    }
}

// ---------------------------------------------------------------
// Session workers
// ---------------------------------------------------------------

/// A queued negentropy operation.
pub struct NegJob {
    pub conn_id: Uuid,
    pub sub_id: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub kind: NegJobKind,
}

pub enum NegJobKind {
    Open { filter: ReqFilter, initial: Vec<u8> },
    Msg { message: Vec<u8> },
    Close,
}

type SessionMap = Arc<Mutex<HashMap<(Uuid, String), Negentropy>>>;

/// Spawn the negentropy worker pool over a shared receiver.
#[allow(clippy::too_many_arguments)]
pub fn start_neg_workers(
    rx: mpsc::Receiver<NegJob>,
    threads: usize,
    event_store: EventStore,
    max_sync_events: u64,
    frame_size_limit: usize,
    shutdown: &broadcast::Sender<()>,
) {
    let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
    let shared = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..threads {
        tokio::task::spawn(neg_worker(
            worker_id,
            shared.clone(),
            sessions.clone(),
            event_store.clone(),
            max_sync_events,
            frame_size_limit,
            shutdown.subscribe(),
        ));
    }
}

async fn recv_shared(rx: &tokio::sync::Mutex<mpsc::Receiver<NegJob>>) -> Option<NegJob> {
    rx.lock().await.recv().await
}

#[allow(clippy::too_many_arguments)]
async fn neg_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<NegJob>>>,
    sessions: SessionMap,
    event_store: EventStore,
    max_sync_events: u64,
    frame_size_limit: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.recv() => break,
            j = recv_shared(&rx) => match j {
                Some(j) => j,
                None => break,
            },
        };
        let key = (job.conn_id, job.sub_id.clone());
        match job.kind {
            NegJobKind::Open { filter, initial } => {
                let es = event_store.clone();
                let built = task::spawn_blocking(move || {
                    build_session(&es, &filter, max_sync_events, frame_size_limit)
                })
                .await;
                match built {
                    Ok(Ok(mut ne)) => {
                        debug!(
                            "negentropy session opened over {} events (sub: {:?})",
                            ne.len(),
                            job.sub_id
                        );
                        match ne.reconcile(&initial) {
                            Ok(reply) => {
                                sessions.lock().expect("session lock").insert(key, ne);
                                job.outbound
                                    .send(Outbound::NegMsg {
                                        sub_id: job.sub_id,
                                        message: hex::encode(reply),
                                    })
                                    .await
                                    .ok();
                            }
                            Err(e) => {
                                job.outbound
                                    .send(Outbound::NegErr {
                                        sub_id: job.sub_id,
                                        reason: format!("error: {e}"),
                                    })
                                    .await
                                    .ok();
                            }
                        }
                    }
                    Ok(Err(Error::NegentropyCapacityError)) => {
                        job.outbound
                            .send(Outbound::NegErr {
                                sub_id: job.sub_id,
                                reason: "blocked: sync range exceeds event bound".into(),
                            })
                            .await
                            .ok();
                    }
                    Ok(Err(e)) => {
                        warn!("negentropy open failed: {}", e);
                        job.outbound
                            .send(Outbound::NegErr {
                                sub_id: job.sub_id,
                                reason: "error: could not build sync session".into(),
                            })
                            .await
                            .ok();
                    }
                    Err(e) => {
                        warn!("negentropy open task failed: {}", e);
                    }
                }
            }
            NegJobKind::Msg { message } => {
                let reply = {
                    let mut map = sessions.lock().expect("session lock");
                    let res = match map.get_mut(&key) {
                        Some(ne) => ne.reconcile(&message),
                        None => Err(Error::NegentropyError("unknown session")),
                    };
                    // a failed session is unrecoverable; forget it
                    if res.is_err() {
                        map.remove(&key);
                    }
                    res
                };
                match reply {
                    Ok(r) => {
                        job.outbound
                            .send(Outbound::NegMsg {
                                sub_id: job.sub_id,
                                message: hex::encode(r),
                            })
                            .await
                            .ok();
                    }
                    Err(e) => {
                        job.outbound
                            .send(Outbound::NegErr {
                                sub_id: job.sub_id,
                                reason: format!("closed: {e}"),
                            })
                            .await
                            .ok();
                    }
                }
            }
            NegJobKind::Close => {
                sessions.lock().expect("session lock").remove(&key);
            }
        }
    }
    info!("negentropy worker {} shutdown", worker_id);
}

/// Collect the sorted `(created_at, id)` items a filter selects,
/// bounded by the session event cap.
fn build_session(
    es: &EventStore,
    filter: &ReqFilter,
    max_sync_events: u64,
    frame_size_limit: usize,
) -> Result<Negentropy> {
    let txn = es.store().txn_ro()?;
    let ts_lo = filter.since.map_or(0u64, |s| s.max(0) as u64);
    let ts_hi = filter.until.map_or(u64::MAX, |u| u.max(0) as u64);
    let lower = [&ts_lo.to_be_bytes()[..], &[0u8; 8][..]].concat();
    let upper = [&ts_hi.to_be_bytes()[..], &[0xffu8; 8][..]].concat();
    let range = KeyRange::inclusive(&lower, &upper);

    let mut ne = Negentropy::new(frame_size_limit);
    let mut count: u64 = 0;
    for row in es.store().by_created_at.range(&txn, &range)? {
        let (_, v) = row?;
        let quad = quad_from(v);
        if let Some((_, event)) = es.get_by_quad(&txn, quad)? {
            if filter.interested_in_event(&event) {
                count += 1;
                if count > max_sync_events {
                    return Err(Error::NegentropyCapacityError);
                }
                ne.insert(event.created_at.max(0) as u64, event.id_bytes()?)?;
            }
        }
    }
    ne.seal()?;
    Ok(ne)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn varint_roundtrip() {
        for n in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX / 2] {
            let mut buf = Vec::new();
            encode_varint(n, &mut buf);
            let mut pos = 0;
            assert_eq!(decode_varint(&buf, &mut pos).unwrap(), n);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn timestamp_codec_roundtrip() {
        let ts = [100u64, 100, 250, u64::MAX, 300];
        let mut enc = TimestampCodec::default();
        let mut buf = Vec::new();
        for t in ts {
            enc.encode(t, &mut buf);
        }
        let mut dec = TimestampCodec::default();
        let mut pos = 0;
        for t in ts {
            assert_eq!(dec.decode(&buf, &mut pos).unwrap(), t);
        }
    }

    #[test]
    fn accumulator_is_order_independent() {
        let ids: Vec<[u8; 32]> = (0u8..10).map(|i| [i.wrapping_mul(37); 32]).collect();
        let mut a = Accumulator::new();
        for id in &ids {
            a.add(id);
        }
        let mut b = Accumulator::new();
        for id in ids.iter().rev() {
            b.add(id);
        }
        assert_eq!(a.fingerprint(10), b.fingerprint(10));
    }

    #[test]
    fn accumulator_concatenates_adjacent_ranges() {
        let ids: Vec<[u8; 32]> = (0u8..8).map(|i| [i.wrapping_add(3); 32]).collect();
        let mut whole = Accumulator::new();
        for id in &ids {
            whole.add(id);
        }
        let mut left = Accumulator::new();
        for id in &ids[..4] {
            left.add(id);
        }
        let mut right = Accumulator::new();
        for id in &ids[4..] {
            right.add(id);
        }
        // adding the right half onto the left equals the whole
        for id in &ids[4..] {
            left.add(id);
        }
        assert_eq!(whole.fingerprint(8), left.fingerprint(8));
        // and differs from either half alone
        assert_ne!(whole.fingerprint(8), right.fingerprint(4));
    }

    fn rand_item(rng: &mut StdRng) -> Item {
        let mut id = [0u8; 32];
        rng.fill(&mut id[..]);
        Item {
            timestamp: rng.gen_range(1_000..2_000),
            id,
        }
    }

    /// Run a full reconciliation dialog between two sets and return
    /// (have, need) from the initiating side.
    fn converge(
        ours: &[Item],
        theirs: &[Item],
        frame_limit: usize,
    ) -> (Vec<[u8; 32]>, Vec<[u8; 32]>) {
        let mut client = Negentropy::new(frame_limit);
        for item in ours {
            client.insert(item.timestamp, item.id).unwrap();
        }
        client.seal().unwrap();
        let mut relay = Negentropy::new(frame_limit);
        for item in theirs {
            relay.insert(item.timestamp, item.id).unwrap();
        }
        relay.seal().unwrap();

        let mut have = Vec::new();
        let mut need = Vec::new();
        let mut msg = client.initiate().unwrap();
        for round in 0..64 {
            let response = relay.reconcile(&msg).unwrap();
            match client
                .reconcile_with_ids(&response, &mut have, &mut need)
                .unwrap()
            {
                Some(next) => msg = next,
                None => return (have, need),
            }
            assert!(round < 63, "reconciliation did not converge");
        }
        unreachable!()
    }

    #[test]
    fn identical_sets_converge_immediately() {
        let mut rng = StdRng::seed_from_u64(7);
        let items: Vec<Item> = (0..500).map(|_| rand_item(&mut rng)).collect();
        let (have, need) = converge(&items, &items, 0);
        assert!(have.is_empty());
        assert!(need.is_empty());
    }

    #[test]
    fn arbitrary_sets_discover_symmetric_difference() {
        let mut rng = StdRng::seed_from_u64(42);
        let shared: Vec<Item> = (0..2_000).map(|_| rand_item(&mut rng)).collect();
        let only_ours: Vec<Item> = (0..40).map(|_| rand_item(&mut rng)).collect();
        let only_theirs: Vec<Item> = (0..60).map(|_| rand_item(&mut rng)).collect();

        let mut ours = shared.clone();
        ours.extend_from_slice(&only_ours);
        let mut theirs = shared;
        theirs.extend_from_slice(&only_theirs);

        let (mut have, mut need) = converge(&ours, &theirs, 0);
        have.sort_unstable();
        need.sort_unstable();
        let mut expect_have: Vec<[u8; 32]> = only_ours.iter().map(|i| i.id).collect();
        let mut expect_need: Vec<[u8; 32]> = only_theirs.iter().map(|i| i.id).collect();
        expect_have.sort_unstable();
        expect_need.sort_unstable();
        assert_eq!(have, expect_have);
        assert_eq!(need, expect_need);
    }

    #[test]
    fn frame_size_limit_still_converges() {
        let mut rng = StdRng::seed_from_u64(9);
        let shared: Vec<Item> = (0..3_000).map(|_| rand_item(&mut rng)).collect();
        let only_theirs: Vec<Item> = (0..25).map(|_| rand_item(&mut rng)).collect();
        let ours = shared.clone();
        let mut theirs = shared;
        theirs.extend_from_slice(&only_theirs);

        let (have, need) = converge(&ours, &theirs, 4_096);
        assert!(have.is_empty());
        assert_eq!(need.len(), 25);
    }

    #[test]
    fn empty_initiator_learns_everything() {
        let mut rng = StdRng::seed_from_u64(3);
        let theirs: Vec<Item> = (0..100).map(|_| rand_item(&mut rng)).collect();
        let (have, need) = converge(&[], &theirs, 0);
        assert!(have.is_empty());
        assert_eq!(need.len(), 100);
    }

    #[test]
    fn bad_version_rejected() {
        let mut ne = Negentropy::new(0);
        ne.seal().unwrap();
        assert!(ne.reconcile(&[0x60]).is_err());
    }

    #[test]
    fn neg_open_cmd_parses() {
        let raw = r#"["NEG-OPEN","s1",{"kinds":[1]},"61"]"#;
        let cmd: NegOpenCmd = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.sub_id, "s1");
        assert_eq!(cmd.initial, vec![0x61]);
        assert_eq!(cmd.filter.kinds, Some(vec![1]));
    }

    #[test]
    fn neg_msg_cmd_rejects_wrong_cmd() {
        let raw = r#"["NEG-OPEN","s1","61"]"#;
        let parse: std::result::Result<NegMsgCmd, _> = serde_json::from_str(raw);
        assert!(parse.is_err());
    }
}
