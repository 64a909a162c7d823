//! Historical scan workers
//!
//! Each new REQ is compiled into a scan plan over the cheapest index
//! for each filter, walked newest-first under a CPU timeslice budget.
//! A scan that exceeds its slice checkpoints its cursors and requeues
//! itself, so one expensive subscription cannot starve the rest.
use crate::conn::Outbound;
use crate::error::Result;
use crate::event::{is_replaceable_kind, Event};
use crate::event_store::{keys, EventStore, MAX_INDEXED_TAG_SIZE};
use crate::hexrange::{hex_range, pad, HexSearch};
use crate::req_monitor::{MonitorCmd, MonitorHandles};
use crate::server::RelayMetrics;
use crate::store::KeyRange;
use crate::subscription::{ReqFilter, Subscription};
use crate::utils::is_hex;
use heed::types::Bytes;
use heed::{Database, RoTxn};
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Budget and cancellation checks happen once per this many index
/// entries.
const CHECK_INTERVAL: usize = 32;

/// Recently-sent event ids, for de-duplication across the filters of
/// one subscription.
pub(crate) struct LruSet {
    cap: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl LruSet {
    fn new(cap: usize) -> Self {
        LruSet {
            cap,
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert, returning true when the value was not already present.
    fn insert(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        self.set.insert(key.to_owned());
        self.order.push_back(key.to_owned());
        if self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

/// Where one index range resumes after a yield.
enum RangeResume {
    /// Not yet visited.
    Start,
    /// Continue strictly below this key.
    At(Vec<u8>),
    /// Fully consumed.
    Done,
}

/// Per-scan progress carried across timeslices.
struct ScanState {
    /// Highest quadID visible to this scan; later commits reach the
    /// subscription via the monitor instead.
    snapshot_max: Option<u64>,
    filter_idx: usize,
    sent_current: u64,
    /// Events delivered over the whole scan, and how many of those
    /// have been counted in metrics already.
    delivered: u64,
    reported: u64,
    resume: Option<Vec<RangeResume>>,
    seen: LruSet,
}

/// A queued (or requeued) historical scan.
pub struct ScanJob {
    pub conn_id: Uuid,
    pub sub: Subscription,
    pub outbound: mpsc::Sender<Outbound>,
    pub cancelled: Arc<AtomicBool>,
    started: Instant,
    state: ScanState,
}

impl ScanJob {
    #[must_use]
    pub fn new(
        conn_id: Uuid,
        sub: Subscription,
        outbound: mpsc::Sender<Outbound>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        ScanJob {
            conn_id,
            sub,
            outbound,
            cancelled,
            started: Instant::now(),
            state: ScanState {
                snapshot_max: None,
                filter_idx: 0,
                sent_current: 0,
                delivered: 0,
                reported: 0,
                resume: None,
                seen: LruSet::new(512),
            },
        }
    }
}

enum SliceResult {
    Done,
    Yielded,
    Cancelled,
    Error(crate::error::Error),
}

enum FilterProgress {
    Done,
    Budget,
    Cancelled,
    ClientGone,
}

/// Spawn the scan worker pool over a shared receiver.
#[allow(clippy::too_many_arguments)]
pub fn start_req_workers(
    rx: mpsc::Receiver<ScanJob>,
    requeue_tx: mpsc::Sender<ScanJob>,
    threads: usize,
    budget_micros: u64,
    max_filter_limit: Option<u64>,
    event_store: EventStore,
    monitors: MonitorHandles,
    metrics: RelayMetrics,
    shutdown: &broadcast::Sender<()>,
) {
    let shared = Arc::new(Mutex::new(rx));
    for worker_id in 0..threads {
        tokio::task::spawn(req_worker(
            worker_id,
            shared.clone(),
            requeue_tx.clone(),
            budget_micros,
            max_filter_limit,
            event_store.clone(),
            monitors.clone(),
            metrics.clone(),
            shutdown.subscribe(),
        ));
    }
}

async fn recv_shared(rx: &Mutex<mpsc::Receiver<ScanJob>>) -> Option<ScanJob> {
    rx.lock().await.recv().await
}

#[allow(clippy::too_many_arguments)]
async fn req_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<ScanJob>>>,
    requeue_tx: mpsc::Sender<ScanJob>,
    budget_micros: u64,
    max_filter_limit: Option<u64>,
    event_store: EventStore,
    monitors: MonitorHandles,
    metrics: RelayMetrics,
    mut shutdown: broadcast::Receiver<()>,
) {
    let budget = Duration::from_micros(budget_micros.max(1));
    loop {
        let job = tokio::select! {
            _ = shutdown.recv() => break,
            j = recv_shared(&rx) => match j {
                Some(j) => j,
                None => break,
            },
        };
        if job.cancelled.load(Ordering::Relaxed) {
            continue;
        }
        let es = event_store.clone();
        let slice = task::spawn_blocking(move || run_slice(job, &es, budget, max_filter_limit)).await;
        let (result, mut job) = match slice {
            Ok(r) => r,
            Err(e) => {
                warn!("scan slice panicked: {}", e);
                metrics.query_aborts.with_label_values(&["panic"]).inc();
                continue;
            }
        };
        let newly_sent = job.state.delivered - job.state.reported;
        if newly_sent > 0 {
            job.state.reported = job.state.delivered;
            metrics
                .sent_events
                .with_label_values(&["db"])
                .inc_by(newly_sent);
        }
        match result {
            SliceResult::Yielded => {
                // back of the queue: fair service across scans
                requeue_tx.send(job).await.ok();
            }
            SliceResult::Done => {
                metrics.query_sub.observe(job.started.elapsed().as_secs_f64());
                debug!(
                    "scan complete (sub: {:?}, duration: {:?})",
                    job.sub.id,
                    job.started.elapsed()
                );
                job.outbound
                    .send(Outbound::Eose {
                        sub_id: job.sub.id.clone(),
                    })
                    .await
                    .ok();
                // the monitor takes over from the snapshot watermark;
                // the hand-off seed is what guarantees exactly one
                // delivery path per event
                monitors
                    .send(MonitorCmd::Register {
                        conn_id: job.conn_id,
                        sub: job.sub,
                        outbound: job.outbound,
                        latest_quad: job.state.snapshot_max.unwrap_or(0),
                    })
                    .await;
            }
            SliceResult::Cancelled => {
                metrics.query_aborts.with_label_values(&["cancelled"]).inc();
            }
            SliceResult::Error(e) => {
                warn!("scan failed (sub: {:?}): {}", job.sub.id, e);
                metrics.query_aborts.with_label_values(&["error"]).inc();
                job.outbound
                    .send(Outbound::Notice(crate::notice::Notice::message(format!(
                        "query error for subscription {:?}",
                        job.sub.id
                    ))))
                    .await
                    .ok();
            }
        }
    }
    info!("req worker {} shutdown", worker_id);
}

/// Execute one timeslice of a scan against a fresh snapshot.
fn run_slice(
    mut job: ScanJob,
    es: &EventStore,
    budget: Duration,
    max_filter_limit: Option<u64>,
) -> (SliceResult, ScanJob) {
    let deadline = Instant::now() + budget;
    let txn = match es.store().txn_ro() {
        Ok(t) => t,
        Err(e) => return (SliceResult::Error(e), job),
    };
    // pin the scan to the log position at first entry; everything
    // after it belongs to the monitor
    let snapshot_max = match job.state.snapshot_max {
        Some(s) => s,
        None => match es.max_quad(&txn) {
            Ok(m) => {
                job.state.snapshot_max = Some(m);
                m
            }
            Err(e) => return (SliceResult::Error(e), job),
        },
    };

    while job.state.filter_idx < job.sub.filters.len() {
        if job.cancelled.load(Ordering::Relaxed) {
            return (SliceResult::Cancelled, job);
        }
        let filter = job.sub.filters[job.state.filter_idx].clone();
        let limit = effective_limit(&filter, max_filter_limit);
        let progress = if limit == Some(0) {
            Ok(FilterProgress::Done)
        } else {
            scan_filter_slice(
                es,
                &txn,
                &job.sub.id,
                &filter,
                snapshot_max,
                limit,
                &mut job.state,
                &job.outbound,
                deadline,
                &job.cancelled,
            )
        };
        match progress {
            Ok(FilterProgress::Done) => {
                job.state.filter_idx += 1;
                job.state.sent_current = 0;
                job.state.resume = None;
            }
            Ok(FilterProgress::Budget) => return (SliceResult::Yielded, job),
            Ok(FilterProgress::Cancelled) | Ok(FilterProgress::ClientGone) => {
                return (SliceResult::Cancelled, job)
            }
            Err(e) => return (SliceResult::Error(e), job),
        }
    }
    (SliceResult::Done, job)
}

fn effective_limit(f: &ReqFilter, cap: Option<u64>) -> Option<u64> {
    match (f.limit, cap) {
        (Some(l), Some(c)) => Some(l.min(c)),
        (Some(l), None) => Some(l),
        (None, Some(c)) => Some(c),
        (None, None) => None,
    }
}

/// Which secondary index a plan walks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IndexId {
    PubkeyKind,
    Pubkey,
    Kind,
    Tag,
    CreatedAt,
}

/// One contiguous index key range.
struct RangeSpec {
    lower: Vec<u8>,
    upper: Vec<u8>,
    upper_inclusive: bool,
}

enum ScanPlan {
    /// Nothing can match.
    Empty,
    /// Direct id lookups (exact or prefix).
    Ids(Vec<String>),
    /// Direct winner lookups in the replaceable table.
    Replaceable(Vec<Vec<u8>>),
    /// Descending walks over one index, merged newest-first.
    Ranges(IndexId, Vec<RangeSpec>),
}

fn ts_lower(f: &ReqFilter) -> u64 {
    f.since.map_or(0, |s| s.max(0) as u64)
}

fn ts_upper(f: &ReqFilter) -> u64 {
    f.until.map_or(u64::MAX, |u| u.max(0) as u64)
}

/// Choose the cheapest index able to serve a filter.  Preference:
/// byId > replaceable > byPubkeyKind > byTag > byPubkey ≈ byKind >
/// byCreatedAt.  Time bounds prune the created_at segment of every
/// range.
fn plan_filter(f: &ReqFilter) -> ScanPlan {
    if f.force_no_match {
        return ScanPlan::Empty;
    }
    if let Some(ids) = &f.ids {
        return ScanPlan::Ids(ids.clone());
    }
    let ts_lo = ts_lower(f);
    let ts_hi = ts_upper(f);

    if let (Some(authors), Some(kinds)) = (&f.authors, &f.kinds) {
        let all_exact = authors.iter().all(|a| a.len() == 64 && is_hex(a));
        if all_exact {
            // single-winner kinds with no other constraints resolve
            // directly through the replaceable table
            if f.tags.is_none()
                && f.since.is_none()
                && f.until.is_none()
                && kinds.iter().all(|k| is_replaceable_kind(*k))
            {
                let mut lookups = Vec::with_capacity(authors.len() * kinds.len());
                for a in authors {
                    if let Ok(pk) = decode_pubkey(a) {
                        for k in kinds {
                            lookups.push(keys::replaceable(&pk, *k, ""));
                        }
                    }
                }
                return ScanPlan::Replaceable(lookups);
            }
            let mut specs = Vec::with_capacity(authors.len() * kinds.len());
            for a in authors {
                if let Ok(pk) = decode_pubkey(a) {
                    for k in kinds {
                        specs.push(RangeSpec {
                            lower: compose(&[&pk, &k.to_be_bytes(), &ts_lo.to_be_bytes(), &[0u8; 8]]),
                            upper: compose(&[
                                &pk,
                                &k.to_be_bytes(),
                                &ts_hi.to_be_bytes(),
                                &[0xffu8; 8],
                            ]),
                            upper_inclusive: true,
                        });
                    }
                }
            }
            return ScanPlan::Ranges(IndexId::PubkeyKind, specs);
        }
    }

    if let Some(tags) = &f.tags {
        let best = tags
            .iter()
            .filter(|(l, _)| l.is_ascii())
            .min_by_key(|(_, vals)| vals.len());
        if let Some((letter, values)) = best {
            let mut specs = Vec::with_capacity(values.len());
            for v in values {
                if v.len() > MAX_INDEXED_TAG_SIZE {
                    // over-long values are never indexed, so they
                    // cannot match a stored row
                    continue;
                }
                let prefix = keys::tag_prefix(*letter as u8, v);
                specs.push(RangeSpec {
                    lower: compose(&[&prefix, &ts_lo.to_be_bytes(), &[0u8; 8]]),
                    upper: compose(&[&prefix, &ts_hi.to_be_bytes(), &[0xffu8; 8]]),
                    upper_inclusive: true,
                });
            }
            return ScanPlan::Ranges(IndexId::Tag, specs);
        }
    }

    if let Some(authors) = &f.authors {
        let mut specs = Vec::with_capacity(authors.len());
        for a in authors {
            match hex_range(a) {
                Some(HexSearch::Exact(pk)) => specs.push(RangeSpec {
                    lower: compose(&[&pk, &ts_lo.to_be_bytes(), &[0u8; 8]]),
                    upper: compose(&[&pk, &ts_hi.to_be_bytes(), &[0xffu8; 8]]),
                    upper_inclusive: true,
                }),
                Some(HexSearch::Range(lo, hi)) => specs.push(RangeSpec {
                    lower: compose(&[&pad(&lo, 32, 0), &[0u8; 16]]),
                    upper: compose(&[&pad(&hi, 32, 0), &[0u8; 16]]),
                    upper_inclusive: false,
                }),
                Some(HexSearch::LowerOnly(lo)) => specs.push(RangeSpec {
                    lower: compose(&[&pad(&lo, 32, 0), &[0u8; 16]]),
                    upper: vec![0xff; 48],
                    upper_inclusive: true,
                }),
                None => {} // malformed author can never match
            }
        }
        return ScanPlan::Ranges(IndexId::Pubkey, specs);
    }

    if let Some(kinds) = &f.kinds {
        let specs = kinds
            .iter()
            .map(|k| RangeSpec {
                lower: compose(&[&k.to_be_bytes(), &ts_lo.to_be_bytes(), &[0u8; 8]]),
                upper: compose(&[&k.to_be_bytes(), &ts_hi.to_be_bytes(), &[0xffu8; 8]]),
                upper_inclusive: true,
            })
            .collect();
        return ScanPlan::Ranges(IndexId::Kind, specs);
    }

    ScanPlan::Ranges(
        IndexId::CreatedAt,
        vec![RangeSpec {
            lower: compose(&[&ts_lo.to_be_bytes(), &[0u8; 8]]),
            upper: compose(&[&ts_hi.to_be_bytes(), &[0xffu8; 8]]),
            upper_inclusive: true,
        }],
    )
}

fn decode_pubkey(a: &str) -> Result<[u8; 32]> {
    let b = hex::decode(a)?;
    b.try_into()
        .map_err(|_| crate::error::Error::EventMalformedId)
}

fn compose(parts: &[&[u8]]) -> Vec<u8> {
    let mut v = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for p in parts {
        v.extend_from_slice(p);
    }
    v
}

/// (created_at, quadID) live in the last 16 bytes of every range key.
fn decode_index_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() < 16 {
        return None;
    }
    let n = key.len();
    let created = u64::from_be_bytes(key[n - 16..n - 8].try_into().ok()?);
    let quad = u64::from_be_bytes(key[n - 8..].try_into().ok()?);
    Some((created, quad))
}

struct HeapEntry {
    created: u64,
    quad: u64,
    spec_idx: usize,
    key: Vec<u8>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.created == other.created && self.quad == other.quad
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.created, self.quad).cmp(&(other.created, other.quad))
    }
}

#[allow(clippy::too_many_arguments)]
fn scan_filter_slice(
    es: &EventStore,
    txn: &RoTxn,
    sub_id: &str,
    filter: &ReqFilter,
    snapshot_max: u64,
    limit: Option<u64>,
    state: &mut ScanState,
    outbound: &mpsc::Sender<Outbound>,
    deadline: Instant,
    cancelled: &AtomicBool,
) -> Result<FilterProgress> {
    match plan_filter(filter) {
        ScanPlan::Empty => Ok(FilterProgress::Done),
        ScanPlan::Ids(ids) => {
            scan_ids(es, txn, sub_id, &ids, filter, snapshot_max, limit, state, outbound)
        }
        ScanPlan::Replaceable(lookups) => scan_replaceable(
            es,
            txn,
            sub_id,
            &lookups,
            filter,
            snapshot_max,
            limit,
            state,
            outbound,
        ),
        ScanPlan::Ranges(index, specs) => scan_ranges(
            es,
            txn,
            sub_id,
            index,
            &specs,
            filter,
            snapshot_max,
            limit,
            state,
            outbound,
            deadline,
            cancelled,
        ),
    }
}

/// Deliver one stored event if it survives the snapshot bound, the
/// structural filter test and de-duplication.  Returns false when the
/// connection is gone.
#[allow(clippy::too_many_arguments)]
fn deliver(
    sub_id: &str,
    event: Event,
    state: &mut ScanState,
    outbound: &mpsc::Sender<Outbound>,
) -> bool {
    if !state.seen.insert(&event.id) {
        return true;
    }
    if outbound
        .blocking_send(Outbound::Event {
            sub_id: sub_id.to_owned(),
            event: Arc::new(event),
        })
        .is_err()
    {
        return false;
    }
    state.sent_current += 1;
    state.delivered += 1;
    true
}

#[allow(clippy::too_many_arguments)]
fn scan_ids(
    es: &EventStore,
    txn: &RoTxn,
    sub_id: &str,
    ids: &[String],
    filter: &ReqFilter,
    snapshot_max: u64,
    limit: Option<u64>,
    state: &mut ScanState,
    outbound: &mpsc::Sender<Outbound>,
) -> Result<FilterProgress> {
    let mut quads: Vec<u64> = Vec::new();
    for id in ids {
        match hex_range(id) {
            Some(HexSearch::Exact(b)) => {
                if let Some(q) = es.get_quad_by_id(txn, &b)? {
                    quads.push(q);
                }
            }
            Some(HexSearch::Range(lo, hi)) => {
                let lower = pad(&lo, 32, 0);
                let upper = pad(&hi, 32, 0);
                let range = KeyRange::upper_exclusive(&lower, &upper);
                for row in es.store().by_id.range(txn, &range)? {
                    let (_, v) = row?;
                    quads.push(crate::event_store::quad_from(v));
                }
            }
            Some(HexSearch::LowerOnly(lo)) => {
                let lower = pad(&lo, 32, 0);
                let range = KeyRange::lower_only(&lower);
                for row in es.store().by_id.range(txn, &range)? {
                    let (_, v) = row?;
                    quads.push(crate::event_store::quad_from(v));
                }
            }
            None => {}
        }
    }
    let mut candidates: Vec<(i64, u64, Event)> = Vec::with_capacity(quads.len());
    for quad in quads {
        if quad > snapshot_max {
            continue;
        }
        if let Some((_, event)) = es.get_by_quad(txn, quad)? {
            if filter.interested_in_event(&event) {
                candidates.push((event.created_at, quad, event));
            }
        }
    }
    candidates.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
    for (_, _, event) in candidates {
        if let Some(l) = limit {
            if state.sent_current >= l {
                break;
            }
        }
        if !deliver(sub_id, event, state, outbound) {
            return Ok(FilterProgress::ClientGone);
        }
    }
    Ok(FilterProgress::Done)
}

#[allow(clippy::too_many_arguments)]
fn scan_replaceable(
    es: &EventStore,
    txn: &RoTxn,
    sub_id: &str,
    lookups: &[Vec<u8>],
    filter: &ReqFilter,
    snapshot_max: u64,
    limit: Option<u64>,
    state: &mut ScanState,
    outbound: &mpsc::Sender<Outbound>,
) -> Result<FilterProgress> {
    let mut candidates: Vec<(i64, u64, Event)> = Vec::with_capacity(lookups.len());
    for key in lookups {
        if let Some(v) = es.store().replaceable.get(txn, key)? {
            let quad = crate::event_store::quad_from(v);
            if quad > snapshot_max {
                continue;
            }
            if let Some((_, event)) = es.get_by_quad(txn, quad)? {
                if filter.interested_in_event(&event) {
                    candidates.push((event.created_at, quad, event));
                }
            }
        }
    }
    candidates.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
    for (_, _, event) in candidates {
        if let Some(l) = limit {
            if state.sent_current >= l {
                break;
            }
        }
        if !deliver(sub_id, event, state, outbound) {
            return Ok(FilterProgress::ClientGone);
        }
    }
    Ok(FilterProgress::Done)
}

#[allow(clippy::too_many_arguments)]
fn scan_ranges(
    es: &EventStore,
    txn: &RoTxn,
    sub_id: &str,
    index: IndexId,
    specs: &[RangeSpec],
    filter: &ReqFilter,
    snapshot_max: u64,
    limit: Option<u64>,
    state: &mut ScanState,
    outbound: &mpsc::Sender<Outbound>,
    deadline: Instant,
    cancelled: &AtomicBool,
) -> Result<FilterProgress> {
    let db: Database<Bytes, Bytes> = match index {
        IndexId::PubkeyKind => es.store().by_pubkey_kind,
        IndexId::Pubkey => es.store().by_pubkey,
        IndexId::Kind => es.store().by_kind,
        IndexId::Tag => es.store().by_tag,
        IndexId::CreatedAt => es.store().by_created_at,
    };

    // rebuild cursors, honoring any checkpoint from a prior slice
    let fresh = RangeResume::Start;
    let mut iters = Vec::with_capacity(specs.len());
    let mut last_popped: Vec<Option<Vec<u8>>> = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let resume = state
            .resume
            .as_ref()
            .and_then(|r| r.get(i))
            .unwrap_or(&fresh);
        let iter = match resume {
            RangeResume::Done => None,
            RangeResume::Start => {
                let range = if spec.upper_inclusive {
                    KeyRange::inclusive(&spec.lower, &spec.upper)
                } else {
                    KeyRange::upper_exclusive(&spec.lower, &spec.upper)
                };
                Some(db.rev_range(txn, &range)?)
            }
            RangeResume::At(key) => {
                let range = KeyRange::upper_exclusive(&spec.lower, key);
                Some(db.rev_range(txn, &range)?)
            }
        };
        last_popped.push(match resume {
            RangeResume::At(key) => Some(key.clone()),
            _ => None,
        });
        iters.push(iter);
    }

    // prime the heap with each live cursor's head
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    for (i, iter) in iters.iter_mut().enumerate() {
        let mut exhausted = false;
        if let Some(it) = iter.as_mut() {
            match it.next().transpose()? {
                Some((k, _)) => {
                    if let Some((created, quad)) = decode_index_key(k) {
                        heap.push(HeapEntry {
                            created,
                            quad,
                            spec_idx: i,
                            key: k.to_vec(),
                        });
                    }
                }
                None => exhausted = true,
            }
        }
        if exhausted {
            *iter = None;
        }
    }

    let mut ops: usize = 0;
    while let Some(entry) = heap.pop() {
        let spec_idx = entry.spec_idx;
        last_popped[spec_idx] = Some(entry.key);
        // refill from the cursor we just consumed
        let mut exhausted = false;
        if let Some(it) = iters[spec_idx].as_mut() {
            match it.next().transpose()? {
                Some((k, _)) => {
                    if let Some((created, quad)) = decode_index_key(k) {
                        heap.push(HeapEntry {
                            created,
                            quad,
                            spec_idx,
                            key: k.to_vec(),
                        });
                    }
                }
                None => exhausted = true,
            }
        }
        if exhausted {
            iters[spec_idx] = None;
        }

        if entry.quad <= snapshot_max {
            if let Some((_, event)) = es.get_by_quad(txn, entry.quad)? {
                if filter.interested_in_event(&event)
                    && !deliver(sub_id, event, state, outbound)
                {
                    return Ok(FilterProgress::ClientGone);
                }
                if let Some(l) = limit {
                    if state.sent_current >= l {
                        return Ok(FilterProgress::Done);
                    }
                }
            }
        }

        ops += 1;
        if ops % CHECK_INTERVAL == 0 {
            if cancelled.load(Ordering::Relaxed) {
                return Ok(FilterProgress::Cancelled);
            }
            if Instant::now() >= deadline {
                // checkpoint every cursor and yield
                let mut resume = Vec::with_capacity(specs.len());
                for i in 0..specs.len() {
                    resume.push(match (&iters[i], &last_popped[i]) {
                        (None, _) => RangeResume::Done,
                        (Some(_), Some(k)) => RangeResume::At(k.clone()),
                        (Some(_), None) => RangeResume::Start,
                    });
                }
                state.resume = Some(resume);
                return Ok(FilterProgress::Budget);
            }
        }
    }
    Ok(FilterProgress::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn filter_from(json: &str) -> ReqFilter {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn lru_set_dedups_and_evicts() {
        let mut lru = LruSet::new(2);
        assert!(lru.insert("a"));
        assert!(!lru.insert("a"));
        assert!(lru.insert("b"));
        assert!(lru.insert("c"));
        // "a" fell out of the window
        assert!(lru.insert("a"));
    }

    #[test]
    fn effective_limit_caps() {
        let mut f = filter_from(r#"{"kinds":[1]}"#);
        assert_eq!(effective_limit(&f, None), None);
        assert_eq!(effective_limit(&f, Some(100)), Some(100));
        f.limit = Some(5);
        assert_eq!(effective_limit(&f, Some(100)), Some(5));
        f.limit = Some(500);
        assert_eq!(effective_limit(&f, Some(100)), Some(100));
    }

    #[test]
    fn plan_prefers_ids() {
        let f = filter_from(r#"{"ids":["aa"],"kinds":[1],"authors":["bb"]}"#);
        assert!(matches!(plan_filter(&f), ScanPlan::Ids(_)));
    }

    #[test]
    fn plan_replaceable_winner_lookup() {
        let author = "a".repeat(64);
        let f = filter_from(&format!(r#"{{"authors":["{author}"],"kinds":[0,3]}}"#));
        match plan_filter(&f) {
            ScanPlan::Replaceable(keys) => assert_eq!(keys.len(), 2),
            _ => panic!("expected replaceable plan"),
        }
    }

    #[test]
    fn plan_pubkey_kind_for_exact_authors() {
        let author = "a".repeat(64);
        let f = filter_from(&format!(r#"{{"authors":["{author}"],"kinds":[1,7]}}"#));
        match plan_filter(&f) {
            ScanPlan::Ranges(IndexId::PubkeyKind, specs) => assert_eq!(specs.len(), 2),
            _ => panic!("expected pubkey-kind plan"),
        }
    }

    #[test]
    fn plan_prefix_author_uses_pubkey_index() {
        let f = filter_from(r#"{"authors":["ab"],"kinds":[1]}"#);
        match plan_filter(&f) {
            ScanPlan::Ranges(IndexId::Pubkey, specs) => {
                assert_eq!(specs.len(), 1);
                assert!(!specs[0].upper_inclusive);
            }
            _ => panic!("expected pubkey plan"),
        }
    }

    #[test]
    fn plan_tag_beats_kind_alone() {
        let f = filter_from(r##"{"#e":["aaaa"]}"##);
        assert!(matches!(plan_filter(&f), ScanPlan::Ranges(IndexId::Tag, _)));
    }

    #[test]
    fn plan_fallback_created_at() {
        let f = filter_from(r#"{"since":100,"until":200}"#);
        match plan_filter(&f) {
            ScanPlan::Ranges(IndexId::CreatedAt, specs) => {
                assert_eq!(specs.len(), 1);
                assert_eq!(&specs[0].lower[..8], &100u64.to_be_bytes());
            }
            _ => panic!("expected created_at plan"),
        }
    }

    fn test_event(id_byte: u8, pubkey_byte: u8, kind: u16, created_at: i64) -> Event {
        Event {
            id: hex::encode([id_byte; 32]),
            pubkey: hex::encode([pubkey_byte; 32]),
            created_at,
            kind,
            tags: vec![],
            content: "".into(),
            sig: hex::encode([0u8; 64]),
        }
    }

    fn seeded_store(events: &[Event]) -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path(), 16).unwrap();
        let es = EventStore::new(store);
        let mut last_quad = 0;
        let mut txn = es.store().txn_rw().unwrap();
        for e in events {
            es.install(&mut txn, e, 1000, &mut last_quad).unwrap();
        }
        txn.commit().unwrap();
        (dir, es)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut ids = vec![];
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Event { event, .. } = msg {
                ids.push(event.id.clone());
            }
        }
        ids
    }

    #[test]
    fn scan_kind_newest_first_with_limit() {
        let events: Vec<Event> = (1..=5u8)
            .map(|i| test_event(i, 1, 1, 1000 + i as i64))
            .collect();
        let (_dir, es) = seeded_store(&events);
        let sub: Subscription =
            serde_json::from_str(r#"["REQ","s1",{"kinds":[1],"limit":2}]"#).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let job = ScanJob::new(Uuid::new_v4(), sub, tx, Arc::new(AtomicBool::new(false)));
        let (result, job) = run_slice(job, &es, Duration::from_secs(5), None);
        assert!(matches!(result, SliceResult::Done));
        assert_eq!(job.state.snapshot_max, Some(5));
        let ids = drain(&mut rx);
        // two newest (created 1005, 1004)
        assert_eq!(ids, vec![events[4].id.clone(), events[3].id.clone()]);
    }

    #[test]
    fn scan_dedups_across_filters() {
        let events = vec![test_event(1, 7, 1, 1000)];
        let (_dir, es) = seeded_store(&events);
        let author = hex::encode([7u8; 32]);
        let sub: Subscription = serde_json::from_str(&format!(
            r#"["REQ","s1",{{"kinds":[1]}},{{"authors":["{author}"]}}]"#
        ))
        .unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let job = ScanJob::new(Uuid::new_v4(), sub, tx, Arc::new(AtomicBool::new(false)));
        let (result, _) = run_slice(job, &es, Duration::from_secs(5), None);
        assert!(matches!(result, SliceResult::Done));
        // both filters match the same event; it is sent exactly once
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn scan_ids_exact_lookup() {
        let events = vec![test_event(1, 1, 1, 1000), test_event(2, 1, 1, 1001)];
        let (_dir, es) = seeded_store(&events);
        let sub: Subscription = serde_json::from_str(&format!(
            r#"["REQ","s1",{{"ids":["{}"]}}]"#,
            events[0].id
        ))
        .unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let job = ScanJob::new(Uuid::new_v4(), sub, tx, Arc::new(AtomicBool::new(false)));
        let (result, _) = run_slice(job, &es, Duration::from_secs(5), None);
        assert!(matches!(result, SliceResult::Done));
        assert_eq!(drain(&mut rx), vec![events[0].id.clone()]);
    }

    #[test]
    fn scan_yields_on_exhausted_budget_and_resumes() {
        let events: Vec<Event> = (0..200)
            .map(|i| test_event(i as u8, 1, 1, 1000 + i))
            .collect();
        // ids collide above: use two distinguishing bytes
        let events: Vec<Event> = events
            .into_iter()
            .enumerate()
            .map(|(i, mut e)| {
                let mut id = [0u8; 32];
                id[0] = (i / 256) as u8;
                id[1] = (i % 256) as u8;
                e.id = hex::encode(id);
                e
            })
            .collect();
        let (_dir, es) = seeded_store(&events);
        let sub: Subscription = serde_json::from_str(r#"["REQ","big",{"kinds":[1]}]"#).unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        let mut job = ScanJob::new(Uuid::new_v4(), sub, tx, Arc::new(AtomicBool::new(false)));
        // a zero-length budget forces a yield at the first check
        let mut slices = 0;
        loop {
            let (result, j) = run_slice(job, &es, Duration::from_micros(0), None);
            job = j;
            slices += 1;
            match result {
                SliceResult::Yielded => continue,
                SliceResult::Done => break,
                _ => panic!("unexpected slice result"),
            }
        }
        assert!(slices > 1, "scan should have yielded at least once");
        let ids = drain(&mut rx);
        assert_eq!(ids.len(), 200, "every event delivered exactly once");
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 200);
    }

    #[test]
    fn cancelled_scan_stops() {
        let events: Vec<Event> = (1..=5u8).map(|i| test_event(i, 1, 1, 1000)).collect();
        let (_dir, es) = seeded_store(&events);
        let sub: Subscription = serde_json::from_str(r#"["REQ","s1",{"kinds":[1]}]"#).unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let cancelled = Arc::new(AtomicBool::new(true));
        let job = ScanJob::new(Uuid::new_v4(), sub, tx, cancelled);
        let (result, _) = run_slice(job, &es, Duration::from_secs(5), None);
        assert!(matches!(result, SliceResult::Cancelled));
    }
}
