//! Live subscription monitors
//!
//! Connections are partitioned across N monitor tasks, so all
//! fan-out for one connection is single-threaded and ordered.  The
//! writer publishes a committed watermark; each partition re-reads
//! the committed rows from its own store snapshot, which is also how
//! a freshly registered subscription catches up on anything committed
//! between its scan snapshot and the hand-off.
use crate::conn::Outbound;
use crate::event::Event;
use crate::event_store::{EphemeralBuffer, EventStore};
use crate::server::RelayMetrics;
use crate::subscription::Subscription;
use crate::writer::CommitNotice;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Commands routed to the monitor partition owning a connection.
pub enum MonitorCmd {
    /// Hand a subscription over after its historical scan.
    Register {
        conn_id: Uuid,
        sub: Subscription,
        outbound: mpsc::Sender<Outbound>,
        /// Highest quadID the initial scan has considered.
        latest_quad: u64,
    },
    /// CLOSE: drop one subscription.
    Close { conn_id: Uuid, sub_id: String },
    /// Connection loss: drop everything the connection owns.
    Disconnect { conn_id: Uuid },
}

impl MonitorCmd {
    fn conn_id(&self) -> Uuid {
        match self {
            MonitorCmd::Register { conn_id, .. }
            | MonitorCmd::Close { conn_id, .. }
            | MonitorCmd::Disconnect { conn_id } => *conn_id,
        }
    }
}

/// Senders for every monitor partition, routed by connection id.
#[derive(Clone)]
pub struct MonitorHandles {
    txs: Vec<mpsc::Sender<MonitorCmd>>,
}

impl MonitorHandles {
    fn partition(&self, conn_id: &Uuid) -> usize {
        (conn_id.as_u128() % self.txs.len() as u128) as usize
    }

    /// Route a command to the partition owning its connection.
    pub async fn send(&self, cmd: MonitorCmd) {
        let idx = self.partition(&cmd.conn_id());
        // a closed partition only happens during shutdown
        self.txs[idx].send(cmd).await.ok();
    }
}

/// Spawn the monitor pool; each partition subscribes to the writer's
/// commit channel independently.
pub fn start_req_monitors(
    threads: usize,
    event_store: EventStore,
    ephemeral: EphemeralBuffer,
    commit_tx: &broadcast::Sender<CommitNotice>,
    initial_processed: u64,
    cmd_buffer: usize,
    metrics: RelayMetrics,
    shutdown: &broadcast::Sender<()>,
) -> MonitorHandles {
    let mut txs = Vec::with_capacity(threads);
    for partition in 0..threads {
        let (tx, rx) = mpsc::channel::<MonitorCmd>(cmd_buffer);
        txs.push(tx);
        tokio::task::spawn(monitor_task(
            partition,
            rx,
            commit_tx.subscribe(),
            event_store.clone(),
            ephemeral.clone(),
            initial_processed,
            metrics.clone(),
            shutdown.subscribe(),
        ));
    }
    MonitorHandles { txs }
}

struct LiveSub {
    sub: Subscription,
    latest_quad: u64,
}

struct ConnState {
    outbound: mpsc::Sender<Outbound>,
    subs: HashMap<String, LiveSub>,
}

#[allow(clippy::too_many_arguments)]
async fn monitor_task(
    partition: usize,
    mut cmd_rx: mpsc::Receiver<MonitorCmd>,
    mut commit_rx: broadcast::Receiver<CommitNotice>,
    event_store: EventStore,
    ephemeral: EphemeralBuffer,
    mut processed: u64,
    metrics: RelayMetrics,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut conns: HashMap<Uuid, ConnState> = HashMap::new();
    trace!("monitor partition {} started at quad {}", partition, processed);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        handle_cmd(cmd, &mut conns, &event_store, &ephemeral, processed, &metrics).await;
                    }
                    None => break,
                }
            },
            notice = commit_rx.recv() => {
                match notice {
                    Ok(CommitNotice::Ephemeral { quad, event }) => {
                        fan_out(&mut conns, quad, &event, &metrics);
                        processed = processed.max(quad);
                    }
                    Ok(CommitNotice::Committed { max_quad }) => {
                        if max_quad > processed {
                            match read_range(&event_store, processed, max_quad).await {
                                Ok(rows) => {
                                    for (quad, event) in rows {
                                        fan_out(&mut conns, quad, &Arc::new(event), &metrics);
                                    }
                                    processed = max_quad;
                                }
                                Err(e) => {
                                    warn!("monitor {} failed to read commits: {}", partition, e);
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // committed rows are re-read from the store on
                        // the next watermark, so lag loses at most
                        // ephemeral deliveries
                        warn!("monitor {} lagged, {} notices dropped", partition, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            },
        }
    }
    info!("monitor partition {} shutdown", partition);
}

async fn read_range(
    event_store: &EventStore,
    after: u64,
    upto: u64,
) -> crate::error::Result<Vec<(u64, Event)>> {
    let es = event_store.clone();
    task::spawn_blocking(move || {
        let txn = es.store().txn_ro()?;
        es.scan_quad_range(&txn, after, upto)
    })
    .await
    .map_err(|e| crate::error::Error::InternalError(format!("monitor read task: {e}")))?
}

/// Test one event against every subscription of the partition.  The
/// high-water mark advances for every subscription regardless of
/// matching, which is what keeps delivery exactly-once.
fn fan_out(
    conns: &mut HashMap<Uuid, ConnState>,
    quad: u64,
    event: &Arc<Event>,
    metrics: &RelayMetrics,
) {
    for conn in conns.values_mut() {
        for live in conn.subs.values_mut() {
            if live.latest_quad >= quad {
                continue;
            }
            live.latest_quad = quad;
            if !live.sub.interested_in_event(event) {
                continue;
            }
            match conn.outbound.try_send(Outbound::Event {
                sub_id: live.sub.id.clone(),
                event: event.clone(),
            }) {
                Ok(()) => {
                    metrics.sent_events.with_label_values(&["realtime"]).inc();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // a reader this far behind loses realtime events
                    metrics.query_aborts.with_label_values(&["slow_client"]).inc();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

async fn handle_cmd(
    cmd: MonitorCmd,
    conns: &mut HashMap<Uuid, ConnState>,
    event_store: &EventStore,
    ephemeral: &EphemeralBuffer,
    processed: u64,
    metrics: &RelayMetrics,
) {
    match cmd {
        MonitorCmd::Register {
            conn_id,
            sub,
            outbound,
            latest_quad,
        } => {
            debug!(
                "monitor registering sub {:?} at quad {} (partition watermark {})",
                sub.id, latest_quad, processed
            );
            // catch up over the gap between the scan snapshot and
            // this partition's watermark before going live
            if latest_quad < processed {
                let mut rows: Vec<(u64, Arc<Event>)> =
                    match read_range(event_store, latest_quad, processed).await {
                        Ok(r) => r.into_iter().map(|(q, e)| (q, Arc::new(e))).collect(),
                        Err(e) => {
                            warn!("monitor catch-up read failed: {}", e);
                            Vec::new()
                        }
                    };
                rows.extend(ephemeral.range(latest_quad, processed));
                rows.sort_unstable_by_key(|(q, _)| *q);
                for (_, event) in rows {
                    if sub.interested_in_event(&event) {
                        let sent = outbound
                            .send(Outbound::Event {
                                sub_id: sub.id.clone(),
                                event,
                            })
                            .await;
                        if sent.is_err() {
                            return;
                        }
                        metrics.sent_events.with_label_values(&["realtime"]).inc();
                    }
                }
            }
            let conn = conns.entry(conn_id).or_insert_with(|| ConnState {
                outbound: outbound.clone(),
                subs: HashMap::new(),
            });
            conn.outbound = outbound;
            // a subscription reusing a live id replaces it
            conn.subs.insert(
                sub.id.clone(),
                LiveSub {
                    sub,
                    latest_quad: latest_quad.max(processed),
                },
            );
        }
        MonitorCmd::Close { conn_id, sub_id } => {
            if let Some(conn) = conns.get_mut(&conn_id) {
                conn.subs.remove(&sub_id);
                if conn.subs.is_empty() {
                    conns.remove(&conn_id);
                }
            }
        }
        MonitorCmd::Disconnect { conn_id } => {
            conns.remove(&conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_event(id_byte: u8, kind: u16) -> Arc<Event> {
        Arc::new(Event {
            id: hex::encode([id_byte; 32]),
            pubkey: hex::encode([1u8; 32]),
            created_at: 1000,
            kind,
            tags: vec![],
            content: "".into(),
            sig: hex::encode([0u8; 64]),
        })
    }

    fn live(sub_json: &str, latest: u64) -> LiveSub {
        LiveSub {
            sub: serde_json::from_str(sub_json).unwrap(),
            latest_quad: latest,
        }
    }

    fn metrics() -> RelayMetrics {
        crate::server::create_metrics().1
    }

    #[tokio::test]
    async fn fan_out_respects_watermark() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut conns = HashMap::new();
        let mut subs = HashMap::new();
        subs.insert("s1".to_string(), live(r#"["REQ","s1",{"kinds":[1]}]"#, 5));
        conns.insert(Uuid::new_v4(), ConnState { outbound: tx, subs });
        let m = metrics();

        // quad at or below the subscription watermark: skipped
        fan_out(&mut conns, 5, &test_event(1, 1), &m);
        assert!(rx.try_recv().is_err());
        // above the watermark: delivered once
        fan_out(&mut conns, 6, &test_event(2, 1), &m);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Event { .. })));
        // re-delivery of the same quad is refused
        fan_out(&mut conns, 6, &test_event(2, 1), &m);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn watermark_advances_even_without_match() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut conns = HashMap::new();
        let mut subs = HashMap::new();
        subs.insert("s1".to_string(), live(r#"["REQ","s1",{"kinds":[7]}]"#, 0));
        let conn_id = Uuid::new_v4();
        conns.insert(conn_id, ConnState { outbound: tx, subs });
        let m = metrics();

        // kind 1 does not match the filter, but the watermark moves
        fan_out(&mut conns, 3, &test_event(1, 1), &m);
        assert!(rx.try_recv().is_err());
        let latest = conns[&conn_id].subs["s1"].latest_quad;
        assert_eq!(latest, 3);
    }
}
