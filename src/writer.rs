//! Singleton store writer
//!
//! Owns the one write transaction.  Drains bounded batches from the
//! ingesters, installs them in a single commit, then publishes the
//! committed watermark to the subscription monitors and answers each
//! submitter.
use crate::config::Settings;
use crate::conn::Outbound;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::event_store::{EphemeralBuffer, EventStore, Outcome};
use crate::notice::Notice;
use crate::server::RelayMetrics;
use crate::store::Store;
use crate::utils::unix_time;
use governor::{Quota, RateLimiter};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

/// A verified event awaiting persistence, with the channel its OK
/// result goes back on.
pub struct SubmittedEvent {
    pub event: Arc<Event>,
    pub outbound: mpsc::Sender<Outbound>,
    pub source_ip: String,
}

/// Publication from the writer to the subscription monitors.
#[derive(Clone, Debug)]
pub enum CommitNotice {
    /// Events up to this quadID are committed and readable.
    Committed { max_quad: u64 },
    /// An ephemeral event was admitted; it has no store row, so the
    /// payload rides along.
    Ephemeral { quad: u64, event: Arc<Event> },
}

/// Run the writer until shutdown or a fatal store error.
pub async fn run_writer(
    event_store: EventStore,
    ephemeral: EphemeralBuffer,
    settings: Settings,
    mut event_rx: mpsc::Receiver<SubmittedEvent>,
    commit_tx: broadcast::Sender<CommitNotice>,
    invoke_shutdown: broadcast::Sender<()>,
    metrics: RelayMetrics,
) -> Result<()> {
    // recover the allocation counter from the primary table
    let mut last_quad = {
        let txn = event_store.store().txn_ro()?;
        event_store.max_quad(&txn)?
    };
    info!("writer started, log position recovered at {}", last_quad);

    // writer-side admission rate limit
    let lim_opt = settings
        .limits
        .messages_per_sec
        .and_then(core::num::NonZeroU32::new)
        .map(|rps| RateLimiter::direct(Quota::per_second(rps)));

    let mut shutdown_rx = invoke_shutdown.subscribe();
    let batch_window = tokio::time::Duration::from_millis(settings.writer.batch_window_ms);
    let max_batch = settings.writer.max_batch_events.max(1);
    let retention = settings.options.ephemeral_retention_seconds;

    loop {
        // block for the first event of the next batch
        let first = tokio::select! {
            _ = shutdown_rx.recv() => break,
            ev = event_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        // accumulate until the batch fills or the window elapses
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + batch_window;
        while batch.len() < max_batch {
            match tokio::time::timeout_at(deadline, event_rx.recv()).await {
                Ok(Some(ev)) => batch.push(ev),
                Ok(None) | Err(_) => break,
            }
        }

        let now = unix_time();
        let mut persist: Vec<SubmittedEvent> = Vec::with_capacity(batch.len());
        for sub in batch {
            if let Some(lim) = &lim_opt {
                if lim.check().is_err() {
                    sub.outbound
                        .try_send(Outbound::Notice(Notice::rate_limited(
                            sub.event.id.clone(),
                            "slow down",
                        )))
                        .ok();
                    continue;
                }
            }
            if sub.event.is_ephemeral() {
                // delivered without a commit; buffered so monitor
                // registration can catch up on it
                last_quad += 1;
                ephemeral.push(last_quad, sub.event.clone(), now, retention);
                commit_tx
                    .send(CommitNotice::Ephemeral {
                        quad: last_quad,
                        event: sub.event.clone(),
                    })
                    .ok();
                sub.outbound
                    .try_send(Outbound::Notice(Notice::saved(sub.event.id.clone())))
                    .ok();
            } else {
                persist.push(sub);
            }
        }
        if persist.is_empty() {
            continue;
        }

        let start = Instant::now();
        match commit_batch(&event_store, &persist, now, last_quad, settings.writer.commit_retries)
            .await
        {
            BatchResult::Committed { outcomes, counter } => {
                last_quad = counter;
                metrics.write_events.observe(start.elapsed().as_secs_f64());
                // monitors read committed state only, so the
                // watermark goes out strictly after the commit
                if let Some(max_quad) = outcomes.iter().filter_map(Outcome::quad_id).max() {
                    commit_tx.send(CommitNotice::Committed { max_quad }).ok();
                }
                for (sub, outcome) in persist.iter().zip(outcomes) {
                    let id = sub.event.id.clone();
                    let notice = match outcome {
                        Outcome::Stored(_) | Outcome::Replaced(_) => Notice::saved(id),
                        Outcome::Duplicate => {
                            debug!("ignoring duplicate event: {}", sub.event.get_event_id_prefix());
                            Notice::duplicate(id)
                        }
                        Outcome::Shadowed => Notice::shadowed(id),
                    };
                    sub.outbound.try_send(Outbound::Notice(notice)).ok();
                }
            }
            BatchResult::Failed(e) => {
                warn!("writer giving up on batch: {}", e);
                for sub in &persist {
                    sub.outbound
                        .try_send(Outbound::Notice(Notice::error(
                            sub.event.id.clone(),
                            "relay could not store the event",
                        )))
                        .ok();
                }
            }
            BatchResult::Fatal(e) => {
                error!("fatal store error, shutting down: {}", e);
                for sub in &persist {
                    sub.outbound
                        .try_send(Outbound::Notice(Notice::error(
                            sub.event.id.clone(),
                            "relay store failure",
                        )))
                        .ok();
                }
                invoke_shutdown.send(()).ok();
                return Err(e);
            }
        }
    }
    info!("writer shutdown");
    Ok(())
}

enum BatchResult {
    Committed { outcomes: Vec<Outcome>, counter: u64 },
    /// transient failure after exhausting retries
    Failed(Error),
    /// unrecoverable store failure
    Fatal(Error),
}

/// Install a batch inside one write transaction, retrying transient
/// commit failures.
async fn commit_batch(
    event_store: &EventStore,
    batch: &[SubmittedEvent],
    received_at: u64,
    counter_in: u64,
    retries: usize,
) -> BatchResult {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let es = event_store.clone();
        let events: Vec<Arc<Event>> = batch.iter().map(|s| s.event.clone()).collect();
        let result = task::spawn_blocking(move || -> Result<(Vec<Outcome>, u64)> {
            let mut txn = es.store().txn_rw()?;
            let mut counter = counter_in;
            let mut outcomes = Vec::with_capacity(events.len());
            for event in &events {
                outcomes.push(es.install(&mut txn, event, received_at, &mut counter)?);
            }
            txn.commit()?;
            Ok((outcomes, counter))
        })
        .await;

        let err = match result {
            Ok(Ok((outcomes, counter))) => {
                return BatchResult::Committed { outcomes, counter }
            }
            Ok(Err(e)) => e,
            Err(join_err) => Error::InternalError(format!("writer task panicked: {join_err}")),
        };
        if let Error::StoreError(ref he) = err {
            if Store::is_fatal(he) {
                return BatchResult::Fatal(err);
            }
        }
        if attempt > retries {
            return BatchResult::Failed(err);
        }
        warn!("commit attempt {} failed, retrying: {}", attempt, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn signedish_event(id_byte: u8, kind: u16) -> Arc<Event> {
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

    #[tokio::test]
    async fn batch_commit_assigns_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path(), 16).unwrap();
        let es = EventStore::new(store);
        let (tx, _rx) = mpsc::channel::<Outbound>(16);
        let batch: Vec<SubmittedEvent> = (1..=3u8)
            .map(|i| SubmittedEvent {
                event: signedish_event(i, 1),
                outbound: tx.clone(),
                source_ip: "test".into(),
            })
            .collect();
        match commit_batch(&es, &batch, 1000, 0, 2).await {
            BatchResult::Committed { outcomes, counter } => {
                assert_eq!(counter, 3);
                let quads: Vec<u64> = outcomes.iter().filter_map(Outcome::quad_id).collect();
                assert_eq!(quads, vec![1, 2, 3]);
            }
            _ => panic!("expected commit"),
        }
    }

    #[tokio::test]
    async fn duplicate_within_batch_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path(), 16).unwrap();
        let es = EventStore::new(store);
        let (tx, _rx) = mpsc::channel::<Outbound>(16);
        let ev = signedish_event(9, 1);
        let batch: Vec<SubmittedEvent> = (0..2)
            .map(|_| SubmittedEvent {
                event: ev.clone(),
                outbound: tx.clone(),
                source_ip: "test".into(),
            })
            .collect();
        match commit_batch(&es, &batch, 1000, 0, 2).await {
            BatchResult::Committed { outcomes, .. } => {
                assert_eq!(outcomes[0], Outcome::Stored(1));
                assert_eq!(outcomes[1], Outcome::Duplicate);
            }
            _ => panic!("expected commit"),
        }
    }
}
