//! Ingester pool: validation, signature verification and dispatch
//!
//! N workers pull parsed client messages off one bounded queue.
//! EVENT submissions are verified and checked against the write
//! policy here, in parallel, before anything reaches the writer.
use crate::close::Close;
use crate::config::Settings;
use crate::conn::Outbound;
use crate::event::Event;
use crate::negentropy::NegJob;
use crate::negentropy::NegJobKind;
use crate::notice::Notice;
use crate::policy::{PolicyResult, WritePolicy};
use crate::req_monitor::{MonitorCmd, MonitorHandles};
use crate::req_worker::ScanJob;
use crate::subscription::{ReqFilter, Subscription};
use crate::writer::SubmittedEvent;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// A parsed client message, ready for ingestion.
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        sub: Subscription,
        cancelled: Arc<AtomicBool>,
    },
    Close(Close),
    NegOpen {
        sub_id: String,
        filter: ReqFilter,
        initial: Vec<u8>,
    },
    NegMsg {
        sub_id: String,
        message: Vec<u8>,
    },
    NegClose {
        sub_id: String,
    },
}

/// One unit of ingester work: a message plus its connection context.
pub struct IngestJob {
    pub conn_id: Uuid,
    pub source_ip: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub msg: ClientMessage,
}

/// Shared handles the ingesters dispatch into.
#[derive(Clone)]
pub struct IngesterContext {
    pub settings: Settings,
    pub policy: Arc<dyn WritePolicy>,
    pub writer_tx: mpsc::Sender<SubmittedEvent>,
    pub scan_tx: mpsc::Sender<ScanJob>,
    pub monitors: MonitorHandles,
    pub neg_tx: mpsc::Sender<NegJob>,
}

/// Spawn the ingester pool over a shared receiver.
pub fn start_ingesters(
    rx: mpsc::Receiver<IngestJob>,
    ctx: IngesterContext,
    shutdown: &broadcast::Sender<()>,
) {
    let shared = Arc::new(Mutex::new(rx));
    for worker_id in 0..ctx.settings.workers.ingester_threads {
        tokio::task::spawn(ingester_worker(
            worker_id,
            shared.clone(),
            ctx.clone(),
            shutdown.subscribe(),
        ));
    }
}

async fn recv_shared(rx: &Mutex<mpsc::Receiver<IngestJob>>) -> Option<IngestJob> {
    rx.lock().await.recv().await
}

async fn ingester_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<IngestJob>>>,
    ctx: IngesterContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    trace!("ingester {} started", worker_id);
    loop {
        let job = tokio::select! {
            _ = shutdown.recv() => break,
            j = recv_shared(&rx) => match j {
                Some(j) => j,
                None => break,
            },
        };
        match job.msg {
            ClientMessage::Event(event) => {
                handle_event(&ctx, job.outbound, *event, &job.source_ip).await;
            }
            ClientMessage::Req { sub, cancelled } => {
                // scan planning happens in the req worker; a closed
                // channel means shutdown is underway.
                let scan = ScanJob::new(job.conn_id, sub, job.outbound, cancelled);
                ctx.scan_tx.send(scan).await.ok();
            }
            ClientMessage::Close(c) => {
                ctx.monitors
                    .send(MonitorCmd::Close {
                        conn_id: job.conn_id,
                        sub_id: c.id,
                    })
                    .await;
            }
            ClientMessage::NegOpen {
                sub_id,
                filter,
                initial,
            } => {
                let neg = NegJob {
                    conn_id: job.conn_id,
                    sub_id,
                    outbound: job.outbound,
                    kind: NegJobKind::Open { filter, initial },
                };
                ctx.neg_tx.send(neg).await.ok();
            }
            ClientMessage::NegMsg { sub_id, message } => {
                let neg = NegJob {
                    conn_id: job.conn_id,
                    sub_id,
                    outbound: job.outbound,
                    kind: NegJobKind::Msg { message },
                };
                ctx.neg_tx.send(neg).await.ok();
            }
            ClientMessage::NegClose { sub_id } => {
                let neg = NegJob {
                    conn_id: job.conn_id,
                    sub_id,
                    outbound: job.outbound,
                    kind: NegJobKind::Close,
                };
                ctx.neg_tx.send(neg).await.ok();
            }
        }
    }
    info!("ingester {} shutdown", worker_id);
}

/// Validate and verify a submitted event, consult the policy, and
/// hand it to the writer.  Every failure is reported to the
/// submitting connection and stops here.
async fn handle_event(
    ctx: &IngesterContext,
    outbound: mpsc::Sender<Outbound>,
    event: Event,
    source_ip: &str,
) {
    let id = event.id.clone();
    // structural limits first, they are the cheapest
    if event.tags.len() > ctx.settings.limits.max_event_tags {
        outbound
            .send(Outbound::Notice(Notice::invalid(id, "too many tags")))
            .await
            .ok();
        return;
    }
    // created_at admission window
    if !event.is_valid_timestamp(
        ctx.settings.options.reject_older_seconds,
        ctx.settings.options.reject_newer_seconds,
    ) {
        debug!("rejecting event with out-of-window created_at: {}", event.created_at);
        outbound
            .send(Outbound::Notice(Notice::invalid(
                id,
                "the event created_at field is out of the acceptable range for this relay",
            )))
            .await
            .ok();
        return;
    }
    // canonical id recomputation and schnorr verification.  This is
    // the CPU-heavy part the pool parallelizes.
    if let Err(e) = event.validate() {
        outbound
            .send(Outbound::Notice(Notice::invalid(id, &format!("{e}"))))
            .await
            .ok();
        return;
    }
    // the external write policy gets the last word before persistence
    match ctx.policy.admit_event(&event, source_ip).await {
        PolicyResult::Accept => {
            let submission = SubmittedEvent {
                event: Arc::new(event),
                outbound: outbound.clone(),
                source_ip: source_ip.to_string(),
            };
            // awaiting a full writer queue is the backpressure that
            // pauses this connection's reads
            if ctx.writer_tx.send(submission).await.is_err() {
                outbound
                    .send(Outbound::Notice(Notice::error(id, "relay shutting down")))
                    .await
                    .ok();
            }
        }
        PolicyResult::Deny(msg) => {
            debug!("policy denied event {}: {}", &id[..8.min(id.len())], msg);
            outbound
                .send(Outbound::Notice(Notice::blocked(id, &msg)))
                .await
                .ok();
        }
        PolicyResult::ShadowDeny => {
            // acknowledged but goes nowhere
            outbound
                .send(Outbound::Notice(Notice::saved(id)))
                .await
                .ok();
        }
    }
}
