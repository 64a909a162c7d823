//! Server process
use crate::close::Close;
use crate::close::CloseCmd;
use crate::config::Settings;
use crate::conn;
use crate::conn::Outbound;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::event::EventCmd;
use crate::event_store::{EphemeralBuffer, EventStore};
use crate::info::RelayInfo;
use crate::ingester::{start_ingesters, ClientMessage, IngestJob, IngesterContext};
use crate::negentropy::{start_neg_workers, NegCloseCmd, NegJob, NegMsgCmd, NegOpenCmd};
use crate::notice::Notice;
use crate::policy::AllowAll;
use crate::req_monitor::{start_req_monitors, MonitorCmd, MonitorHandles};
use crate::req_worker::{start_req_workers, ScanJob};
use crate::store::Store;
use crate::subscription::Subscription;
use crate::utils::unix_time;
use crate::writer::{run_writer, CommitNotice, SubmittedEvent};
use futures::SinkExt;
use futures::StreamExt;
use governor::{Jitter, Quota, RateLimiter};
use http::header::HeaderMap;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{
    header, server::conn::AddrStream, upgrade, Body, Request, Response, Server, StatusCode,
};
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::runtime::Builder;
use tokio::sync::broadcast::{self, Receiver};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};
use tungstenite::error::CapacityError::MessageTooLong;
use tungstenite::error::Error as WsError;
use tungstenite::handshake;
use tungstenite::protocol::Message;
use tungstenite::protocol::WebSocketConfig;

fn status_and_text(status: StatusCode, msg: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .header("Server", crate::info::SERVER)
        .body(Body::from(msg))
        .unwrap()
}

/// Handle arbitrary HTTP requests, including for `WebSocket` upgrades.
#[allow(clippy::too_many_arguments)]
async fn handle_web_request(
    mut request: Request<Body>,
    settings: Settings,
    remote_addr: SocketAddr,
    ingest_tx: mpsc::Sender<IngestJob>,
    monitors: MonitorHandles,
    shutdown: Receiver<()>,
    registry: Registry,
    metrics: RelayMetrics,
) -> Result<Response<Body>, Infallible> {
    match (
        request.uri().path(),
        request.headers().contains_key(header::UPGRADE),
    ) {
        // Request for / as websocket
        ("/", true) => {
            trace!("websocket with upgrade request");
            //assume request is a handshake, so create the handshake response
            let response = match handshake::server::create_response_with_body(&request, || {
                Body::empty()
            }) {
                Ok(response) => {
                    //in case the handshake response creation succeeds,
                    //spawn a task to handle the websocket connection
                    tokio::spawn(async move {
                        //using the hyper feature of upgrading a connection
                        match upgrade::on(&mut request).await {
                            //if successfully upgraded
                            Ok(upgraded) => {
                                // set WebSocket configuration options
                                let config = WebSocketConfig {
                                    max_send_queue: Some(1024),
                                    max_message_size: settings.limits.max_ws_message_bytes,
                                    max_frame_size: settings.limits.max_ws_frame_bytes,
                                    ..Default::default()
                                };
                                //create a websocket stream from the upgraded object
                                let ws_stream = WebSocketStream::from_raw_socket(
                                    //pass the upgraded object
                                    //as the base layer stream of the Websocket
                                    upgraded,
                                    tokio_tungstenite::tungstenite::protocol::Role::Server,
                                    Some(config),
                                )
                                .await;
                                let origin = get_header_string("origin", request.headers());
                                let user_agent = get_header_string("user-agent", request.headers());
                                // determine the remote IP from headers if the exist
                                let header_ip = settings
                                    .network
                                    .remote_ip_header
                                    .as_ref()
                                    .and_then(|x| get_header_string(x, request.headers()));
                                // use the socket addr as a backup
                                let remote_ip =
                                    header_ip.unwrap_or_else(|| remote_addr.ip().to_string());
                                let client_info = ClientInfo {
                                    remote_ip,
                                    user_agent,
                                    origin,
                                };
                                // spawn a nostr server with our websocket
                                tokio::spawn(nostr_server(
                                    settings,
                                    client_info,
                                    ws_stream,
                                    ingest_tx,
                                    monitors,
                                    shutdown,
                                    metrics,
                                ));
                            }
                            Err(e) => warn!(
                                "error when trying to upgrade connection \
                                 from address {} to websocket connection: {}",
                                remote_addr, e
                            ),
                        }
                    });
                    //return the response to the handshake request
                    response
                }
                Err(error) => {
                    warn!("websocket response failed");
                    let mut res =
                        Response::new(Body::from(format!("Failed to create websocket: {error}")));
                    *res.status_mut() = StatusCode::BAD_REQUEST;
                    return Ok(res);
                }
            };
            Ok::<_, Infallible>(response)
        }
        // Request for Relay info
        ("/", false) => {
            // handle request at root with no upgrade header
            // Check if this is a nostr server info request
            let accept_header = &request.headers().get(header::ACCEPT);
            // check if application/nostr+json is included
            if let Some(media_types) = accept_header {
                if let Ok(mt_str) = media_types.to_str() {
                    if mt_str.contains("application/nostr+json") {
                        // build a relay info response
                        debug!("Responding to server info request");
                        let rinfo = RelayInfo::from(&settings);
                        let b = Body::from(serde_json::to_string_pretty(&rinfo).unwrap());
                        return Ok(Response::builder()
                            .status(200)
                            .header("Content-Type", "application/nostr+json")
                            .header("Access-Control-Allow-Origin", "*")
                            .body(b)
                            .unwrap());
                    }
                }
            }
            Ok(status_and_text(
                StatusCode::OK,
                "Please use a Nostr client to connect.",
            ))
        }
        ("/metrics", false) => {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            encoder.encode(&metric_families, &mut buffer).unwrap();

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(Body::from(buffer))
                .unwrap())
        }
        (_, _) => {
            //handle any other url
            Ok(status_and_text(StatusCode::NOT_FOUND, "Nothing here."))
        }
    }
}

fn get_header_string(header: &str, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header)
        .and_then(|x| x.to_str().ok().map(std::string::ToString::to_string))
}

// return on a control-c or internally requested shutdown signal
async fn ctrl_c_or_signal(mut shutdown_signal: Receiver<()>) {
    let mut term_signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("could not define signal");
    #[allow(clippy::never_loop)]
    loop {
        tokio::select! {
            _ = shutdown_signal.recv() => {
                info!("Shutting down webserver as requested");
                // server shutting down, exit loop
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down webserver due to SIGINT");
                break;
            },
            _ = term_signal.recv() => {
                info!("Shutting down webserver due to SIGTERM");
                break;
            },
        }
    }
}

/// Build the process-wide telemetry registry and the handle every
/// pool receives.
pub fn create_metrics() -> (Registry, RelayMetrics) {
    // setup prometheus registry
    let registry = Registry::new();

    let query_sub = Histogram::with_opts(HistogramOpts::new(
        "nostr_query_seconds",
        "Subscription response times",
    ))
    .unwrap();
    let write_events = Histogram::with_opts(HistogramOpts::new(
        "nostr_events_write_seconds",
        "Event batch commit times",
    ))
    .unwrap();
    let sent_events = IntCounterVec::new(
        Opts::new("nostr_events_sent_total", "Events sent to clients"),
        vec!["source"].as_slice(),
    )
    .unwrap();
    let connections =
        IntCounter::with_opts(Opts::new("nostr_connections_total", "New connections")).unwrap();
    let query_aborts = IntCounterVec::new(
        Opts::new("nostr_query_abort_total", "Aborted queries"),
        vec!["reason"].as_slice(),
    )
    .unwrap();
    let cmd_req = IntCounter::with_opts(Opts::new("nostr_cmd_req_total", "REQ commands")).unwrap();
    let cmd_event =
        IntCounter::with_opts(Opts::new("nostr_cmd_event_total", "EVENT commands")).unwrap();
    let cmd_close =
        IntCounter::with_opts(Opts::new("nostr_cmd_close_total", "CLOSE commands")).unwrap();
    let cmd_neg =
        IntCounter::with_opts(Opts::new("nostr_cmd_neg_total", "Negentropy commands")).unwrap();
    let disconnects = IntCounterVec::new(
        Opts::new("nostr_disconnects_total", "Client disconnects"),
        vec!["reason"].as_slice(),
    )
    .unwrap();
    let active_subscriptions = IntGauge::with_opts(Opts::new(
        "nostr_active_subscriptions",
        "Registered subscriptions",
    ))
    .unwrap();
    registry.register(Box::new(query_sub.clone())).unwrap();
    registry.register(Box::new(write_events.clone())).unwrap();
    registry.register(Box::new(sent_events.clone())).unwrap();
    registry.register(Box::new(connections.clone())).unwrap();
    registry.register(Box::new(query_aborts.clone())).unwrap();
    registry.register(Box::new(cmd_req.clone())).unwrap();
    registry.register(Box::new(cmd_event.clone())).unwrap();
    registry.register(Box::new(cmd_close.clone())).unwrap();
    registry.register(Box::new(cmd_neg.clone())).unwrap();
    registry.register(Box::new(disconnects.clone())).unwrap();
    registry
        .register(Box::new(active_subscriptions.clone()))
        .unwrap();
    let metrics = RelayMetrics {
        query_sub,
        write_events,
        sent_events,
        connections,
        disconnects,
        query_aborts,
        cmd_req,
        cmd_event,
        cmd_close,
        cmd_neg,
        active_subscriptions,
    };
    (registry, metrics)
}

/// Start running a Nostr relay server.
pub fn start_server(settings: &Settings, shutdown_rx: MpscReceiver<()>) -> Result<(), Error> {
    trace!("Config: {:?}", settings);
    // do some config validation.
    if !Path::new(&settings.database.data_directory).is_dir() {
        error!("Database directory does not exist");
        return Err(Error::DatabaseDirError);
    }
    let addr = format!(
        "{}:{}",
        settings.network.address.trim(),
        settings.network.port
    );
    let socket_addr = addr.parse().expect("listening address not valid");
    // configure tokio runtime
    let rt = Builder::new_multi_thread()
        .enable_all()
        .thread_name_fn(|| {
            // give each thread a unique numeric name
            static ATOMIC_ID: std::sync::atomic::AtomicUsize =
                std::sync::atomic::AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("tokio-ws-{id}")
        })
        // limit concurrent store blocking threads (scans and commits)
        .max_blocking_threads(settings.limits.max_blocking_threads)
        .on_thread_start(|| {
            trace!("started new thread: {:?}", std::thread::current().name());
        })
        .on_thread_stop(|| {
            trace!("stopped thread: {:?}", std::thread::current().name());
        })
        .build()
        .unwrap();
    // start tokio
    rt.block_on(async {
        let settings = settings.clone();
        info!("listening on: {}", socket_addr);

        // open the store and recover the log watermark
        let store = match Store::open(
            &settings.database.data_directory,
            settings.database.map_size_mb,
        ) {
            Ok(s) => s,
            Err(e) => {
                error!("could not open store: {}", e);
                return;
            }
        };
        let event_store = EventStore::new(store);
        let initial_watermark = {
            let txn = event_store.store().txn_ro().expect("store read");
            event_store.max_quad(&txn).expect("watermark recovery")
        };
        info!("store contains events up to quad {}", initial_watermark);

        // parsed client messages flow to the ingester pool.  Once
        // this fills, connection loops stop reading their sockets.
        let (ingest_tx, ingest_rx) = mpsc::channel::<IngestJob>(settings.limits.ingest_buffer);
        // verified events that need to be persisted are sent to the
        // writer on this channel.
        let (event_tx, event_rx) =
            mpsc::channel::<SubmittedEvent>(settings.limits.event_persist_buffer);
        // historical scans, including requeued timesliced ones
        let (scan_tx, scan_rx) = mpsc::channel::<ScanJob>(settings.limits.ingest_buffer);
        // negentropy session operations
        let (neg_tx, neg_rx) = mpsc::channel::<NegJob>(settings.limits.ingest_buffer);
        // commit watermarks are broadcast to every monitor partition.
        // Committed rows are re-read from the store, so an overflow
        // here only loses ephemeral deliveries.
        let (commit_tx, _) = broadcast::channel::<CommitNotice>(settings.limits.broadcast_buffer);
        // establish a channel for letting all threads know about a
        // requested server shutdown.
        let (invoke_shutdown, shutdown_listen) = broadcast::channel::<()>(1);

        let (registry, metrics) = create_metrics();
        let ephemeral = EphemeralBuffer::new();

        // the subscription monitors own all live fan-out
        let monitors = start_req_monitors(
            settings.workers.req_monitor_threads,
            event_store.clone(),
            ephemeral.clone(),
            &commit_tx,
            initial_watermark,
            settings.limits.ingest_buffer,
            metrics.clone(),
            &invoke_shutdown,
        );

        // start the single store writer task
        let writer_es = event_store.clone();
        let writer_eph = ephemeral.clone();
        let writer_settings = settings.clone();
        let writer_commit_tx = commit_tx.clone();
        let writer_shutdown = invoke_shutdown.clone();
        let writer_metrics = metrics.clone();
        tokio::task::spawn(async move {
            if let Err(e) = run_writer(
                writer_es,
                writer_eph,
                writer_settings,
                event_rx,
                writer_commit_tx,
                writer_shutdown,
                writer_metrics,
            )
            .await
            {
                error!("writer exited with error: {}", e);
            }
        });
        info!("writer created");

        // ingester pool
        start_ingesters(
            ingest_rx,
            IngesterContext {
                settings: settings.clone(),
                policy: Arc::new(AllowAll),
                writer_tx: event_tx.clone(),
                scan_tx: scan_tx.clone(),
                monitors: monitors.clone(),
                neg_tx: neg_tx.clone(),
            },
            &invoke_shutdown,
        );

        // historical scan pool
        start_req_workers(
            scan_rx,
            scan_tx.clone(),
            settings.workers.req_worker_threads,
            settings.options.query_timeslice_budget_microseconds,
            settings.limits.max_filter_limit,
            event_store.clone(),
            monitors.clone(),
            metrics.clone(),
            &invoke_shutdown,
        );

        // negentropy pool
        start_neg_workers(
            neg_rx,
            settings.workers.negentropy_threads,
            event_store.clone(),
            settings.negentropy.max_sync_events,
            settings.negentropy.frame_size_limit,
            &invoke_shutdown,
        );

        // expired ephemeral events get swept in the background
        let sweep_buffer = ephemeral.clone();
        let mut sweep_shutdown = invoke_shutdown.subscribe();
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = sweep_shutdown.recv() => break,
                    _ = interval.tick() => {
                        let removed = sweep_buffer.sweep(unix_time());
                        if removed > 0 {
                            debug!("swept {} expired ephemeral events", removed);
                        }
                    },
                }
            }
        });

        // listen for (external to tokio) shutdown request
        let controlled_shutdown = invoke_shutdown.clone();
        tokio::spawn(async move {
            info!("control message listener started");
            match shutdown_rx.recv() {
                Ok(()) => {
                    info!("control message requesting shutdown");
                    controlled_shutdown.send(()).ok();
                }
                Err(std::sync::mpsc::RecvError) => {
                    trace!("shutdown requestor is disconnected (this is normal)");
                }
            };
        });
        // listen for ctrl-c interruupts
        let ctrl_c_shutdown = invoke_shutdown.clone();
        // listener for webserver shutdown
        let webserver_shutdown_listen = invoke_shutdown.subscribe();

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.unwrap();
            info!("shutting down due to SIGINT (main)");
            ctrl_c_shutdown.send(()).ok();
        });

        // A `Service` is needed for every connection, so this
        // creates one from our `handle_request` function.
        let make_svc = make_service_fn(|conn: &AddrStream| {
            let remote_addr = conn.remote_addr();
            let ingest = ingest_tx.clone();
            let monitors = monitors.clone();
            let stop = invoke_shutdown.clone();
            let settings = settings.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();
            async move {
                // service_fn converts our function into a `Service`
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    handle_web_request(
                        request,
                        settings.clone(),
                        remote_addr,
                        ingest.clone(),
                        monitors.clone(),
                        stop.subscribe(),
                        registry.clone(),
                        metrics.clone(),
                    )
                }))
            }
        });
        let server = Server::bind(&socket_addr)
            .serve(make_svc)
            .with_graceful_shutdown(ctrl_c_or_signal(webserver_shutdown_listen));
        // run hyper in this thread.  This is why the thread does not return.
        if let Err(e) = server.await {
            eprintln!("server error: {e}");
        }
        drop(shutdown_listen);
    });
    Ok(())
}

/// Nostr protocol messages from a client
#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(untagged)]
pub enum NostrMessage {
    /// An `EVENT` message
    EventMsg(EventCmd),
    /// A `REQ` message
    SubMsg(Subscription),
    /// A `NEG-OPEN` message
    NegOpenMsg(NegOpenCmd),
    /// A `NEG-MSG` message
    NegMsgMsg(NegMsgCmd),
    /// A `NEG-CLOSE` message
    NegCloseMsg(NegCloseCmd),
    /// A `CLOSE` message
    CloseMsg(CloseCmd),
}

/// Convert Message to `NostrMessage`
fn convert_to_msg(msg: &str, max_bytes: Option<usize>) -> Result<NostrMessage> {
    let parsed_res: Result<NostrMessage> =
        serde_json::from_str(msg).map_err(std::convert::Into::into);
    match parsed_res {
        Ok(m) => {
            if let NostrMessage::SubMsg(_) = m {
                // note; this only prints the first 16k of a REQ and then truncates.
                trace!("REQ: {:?}", msg);
            };
            if let NostrMessage::EventMsg(_) = m {
                if let Some(max_size) = max_bytes {
                    // check length, ensure that some max size is set.
                    if msg.len() > max_size && max_size > 0 {
                        return Err(Error::EventMaxLengthError(msg.len()));
                    }
                }
            }
            Ok(m)
        }
        Err(e) => {
            trace!("proto parse error: {:?}", e);
            trace!("parse error on message: {:?}", msg.trim());
            Err(Error::ProtoParseError)
        }
    }
}

/// Turn a string into a NOTICE message ready to send over a `WebSocket`
fn make_notice_message(notice: &Notice) -> Message {
    let json = match notice {
        Notice::Message(ref msg) => json!(["NOTICE", msg]),
        Notice::EventResult(ref res) => json!(["OK", res.id, res.status.to_bool(), res.msg]),
    };

    Message::text(json.to_string())
}

/// Serialize a queued outbound message into a websocket frame.
fn make_outbound_message(out: &Outbound) -> Option<Message> {
    match out {
        Outbound::Event { sub_id, event } => match serde_json::to_string(event.as_ref()) {
            Ok(event_str) => {
                let subesc = sub_id.replace('"', "");
                Some(Message::Text(format!(
                    "[\"EVENT\",\"{subesc}\",{event_str}]"
                )))
            }
            Err(_) => {
                warn!(
                    "could not serialize event: {:?}",
                    event.get_event_id_prefix()
                );
                None
            }
        },
        Outbound::Eose { sub_id } => {
            let subesc = sub_id.replace('"', "");
            Some(Message::Text(format!("[\"EOSE\",\"{subesc}\"]")))
        }
        Outbound::Notice(n) => Some(make_notice_message(n)),
        Outbound::NegMsg { sub_id, message } => {
            Some(Message::text(json!(["NEG-MSG", sub_id, message]).to_string()))
        }
        Outbound::NegErr { sub_id, reason } => {
            Some(Message::text(json!(["NEG-ERR", sub_id, reason]).to_string()))
        }
    }
}

struct ClientInfo {
    remote_ip: String,
    user_agent: Option<String>,
    origin: Option<String>,
}

/// Handle new client connections.  This runs through an event loop
/// for all client communication.
#[allow(clippy::too_many_arguments)]
async fn nostr_server(
    settings: Settings,
    client_info: ClientInfo,
    mut ws_stream: WebSocketStream<Upgraded>,
    ingest_tx: mpsc::Sender<IngestJob>,
    monitors: MonitorHandles,
    mut shutdown: Receiver<()>,
    metrics: RelayMetrics,
) {
    // the time this websocket nostr server started
    let orig_start = Instant::now();
    // Track internal client state
    let mut conn = conn::ClientConn::new(
        client_info.remote_ip,
        settings.limits.max_subs_per_connection,
    );
    let conn_id = conn.connection_id();
    // subscription creation rate limiting
    let mut sub_lim_opt = None;
    // 100ms jitter when the rate limiter returns
    let jitter = Jitter::up_to(Duration::from_millis(100));
    let sub_per_min_setting = settings.limits.subscriptions_per_min;
    if let Some(sub_per_min) = sub_per_min_setting {
        if sub_per_min > 0 {
            trace!("Rate limits for sub creation ({}/min)", sub_per_min);
            let quota_time = core::num::NonZeroU32::new(sub_per_min).unwrap();
            let quota = Quota::per_minute(quota_time);
            sub_lim_opt = Some(RateLimiter::direct(quota));
        }
    }
    // Use the remote IP as the client identifier
    let cid = conn.get_client_prefix();
    // every relay-generated message for this connection flows through
    // one ordered channel.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(settings.limits.outbound_buffer);

    // last time this client sent data (message, ping, etc.)
    let mut last_message_time = Instant::now();

    // ping interval (every 5 minutes)
    let default_ping_dur = Duration::from_secs(settings.network.ping_interval_seconds.into());

    // disconnect after 20 minutes without a ping response or event.
    let max_quiet_time = Duration::from_secs(60 * 20);

    let start = tokio::time::Instant::now() + default_ping_dur;
    let mut ping_interval = tokio::time::interval_at(start, default_ping_dur);

    // cancellation flags for scans the client still owns; a CLOSE or
    // a replacement REQ flips the flag and the scan stops at its next
    // checkpoint.
    let mut running_scans: HashMap<String, Arc<AtomicBool>> = HashMap::new();
    // open negentropy session identifiers
    let mut neg_subs: HashSet<String> = HashSet::new();
    // for stats, keep track of how many events the client published,
    // and how many it received from queries.
    let mut client_published_event_count: usize = 0;
    let mut client_received_event_count: usize = 0;

    let unspec = "<unspecified>".to_string();
    info!("new client connection (cid: {}, ip: {:?})", cid, conn.ip());
    let origin = client_info.origin.as_ref().unwrap_or(&unspec);
    let user_agent = client_info.user_agent.as_ref().unwrap_or(&unspec);
    info!(
        "cid: {}, origin: {:?}, user-agent: {:?}",
        cid, origin, user_agent
    );

    // Measure connections
    metrics.connections.inc();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                metrics.disconnects.with_label_values(&["shutdown"]).inc();
                info!("Close connection down due to shutdown, client: {}, ip: {:?}, connected: {:?}", cid, conn.ip(), orig_start.elapsed());
                // server shutting down, exit loop
                break;
            },
            _ = ping_interval.tick() => {
                // check how long since we talked to client
                // if it has been too long, disconnect
                if last_message_time.elapsed() > max_quiet_time {
                    debug!("ending connection due to lack of client ping response");
                    metrics.disconnects.with_label_values(&["timeout"]).inc();
                    break;
                }
                // Send a ping
                ws_stream.send(Message::Ping(Vec::new())).await.ok();
            },
            Some(out) = outbound_rx.recv() => {
                // a pool produced something for this client
                if let Outbound::Event { .. } = out {
                    client_received_event_count += 1;
                }
                if let Some(frame) = make_outbound_message(&out) {
                    ws_stream.send(frame).await.ok();
                }
            },
            ws_next = ws_stream.next() => {
                // update most recent message time for client
                last_message_time = Instant::now();
                // Consume text messages from the client, parse into Nostr messages.
                let nostr_msg = match ws_next {
                    Some(Ok(Message::Text(m))) => {
                        convert_to_msg(&m, settings.limits.max_event_bytes)
                    },
                    Some(Ok(Message::Binary(_))) => {
                        ws_stream.send(
                            make_notice_message(&Notice::message("binary messages are not accepted".into()))).await.ok();
                        continue;
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // get a ping/pong, ignore.  tungstenite will
                        // send responses automatically.
                        continue;
                    },
                    Some(Err(WsError::Capacity(MessageTooLong{size, max_size}))) => {
                        ws_stream.send(
                            make_notice_message(&Notice::message(format!("message too large ({size} > {max_size})")))).await.ok();
                        continue;
                    },
                    None |
                    Some(Ok(Message::Close(_)) |
                         Err(WsError::AlreadyClosed | WsError::ConnectionClosed |
                             WsError::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake)))
                        => {
                            debug!("websocket close from client (cid: {}, ip: {:?})",cid, conn.ip());
                            metrics.disconnects.with_label_values(&["normal"]).inc();
                            break;
                        },
                    Some(Err(WsError::Io(e))) => {
                        // IO errors are considered fatal
                        warn!("IO error (cid: {}, ip: {:?}): {:?}", cid, conn.ip(), e);
                        metrics.disconnects.with_label_values(&["error"]).inc();
                        break;
                    }
                    x => {
                        // default condition on error is to close the client connection
                        info!("unknown error (cid: {}, ip: {:?}): {:?} (closing conn)", cid, conn.ip(), x);
                        metrics.disconnects.with_label_values(&["error"]).inc();
                        break;
                    }
                };

                // convert ws_next into proto_next
                match nostr_msg {
                    Ok(NostrMessage::EventMsg(ec)) => {
                        // An EventCmd carries a still-unverified event
                        metrics.cmd_event.inc();
                        let evid = ec.event_id().to_owned();
                        let parsed : Result<Event> = Result::<Event>::from(ec);
                        match parsed {
                            Ok(e) => {
                                let id_prefix:String = e.id.chars().take(8).collect();
                                debug!("successfully parsed event: {:?} (cid: {}, kind: {})", id_prefix, cid, e.kind);
                                // hand off to the ingesters for
                                // validation and verification.  A full
                                // queue holds this loop, and with it
                                // the socket reads.
                                let job = IngestJob {
                                    conn_id,
                                    source_ip: conn.ip().to_string(),
                                    outbound: outbound_tx.clone(),
                                    msg: ClientMessage::Event(Box::new(e)),
                                };
                                ingest_tx.send(job).await.ok();
                                client_published_event_count += 1;
                            },
                            Err(e) => {
                                info!("client sent an invalid event (cid: {})", cid);
                                ws_stream.send(make_notice_message(&Notice::invalid(evid, &format!("{e}")))).await.ok();
                            }
                        }
                    },
                    Ok(NostrMessage::SubMsg(s)) => {
                        debug!("subscription requested (cid: {}, sub: {:?})", cid, s.id);
                        // subscription handling consists of:
                        // * check for rate limits
                        // * registering the subscription so future events can be matched
                        // * making a flag to cancel the scan later
                        // * queueing the historical scan
                        // Do nothing if the sub already exists.
                        if conn.has_subscription(&s) {
                            info!("client sent duplicate subscription, ignoring (cid: {}, sub: {:?})", cid, s.id);
                        } else {
                            metrics.cmd_req.inc();
                            if let Some(ref lim) = sub_lim_opt {
                                lim.until_ready_with_jitter(jitter).await;
                            }
                            let sub_id = s.id.clone();
                            match conn.subscribe(s.clone()) {
                                Ok(()) => {
                                    let cancelled = Arc::new(AtomicBool::new(false));
                                    // a REQ reusing a live subID implicitly
                                    // closes its predecessor first
                                    if let Some(previous_scan) = running_scans.insert(sub_id.clone(), cancelled.clone()) {
                                        previous_scan.store(true, Ordering::Relaxed);
                                        monitors.send(MonitorCmd::Close { conn_id, sub_id: sub_id.clone() }).await;
                                    } else {
                                        metrics.active_subscriptions.inc();
                                    }
                                    let job = IngestJob {
                                        conn_id,
                                        source_ip: conn.ip().to_string(),
                                        outbound: outbound_tx.clone(),
                                        msg: ClientMessage::Req { sub: s, cancelled },
                                    };
                                    ingest_tx.send(job).await.ok();
                                },
                                Err(Error::SubIdInvalidError) => {
                                    info!("invalid subscription identifier (cid: {})", cid);
                                    ws_stream.send(make_notice_message(&Notice::message("subscription identifier invalid".into()))).await.ok();
                                },
                                Err(e) => {
                                    info!("Subscription error: {} (cid: {}, sub: {:?})", e, cid, sub_id);
                                    ws_stream.send(make_notice_message(&Notice::message(format!("Subscription error: {e}")))).await.ok();
                                }
                            }
                        }
                    },
                    Ok(NostrMessage::CloseMsg(cc)) => {
                        // closing a request simply removes the subscription.
                        let parsed : Result<Close> = Result::<Close>::from(cc);
                        if let Ok(c) = parsed {
                            metrics.cmd_close.inc();
                            // stop a scan that is still running, and
                            // let the monitor drop the subscription
                            if let Some(cancel) = running_scans.remove(&c.id) {
                                cancel.store(true, Ordering::Relaxed);
                                metrics.active_subscriptions.dec();
                            }
                            conn.unsubscribe(&c);
                            let job = IngestJob {
                                conn_id,
                                source_ip: conn.ip().to_string(),
                                outbound: outbound_tx.clone(),
                                msg: ClientMessage::Close(c),
                            };
                            ingest_tx.send(job).await.ok();
                        } else {
                            info!("invalid command ignored");
                            ws_stream.send(make_notice_message(&Notice::message("could not parse command".into()))).await.ok();
                        }
                    },
                    Ok(NostrMessage::NegOpenMsg(cmd)) => {
                        metrics.cmd_neg.inc();
                        if !conn::is_valid_sub_id(&cmd.sub_id) {
                            ws_stream.send(make_notice_message(&Notice::message("subscription identifier invalid".into()))).await.ok();
                        } else {
                            neg_subs.insert(cmd.sub_id.clone());
                            let job = IngestJob {
                                conn_id,
                                source_ip: conn.ip().to_string(),
                                outbound: outbound_tx.clone(),
                                msg: ClientMessage::NegOpen {
                                    sub_id: cmd.sub_id,
                                    filter: cmd.filter,
                                    initial: cmd.initial,
                                },
                            };
                            ingest_tx.send(job).await.ok();
                        }
                    },
                    Ok(NostrMessage::NegMsgMsg(cmd)) => {
                        metrics.cmd_neg.inc();
                        let job = IngestJob {
                            conn_id,
                            source_ip: conn.ip().to_string(),
                            outbound: outbound_tx.clone(),
                            msg: ClientMessage::NegMsg {
                                sub_id: cmd.sub_id,
                                message: cmd.message,
                            },
                        };
                        ingest_tx.send(job).await.ok();
                    },
                    Ok(NostrMessage::NegCloseMsg(cmd)) => {
                        metrics.cmd_neg.inc();
                        neg_subs.remove(&cmd.sub_id);
                        let job = IngestJob {
                            conn_id,
                            source_ip: conn.ip().to_string(),
                            outbound: outbound_tx.clone(),
                            msg: ClientMessage::NegClose { sub_id: cmd.sub_id },
                        };
                        ingest_tx.send(job).await.ok();
                    },
                    Err(Error::ConnError) => {
                        debug!("got connection close/error, disconnecting cid: {}, ip: {:?}",cid, conn.ip());
                        break;
                    }
                    Err(Error::EventMaxLengthError(s)) => {
                        info!("client sent command larger ({} bytes) than max size (cid: {})", s, cid);
                        ws_stream.send(make_notice_message(&Notice::message("event exceeded max size".into()))).await.ok();
                    },
                    Err(Error::ProtoParseError) => {
                        info!("client sent command that could not be parsed (cid: {})", cid);
                        ws_stream.send(make_notice_message(&Notice::message("could not parse command".into()))).await.ok();
                    },
                    Err(e) => {
                        info!("got non-fatal error from client (cid: {}, error: {:?}", cid, e);
                    },
                }
            },
        }
    }
    // connection cleanup - ensure scans stop, the monitor forgets the
    // connection, and negentropy sessions die with it.
    for cancel in running_scans.values() {
        cancel.store(true, Ordering::Relaxed);
    }
    metrics
        .active_subscriptions
        .sub(running_scans.len() as i64);
    monitors.send(MonitorCmd::Disconnect { conn_id }).await;
    for sub_id in neg_subs {
        let job = IngestJob {
            conn_id,
            source_ip: conn.ip().to_string(),
            outbound: outbound_tx.clone(),
            msg: ClientMessage::NegClose { sub_id },
        };
        ingest_tx.send(job).await.ok();
    }
    info!(
        "stopping client connection (cid: {}, ip: {:?}, sent: {} events, recv: {} events, connected: {:?})",
        cid,
        conn.ip(),
        client_published_event_count,
        client_received_event_count,
        orig_start.elapsed()
    );
}

#[derive(Clone)]
pub struct RelayMetrics {
    pub query_sub: Histogram,           // response time of completed scans
    pub write_events: Histogram,        // response time of event batch commits
    pub sent_events: IntCounterVec,     // count of events sent to clients
    pub connections: IntCounter,        // count of websocket connections
    pub disconnects: IntCounterVec,     // client disconnects
    pub query_aborts: IntCounterVec,    // count of queries aborted by server
    pub cmd_req: IntCounter,            // count of REQ commands received
    pub cmd_event: IntCounter,          // count of EVENT commands received
    pub cmd_close: IntCounter,          // count of CLOSE commands received
    pub cmd_neg: IntCounter,            // count of negentropy commands received
    pub active_subscriptions: IntGauge, // currently registered subscriptions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_event_msg() {
        let raw = r#"["EVENT",{"id":"0000000000000000000000000000000000000000000000000000000000000000","pubkey":"0000000000000000000000000000000000000000000000000000000000000000","created_at":1000,"kind":1,"tags":[],"content":"hi","sig":"00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000"}]"#;
        let m = convert_to_msg(raw, None).unwrap();
        assert!(matches!(m, NostrMessage::EventMsg(_)));
    }

    #[test]
    fn parse_req_msg() {
        let m = convert_to_msg(r#"["REQ","s1",{"kinds":[1],"limit":2}]"#, None).unwrap();
        assert!(matches!(m, NostrMessage::SubMsg(_)));
    }

    #[test]
    fn parse_close_msg() {
        let m = convert_to_msg(r#"["CLOSE","s1"]"#, None).unwrap();
        assert!(matches!(m, NostrMessage::CloseMsg(_)));
    }

    #[test]
    fn parse_neg_msgs() {
        let m = convert_to_msg(r#"["NEG-OPEN","s1",{"kinds":[1]},"61"]"#, None).unwrap();
        assert!(matches!(m, NostrMessage::NegOpenMsg(_)));
        let m = convert_to_msg(r#"["NEG-MSG","s1","61"]"#, None).unwrap();
        assert!(matches!(m, NostrMessage::NegMsgMsg(_)));
        let m = convert_to_msg(r#"["NEG-CLOSE","s1"]"#, None).unwrap();
        assert!(matches!(m, NostrMessage::NegCloseMsg(_)));
    }

    #[test]
    fn oversize_event_rejected() {
        let raw = format!(
            r#"["EVENT",{{"id":"{}","pubkey":"{}","created_at":1000,"kind":1,"tags":[],"content":"{}","sig":"{}"}}]"#,
            "0".repeat(64),
            "0".repeat(64),
            "x".repeat(64),
            "0".repeat(128)
        );
        let res = convert_to_msg(&raw, Some(100));
        assert!(matches!(res, Err(Error::EventMaxLengthError(_))));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(
            convert_to_msg("not json", None),
            Err(Error::ProtoParseError)
        ));
        assert!(matches!(
            convert_to_msg(r#"["REQ"]"#, None),
            Err(Error::ProtoParseError)
        ));
        // an unknown two-string command parses as a loose CLOSE and is
        // rejected at conversion time
        let m = convert_to_msg(r#"["UNKNOWN","x"]"#, None).unwrap();
        if let NostrMessage::CloseMsg(cc) = m {
            assert!(Result::<Close>::from(cc).is_err());
        } else {
            panic!("expected close-shaped message");
        }
    }

    #[test]
    fn outbound_frames() {
        let eose = make_outbound_message(&Outbound::Eose { sub_id: "s1".into() }).unwrap();
        assert_eq!(eose.to_text().unwrap(), "[\"EOSE\",\"s1\"]");
        let ok = make_outbound_message(&Outbound::Notice(Notice::saved("abcd".into()))).unwrap();
        assert_eq!(ok.to_text().unwrap(), "[\"OK\",\"abcd\",true,\"\"]");
        let neg = make_outbound_message(&Outbound::NegErr {
            sub_id: "s1".into(),
            reason: "closed: unknown session".into(),
        })
        .unwrap();
        assert_eq!(
            neg.to_text().unwrap(),
            "[\"NEG-ERR\",\"s1\",\"closed: unknown session\"]"
        );
    }
}
