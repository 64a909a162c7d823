//! Configuration file and settings management
use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(unused)]
pub struct Info {
    pub relay_url: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Database {
    /// Directory holding the memory-mapped store.
    pub data_directory: String,
    /// Maximum size of the memory map in megabytes.  Exhausting the
    /// map is a fatal write error.
    pub map_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Network {
    pub port: u16,
    pub address: String,
    /// Optional network address header to use instead of the socket
    /// peer (when behind a reverse proxy).
    pub remote_ip_header: Option<String>,
    pub ping_interval_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Limits {
    /// Maximum size of an EVENT frame in bytes (serialized).
    pub max_event_bytes: Option<usize>,
    pub max_ws_message_bytes: Option<usize>,
    pub max_ws_frame_bytes: Option<usize>,
    /// Maximum number of tags a submitted event may carry.
    pub max_event_tags: usize,
    /// Maximum concurrent subscriptions per connection.
    pub max_subs_per_connection: usize,
    /// Limit on REQ creation rate, per minute.
    pub subscriptions_per_min: Option<u32>,
    /// Limit on events admitted by the writer, per second.
    pub messages_per_sec: Option<u32>,
    /// Cap applied to any filter `limit` during initial scans.
    pub max_filter_limit: Option<u64>,
    /// Buffered messages in the ingest queue before socket reads pause.
    pub ingest_buffer: usize,
    /// Events pending in the writer queue before ingesters block.
    pub event_persist_buffer: usize,
    /// Commit notices buffered for the subscription monitors.
    pub broadcast_buffer: usize,
    /// Outbound frames buffered per connection.
    pub outbound_buffer: usize,
    /// Tokio blocking-thread cap (store scans and commits).
    pub max_blocking_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Options {
    /// Reject events older than this many seconds.
    pub reject_older_seconds: Option<u64>,
    /// Reject events with a created_at further in the future than this.
    pub reject_newer_seconds: Option<u64>,
    /// Seconds an ephemeral event stays replayable for monitor catch-up.
    pub ephemeral_retention_seconds: u64,
    /// CPU budget for one historical-scan slice before the scan
    /// yields and is requeued.
    pub query_timeslice_budget_microseconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Workers {
    pub ingester_threads: usize,
    pub req_worker_threads: usize,
    pub req_monitor_threads: usize,
    pub negentropy_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Writer {
    /// Largest number of events committed in one transaction.
    pub max_batch_events: usize,
    /// Longest time the writer accumulates a batch before committing.
    pub batch_window_ms: u64,
    /// Transient commit failures retried before giving up on a batch.
    pub commit_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Negentropy {
    /// Largest event set a single sync session may cover.
    pub max_sync_events: u64,
    /// Upper bound on a single protocol frame, in bytes.
    pub frame_size_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Diagnostics {
    /// Optional directory for a rolling file log.
    pub file_log_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(unused)]
pub struct Settings {
    pub info: Info,
    pub database: Database,
    pub network: Network,
    pub limits: Limits,
    pub options: Options,
    pub workers: Workers,
    pub writer: Writer,
    pub negentropy: Negentropy,
    pub diagnostics: Diagnostics,
}

impl Settings {
    /// Load settings, with any values in the config file overriding
    /// the defaults.
    #[must_use]
    pub fn new(config_file_name: &Option<String>) -> Self {
        let default_settings = Self::default();
        // attempt to construct settings with file
        let from_file = Self::new_from_default(&default_settings, config_file_name);
        match from_file {
            Err(e) => {
                warn!("Error reading config file ({:?})", e);
                default_settings
            }
            Ok(f) => f,
        }
    }

    fn new_from_default(
        default: &Settings,
        config_file_name: &Option<String>,
    ) -> Result<Self, ConfigError> {
        let default_config_file_name = "config.toml".to_string();
        let config: &String = match config_file_name {
            Some(value) => value,
            None => &default_config_file_name,
        };
        let builder = Config::builder();
        let config: Config = builder
            // use defaults
            .add_source(Config::try_from(default)?)
            // override with file contents
            .add_source(File::with_name(config).required(false))
            .build()?;
        let settings: Settings = config.try_deserialize()?;
        // ensure bounded queues are actually bounded
        assert!(settings.limits.ingest_buffer > 0);
        assert!(settings.limits.event_persist_buffer > 0);
        assert!(settings.limits.outbound_buffer > 0);
        assert!(settings.workers.req_monitor_threads > 0);
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            info: Info {
                relay_url: None,
                name: Some("Unnamed quadrelay".to_string()),
                description: None,
                pubkey: None,
                contact: None,
            },
            database: Database {
                data_directory: ".".to_string(),
                map_size_mb: 10 * 1024,
            },
            network: Network {
                port: 8080,
                address: "0.0.0.0".to_string(),
                remote_ip_header: None,
                ping_interval_seconds: 300,
            },
            limits: Limits {
                max_event_bytes: Some(2 << 17), // 256K
                max_ws_message_bytes: Some(2 << 17),
                max_ws_frame_bytes: Some(2 << 17),
                max_event_tags: 2048,
                max_subs_per_connection: 32,
                subscriptions_per_min: None,
                messages_per_sec: None,
                max_filter_limit: Some(5000),
                ingest_buffer: 4096,
                event_persist_buffer: 4096,
                broadcast_buffer: 16384,
                outbound_buffer: 1024,
                max_blocking_threads: 16,
            },
            options: Options {
                reject_older_seconds: None,
                reject_newer_seconds: Some(900),
                ephemeral_retention_seconds: 300,
                query_timeslice_budget_microseconds: 10_000,
            },
            workers: Workers {
                ingester_threads: 3,
                req_worker_threads: 3,
                req_monitor_threads: 3,
                negentropy_threads: 2,
            },
            writer: Writer {
                max_batch_events: 100,
                batch_window_ms: 10,
                commit_retries: 3,
            },
            negentropy: Negentropy {
                max_sync_events: 1_000_000,
                frame_size_limit: 60_000,
            },
            diagnostics: Diagnostics { file_log_dir: None },
        }
    }
}
