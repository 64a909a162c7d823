//! Server startup
use clap::Parser;
use quadrelay::cli::CLIArgs;
use quadrelay::config;
use quadrelay::server::start_server;
use std::sync::mpsc as syncmpsc;
use std::sync::mpsc::{Receiver as MpscReceiver, Sender as MpscSender};
use std::thread;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[cfg(all(not(target_env = "msvc"), not(target_os = "openbsd")))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), not(target_os = "openbsd")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Start running a Nostr relay server.
fn main() {
    let args = CLIArgs::parse();

    // get config file name from args
    let config_file_arg = args.config;

    // configure settings from the config file (defaults to config.toml)
    let mut settings = config::Settings::new(&config_file_arg);

    // setup tracing, optionally into a rolling daily log file
    let _trace_guard: Option<WorkerGuard> = match &settings.diagnostics.file_log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "quadrelay.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_writer(non_blocking)
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .try_init()
                .ok();
            None
        }
    };
    info!("Starting up from main");

    // update with database location from args, if provided
    if let Some(db) = args.db {
        settings.database.data_directory = db;
    }

    let (_ctrl_tx, ctrl_rx): (MpscSender<()>, MpscReceiver<()>) = syncmpsc::channel();
    // run this in a new thread
    let handle = thread::spawn(move || {
        let _svr = start_server(&settings, ctrl_rx);
    });
    // block on nostr thread to finish.
    handle.join().unwrap();
}
