// ABOUTME: Service entrypoint: flag parsing, logging, signal handling, and relay wiring
// ABOUTME: Runs the supplier, the fan-out, and a heartbeat until SIGINT or SIGTERM

use std::error::Error;
use std::time::Duration;

use argh::FromArgs;
use bytehub::{Fanout, FramePool, RelayConfig, RelayListener, Supplier};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

/// Byte-stream fan-out relay: one supplier in, every connected consumer out
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// size of a pool frame in bytes (default: 1048576)
    #[argh(option)]
    frame_size: Option<usize>,

    /// number of frames in the pool (default: 1024)
    #[argh(option)]
    frame_count: Option<usize>,

    /// protocol ('tcp' or 'unix') and address to listen on for the input
    /// stream supplier (default: unix:///tmp/bytehub.sock)
    #[argh(option)]
    listen_input: Option<String>,

    /// protocol and address to listen on for output stream consumers
    /// (default: tcp://0.0.0.0:4096)
    #[argh(option)]
    listen_output: Option<String>,

    /// per-consumer write deadline in seconds, 0 to disable (default: 30)
    #[argh(option)]
    write_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut config = RelayConfig::default();
    if let Some(size) = cli_args.frame_size {
        config.frame_size = size;
    }
    if let Some(count) = cli_args.frame_count {
        config.frame_count = count;
    }
    if let Some(spec) = cli_args.listen_input {
        config.supplier_listen = spec.parse()?;
    }
    if let Some(spec) = cli_args.listen_output {
        config.consumer_listen = spec.parse()?;
    }
    if let Some(secs) = cli_args.write_timeout {
        config.write_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    config.validate()?;

    info!(
        supplier = %config.supplier_listen,
        consumer = %config.consumer_listen,
        frames = config.frame_count,
        frame_size = config.frame_size,
        total_bytes = config.total_bytes(),
        "service started"
    );

    let supplier_listener = RelayListener::bind(&config.supplier_listen)
        .await
        .map_err(|err| {
            error!(%err, addr = %config.supplier_listen, "failed to listen for input stream suppliers");
            err
        })?;
    let consumer_listener = RelayListener::bind(&config.consumer_listen)
        .await
        .map_err(|err| {
            error!(%err, addr = %config.consumer_listen, "failed to listen for output stream consumers");
            err
        })?;

    let pool = FramePool::new(config.frame_size, config.frame_count);
    let (frames_tx, frames_rx) = mpsc::channel(config.frame_count);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supplier = Supplier::new(supplier_listener, pool.clone(), frames_tx);
    let fanout = Fanout::new(
        consumer_listener,
        frames_rx,
        config.frame_count,
        config.write_timeout,
    );

    let supplier_task = tokio::spawn(supplier.serve(shutdown_rx.clone()));
    let fanout_task = tokio::spawn(fanout.serve(shutdown_rx.clone()));
    let heartbeat_task = tokio::spawn(heartbeat(pool.clone(), shutdown_rx));

    wait_for_shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let _ = supplier_task.await;
    let _ = fanout_task.await;
    let _ = heartbeat_task.await;
    pool.close();

    info!("service terminated");
    Ok(())
}

/// Block until SIGINT or SIGTERM. SIGKILL cannot be caught and is
/// deliberately not in the handler set.
async fn wait_for_shutdown_signal() {
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt, terminating"),
        _ = terminate.recv() => info!("received terminate, terminating"),
    }
}

/// Periodically log pool occupancy so operators can see how close the relay
/// runs to saturation.
async fn heartbeat(pool: FramePool, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(HEARTBEAT_PERIOD);
    // The first tick of a tokio interval completes immediately; skip it so
    // the log starts one period in, not at startup.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let stat = pool.stat();
                let percent = stat.used_bytes * 100 / stat.total_bytes;
                info!(
                    used_bytes = stat.used_bytes,
                    total_bytes = stat.total_bytes,
                    percent,
                    "buffer usage"
                );
            }
            _ = shutdown.changed() => return,
        }
    }
}
