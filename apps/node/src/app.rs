//! Wires a single transfer job to a TCP listener or connector.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use imgsync_data_channel::{SessionOptions, Uploader};
use imgsync_jobs::{
    IncomingTransfer, JobState, OutgoingTransfer, SessionPool, TransferConfig, TransferProgress,
    TransferRegistry,
};
use imgsync_transfer::HashChecker;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const REAP_INTERVAL: Duration = Duration::from_secs(30);
const REPORT_INTERVAL: Duration = Duration::from_secs(2);

pub struct ReceiveArgs {
    pub listen: String,
    pub dest: PathBuf,
    pub size: u64,
    pub token: String,
    pub config: TransferConfig,
}

pub struct SendArgs {
    pub connect: String,
    pub file: PathBuf,
    pub token: String,
    pub connections: usize,
    pub config: TransferConfig,
}

/// Loads `path`, or the defaults when no config file was given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TransferConfig> {
    let config = match path {
        Some(path) => TransferConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TransferConfig::default(),
    };
    tracing::debug!(?config, "transfer config");
    Ok(config)
}

fn report(progress: &TransferProgress) {
    tracing::info!(
        done = progress.done_bytes,
        total = progress.total_bytes,
        chunks = progress.done_chunks,
        percent = format!("{:.1}", progress.percent()),
        mbps = format!("{:.1}", progress.bytes_per_second / (1024.0 * 1024.0)),
        eta_secs = progress.eta.map(|d| d.as_secs()),
        "progress"
    );
}

/// Listens until the image on `dest` is complete, cancelled or failed.
pub async fn receive(args: ReceiveArgs) -> anyhow::Result<()> {
    let config = args.config;
    let hasher = HashChecker::start(config.hash_queue_capacity, config.hash_idle_worker_timeout());
    let job = IncomingTransfer::new(
        args.token.clone(),
        &args.dest,
        args.size,
        None,
        config.clone(),
        Arc::clone(&hasher),
    )?;

    let registry = Arc::new(TransferRegistry::new(&config));
    registry.register_incoming(Arc::clone(&job))?;
    let pool = SessionPool::new(config.session_pool_size);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    tracing::info!(addr = %listener.local_addr()?, dest = %args.dest.display(), "waiting for sender");

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&registry).run_reaper(REAP_INTERVAL, cancel.clone()));
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, cancelling transfer");
                job.cancel();
                break;
            }
            _ = ticker.tick() => {
                report(&job.progress());
                if job.state().is_terminal() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;
                tracing::debug!(%peer, "inbound connection");
                let registry = Arc::clone(&registry);
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(e) = registry.dispatch(stream, &pool).await {
                        tracing::warn!(%peer, error = %e, "inbound session refused");
                    }
                });
            }
        }
    }

    cancel.cancel();
    hasher.shutdown();
    finish(job.state(), job.error_code())
}

/// Opens `connections` sessions to the receiver and serves until they end.
pub async fn send(args: SendArgs) -> anyhow::Result<()> {
    let config = args.config;
    let job = OutgoingTransfer::new(args.token.clone(), &args.file, config.clone())?;
    let pool = SessionPool::new(config.session_pool_size);
    let options = SessionOptions {
        read_timeout: config.read_timeout(),
        ..SessionOptions::default()
    };

    let mut sessions = Vec::new();
    for _ in 0..args.connections.max(1) {
        let connected = async {
            let stream = TcpStream::connect(&args.connect).await?;
            stream.set_nodelay(true)?;
            Ok::<_, anyhow::Error>(Uploader::connect(stream, &args.token, options.clone()).await?)
        };
        match connected.await {
            Ok(uploader) => match job.add_connection(uploader, &pool).await {
                Ok(handle) => sessions.push(handle),
                Err(e) => tracing::warn!(error = %e, "receiver refused connection"),
            },
            Err(e) => {
                job.record_connect_failure();
                tracing::warn!(addr = %args.connect, error = %e, "connect failed");
            }
        }
    }
    if sessions.is_empty() {
        bail!("no session to {} could be established", args.connect);
    }
    tracing::info!(sessions = sessions.len(), file = %args.file.display(), "sending");

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let all_done = async {
        for session in sessions {
            if let Err(e) = session.await {
                tracing::error!(error = %e, "session task panicked");
            }
        }
    };
    tokio::pin!(all_done);

    loop {
        tokio::select! {
            _ = &mut all_done => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, cancelling transfer");
                job.cancel();
            }
            _ = ticker.tick() => report(&job.progress()),
        }
    }

    finish(job.state(), job.error_code())
}

fn finish(state: JobState, error_code: Option<String>) -> anyhow::Result<()> {
    match state {
        JobState::Finished => {
            tracing::info!("transfer complete");
            Ok(())
        }
        JobState::Error => bail!(
            "transfer failed: {}",
            error_code.unwrap_or_else(|| "unknown error".into())
        ),
        other => bail!("transfer stopped while {other}"),
    }
}
