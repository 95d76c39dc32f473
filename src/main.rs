use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use custos::api::{self, AppState};
use custos::configs::CustosConfig;
use custos::distributed::{Distributed, HttpTransport};
use custos::server;
use custos::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "CUSTOS_CONFIG",
        value_name = "FILE",
        default_value = "/etc/custos/config.yml"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let config = CustosConfig::from_path(&args.config)?;

    let filter = EnvFilter::try_from_env("CUSTOS_LOG")
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .wrap_err("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(config = %args.config.display(), "Starting custos");

    let supervisor = Arc::new(Supervisor::new(
        &config.server.log_dir,
        config.server.shutdown_timeout,
    ));
    let (programs, rejected) = config.validated_programs();
    for err in rejected {
        error!(%err, "Program omitted");
    }
    for program in programs {
        if let Err(err) = supervisor.create_program(program).await {
            error!(%err, "Program omitted");
        }
    }

    let transport = Arc::new(HttpTransport::new(config.server.auth.as_ref()));
    let distributed = Arc::new(Distributed::new(
        &config.server.distributed,
        Arc::clone(&supervisor),
        transport,
    ));
    let shutdown = CancellationToken::new();
    let sync = tokio::spawn(
        Arc::clone(&distributed)
            .run(shutdown.clone())
            .instrument(info_span!("peer_sync", node = distributed.node_id())),
    );

    supervisor.auto_start_all().await;

    let router = api::router(
        AppState {
            supervisor: Arc::clone(&supervisor),
            distributed,
            shutdown: shutdown.clone(),
        },
        config.server.auth.clone(),
    );
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => info!("Shutdown requested"),
            Err(err) => error!(?err, "Failed to listen for signals, shutting down"),
        }
        signalled.cancel();
    });
    let stopped = shutdown.clone();
    let served = server::serve(config.server.listen, router, async move {
        stopped.cancelled().await
    })
    .await;

    shutdown.cancel();
    if let Err(err) = sync.await {
        warn!(?err, "Peer sync task failed");
    }
    supervisor.shutdown().await;
    served
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
