use axum::Router;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, instrument};

/// Serves the control api until `shutdown` resolves. In-flight requests are
/// allowed to finish; open log and event streams are cut.
#[instrument(skip(router, shutdown))]
pub async fn serve(
    listen: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .wrap_err("Failed to bind control listener")?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("Control server failed")?;
    info!("Control server stopped");
    Ok(())
}
