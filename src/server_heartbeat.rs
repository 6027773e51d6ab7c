//! Liveness row for this processing server.
//!
//! Other tools read `processing_servers` to see which servers are up. The
//! row is advisory, so failures here are logged and never stop the process.

use std::time::Duration;

use chrono::Utc;
use ingestd_common::Result;
use ingestd_db::pool::{get_conn, DbPool};
use ingestd_db::queries::servers;

use crate::shutdown::Shutdown;

/// Register the server row, or refresh it if it already exists.
pub fn register(pool: &DbPool, server_id: i64) -> Result<()> {
    let conn = get_conn(pool)?;
    servers::ensure_server(&conn, server_id, Utc::now())?;
    tracing::info!(server_id, "Processing server registered");
    Ok(())
}

fn touch(pool: &DbPool, server_id: i64) -> Result<()> {
    let conn = get_conn(pool)?;
    if !servers::touch_server(&conn, server_id, Utc::now())? {
        tracing::warn!(server_id, "Server row missing, registering again");
        servers::ensure_server(&conn, server_id, Utc::now())?;
    }
    Ok(())
}

/// Touch the server row every `interval` until shutdown.
pub async fn run_server_heartbeat(pool: DbPool, server_id: i64, interval: Duration, shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let pool = pool.clone();
        match tokio::task::spawn_blocking(move || touch(&pool, server_id)).await {
            Ok(Ok(())) => tracing::trace!(server_id, "Server heartbeat written"),
            Ok(Err(e)) => tracing::warn!(server_id, "Failed to write server heartbeat: {e}"),
            Err(e) => tracing::warn!(server_id, "Server heartbeat task failed: {e}"),
        }
    }

    tracing::debug!(server_id, "Server heartbeat stopped");
}
