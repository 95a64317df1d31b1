use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::ccb::CloseReason;
use crate::connection::Connection;
use crate::connection_table::ConnectionTable;
use crate::transport_context::TransportContext;

/// Orderly shutdown of an endpoint's connections: refuse new connections, close every live one
///  and give them up to `timeout` to drain, forcing the rest closed. Once every connection is
///  quiescent the buffer arena is shut down. Returns the number of arena buffers that were
///  still in use at that point.
pub async fn shutdown(ctx: &TransportContext, table: &ConnectionTable<Arc<Connection>>, timeout: Duration) -> usize {
    // refuse new connections first: anything registered after the flag is set removes itself,
    //  anything registered before it is in the snapshot
    ctx.begin_shutdown();
    let mut connections = table.snapshot();
    info!("shutting down interconnect with {} live connections", connections.len());

    for connection in &connections {
        connection.close().await;
    }

    if !wait_for_quiescence(table, timeout, ctx.config.timer_tick).await {
        let remaining = table.snapshot();
        warn!("{} connections did not drain within {:?} - forcing them closed", remaining.len(), timeout);
        for connection in &remaining {
            connection.force_close(CloseReason::DrainTimeout).await;
        }
        connections.extend(remaining);
    }
    connections.extend(table.snapshot());

    // no connection may be in the middle of an operation when the arena goes away
    for connection in &connections {
        connection.quiesce().await;
    }
    debug!("all connections are quiescent");

    ctx.arena.shut_down()
}

/// Wait until no live connection remains, polling the table every `poll_interval`. Returns
///  `false` if there are live connections after `timeout`.
pub async fn wait_for_quiescence(table: &ConnectionTable<Arc<Connection>>, timeout: Duration, poll_interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if table.is_empty() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(poll_interval.min(deadline - now)).await;
    }
}
