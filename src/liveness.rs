//! Detection of dead peers.
//!
//! One monitor task per endpoint periodically visits every established connection. A
//!  connection that received nothing for `idle_threshold` is probed with STATUS_QUERY packets,
//!  repeated with exponential backoff. Any inbound packet counts as a sign of life, and a
//!  connection whose probes all go unanswered is closed.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ccb::liveness_state::LivenessAction;
use crate::ccb::{Ccb, ConnectionState};
use crate::connection::Connection;
use crate::connection_table::{ConnectionKey, ConnectionTable};
use crate::send_engine;
use crate::transport_context::TransportContext;

pub fn spawn_liveness_monitor(ctx: Arc<TransportContext>, table: Weak<ConnectionTable<Arc<Connection>>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("starting liveness monitor");

        let mut ticks = interval(ctx.config.liveness_check_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            let Some(table) = table.upgrade() else {
                break;
            };
            if ctx.is_shutting_down() {
                break;
            }

            for connection in table.snapshot() {
                connection.check_liveness().await;
            }
        }

        info!("liveness monitor stopped");
    })
}

/// Probe a connection if it is due. Returns `true` if the peer is unresponsive and the
///  connection should be closed.
pub async fn check_connection(ctx: &TransportContext, key: &ConnectionKey, ccb: &mut Ccb, now: Instant) -> bool {
    if ccb.state() != ConnectionState::Established {
        return false;
    }

    match ccb.liveness.poll(now, ctx.config.idle_threshold, ctx.config.max_liveness_probes) {
        LivenessAction::Nothing => false,
        LivenessAction::SendProbe(probe) => {
            debug!("no traffic from {} - sending status query #{}", key, probe);
            send_engine::send_status_query(ctx, key, ccb, probe).await;
            false
        }
        LivenessAction::Unresponsive => {
            warn!("{} did not answer {} status queries", key, ccb.liveness.num_outstanding_probes());
            true
        }
    }
}
