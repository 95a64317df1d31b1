use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::buffers::buffer_arena::BufferArena;
use crate::config::InterconnectConfig;
use crate::connection_table::ConnectionKey;
use crate::send_pipeline::SendPipeline;
use crate::sequence_number::SequenceNumber;
use crate::statistics::StatisticsCollector;

/// Everything an endpoint's connections share
pub struct TransportContext {
    pub config: Arc<InterconnectConfig>,
    pub arena: Arc<BufferArena>,
    pub statistics: Arc<StatisticsCollector>,
    pub pipeline: SendPipeline,
    is_shutting_down: AtomicBool,
    recently_closed: Mutex<FxHashMap<ConnectionKey, Lingering>>,
}

/// A connection that closed normally after receiving the peer's complete stream. If the
///  peer did not get the final ACK, it re-sends its FIN, and the lingering record allows
///  answering it after the connection itself is gone.
#[derive(Debug, Clone, Copy)]
struct Lingering {
    final_ack: SequenceNumber,
    until: Instant,
}

impl TransportContext {
    pub fn new(config: Arc<InterconnectConfig>, arena: Arc<BufferArena>, statistics: Arc<StatisticsCollector>, pipeline: SendPipeline) -> TransportContext {
        TransportContext {
            config,
            arena,
            statistics,
            pipeline,
            is_shutting_down: AtomicBool::new(false),
            recently_closed: Default::default(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::Release);
    }

    pub fn linger(&self, key: ConnectionKey, final_ack: SequenceNumber, now: Instant) {
        let mut recently_closed = self.recently_closed.lock().unwrap_or_else(PoisonError::into_inner);
        recently_closed.retain(|_, l| l.until > now);
        trace!("connection {} lingering with final ack {}", key, final_ack);
        recently_closed.insert(key, Lingering {
            final_ack,
            until: now + self.config.drain_timeout,
        });
    }

    /// The final ack of a recently closed connection with this key
    pub fn lingering_ack(&self, key: &ConnectionKey, now: Instant) -> Option<SequenceNumber> {
        self.recently_closed.lock().unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|l| l.until > now)
            .map(|l| l.final_ack)
    }

    pub fn forget_lingering(&self, key: &ConnectionKey) {
        self.recently_closed.lock().unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
