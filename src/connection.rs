use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::select;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::ccb::handshake::HandshakeAction;
use crate::ccb::receive_state::ReceivedItem;
use crate::ccb::{Ccb, CloseReason, ConnectionState};
use crate::connection_table::{ConnectionId, ConnectionKey, ConnectionTable, HasConnectionId};
use crate::error::ConnectionError;
use crate::packet_header::PacketHeader;
use crate::sequence_number::SequenceNumber;
use crate::transport_context::TransportContext;
use crate::{liveness, receive_engine, send_engine};

/// A connection's handle for producers and consumers.
///
/// All protocol state lives in the [Ccb] behind a per-connection lock. Producers blocked on the
///  congestion window or the arena wait on `window_changed` / the arena's release signal,
///  consumers wait on `data_available`, and state changes are published through a watch
///  channel. Every wait is bounded by a timeout passed by the caller.
pub struct Connection {
    key: ConnectionKey,
    id: ConnectionId,
    ctx: Arc<TransportContext>,
    table: Weak<ConnectionTable<Arc<Connection>>>,
    inner: RwLock<Ccb>,
    window_changed: Notify,
    data_available: Notify,
    state: watch::Sender<ConnectionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl HasConnectionId for Arc<Connection> {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

impl Connection {
    pub(crate) fn new(key: ConnectionKey, id: ConnectionId, ctx: Arc<TransportContext>, table: &Arc<ConnectionTable<Arc<Connection>>>, ccb: Ccb) -> Arc<Connection> {
        let (state, _) = watch::channel(ccb.state());
        Arc::new(Connection {
            key,
            id,
            ctx,
            table: Arc::downgrade(table),
            inner: RwLock::new(ccb),
            window_changed: Notify::new(),
            data_available: Notify::new(),
            state,
            driver: Default::default(),
        })
    }

    /// Called once the connection is registered in the table
    pub(crate) fn start(self: &Arc<Self>) {
        self.ctx.statistics.on_connection_opened();

        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if driver.is_some() {
            warn!("timer driver for {} already spawned", self.key);
            return;
        }
        *driver = Some(tokio::spawn(Self::drive_timers(Arc::downgrade(self), self.ctx.config.timer_tick)));
    }

    async fn drive_timers(connection: Weak<Connection>, timer_tick: Duration) {
        let mut ticks = interval(timer_tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            let Some(connection) = connection.upgrade() else {
                break;
            };
            if !connection.on_timer_tick().await {
                break;
            }
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send a payload, waiting up to `timeout` for the congestion window and the buffer arena to
    ///  admit it. Payloads that do not fit a single packet are rejected.
    pub async fn submit(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectionError> {
        let max = self.ctx.config.max_payload_len();
        if payload.len() > max {
            return Err(ConnectionError::PayloadTooLarge { len: payload.len(), max });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let window_changed = self.window_changed.notified();
            let buffer_released = self.ctx.arena.buffer_released();

            {
                let mut ccb = self.inner.write().await;
                match ccb.state() {
                    ConnectionState::Closed(reason) => return Err(ConnectionError::for_close_reason(reason)),
                    ConnectionState::Draining => return Err(ConnectionError::Closed),
                    ConnectionState::Setup | ConnectionState::Established => {}
                }

                let capacity = ccb.send.capacity();
                self.ctx.statistics.sample_send_capacity(capacity, self.ctx.arena.available());

                if capacity > 0 {
                    if let Some(buf) = self.ctx.arena.acquire() {
                        send_engine::send_data(&self.ctx, &self.key, &mut ccb, buf, payload, Instant::now()).await;
                        return Ok(());
                    }
                }
                trace!("{}: waiting for send capacity (window {}, in flight {})", self.key, ccb.send.cwnd(), ccb.send.num_in_flight());
            }

            select! {
                _ = window_changed => {}
                _ = buffer_released => {}
                _ = sleep_until(deadline) => return Err(ConnectionError::Timeout),
            }
        }
    }

    /// Take the next payload in order, waiting up to `timeout` for it to arrive. `Ok(None)`
    ///  signals the end of the peer's stream.
    pub async fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let data_available = self.data_available.notified();

            {
                let mut ccb = self.inner.write().await;
                self.ctx.statistics.sample_recv_queue_size(ccb.receive.queue_len());

                match ccb.receive.pop_delivery() {
                    Some(ReceivedItem::Payload(buf)) => return Ok(Some(buf.as_ref().to_vec())),
                    Some(ReceivedItem::EndOfStream) => {
                        self.check_drain(&mut ccb, Instant::now());
                        self.publish_state(&ccb);
                        return Ok(None);
                    }
                    None => {}
                }

                if let ConnectionState::Closed(reason) = ccb.state() {
                    if reason == CloseReason::Normal && ccb.receive.is_end_of_stream_consumed() {
                        return Ok(None);
                    }
                    return Err(ConnectionError::for_close_reason(reason));
                }
            }

            select! {
                _ = data_available => {}
                _ = sleep_until(deadline) => return Err(ConnectionError::Timeout),
            }
        }
    }

    /// Start an orderly close: no more payloads are accepted, and the connection closes once
    ///  everything sent so far (followed by FIN) was acknowledged
    pub async fn close(&self) {
        let mut ccb = self.inner.write().await;
        let now = Instant::now();

        match ccb.state() {
            ConnectionState::Closed(_) => return,
            ConnectionState::Setup if ccb.send.next_sequence() == SequenceNumber::FIRST => {
                debug!("closing {} before it was established", self.key);
                self.apply_close(&mut ccb, CloseReason::Normal, now);
            }
            ConnectionState::Setup | ConnectionState::Established => {
                debug!("closing {} ({})", self.key, self.id);
                ccb.mark_locally_closed();
                ccb.send.fin_pending = true;
                ccb.start_draining(now, &self.ctx.config);
                send_engine::try_send_fin(&self.ctx, &self.key, &mut ccb, now).await;
            }
            ConnectionState::Draining => {
                ccb.mark_locally_closed();
            }
        }

        self.check_drain(&mut ccb, now);
        self.publish_state(&ccb);
    }

    /// Wait up to `timeout` for the connection to be closed, returning the reason
    pub async fn wait_closed(&self, timeout_duration: Duration) -> Result<CloseReason, ConnectionError> {
        let mut state = self.state.subscribe();
        let result = match timeout(timeout_duration, state.wait_for(ConnectionState::is_closed)).await {
            Err(_) => Err(ConnectionError::Timeout),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Ok(Ok(current)) => match *current {
                ConnectionState::Closed(reason) => Ok(reason),
                _ => Err(ConnectionError::Closed),
            },
        };
        result
    }

    /// Close the connection right away, discarding everything it holds
    pub async fn force_close(&self, reason: CloseReason) {
        let mut ccb = self.inner.write().await;
        self.apply_close(&mut ccb, reason, Instant::now());
        self.publish_state(&ccb);
    }

    /// Wait for any operation in progress on this connection to finish
    pub(crate) async fn quiesce(&self) {
        let _ccb = self.inner.write().await;
    }

    pub(crate) async fn on_packet(&self, header: &PacketHeader, payload: &[u8]) {
        let mut ccb = self.inner.write().await;
        let now = Instant::now();

        let outcome = receive_engine::on_packet(&self.ctx, &self.key, &mut ccb, header, payload, now).await;
        if outcome.window_changed {
            self.window_changed.notify_waiters();
        }
        if outcome.data_available {
            self.data_available.notify_waiters();
        }

        self.check_drain(&mut ccb, now);
        self.publish_state(&ccb);
    }

    /// Local open of a connection the peer created. Returns `false` if it was opened before or
    ///  is closed already.
    pub(crate) async fn accept(&self) -> bool {
        let mut ccb = self.inner.write().await;
        if ccb.state().is_closed() || !ccb.mark_opened() {
            return false;
        }
        let now = Instant::now();
        debug!("accepting connection {} ({})", self.key, self.id);

        ccb.establish();
        let outcome = receive_engine::replay_startup_cache(&self.ctx, &self.key, &mut ccb, now).await;
        if outcome.data_available {
            self.data_available.notify_waiters();
        }

        self.check_drain(&mut ccb, now);
        self.publish_state(&ccb);
        true
    }

    pub(crate) async fn check_liveness(&self) {
        let mut ccb = self.inner.write().await;
        let now = Instant::now();

        if liveness::check_connection(&self.ctx, &self.key, &mut ccb, now).await {
            self.apply_close(&mut ccb, CloseReason::PeerUnresponsive, now);
            self.publish_state(&ccb);
        }
    }

    /// Periodic work: connect retries, retransmit deadlines, pending FIN, delayed ACKs and the
    ///  accept / drain deadlines. Returns `false` once the connection is closed.
    pub(crate) async fn on_timer_tick(&self) -> bool {
        let mut ccb = self.inner.write().await;
        let now = Instant::now();

        if ccb.state().is_closed() {
            return false;
        }

        if ccb.is_accept_overdue(now, &self.ctx.config) {
            debug!("connection {} was not opened in time", self.key);
            self.apply_close(&mut ccb, CloseReason::SetupTimeout, now);
            self.publish_state(&ccb);
            return false;
        }

        if !ccb.is_locally_opened() {
            return true;
        }

        if ccb.state() == ConnectionState::Setup {
            match ccb.handshake.poll(now, self.ctx.config.max_connect_attempts) {
                HandshakeAction::Nothing => {}
                HandshakeAction::SendConnect => send_engine::send_connect(&self.ctx, &self.key, &ccb).await,
                HandshakeAction::GiveUp => {
                    warn!("{} did not answer {} connection attempts", self.key, ccb.handshake.num_attempts());
                    self.apply_close(&mut ccb, CloseReason::PeerUnresponsive, now);
                    self.publish_state(&ccb);
                    return false;
                }
            }
        }

        send_engine::retransmit_expired(&self.ctx, &self.key, &mut ccb, now).await;
        send_engine::try_send_fin(&self.ctx, &self.key, &mut ccb, now).await;
        if ccb.receive.is_ack_due(now, self.ctx.config.max_ack_delay) {
            send_engine::send_ack(&self.ctx, &self.key, &mut ccb).await;
        }

        self.check_drain(&mut ccb, now);
        self.publish_state(&ccb);
        !ccb.state().is_closed()
    }

    fn check_drain(&self, ccb: &mut Ccb, now: Instant) {
        if ccb.is_drained() {
            self.apply_close(ccb, CloseReason::Normal, now);
        }
        else if ccb.is_drain_overdue(now) {
            warn!("connection {} did not drain in time, discarding {} unacknowledged packets", self.key, ccb.send.num_in_flight());
            self.apply_close(ccb, CloseReason::DrainTimeout, now);
        }
    }

    fn apply_close(&self, ccb: &mut Ccb, reason: CloseReason, now: Instant) {
        let is_end_of_stream_delivered = ccb.receive.is_end_of_stream_delivered();
        let final_ack = ccb.receive.highest_contiguous();

        if !ccb.close(reason) {
            return;
        }
        match reason {
            CloseReason::Normal => debug!("connection {} ({}) closed", self.key, self.id),
            _ => warn!("connection {} ({}) closed: {:?}", self.key, self.id, reason),
        }

        self.ctx.statistics.on_connection_closed();
        if reason == CloseReason::Normal && is_end_of_stream_delivered {
            self.ctx.linger(self.key, final_ack, now);
        }
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.key, self.id);
        }

        self.window_changed.notify_waiters();
        self.data_available.notify_waiters();
    }

    fn publish_state(&self, ccb: &Ccb) {
        let new_state = ccb.state();
        self.state.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            trace!("connection {}: {} -> {}", self.key, state, new_state);
            *state = new_state;
            true
        });
    }
}
