use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::bail;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::buffers::buffer_arena::BufferArena;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::ccb::Ccb;
use crate::config::InterconnectConfig;
use crate::connection::Connection;
use crate::connection_table::{ConnectionKey, ConnectionTable};
use crate::packet_header::{PacketHeader, PacketKind};
use crate::send_pipeline::{DatagramSocket, SendPipeline};
use crate::statistics::{InterconnectStatistics, StatisticsCollector};
use crate::transport_context::TransportContext;
use crate::{liveness, send_engine, shutdown};

/// EndPoint is where all parts of the interconnect come together: it owns the socket, the buffer
///  arena and the table of live connections, dispatches inbound datagrams to their connections
///  and has the API for opening connections.
pub struct EndPoint {
    ctx: Arc<TransportContext>,
    table: Arc<ConnectionTable<Arc<Connection>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

impl EndPoint {
    /// Bind a UDP socket to the configured address and start receiving on it
    pub async fn bind(config: InterconnectConfig) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound interconnect socket to {:?}", UdpSocket::local_addr(&socket)?);

        let recv_buf_size = config.max_datagram_size;
        let end_point = Self::with_socket(config, Arc::new(socket.clone()))?;

        let recv_loop = tokio::spawn(Self::recv_loop(Arc::downgrade(&end_point), socket, recv_buf_size));
        end_point.tasks.lock().unwrap_or_else(PoisonError::into_inner)
            .push(recv_loop);

        Ok(end_point)
    }

    /// Create an endpoint sending through an arbitrary [DatagramSocket]. Inbound datagrams must
    ///  be passed to [EndPoint::on_datagram].
    pub fn with_socket(config: InterconnectConfig, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Arc<EndPoint>> {
        config.validate()?;

        info!("allocating {} bytes for {} arena buffers ({} expected connections)", config.arena_memory_size(), config.arena_capacity(), config.expected_connections);
        let arena = BufferArena::new(config.max_datagram_size, config.arena_capacity())?;
        let statistics = Arc::new(StatisticsCollector::default());
        let pipeline = SendPipeline::new(socket, statistics.clone());
        let ctx = Arc::new(TransportContext::new(Arc::new(config), arena, statistics, pipeline));

        let table = Arc::new(ConnectionTable::default());
        let liveness_monitor = liveness::spawn_liveness_monitor(ctx.clone(), Arc::downgrade(&table));

        Ok(Arc::new(EndPoint {
            ctx,
            table,
            tasks: Mutex::new(vec![liveness_monitor]),
        }))
    }

    async fn recv_loop(end_point: Weak<EndPoint>, socket: Arc<UdpSocket>, buf_size: usize) {
        info!("starting receive loop");

        let mut buf = FixedBuf::new(buf_size);
        loop {
            buf.maximize_len();
            let (num_read, from) = match socket.recv_from(buf.as_mut()).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            buf.truncate(num_read);

            let Some(end_point) = end_point.upgrade() else {
                break;
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            end_point.on_datagram(from, buf.as_ref())
                .instrument(span)
                .await;
        }

        info!("receive loop stopped");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.pipeline.local_addr()
    }

    pub fn config(&self) -> &InterconnectConfig {
        &self.ctx.config
    }

    pub fn statistics(&self) -> InterconnectStatistics {
        self.ctx.statistics.snapshot()
    }

    pub fn num_connections(&self) -> usize {
        self.table.len()
    }

    pub fn arena(&self) -> &Arc<BufferArena> {
        &self.ctx.arena
    }

    /// Open a connection. If the peer already started sending on it, the packets it sent so far
    ///  are delivered right away.
    pub async fn open(&self, key: ConnectionKey) -> anyhow::Result<Arc<Connection>> {
        if self.ctx.is_shutting_down() {
            bail!("end point is shutting down, can not open connection {}", key);
        }
        self.ctx.forget_lingering(&key);

        let (connection, created) = self.table.get_or_insert_with(key, |id| {
            Connection::new(key, id, self.ctx.clone(), &self.table, Ccb::new_opened(&self.ctx.config, Instant::now()))
        });

        if created {
            if self.ctx.is_shutting_down() {
                // shutdown started between the check above and the insert
                self.table.remove(&key, connection.id());
                bail!("end point is shutting down, can not open connection {}", key);
            }
            debug!("opening connection {} ({})", key, connection.id());
            connection.start();
            // sends the first CONNECT right away
            connection.on_timer_tick().await;
        }
        else if !connection.accept().await {
            bail!("connection {} is already open", key);
        }

        Ok(connection)
    }

    /// Entry point for every inbound datagram
    pub async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let (header, payload) = match PacketHeader::decode(datagram) {
            Ok(x) => x,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                self.ctx.statistics.on_checksum_error();
                return;
            }
        };
        self.ctx.statistics.on_packet_received();
        trace!("received {:?} {} from {:?}", header.kind, header.sequence, from);

        let key = ConnectionKey {
            instance_id: header.instance_id,
            remote: from,
            channel_id: header.channel_id,
        };

        let connection = match self.table.lookup(&key) {
            Some(connection) => connection,
            None => match self.on_unknown_connection(&key, &header).await {
                Some(connection) => connection,
                None => return,
            },
        };
        connection.on_packet(&header, payload).await;
    }

    async fn on_unknown_connection(&self, key: &ConnectionKey, header: &PacketHeader) -> Option<Arc<Connection>> {
        match header.kind {
            PacketKind::Data | PacketKind::Fin => {
                if let Some(final_ack) = self.ctx.lingering_ack(key, Instant::now()) {
                    debug!("{:?} {} for recently closed connection {} - acknowledging", header.kind, header.sequence, key);
                    send_engine::send_stateless_ack(&self.ctx, key, final_ack).await;
                    return None;
                }
            }
            PacketKind::Connect => self.ctx.forget_lingering(key),
            PacketKind::Ack | PacketKind::Nak | PacketKind::StatusQuery | PacketKind::StatusReply => {
                trace!("{:?} for unknown connection {} - ignoring", header.kind, key);
                return None;
            }
        }

        if self.ctx.is_shutting_down() {
            debug!("{:?} for unknown connection {} during shutdown - ignoring", header.kind, key);
            return None;
        }

        let (connection, created) = self.table.get_or_insert_with(*key, |id| {
            Connection::new(*key, id, self.ctx.clone(), &self.table, Ccb::new_passive(&self.ctx.config, Instant::now()))
        });
        if created {
            if self.ctx.is_shutting_down() {
                self.table.remove(key, connection.id());
                return None;
            }
            debug!("peer started connection {} ({})", key, connection.id());
            connection.start();
        }
        Some(connection)
    }

    /// Close every connection and shut the buffer arena down, see [shutdown::shutdown]. Returns
    ///  the number of arena buffers still in use afterwards, which is zero unless some buffer
    ///  was leaked.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let outstanding = shutdown::shutdown(&self.ctx, &self.table, timeout).await;

        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        info!("interconnect shut down");
        outstanding
    }

    /// Wait up to `timeout` until there are no live connections
    pub async fn wait_for_quiescence(&self, timeout: Duration) -> bool {
        shutdown::wait_for_quiescence(&self.table, timeout, self.ctx.config.timer_tick).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccb::{CloseReason, ConnectionState};
    use crate::error::ConnectionError;
    use crate::sequence_number::SequenceNumber;
    use crate::test_util::{test_config, LoopbackNetwork, Verdict};
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 7000))
    }

    fn key(remote: SocketAddr) -> ConnectionKey {
        ConnectionKey { instance_id: 1, remote, channel_id: 2 }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn secs(seconds: u64) -> Duration {
        Duration::from_secs(seconds)
    }

    fn rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    /// two endpoints on a loopback network, with A at addr(1) and B at addr(2)
    fn end_points(configure: impl Fn(&mut InterconnectConfig)) -> (Arc<LoopbackNetwork>, Arc<EndPoint>, Arc<EndPoint>) {
        let network = LoopbackNetwork::new();
        let mut config_a = test_config(addr(1));
        configure(&mut config_a);
        let mut config_b = test_config(addr(2));
        configure(&mut config_b);

        let a = network.end_point(config_a);
        let b = network.end_point(config_b);
        (network, a, b)
    }

    async fn open_pair(a: &EndPoint, b: &EndPoint) -> (Arc<Connection>, Arc<Connection>) {
        let sender = a.open(key(addr(2))).await.unwrap();
        let receiver = b.open(key(addr(1))).await.unwrap();
        (sender, receiver)
    }

    async fn submit_all(sender: &Connection, payloads: impl IntoIterator<Item = u8>) {
        for p in payloads {
            sender.submit(&[p], secs(5)).await.unwrap();
        }
    }

    async fn recv_n(receiver: &Connection, n: usize) -> Vec<u8> {
        let mut result = Vec::new();
        for _ in 0..n {
            let payload = receiver.recv(secs(5)).await.unwrap().unwrap();
            assert_eq!(payload.len(), 1);
            result.push(payload[0]);
        }
        result
    }

    fn drop_once(kind: PacketKind, sequence: u64) -> impl FnMut(SocketAddr, SocketAddr, &PacketHeader) -> Verdict + Send {
        let mut is_dropped = false;
        move |from: SocketAddr, _: SocketAddr, header: &PacketHeader| {
            if !is_dropped && from == addr(1) && header.kind == kind && header.sequence == SequenceNumber::from_raw(sequence) {
                is_dropped = true;
                return Verdict::Drop;
            }
            Verdict::Deliver
        }
    }

    #[test]
    fn test_in_order_delivery() {
        rt().block_on(async {
            let (_network, a, b) = end_points(|_| {});
            let (sender, receiver) = open_pair(&a, &b).await;

            submit_all(&sender, 0..50).await;

            assert_eq!(recv_n(&receiver, 50).await, (0..50).collect::<Vec<_>>());
            assert!(matches!(receiver.recv(ms(50)).await, Err(ConnectionError::Timeout)));
            assert_eq!(sender.state(), ConnectionState::Established);
            assert_eq!(receiver.state(), ConnectionState::Established);

            let stats = b.statistics();
            assert_eq!(stats.duplicate_packets, 0);
            assert_eq!(stats.checksum_errors, 0);
            assert_eq!(stats.active_connections, 1);
            assert!(stats.recv_queue_size_counting_time >= 50);
            assert!(a.statistics().capacity_counting_time >= 50);
            assert!(a.statistics().acks_received > 0);
        });
    }

    #[test]
    fn test_single_loss_is_retransmitted_once() {
        rt().block_on(async {
            let (network, a, b) = end_points(|c| {
                c.initial_window = 4;
                c.max_window = 4;
                c.fast_retransmit_threshold = 100;
            });
            network.set_filter(drop_once(PacketKind::Data, 3));
            let (sender, receiver) = open_pair(&a, &b).await;

            submit_all(&sender, 1..=10).await;

            assert_eq!(recv_n(&receiver, 10).await, (1..=10).collect::<Vec<_>>());
            assert_eq!(a.statistics().retransmits, 1);
            assert_eq!(b.statistics().duplicate_packets, 0);
            assert!(b.statistics().out_of_order_packets > 0);
            assert_eq!(b.statistics().sequence_mismatches, 1);
        });
    }

    #[test]
    fn test_fast_retransmit() {
        rt().block_on(async {
            let (network, a, b) = end_points(|c| {
                c.initial_window = 8;
                c.max_window = 8;
            });
            network.set_filter(drop_once(PacketKind::Data, 2));
            let (sender, receiver) = open_pair(&a, &b).await;
            let start = Instant::now();

            submit_all(&sender, 1..=8).await;

            assert_eq!(recv_n(&receiver, 8).await, (1..=8).collect::<Vec<_>>());
            // long before the retransmit timeout
            assert!(start.elapsed() < a.config().initial_rto);
            assert_eq!(a.statistics().retransmits, 1);
        });
    }

    #[test]
    fn test_corrupt_packets_are_dropped() {
        rt().block_on(async {
            let (network, a, b) = end_points(|_| {});
            let mut num_corrupted = 0;
            network.set_filter(move |from, _, header| {
                if from == addr(1) && header.kind == PacketKind::Data && num_corrupted < 3 {
                    num_corrupted += 1;
                    return Verdict::Corrupt;
                }
                Verdict::Deliver
            });
            let (sender, receiver) = open_pair(&a, &b).await;

            submit_all(&sender, 1..=10).await;

            assert_eq!(recv_n(&receiver, 10).await, (1..=10).collect::<Vec<_>>());
            assert_eq!(b.statistics().checksum_errors, 3);
        });
    }

    #[test]
    fn test_duplicates_do_not_change_delivery() {
        rt().block_on(async {
            let (network, a, b) = end_points(|_| {});
            network.set_filter(|from, _, header| {
                if from == addr(1) && header.kind == PacketKind::Data {
                    Verdict::Duplicate
                }
                else {
                    Verdict::Deliver
                }
            });
            let (sender, receiver) = open_pair(&a, &b).await;

            submit_all(&sender, 1..=10).await;

            assert_eq!(recv_n(&receiver, 10).await, (1..=10).collect::<Vec<_>>());
            assert!(matches!(receiver.recv(ms(50)).await, Err(ConnectionError::Timeout)));
            assert!(b.statistics().duplicate_packets >= 10);
            // the fresh ACKs for duplicates carry no selective acks and trigger no fast retransmit
            assert_eq!(a.statistics().retransmits, 0);
        });
    }

    #[test]
    fn test_unresponsive_peer() {
        rt().block_on(async {
            let (network, a, b) = end_points(|c| {
                c.idle_threshold = secs(2);
                c.probe_interval = ms(500);
                c.probe_jitter = 0.0;
                c.max_liveness_probes = 3;
            });
            let (sender, receiver) = open_pair(&a, &b).await;
            submit_all(&sender, [1]).await;
            assert_eq!(recv_n(&receiver, 1).await, vec![1]);
            // let the delayed ACK go out
            sleep(ms(50)).await;

            network.disconnect();

            assert_eq!(sender.wait_closed(secs(30)).await, Ok(CloseReason::PeerUnresponsive));
            assert_eq!(sender.submit(&[2], secs(1)).await, Err(ConnectionError::PeerUnresponsive));
            assert_eq!(sender.recv(secs(1)).await, Err(ConnectionError::PeerUnresponsive));
            assert_eq!(a.statistics().status_query_messages, 3);
            assert_eq!(a.num_connections(), 0);
            assert_eq!(a.arena().in_use(), 0);

            assert_eq!(receiver.wait_closed(secs(30)).await, Ok(CloseReason::PeerUnresponsive));
        });
    }

    #[test]
    fn test_orderly_close() {
        rt().block_on(async {
            let (_network, a, b) = end_points(|_| {});
            let (sender, receiver) = open_pair(&a, &b).await;

            submit_all(&sender, 1..=5).await;
            sender.close().await;
            assert_eq!(sender.submit(&[6], secs(1)).await, Err(ConnectionError::Closed));

            assert_eq!(recv_n(&receiver, 5).await, vec![1, 2, 3, 4, 5]);
            assert_eq!(receiver.recv(secs(1)).await, Ok(None));
            assert_eq!(receiver.recv(secs(1)).await, Ok(None));

            assert_eq!(sender.wait_closed(secs(5)).await, Ok(CloseReason::Normal));
            assert_eq!(receiver.wait_closed(secs(5)).await, Ok(CloseReason::Normal));

            for end_point in [&a, &b] {
                assert_eq!(end_point.num_connections(), 0);
                assert_eq!(end_point.arena().in_use(), 0);
                assert_eq!(end_point.statistics().active_connections, 0);
            }
        });
    }

    #[test]
    fn test_lost_final_ack_is_answered_after_close() {
        rt().block_on(async {
            let (network, a, b) = end_points(|_| {});
            let (sender, receiver) = open_pair(&a, &b).await;
            submit_all(&sender, [1]).await;

            let mut is_dropped = false;
            network.set_filter(move |from, _, header| {
                if !is_dropped && from == addr(2) && header.kind == PacketKind::Ack && header.ack_sequence == SequenceNumber::from_raw(2) {
                    is_dropped = true;
                    return Verdict::Drop;
                }
                Verdict::Deliver
            });
            sender.close().await;

            assert_eq!(recv_n(&receiver, 1).await, vec![1]);
            assert_eq!(receiver.recv(secs(1)).await, Ok(None));
            assert_eq!(receiver.wait_closed(secs(1)).await, Ok(CloseReason::Normal));

            assert_eq!(sender.wait_closed(secs(5)).await, Ok(CloseReason::Normal));
            assert!(a.statistics().retransmits >= 1);
            assert_eq!(b.num_connections(), 0);
        });
    }

    #[test]
    fn test_drain_timeout() {
        rt().block_on(async {
            let (network, a, b) = end_points(|c| c.drain_timeout = secs(1));
            let (sender, receiver) = open_pair(&a, &b).await;
            submit_all(&sender, [1]).await;
            assert_eq!(recv_n(&receiver, 1).await, vec![1]);

            network.disconnect();
            submit_all(&sender, [2]).await;
            sender.close().await;

            assert_eq!(sender.wait_closed(secs(5)).await, Ok(CloseReason::DrainTimeout));
            assert_eq!(sender.submit(&[3], secs(1)).await, Err(ConnectionError::ClosedBeforeDrain));
            assert_eq!(a.arena().in_use(), 0);
        });
    }

    #[test]
    fn test_arena_backpressure() {
        rt().block_on(async {
            let (_network, a, _b) = end_points(|c| {
                c.expected_connections = 1;
                c.buffers_per_connection = 4;
            });
            let sender = a.open(key(addr(9))).await.unwrap();

            let held = (0..4).map(|_| a.arena().acquire().unwrap()).collect::<Vec<_>>();
            assert_eq!(sender.submit(&[1], ms(100)).await, Err(ConnectionError::Timeout));

            tokio::spawn(async move {
                sleep(ms(50)).await;
                drop(held);
            });
            assert_eq!(sender.submit(&[1], ms(100)).await, Ok(()));

            let stats = a.statistics();
            assert!(stats.buffer_counting_time >= 2);
            assert_eq!(stats.avg_buffers().map(|b| b < 4.0), Some(true));
        });
    }

    #[test]
    fn test_window_backpressure() {
        rt().block_on(async {
            let (_network, a, _b) = end_points(|c| {
                c.initial_window = 2;
                c.max_window = 2;
            });
            // nobody is listening at addr(9), so nothing is ever acknowledged
            let sender = a.open(key(addr(9))).await.unwrap();

            submit_all(&sender, [1, 2]).await;
            assert_eq!(sender.submit(&[3], ms(100)).await, Err(ConnectionError::Timeout));
        });
    }

    #[test]
    fn test_startup_cache() {
        rt().block_on(async {
            let (_network, a, b) = end_points(|_| {});
            let sender = a.open(key(addr(2))).await.unwrap();
            submit_all(&sender, [1, 2, 3]).await;

            sleep(ms(50)).await;
            assert_eq!(b.num_connections(), 1);
            assert_eq!(b.statistics().startup_cached_packets, 3);

            let receiver = b.open(key(addr(1))).await.unwrap();
            assert_eq!(receiver.state(), ConnectionState::Established);
            assert_eq!(recv_n(&receiver, 3).await, vec![1, 2, 3]);

            submit_all(&sender, [4]).await;
            assert_eq!(recv_n(&receiver, 1).await, vec![4]);
            sleep(ms(10)).await;
            assert_eq!(sender.state(), ConnectionState::Established);
        });
    }

    #[test]
    fn test_passive_connection_times_out() {
        rt().block_on(async {
            let (network, a, b) = end_points(|c| c.accept_timeout = secs(1));
            let sender = a.open(key(addr(2))).await.unwrap();
            submit_all(&sender, [1, 2]).await;
            sleep(ms(10)).await;
            network.disconnect();

            assert_eq!(b.num_connections(), 1);
            assert!(b.arena().in_use() > 0);

            sleep(secs(2)).await;
            assert_eq!(b.num_connections(), 0);
            assert_eq!(b.arena().in_use(), 0);
            assert_eq!(b.statistics().active_connections, 0);
        });
    }

    #[test]
    fn test_open_rejects_duplicate_key() {
        rt().block_on(async {
            let (_network, a, _b) = end_points(|_| {});
            a.open(key(addr(2))).await.unwrap();
            assert!(a.open(key(addr(2))).await.is_err());
        });
    }

    #[test]
    fn test_payload_too_large() {
        rt().block_on(async {
            let (_network, a, _b) = end_points(|_| {});
            let sender = a.open(key(addr(2))).await.unwrap();
            let max = a.config().max_payload_len();

            assert_eq!(
                sender.submit(&vec![0; max + 1], secs(1)).await,
                Err(ConnectionError::PayloadTooLarge { len: max + 1, max })
            );
        });
    }

    #[test]
    fn test_shutdown() {
        rt().block_on(async {
            let (_network, a, b) = end_points(|_| {});
            let (sender, receiver) = open_pair(&a, &b).await;
            submit_all(&sender, 1..=3).await;

            assert_eq!(a.shutdown(secs(5)).await, 0);

            assert_eq!(sender.state(), ConnectionState::Closed(CloseReason::Normal));
            assert!(a.wait_for_quiescence(ms(1)).await);
            assert!(a.open(key(addr(2))).await.is_err());
            assert_eq!(recv_n(&receiver, 3).await, vec![1, 2, 3]);
            assert_eq!(receiver.recv(secs(1)).await, Ok(None));
        });
    }

    #[test]
    fn test_shutdown_forces_undrained_connections() {
        rt().block_on(async {
            let (network, a, b) = end_points(|_| {});
            let (sender, _receiver) = open_pair(&a, &b).await;
            network.disconnect();
            submit_all(&sender, [1]).await;

            assert_eq!(a.shutdown(secs(1)).await, 0);
            assert_eq!(sender.state(), ConnectionState::Closed(CloseReason::DrainTimeout));
        });
    }

    #[test]
    fn test_shutdown_forces_connection_registered_while_draining() {
        rt().block_on(async {
            let (network, a, b) = end_points(|_| {});
            let (sender, _receiver) = open_pair(&a, &b).await;
            network.disconnect();
            submit_all(&sender, [1]).await;

            let shutdown = tokio::spawn({
                let a = a.clone();
                async move { a.shutdown(secs(1)).await }
            });
            sleep(ms(100)).await;

            // registered after shutdown took its snapshot, like an open racing it on another thread
            let late_key = key(addr(3));
            let (late, created) = a.table.get_or_insert_with(late_key, |id| {
                Connection::new(late_key, id, a.ctx.clone(), &a.table, Ccb::new_opened(&a.ctx.config, Instant::now()))
            });
            assert!(created);
            late.start();
            late.submit(&[2], secs(1)).await.unwrap();
            assert!(a.arena().in_use() >= 2);

            assert_eq!(shutdown.await.unwrap(), 0);

            assert_eq!(sender.state(), ConnectionState::Closed(CloseReason::DrainTimeout));
            assert_eq!(late.state(), ConnectionState::Closed(CloseReason::DrainTimeout));
            assert_eq!(a.num_connections(), 0);
            assert_eq!(a.arena().in_use(), 0);
        });
    }

    #[test]
    fn test_no_passive_connection_during_shutdown() {
        rt().block_on(async {
            let (_network, a, b) = end_points(|_| {});
            assert_eq!(b.shutdown(secs(1)).await, 0);

            let sender = a.open(key(addr(2))).await.unwrap();
            submit_all(&sender, [1]).await;
            sleep(ms(50)).await;

            assert_eq!(b.num_connections(), 0);
            assert_eq!(b.statistics().active_connections, 0);
        });
    }

    #[tokio::test]
    async fn test_udp() {
        let a = EndPoint::bind(test_config(SocketAddr::from(([127, 0, 0, 1], 0)))).await.unwrap();
        let b = EndPoint::bind(test_config(SocketAddr::from(([127, 0, 0, 1], 0)))).await.unwrap();

        let sender = a.open(key(b.local_addr())).await.unwrap();
        let receiver = b.open(key(a.local_addr())).await.unwrap();

        sender.submit(b"hello", secs(5)).await.unwrap();
        sender.close().await;

        assert_eq!(receiver.recv(secs(5)).await, Ok(Some(b"hello".to_vec())));
        assert_eq!(receiver.recv(secs(5)).await, Ok(None));
        assert_eq!(sender.wait_closed(secs(5)).await, Ok(CloseReason::Normal));
    }
}
