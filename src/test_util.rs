//! Helpers for unit tests: a send socket that records everything, and an in-memory network that
//!  connects endpoints and can drop, corrupt or duplicate datagrams on the way.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::buffers::buffer_arena::BufferArena;
use crate::config::InterconnectConfig;
use crate::end_point::EndPoint;
use crate::packet_header::PacketHeader;
use crate::send_pipeline::{DatagramSocket, MockDatagramSocket, SendPipeline};
use crate::statistics::StatisticsCollector;
use crate::transport_context::TransportContext;

pub type SentDatagrams = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

pub fn test_config(self_addr: SocketAddr) -> InterconnectConfig {
    let mut config = InterconnectConfig::new(self_addr);
    // keep the eagerly allocated arena small
    config.expected_connections = 4;
    config
}

/// A [TransportContext] whose socket records every datagram it is asked to send
pub fn recording_context(configure: impl FnOnce(&mut InterconnectConfig)) -> (TransportContext, SentDatagrams) {
    let mut config = test_config(SocketAddr::from(([10, 0, 0, 1], 7000)));
    configure(&mut config);

    let sent: SentDatagrams = Default::default();
    let mut socket = MockDatagramSocket::new();
    socket.expect_local_addr()
        .return_const(config.self_addr);
    let sent_by_socket = sent.clone();
    socket.expect_send_datagram()
        .returning(move |to, datagram| sent_by_socket.lock().unwrap().push((to, datagram.to_vec())));

    let statistics = Arc::new(StatisticsCollector::default());
    let arena = BufferArena::new(config.max_datagram_size, config.arena_capacity()).unwrap();
    let ctx = TransportContext::new(
        Arc::new(config),
        arena,
        statistics.clone(),
        SendPipeline::new(Arc::new(socket), statistics),
    );
    (ctx, sent)
}

/// Decode every recorded datagram, panicking on corrupt ones
pub fn decode_all(sent: &SentDatagrams) -> Vec<(SocketAddr, PacketHeader, Vec<u8>)> {
    sent.lock().unwrap()
        .iter()
        .map(|(to, datagram)| {
            let (header, payload) = PacketHeader::decode(datagram).unwrap();
            (*to, header, payload.to_vec())
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Verdict {
    Deliver,
    Drop,
    /// flip a bit in the payload area
    Corrupt,
    /// deliver twice
    Duplicate,
}

type Filter = Box<dyn FnMut(SocketAddr, SocketAddr, &PacketHeader) -> Verdict + Send>;

/// In-memory network between endpoints. Every datagram passes a filter that decides its fate.
///  Delivery is asynchronous through a per-endpoint channel, like a real network: a sender never
///  runs the receiver's code.
pub struct LoopbackNetwork {
    inboxes: Mutex<FxHashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>>,
    filter: Mutex<Filter>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<LoopbackNetwork> {
        Arc::new(LoopbackNetwork {
            inboxes: Default::default(),
            filter: Mutex::new(Box::new(|_, _, _| Verdict::Deliver)),
        })
    }

    pub fn set_filter(&self, filter: impl FnMut(SocketAddr, SocketAddr, &PacketHeader) -> Verdict + Send + 'static) {
        *self.filter.lock().unwrap() = Box::new(filter);
    }

    /// Drop every datagram from now on
    pub fn disconnect(&self) {
        self.set_filter(|_, _, _| Verdict::Drop);
    }

    /// Create an endpoint attached to this network, with a task feeding it inbound datagrams
    pub fn end_point(self: &Arc<Self>, config: InterconnectConfig) -> Arc<EndPoint> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();
        self.inboxes.lock().unwrap().insert(config.self_addr, sender);

        let socket = Arc::new(LoopbackSocket {
            addr: config.self_addr,
            network: self.clone(),
        });
        let end_point = EndPoint::with_socket(config, socket).unwrap();

        let weak = Arc::downgrade(&end_point);
        tokio::spawn(async move {
            while let Some((from, datagram)) = receiver.recv().await {
                let Some(end_point) = weak.upgrade() else {
                    break;
                };
                end_point.on_datagram(from, &datagram).await;
            }
        });

        end_point
    }

    fn transmit(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        let verdict = match PacketHeader::decode(datagram) {
            Ok((header, _)) => (self.filter.lock().unwrap())(from, to, &header),
            Err(_) => Verdict::Deliver,
        };

        let inboxes = self.inboxes.lock().unwrap();
        let Some(inbox) = inboxes.get(&to) else {
            return;
        };
        match verdict {
            Verdict::Deliver => {
                let _ = inbox.send((from, datagram.to_vec()));
            }
            Verdict::Drop => {}
            Verdict::Corrupt => {
                let mut corrupted = datagram.to_vec();
                let last = corrupted.len() - 1;
                corrupted[last] ^= 0x40;
                let _ = inbox.send((from, corrupted));
            }
            Verdict::Duplicate => {
                let _ = inbox.send((from, datagram.to_vec()));
                let _ = inbox.send((from, datagram.to_vec()));
            }
        }
    }
}

struct LoopbackSocket {
    addr: SocketAddr,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl DatagramSocket for LoopbackSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        self.network.transmit(self.addr, to, datagram);
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}
