use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::statistics::StatisticsCollector;

/// This is an abstraction for sending a buffer on a datagram socket, introduced to facilitate
///  mocking the I/O part away for testing. Send failures are logged and otherwise treated like
///  packet loss.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(datagram, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Outbound path shared by all connections of an endpoint
pub struct SendPipeline {
    socket: Arc<dyn DatagramSocket>,
    statistics: Arc<StatisticsCollector>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn DatagramSocket>, statistics: Arc<StatisticsCollector>) -> SendPipeline {
        SendPipeline { socket, statistics }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.statistics.on_packet_sent();
        self.socket.send_datagram(to, packet_buf).await;
    }
}
