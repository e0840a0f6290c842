use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::carrier::{Carrier, Header};
use crate::connection::state::ConnectionState;
use crate::connection::stream::DatagramStream;


const UDP_CODE: u8 = 0x00;

/// A connectionless carrier: the handshake happens over TCP, after which the receiver binds a
///  UDP socket and tells the sender its port number. Messages then travel as single datagrams,
///  without acks or replies.
#[derive(Debug, Clone, Default)]
pub struct UdpCarrier;

impl UdpCarrier {
    pub fn new() -> UdpCarrier {
        UdpCarrier
    }
}

/// The receiver's answer to the handshake: `Y A <port, u32 LE> R P`
fn port_header(port: u16) -> [u8; 8] {
    let port = (port as u32).to_le_bytes();
    [b'Y', b'A', port[0], port[1], port[2], port[3], b'R', b'P']
}

fn port_from_header(raw: &[u8; 8]) -> anyhow::Result<u16> {
    if &raw[..2] != b"YA" || &raw[6..] != b"RP" {
        bail!("invalid udp handshake reply {:?}", Header(*raw));
    }
    let port = u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]);
    u16::try_from(port)
        .map_err(|_| anyhow!("invalid udp port number {}", port))
}

#[async_trait]
impl Carrier for UdpCarrier {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(UdpCarrier::new())
    }

    fn check_header(&self, header: &Header) -> bool {
        header.binary_specifier() == Some(UDP_CODE)
    }

    fn set_parameters(&mut self, _header: &Header) {
    }

    fn get_header(&self) -> Header {
        Header::binary(UDP_CODE)
    }

    fn is_connectionless(&self) -> bool {
        true
    }

    async fn expect_reply_to_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let mut raw = [0u8; 8];
        conn.read_exact(&mut raw).await?;
        let port = port_from_header(&raw)?;

        let remote_ip = conn.remote_addr()
            .ok_or_else(|| anyhow!("udp handshake requires a peer address"))?
            .ip();
        let remote_addr = SocketAddr::new(remote_ip, port);
        debug!("switching to datagrams, sending to {:?}", remote_addr);

        let stream = DatagramStream::connect(remote_addr).await?;
        conn.take_streams(Box::new(stream));
        Ok(())
    }

    async fn respond_to_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let local_ip = conn.local_addr()
            .ok_or_else(|| anyhow!("udp handshake requires a local address"))?
            .ip();
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        let port = socket.local_addr()?.port();
        debug!("receiving datagrams on port {}", port);

        conn.write_all(&port_header(port)).await?;
        conn.flush().await?;
        conn.take_streams(Box::new(DatagramStream::from_bound(socket)));
        Ok(())
    }
}
