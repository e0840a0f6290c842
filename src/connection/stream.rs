use std::io::ErrorKind;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;


/// The largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// The longest line a text protocol may send, excluding the line terminator
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// A [TwoWayStream] is the byte level transport underneath a connection. Carriers may replace
///  a connection's stream during negotiation (e.g. switching from TCP to UDP).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TwoWayStream: Send {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()>;

    /// reads up to and including the next newline, returning the line without line terminator
    async fn read_line(&mut self) -> std::io::Result<String>;

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Finishes a message. For streams that buffer or packetize output, this is where data is
    ///  actually sent.
    async fn flush(&mut self) -> std::io::Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;
}


/// A stream based on tokio's async I/O traits, e.g. a TCP connection or an in-memory duplex
///  pipe.
pub struct IoStream<T: AsyncRead + AsyncWrite + Unpin + Send> {
    inner: BufStream<T>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl IoStream<TcpStream> {
    pub fn tcp(stream: TcpStream) -> IoStream<TcpStream> {
        let _ = stream.set_nodelay(true);
        IoStream {
            local_addr: stream.local_addr().ok(),
            remote_addr: stream.peer_addr().ok(),
            inner: BufStream::new(stream),
        }
    }
}

impl <T: AsyncRead + AsyncWrite + Unpin + Send> IoStream<T> {
    pub fn new(inner: T, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> IoStream<T> {
        IoStream {
            inner: BufStream::new(inner),
            local_addr,
            remote_addr,
        }
    }
}

#[async_trait]
impl <T: AsyncRead + AsyncWrite + Unpin + Send> TwoWayStream for IoStream<T> {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> std::io::Result<String> {
        let mut raw = Vec::new();
        let num_read = (&mut self.inner).take(MAX_LINE_LEN as u64 + 2).read_until(b'\n', &mut raw).await?;
        if num_read == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        if raw.last() != Some(&b'\n') && raw.len() > MAX_LINE_LEN {
            return Err(std::io::Error::new(ErrorKind::InvalidData, format!("line exceeds {} bytes", MAX_LINE_LEN)));
        }
        while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
            raw.pop();
        }
        String::from_utf8(raw)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf).await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}


/// A stream on top of UDP: everything written up to a `flush()` goes out as a single datagram,
///  and reads consume one received datagram at a time. A read that spans datagrams is an error,
///  since datagrams may be lost or reordered.
pub struct DatagramStream {
    socket: UdpSocket,
    remote_addr: Option<SocketAddr>,
    outgoing: BytesMut,
    incoming: Bytes,
}

impl DatagramStream {
    /// a stream that sends to a single peer
    pub async fn connect(remote_addr: SocketAddr) -> std::io::Result<DatagramStream> {
        let bind_addr: SocketAddr = if remote_addr.is_ipv6() {
            "[::]:0".parse().map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?
        }
        else {
            "0.0.0.0:0".parse().map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote_addr).await?;
        Ok(DatagramStream {
            socket,
            remote_addr: Some(remote_addr),
            outgoing: BytesMut::new(),
            incoming: Bytes::new(),
        })
    }

    /// a stream that receives from anybody
    pub fn from_bound(socket: UdpSocket) -> DatagramStream {
        DatagramStream {
            socket,
            remote_addr: None,
            outgoing: BytesMut::new(),
            incoming: Bytes::new(),
        }
    }

    async fn receive_datagram(&mut self) -> std::io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (num_read, from) = self.socket.recv_from(&mut buf).await?;
        trace!("received datagram of {} bytes from {:?}", num_read, from);
        buf.truncate(num_read);
        self.incoming = Bytes::from(buf);
        Ok(())
    }
}

#[async_trait]
impl TwoWayStream for DatagramStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        if self.incoming.is_empty() {
            self.receive_datagram().await?;
        }
        if self.incoming.len() < buf.len() {
            self.incoming = Bytes::new();
            return Err(std::io::Error::new(ErrorKind::InvalidData, "read spans datagram boundary"));
        }
        self.incoming.copy_to_slice(buf);
        Ok(())
    }

    async fn read_line(&mut self) -> std::io::Result<String> {
        if self.incoming.is_empty() {
            self.receive_datagram().await?;
        }
        let end = self.incoming.iter().position(|&b| b == b'\n').unwrap_or(self.incoming.len());
        let line = self.incoming.split_to(end);
        if !self.incoming.is_empty() {
            self.incoming.advance(1);
        }
        String::from_utf8(line.to_vec())
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if self.outgoing.len() + buf.len() > MAX_DATAGRAM_SIZE {
            self.outgoing.clear();
            return Err(std::io::Error::new(ErrorKind::InvalidInput, "message exceeds maximum datagram size"));
        }
        self.outgoing.extend_from_slice(buf);
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if self.outgoing.is_empty() {
            return Ok(());
        }
        let datagram = self.outgoing.split();
        match self.remote_addr {
            Some(addr) => self.socket.send_to(&datagram, addr).await?,
            None => return Err(std::io::Error::new(ErrorKind::NotConnected, "datagram stream has no peer")),
        };
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_io_stream_lines() {
        let (a, b) = tokio::io::duplex(1024);
        let mut a = IoStream::new(a, None, None);
        let mut b = IoStream::new(b, None, None);

        a.write_all(b"CONNECT /x\r\nd\n").await.unwrap();
        a.flush().await.unwrap();

        let mut header = [0u8; 8];
        b.read_exact(&mut header).await.unwrap();
        assert_eq!(&header, b"CONNECT ");
        assert_eq!(b.read_line().await.unwrap(), "/x");
        assert_eq!(b.read_line().await.unwrap(), "d");

        drop(a);
        assert_eq!(b.read_line().await.unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut a = IoStream::new(a, None, None);
        let mut b = IoStream::new(b, None, None);

        let writer = tokio::spawn(async move {
            let _ = a.write_all(&vec![b'x'; MAX_LINE_LEN + 100]).await;
            let _ = a.flush().await;
        });

        assert_eq!(b.read_line().await.unwrap_err().kind(), ErrorKind::InvalidData);
        drop(b);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_line_at_limit() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut a = IoStream::new(a, None, None);
        let mut b = IoStream::new(b, None, None);

        let writer = tokio::spawn(async move {
            let mut line = vec![b'y'; MAX_LINE_LEN];
            line.extend_from_slice(b"\r\n");
            a.write_all(&line).await.unwrap();
            a.flush().await.unwrap();
            a
        });

        assert_eq!(b.read_line().await.unwrap().len(), MAX_LINE_LEN);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_datagram_stream() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let mut receiver = DatagramStream::from_bound(receiver);
        let mut sender = DatagramStream::connect(receiver_addr).await.unwrap();

        sender.write_all(b"\x01\0\0\0").await.unwrap();
        sender.write_all(b"abc").await.unwrap();
        sender.flush().await.unwrap();

        let mut buf = [0u8; 4];
        receiver.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x01\0\0\0");
        let mut buf = [0u8; 4];
        assert!(receiver.read_exact(&mut buf).await.is_err());
    }
}
