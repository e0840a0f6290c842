use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;

use crate::connection::stream::TwoWayStream;
use crate::contact::Route;


/// Settings shared by all connections of a port that may change while connections are live
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ConnectionControl {
    /// While set, the port's blocking calls (reads, waiting for replies or for a send to
    ///  complete, connecting) fail instead of blocking. Established connections keep running.
    pub interrupted: bool,
    /// the port is shutting down: all network operations fail
    pub closing: bool,
    /// upper bound for any single blocking network operation
    pub timeout: Option<Duration>,
}

impl ConnectionControl {
    pub fn new(timeout: Option<Duration>) -> ConnectionControl {
        ConnectionControl {
            interrupted: false,
            closing: false,
            timeout,
        }
    }
}

/// The per-connection state that carriers operate on: the stream (which carriers may replace
///  during negotiation), the route, and the shared timeout / shutdown control.
///
/// All I/O goes through the methods here so that every blocking operation honors the port's
///  timeout and shutdown. The interrupt flag does not affect connection I/O: a message that
///  started arriving is always read completely, so the stream stays usable.
pub struct ConnectionState {
    stream: Box<dyn TwoWayStream>,
    route: Route,
    control: watch::Receiver<ConnectionControl>,
}

impl ConnectionState {
    pub fn new(stream: Box<dyn TwoWayStream>, route: Route, control: watch::Receiver<ConnectionControl>) -> ConnectionState {
        ConnectionState {
            stream,
            route,
            control,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.remote_addr()
    }

    /// replaces the underlying stream, e.g. after negotiating a different transport
    pub fn take_streams(&mut self, stream: Box<dyn TwoWayStream>) {
        self.stream = stream;
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let timeout = self.control.borrow().timeout;
        guarded(self.stream.read_exact(buf), timeout, &mut self.control).await
    }

    pub async fn read_line(&mut self) -> anyhow::Result<String> {
        let timeout = self.control.borrow().timeout;
        guarded(self.stream.read_line(), timeout, &mut self.control).await
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let timeout = self.control.borrow().timeout;
        guarded(self.stream.write_all(buf), timeout, &mut self.control).await
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        let timeout = self.control.borrow().timeout;
        guarded(self.stream.flush(), timeout, &mut self.control).await
    }

    /// Reads exactly `buf.len()` bytes, waiting for them without timeout, returning `false` if the peer closed the connection before the first byte.
    ///  This is for waiting on the start of the next message, idle connections being regular.
    pub async fn read_start_of_message(&mut self, buf: &mut [u8]) -> anyhow::Result<bool> {
        match self.stream.read_exact(buf).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// the line based counterpart to [ConnectionState::read_start_of_message]
    pub async fn read_first_line(&mut self) -> anyhow::Result<Option<String>> {
        match self.stream.read_line().await {
            Ok(line) => Ok(Some(line)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs a network operation, failing it if the port is (or starts) shutting down or if it
///  takes longer than the timeout.
pub async fn guarded<T>(
    operation: impl Future<Output = std::io::Result<T>>,
    timeout: Option<Duration>,
    control: &mut watch::Receiver<ConnectionControl>,
) -> anyhow::Result<T> {
    Ok(bounded(operation, timeout, control, |c| c.closing).await??)
}

/// Waits on behalf of a port's user (replies, queued messages, send completion, connecting),
///  failing if the port is interrupted or shutting down, or when the timeout expires.
pub async fn interruptible<T>(
    operation: impl Future<Output = T>,
    timeout: Option<Duration>,
    control: &mut watch::Receiver<ConnectionControl>,
) -> anyhow::Result<T> {
    bounded(operation, timeout, control, |c| c.interrupted || c.closing).await
}

async fn bounded<T>(
    operation: impl Future<Output = T>,
    timeout: Option<Duration>,
    control: &mut watch::Receiver<ConnectionControl>,
    abort_if: impl Fn(&ConnectionControl) -> bool,
) -> anyhow::Result<T> {
    let aborted = async {
        let closed = control.wait_for(|c| abort_if(c)).await.is_err();
        if closed {
            // no sender means no more state changes
            std::future::pending::<()>().await;
        }
    };

    let limited = async {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, operation).await
                .map_err(|_| anyhow!("operation timed out after {:?}", timeout)),
            None => Ok(operation.await),
        }
    };

    tokio::select! {
        biased;
        _ = aborted => Err(anyhow!("interrupted")),
        result = limited => result,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::connection::stream::IoStream;
    use super::*;

    fn state_pair(control: watch::Receiver<ConnectionControl>) -> (ConnectionState, ConnectionState) {
        let (a, b) = tokio::io::duplex(1024);
        (
            ConnectionState::new(Box::new(IoStream::new(a, None, None)), Route::default(), control.clone()),
            ConnectionState::new(Box::new(IoStream::new(b, None, None)), Route::default(), control),
        )
    }

    #[tokio::test]
    async fn test_closing_unblocks_read() {
        let (control_tx, control_rx) = watch::channel(ConnectionControl::default());
        let (_a, mut b) = state_pair(control_rx);

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            b.read_exact(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        control_tx.send_modify(|c| c.closing = true);

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await
            .expect("read was not unblocked")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_interrupt_leaves_connection_io_alone() {
        let (control_tx, control_rx) = watch::channel(ConnectionControl::default());
        let (mut a, mut b) = state_pair(control_rx);
        control_tx.send_modify(|c| c.interrupted = true);

        a.write_all(b"ab").await.unwrap();
        a.flush().await.unwrap();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            b.read_exact(&mut buf).await.map(|_| buf)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.write_all(b"cd").await.unwrap();
        a.flush().await.unwrap();

        assert_eq!(&reader.await.unwrap().unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_interruptible() {
        let (control_tx, mut control_rx) = watch::channel(ConnectionControl::default());
        assert_eq!(interruptible(async { 5 }, None, &mut control_rx).await.unwrap(), 5);

        control_tx.send_modify(|c| c.interrupted = true);
        assert!(interruptible(std::future::pending::<()>(), None, &mut control_rx).await.is_err());

        control_tx.send_modify(|c| c.interrupted = false);
        let result = interruptible(std::future::pending::<()>(), Some(Duration::from_millis(10)), &mut control_rx).await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_control_tx, control_rx) = watch::channel(ConnectionControl::new(Some(Duration::from_millis(20))));
        let (_a, mut b) = state_pair(control_rx);

        let mut buf = [0u8; 4];
        let err = b.read_exact(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_start_of_message_eof() {
        let (_control_tx, control_rx) = watch::channel(ConnectionControl::default());
        let (a, mut b) = state_pair(control_rx);
        drop(a);

        let mut buf = [0u8; 4];
        assert!(!b.read_start_of_message(&mut buf).await.unwrap());
        assert_eq!(b.read_first_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_control_tx, control_rx) = watch::channel(ConnectionControl::default());
        let (mut a, mut b) = state_pair(control_rx);

        a.write_all(b"abcd").await.unwrap();
        a.flush().await.unwrap();

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
