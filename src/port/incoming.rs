use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::oneshot;

use crate::connection::reader::ConnectionReader;
use crate::connection::writer::BufferedConnectionWriter;
use crate::payload::{PortReader, PortWriter};


/// Called for every message a port receives, on the receiving connection's task. If the sender
///  expects a reply, the handler writes it to [ConnectionReader::reply_writer]; a handler that
///  writes nothing makes the port send an empty reply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReadHandler: Send + Sync + 'static {
    async fn on_read(&self, reader: &mut ConnectionReader) -> anyhow::Result<bool>;
}

/// A received message, handed out by [crate::port::Port::read] when the port has no read
///  handler. If the sender waits for a reply, it gets one when [Incoming::reply] is called, or an
///  empty one when the `Incoming` is dropped.
pub struct Incoming {
    reader: ConnectionReader,
    reply: Option<oneshot::Sender<BufferedConnectionWriter>>,
}

impl Incoming {
    pub fn new(reader: ConnectionReader, reply: Option<oneshot::Sender<BufferedConnectionWriter>>) -> Incoming {
        Incoming { reader, reply }
    }

    pub fn reader(&mut self) -> &mut ConnectionReader {
        &mut self.reader
    }

    pub fn read_into(&mut self, payload: &mut dyn PortReader) -> anyhow::Result<bool> {
        payload.read(&mut self.reader)
    }

    pub fn is_reply_expected(&self) -> bool {
        self.reply.is_some() && self.reader.is_reply_expected()
    }

    pub fn reply(mut self, payload: &dyn PortWriter) -> anyhow::Result<()> {
        let (mut writer, reply) = match (self.reader.take_reply_writer(), self.reply.take()) {
            (Some(writer), Some(reply)) => (writer, reply),
            _ => return Err(anyhow!("the sender of this message does not expect a reply")),
        };
        payload.write(&mut writer)?;
        reply.send(writer)
            .map_err(|_| anyhow!("the connection closed before the reply was sent"))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use crate::payload::bottle::Bottle;
    use super::*;

    #[test]
    fn test_reply() {
        let reader = ConnectionReader::new(Bytes::new(), true).with_reply_writer();
        let (tx, mut rx) = oneshot::channel();
        let incoming = Incoming::new(reader, Some(tx));
        assert!(incoming.is_reply_expected());

        incoming.reply(&Bottle::from_text("15").unwrap()).unwrap();
        let mut writer = rx.try_recv().unwrap();
        assert_eq!(&writer.body_bytes()[..], b"15\n");
    }

    #[test]
    fn test_reply_without_sender_waiting() {
        let incoming = Incoming::new(ConnectionReader::new(Bytes::new(), false), None);
        assert!(!incoming.is_reply_expected());
        assert!(incoming.reply(&Bottle::new()).is_err());
    }

    #[test]
    fn test_drop_releases_sender() {
        let reader = ConnectionReader::new(Bytes::new(), false).with_reply_writer();
        let (tx, mut rx) = oneshot::channel();
        drop(Incoming::new(reader, Some(tx)));
        assert!(rx.try_recv().is_err());
    }
}
