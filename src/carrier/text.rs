use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::carrier::{Carrier, Header, MessageFlags};
use crate::connection::reader::ConnectionReader;
use crate::connection::state::ConnectionState;
use crate::connection::writer::BufferedConnectionWriter;


const CONNECT: [u8; 8] = *b"CONNECT ";
const CONNACK: [u8; 8] = *b"CONNACK ";
const ACK: &str = "<ACK>";

const CMD_DATA: &str = "d";
const CMD_DATA_WITH_REPLY: &str = "r";
const CMD_ADMIN: &str = "a";
const CMD_QUIT: &str = "q";

/// A human-typable line based carrier. After `CONNECT <name>`, every message is a command line
///  (`d` data, `r` data expecting a reply, `a` administrative, `q` quit) followed by a single
///  payload line; a reply is a single line. The `text_ack` variant (`CONNACK <name>`) acks
///  every message with an `<ACK>` line.
#[derive(Debug, Clone)]
pub struct TextCarrier {
    ack: bool,
}

impl TextCarrier {
    pub fn new(ack: bool) -> TextCarrier {
        TextCarrier { ack }
    }

    async fn write_line(conn: &mut ConnectionState, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        let body = writer.body_bytes();
        conn.write_all(&body).await?;
        if body.last() != Some(&b'\n') {
            conn.write_all(b"\n").await?;
        }
        Ok(())
    }

    fn line_reader(line: String, conn: &ConnectionState) -> ConnectionReader {
        ConnectionReader::new(Bytes::from(line.into_bytes()), true)
            .with_route(conn.route().clone())
    }
}

#[async_trait]
impl Carrier for TextCarrier {
    fn name(&self) -> &'static str {
        if self.ack { "text_ack" } else { "text" }
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn check_header(&self, header: &Header) -> bool {
        header.0 == CONNECT || header.0 == CONNACK
    }

    fn set_parameters(&mut self, header: &Header) {
        self.ack = header.0 == CONNACK;
    }

    fn get_header(&self) -> Header {
        Header(if self.ack { CONNACK } else { CONNECT })
    }

    fn is_text_mode(&self) -> bool {
        true
    }

    fn require_ack(&self) -> bool {
        self.ack
    }

    fn support_reply(&self) -> bool {
        true
    }

    async fn send_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let line = format!("{}\n", conn.route().from_name);
        conn.write_all(&self.get_header().0).await?;
        conn.write_all(line.as_bytes()).await?;
        conn.flush().await
    }

    async fn expect_reply_to_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let welcome = conn.read_line().await?;
        trace!("handshake reply: {:?}", welcome);
        Ok(())
    }

    async fn write(&mut self, conn: &mut ConnectionState, writer: &mut BufferedConnectionWriter, flags: MessageFlags) -> anyhow::Result<()> {
        let command = if flags.admin {
            CMD_ADMIN
        }
        else if flags.reply_expected {
            CMD_DATA_WITH_REPLY
        }
        else {
            CMD_DATA
        };

        conn.write_all(command.as_bytes()).await?;
        conn.write_all(b"\n").await?;
        Self::write_line(conn, writer).await?;
        conn.flush().await
    }

    async fn expect_reply(&mut self, conn: &mut ConnectionState) -> anyhow::Result<ConnectionReader> {
        let line = conn.read_line().await?;
        Ok(Self::line_reader(line, conn))
    }

    async fn expect_ack(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let line = conn.read_line().await?;
        if line != ACK {
            bail!("expected {}, received {:?}", ACK, line);
        }
        Ok(())
    }

    async fn close(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        conn.write_all(CMD_QUIT.as_bytes()).await?;
        conn.write_all(b"\n").await?;
        conn.flush().await
    }

    async fn expect_sender_specifier(&mut self, conn: &mut ConnectionState) -> anyhow::Result<String> {
        Ok(conn.read_line().await?.trim().to_string())
    }

    async fn respond_to_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let line = format!("Welcome {}\n", conn.route().to_name);
        conn.write_all(line.as_bytes()).await?;
        conn.flush().await
    }

    async fn expect_index(&mut self, conn: &mut ConnectionState) -> anyhow::Result<Option<(MessageFlags, ConnectionReader)>> {
        let command = match conn.read_first_line().await? {
            Some(command) => command,
            None => return Ok(None),
        };

        let flags = match command.trim() {
            CMD_DATA => MessageFlags::default(),
            CMD_DATA_WITH_REPLY => MessageFlags { reply_expected: true, ..Default::default() },
            CMD_ADMIN => MessageFlags { reply_expected: true, admin: true, ..Default::default() },
            CMD_QUIT => return Ok(None),
            other => bail!("unknown text command {:?}", other),
        };

        let payload = conn.read_line().await?;
        Ok(Some((flags, Self::line_reader(payload, conn))))
    }

    async fn write_reply(&mut self, conn: &mut ConnectionState, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        Self::write_line(conn, writer).await?;
        conn.flush().await
    }

    async fn send_ack(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        conn.write_all(ACK.as_bytes()).await?;
        conn.write_all(b"\n").await?;
        conn.flush().await
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::text(false, "text", b"CONNECT ")]
    #[case::text_ack(true, "text_ack", b"CONNACK ")]
    fn test_variants(#[case] ack: bool, #[case] name: &str, #[case] header: &[u8; 8]) {
        let carrier = TextCarrier::new(ack);
        assert_eq!(carrier.name(), name);
        assert_eq!(carrier.get_header(), Header(*header));
        assert_eq!(carrier.require_ack(), ack);
        assert!(carrier.is_text_mode());
    }

    #[test]
    fn test_set_parameters_is_per_instance() {
        let prototype = TextCarrier::new(false);
        let mut a = prototype.create();
        let b = prototype.create();

        a.set_parameters(&Header(CONNACK));
        assert!(a.require_ack());
        assert!(!b.require_ack());
        assert_eq!(prototype.name(), "text");
    }
}
