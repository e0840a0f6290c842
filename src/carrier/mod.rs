pub mod crc;
pub mod registry;
pub mod tcp;
pub mod text;
pub mod udp;

use std::fmt::{Debug, Formatter};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use crate::connection::reader::ConnectionReader;
use crate::connection::state::ConnectionState;
use crate::connection::writer::BufferedConnectionWriter;
use crate::util::buf_ext::{BufExt, BufMutExt};


const MAX_NAME_LEN: usize = 1024;
const MAX_BLOCKS: usize = 64 * 1024;
const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;
/// message data is read (and buffer space allocated) at most this much at a time
const READ_CHUNK_LEN: usize = 64 * 1024;

/// The first eight bytes of a connection, identifying the carrier and its parameters
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Header(pub [u8; 8]);

impl Header {
    /// the header layout shared by binary carriers: `Y A <specifier> 0x1E 0 0 R P`
    pub const fn binary(specifier: u8) -> Header {
        Header([b'Y', b'A', specifier, 0x1E, 0, 0, b'R', b'P'])
    }

    /// the specifier byte if this is a binary carrier header
    pub fn binary_specifier(&self) -> Option<u8> {
        let h = &self.0;
        if h[0] == b'Y' && h[1] == b'A' && h[3] == 0x1E && h[6] == b'R' && h[7] == b'P' {
            Some(h[2])
        }
        else {
            None
        }
    }
}

impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x?}({:?})", self.0, String::from_utf8_lossy(&self.0))
    }
}

/// the acknowledgement sent by binary carriers, both for the handshake and for messages
pub const BINARY_ACK: [u8; 8] = *b"YA\0\0\0\0RP";


/// Per-message flags, transmitted as a little endian u32 by binary carriers
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct MessageFlags {
    pub reply_expected: bool,
    pub admin: bool,
    /// the message starts with an envelope string
    pub envelope: bool,
}

impl MessageFlags {
    const REPLY_EXPECTED: u32 = 1;
    const ADMIN: u32 = 2;
    const ENVELOPE: u32 = 4;

    pub fn to_bits(&self) -> u32 {
        let mut result = 0;
        if self.reply_expected { result |= Self::REPLY_EXPECTED; }
        if self.admin { result |= Self::ADMIN; }
        if self.envelope { result |= Self::ENVELOPE; }
        result
    }

    pub fn from_bits(bits: u32) -> MessageFlags {
        MessageFlags {
            reply_expected: bits & Self::REPLY_EXPECTED != 0,
            admin: bits & Self::ADMIN != 0,
            envelope: bits & Self::ENVELOPE != 0,
        }
    }
}


/// A [Carrier] is one variant of the wire protocol: how a connection is negotiated and how
///  messages, acks and replies are framed on it.
///
/// Carriers registered in the [registry::CarrierRegistry] act as stateless prototypes; every
///  connection gets a fresh instance through [Carrier::create], and that instance is owned by
///  the connection exclusively. Negotiated parameters (see [Carrier::set_parameters]) live in
///  the instance.
///
/// The default implementations of the protocol phases are the binary protocol shared by all
///  `YA..RP` carriers.
#[async_trait]
pub trait Carrier: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn create(&self) -> Box<dyn Carrier>;

    /// decides if an incoming connection's first eight bytes belong to this carrier
    fn check_header(&self, header: &Header) -> bool;

    /// adopts the parameters encoded in a received header
    fn set_parameters(&mut self, header: &Header);

    /// the header this instance sends when initiating a connection
    fn get_header(&self) -> Header;

    fn is_connectionless(&self) -> bool { false }
    fn is_broadcast(&self) -> bool { false }
    fn can_accept(&self) -> bool { true }
    fn can_offer(&self) -> bool { true }
    fn is_text_mode(&self) -> bool { false }
    fn can_escape(&self) -> bool { true }
    fn require_ack(&self) -> bool { false }
    fn support_reply(&self) -> bool { false }
    fn is_local(&self) -> bool { false }
    fn is_push(&self) -> bool { true }

    // ---- originating side

    async fn prepare_send(&mut self, _conn: &mut ConnectionState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_slice(&self.get_header().0);
        buf.put_string(&conn.route().from_name);
        conn.write_all(&buf).await?;
        conn.flush().await
    }

    async fn expect_reply_to_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        expect_binary_ack(conn).await
    }

    async fn write(&mut self, conn: &mut ConnectionState, writer: &mut BufferedConnectionWriter, flags: MessageFlags) -> anyhow::Result<()> {
        write_binary_frame(conn, writer, flags).await
    }

    async fn expect_reply(&mut self, conn: &mut ConnectionState) -> anyhow::Result<ConnectionReader> {
        let mut raw_flags = [0u8; 4];
        conn.read_exact(&mut raw_flags).await?;
        read_binary_frame(conn, MessageFlags::from_bits(u32::from_le_bytes(raw_flags)), self.is_text_mode()).await
    }

    async fn expect_ack(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        expect_binary_ack(conn).await
    }

    /// ends a connection from the originating side
    async fn close(&mut self, _conn: &mut ConnectionState) -> anyhow::Result<()> {
        Ok(())
    }

    // ---- receiving side

    async fn expect_sender_specifier(&mut self, conn: &mut ConnectionState) -> anyhow::Result<String> {
        let mut raw_len = [0u8; 4];
        conn.read_exact(&mut raw_len).await?;
        let len = i32::from_le_bytes(raw_len);
        if len < 0 || len as usize > MAX_NAME_LEN {
            bail!("invalid sender name length {}", len);
        }
        let mut raw = vec![0u8; len as usize];
        conn.read_exact(&mut raw).await?;
        if raw.last() == Some(&0) {
            raw.pop();
        }
        Ok(String::from_utf8(raw)?)
    }

    async fn expect_extra_header(&mut self, _conn: &mut ConnectionState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn respond_to_header(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        conn.write_all(&BINARY_ACK).await?;
        conn.flush().await
    }

    /// Reads the next message. Returns `None` if the peer ended the connection regularly.
    async fn expect_index(&mut self, conn: &mut ConnectionState) -> anyhow::Result<Option<(MessageFlags, ConnectionReader)>> {
        let mut raw_flags = [0u8; 4];
        if !conn.read_start_of_message(&mut raw_flags).await? {
            return Ok(None);
        }
        let flags = MessageFlags::from_bits(u32::from_le_bytes(raw_flags));
        let reader = read_binary_frame(conn, flags, self.is_text_mode()).await?;
        Ok(Some((flags, reader)))
    }

    async fn write_reply(&mut self, conn: &mut ConnectionState, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        write_binary_frame(conn, writer, MessageFlags::default()).await
    }

    async fn send_ack(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        conn.write_all(&BINARY_ACK).await?;
        conn.flush().await
    }

    // ---- payload transformations

    fn modifies_incoming_data(&self) -> bool { false }
    fn modify_incoming_data(&mut self, reader: ConnectionReader) -> anyhow::Result<ConnectionReader> {
        Ok(reader)
    }

    fn modifies_outgoing_data(&self) -> bool { false }
    fn modify_outgoing_data(&mut self, _writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        Ok(())
    }

    fn modifies_reply(&self) -> bool { false }
    fn modify_reply(&mut self, _writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn expect_binary_ack(conn: &mut ConnectionState) -> anyhow::Result<()> {
    let mut raw = [0u8; 8];
    conn.read_exact(&mut raw).await?;
    if raw != BINARY_ACK {
        bail!("expected ack, received {:?}", Header(raw));
    }
    Ok(())
}

/// Binary framing: flags (u32), number of blocks (u32), the length of each block (u32 each),
///  followed by the blocks' bytes. Header blocks come before body blocks.
pub async fn write_binary_frame(conn: &mut ConnectionState, writer: &mut BufferedConnectionWriter, flags: MessageFlags) -> anyhow::Result<()> {
    let mut blocks = writer.header_blocks().to_vec();
    blocks.extend_from_slice(writer.body_blocks());

    let mut frame = BytesMut::with_capacity(8 + 4*blocks.len());
    frame.put_u32_le(flags.to_bits());
    frame.put_u32_le(blocks.len() as u32);
    for block in &blocks {
        frame.put_u32_le(block.len() as u32);
    }

    conn.write_all(&frame).await?;
    for block in &blocks {
        conn.write_all(block).await?;
    }
    conn.flush().await
}

/// reads the rest of a binary frame after its flags
pub async fn read_binary_frame(conn: &mut ConnectionState, flags: MessageFlags, text_mode: bool) -> anyhow::Result<ConnectionReader> {
    let mut raw_count = [0u8; 4];
    conn.read_exact(&mut raw_count).await?;
    let num_blocks = u32::from_le_bytes(raw_count) as usize;
    if num_blocks > MAX_BLOCKS {
        bail!("message has {} blocks, maximum is {}", num_blocks, MAX_BLOCKS);
    }

    let mut raw_lengths = vec![0u8; 4*num_blocks];
    conn.read_exact(&mut raw_lengths).await?;
    let mut lengths: &[u8] = &raw_lengths;
    let mut total = 0usize;
    while !lengths.is_empty() {
        total += lengths.try_get_u32_le()? as usize;
    }
    if total > MAX_MESSAGE_LEN {
        bail!("message has {} bytes, maximum is {}", total, MAX_MESSAGE_LEN);
    }

    // the buffer grows as data arrives rather than trusting the announced size up front
    let mut data = BytesMut::new();
    while data.len() < total {
        let start = data.len();
        let chunk_len = (total - start).min(READ_CHUNK_LEN);
        data.resize(start + chunk_len, 0);
        conn.read_exact(&mut data[start..]).await?;
    }
    let mut data = data.freeze();

    let envelope = if flags.envelope {
        Some(data.try_get_string()?)
    }
    else {
        None
    };

    Ok(ConnectionReader::new(data, text_mode)
        .with_route(conn.route().clone())
        .with_envelope(envelope))
}
