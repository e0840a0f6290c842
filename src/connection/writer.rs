use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::trace;

use crate::connection::reader::ConnectionReader;
use crate::connection::state::ConnectionState;
use crate::util::buf_ext::BufMutExt;


const INITIAL_POOL_SIZE: usize = 1024;
const MAX_POOL_SIZE: usize = 64 * 1024;

/// The handler that receives the reply to a message, if the message's sender asked for one.
pub type ReplyHandler = oneshot::Sender<ConnectionReader>;

/// A [BufferedConnectionWriter] assembles a message as an ordered sequence of byte blocks.
///
/// Small appends (numbers, short strings, small copied blocks) go into a pool buffer, so a
///  message composed of many primitives causes a handful of allocations at most. The first pool
///  holds 1 KiB, and every further pool allocation doubles that up to 64 KiB. Copies at least as
///  big as the next pool, and external blocks (which are never copied), become blocks of their
///  own; pooling then continues in a fresh block.
///
/// There are two sequences of blocks: header and body. [BufferedConnectionWriter::add_to_header]
///  directs subsequent appends to the header, which is written before the body.
#[derive(Debug)]
pub struct BufferedConnectionWriter {
    header: Vec<Bytes>,
    body: Vec<Bytes>,
    pool: BytesMut,
    pool_size: usize,
    in_header: bool,
    text_mode: bool,
    drop_requested: bool,
    reply_handler: Option<ReplyHandler>,
}

impl BufferedConnectionWriter {
    pub fn new(text_mode: bool) -> BufferedConnectionWriter {
        BufferedConnectionWriter {
            header: Vec::new(),
            body: Vec::new(),
            pool: BytesMut::new(),
            pool_size: INITIAL_POOL_SIZE,
            in_header: false,
            text_mode,
            drop_requested: false,
            reply_handler: None,
        }
    }

    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    pub fn append_int(&mut self, value: i32) {
        self.push_copy(&value.to_le_bytes());
    }

    pub fn append_int64(&mut self, value: i64) {
        self.push_copy(&value.to_le_bytes());
    }

    pub fn append_u32(&mut self, value: u32) {
        self.push_copy(&value.to_le_bytes());
    }

    pub fn append_double(&mut self, value: f64) {
        self.push_copy(&value.to_le_bytes());
    }

    /// appends a length prefixed, NUL terminated string
    pub fn append_string(&mut self, s: &str) {
        let len = s.len() + 5;
        if len >= self.pool_size {
            let mut buf = BytesMut::with_capacity(len);
            buf.put_string(s);
            self.flush_pool();
            self.target().push(buf.freeze());
            return;
        }

        self.reserve_pool(len);
        self.pool.put_string(s);
    }

    /// appends raw text followed by a newline, for text mode
    pub fn append_line(&mut self, s: &str) {
        self.push_copy(s.as_bytes());
        self.push_copy(b"\n");
    }

    pub fn append_block_copy(&mut self, data: &[u8]) {
        self.push_copy(data);
    }

    /// Appends a block without copying it. The block always becomes a block of its own.
    pub fn append_external_block(&mut self, data: Bytes) {
        self.flush_pool();
        if !data.is_empty() {
            self.target().push(data);
        }
    }

    /// subsequent appends go to the header sequence
    pub fn add_to_header(&mut self) {
        if !self.in_header {
            self.flush_pool();
            self.in_header = true;
        }
    }

    /// subsequent appends go to the body sequence (the default)
    pub fn add_to_body(&mut self) {
        if self.in_header {
            self.flush_pool();
            self.in_header = false;
        }
    }

    fn target(&mut self) -> &mut Vec<Bytes> {
        if self.in_header {
            &mut self.header
        }
        else {
            &mut self.body
        }
    }

    fn push_copy(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data.len() >= self.pool_size {
            trace!("block of {} bytes does not fit a pool of {} - storing it separately", data.len(), self.pool_size);
            self.flush_pool();
            self.target().push(Bytes::copy_from_slice(data));
            return;
        }

        self.reserve_pool(data.len());
        self.pool.put_slice(data);
    }

    /// makes room for `len` bytes in the pool, `len` being less than the pool size
    fn reserve_pool(&mut self, len: usize) {
        if self.pool.capacity() - self.pool.len() < len {
            self.flush_pool();
            self.pool = BytesMut::with_capacity(self.pool_size);
            self.pool_size = (self.pool_size * 2).min(MAX_POOL_SIZE);
        }
    }

    /// finishes the pool's current block, keeping the pool's remaining capacity for later appends
    fn flush_pool(&mut self) {
        if !self.pool.is_empty() {
            let block = self.pool.split().freeze();
            self.target().push(block);
        }
    }

    pub fn header_blocks(&mut self) -> &[Bytes] {
        if self.in_header {
            self.flush_pool();
        }
        &self.header
    }

    pub fn body_blocks(&mut self) -> &[Bytes] {
        if !self.in_header {
            self.flush_pool();
        }
        &self.body
    }

    pub fn header_size(&self) -> usize {
        let pending = if self.in_header { self.pool.len() } else { 0 };
        self.header.iter().map(|b| b.len()).sum::<usize>() + pending
    }

    pub fn body_size(&self) -> usize {
        let pending = if self.in_header { 0 } else { self.pool.len() };
        self.body.iter().map(|b| b.len()).sum::<usize>() + pending
    }

    pub fn data_size(&self) -> usize {
        self.header_size() + self.body_size()
    }

    /// the number of header and body blocks, including a partially filled pool block
    pub fn num_blocks(&self) -> usize {
        let pending = if self.pool.is_empty() { 0 } else { 1 };
        self.header.len() + self.body.len() + pending
    }

    /// the header's content as a contiguous buffer
    pub fn header_bytes(&mut self) -> Bytes {
        concat(self.header_blocks())
    }

    /// the body's content as a contiguous buffer
    pub fn body_bytes(&mut self) -> Bytes {
        concat(self.body_blocks())
    }

    /// the complete message as a contiguous buffer, header first
    pub fn to_bytes(&mut self) -> Bytes {
        self.flush_pool();
        let mut result = BytesMut::with_capacity(self.data_size());
        for block in self.header.iter().chain(self.body.iter()) {
            result.put_slice(block);
        }
        result.freeze()
    }

    /// streams header blocks and then body blocks, in order and unframed
    pub async fn write_to(&mut self, conn: &mut ConnectionState) -> anyhow::Result<()> {
        self.flush_pool();
        for block in self.header.iter().chain(self.body.iter()) {
            conn.write_all(block).await?;
        }
        Ok(())
    }

    /// discards all content, releasing the pool
    pub fn clear(&mut self) {
        self.header.clear();
        self.body.clear();
        self.pool = BytesMut::new();
        self.pool_size = INITIAL_POOL_SIZE;
        self.in_header = false;
        self.drop_requested = false;
        self.reply_handler = None;
    }

    pub fn reset(&mut self, text_mode: bool) {
        self.clear();
        self.text_mode = text_mode;
    }

    /// marks the message as discarded: the carrier does not transmit it
    pub fn request_drop(&mut self) {
        self.drop_requested = true;
    }

    pub fn is_drop_requested(&self) -> bool {
        self.drop_requested
    }

    pub fn set_reply_handler(&mut self, handler: ReplyHandler) {
        self.reply_handler = Some(handler);
    }

    pub fn has_reply_handler(&self) -> bool {
        self.reply_handler.is_some()
    }

    pub fn take_reply_handler(&mut self) -> Option<ReplyHandler> {
        self.reply_handler.take()
    }
}

fn concat(blocks: &[Bytes]) -> Bytes {
    match blocks.len() {
        0 => Bytes::new(),
        1 => blocks[0].clone(),
        _ => {
            let mut result = BytesMut::with_capacity(blocks.iter().map(|b| b.len()).sum());
            for block in blocks {
                result.put_slice(block);
            }
            result.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_small_appends_share_a_block() {
        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_int(1);
        writer.append_double(2.5);
        writer.append_string("abc");

        assert_eq!(writer.body_blocks().len(), 1);
        assert_eq!(writer.data_size(), 4 + 8 + 4 + 4);
        assert_eq!(&writer.to_bytes()[..], b"\x01\0\0\0\0\0\0\0\0\0\x04\x40\x04\0\0\0abc\0");
    }

    #[test]
    fn test_external_block_boundary() {
        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_int(1);
        writer.append_external_block(Bytes::from_static(b"external"));
        writer.append_int(2);

        let blocks = writer.body_blocks().to_vec();
        assert_eq!(blocks.len(), 3);
        assert_eq!(&blocks[0][..], b"\x01\0\0\0");
        assert_eq!(&blocks[1][..], b"external");
        assert_eq!(&blocks[2][..], b"\x02\0\0\0");
    }

    #[rstest]
    #[case::fits_pool(1000, 1)]
    #[case::next_pool(2000, 2)]
    #[case::standalone(3000, 3)]
    #[case::exceeds_max_pool(MAX_POOL_SIZE + 1, 3)]
    fn test_large_copy(#[case] len: usize, #[case] expected_blocks: usize) {
        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_int(7);
        writer.append_block_copy(&vec![3u8; len]);
        writer.append_int(8);

        let blocks = writer.body_blocks().to_vec();
        assert_eq!(blocks.len(), expected_blocks);
        assert_eq!(writer.body_size(), 8 + len);
        assert_eq!(&blocks[blocks.len() - 1][blocks[blocks.len() - 1].len() - 4..], b"\x08\0\0\0");
    }

    #[test]
    fn test_standalone_copy_at_pool_size() {
        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_block_copy(&vec![1u8; INITIAL_POOL_SIZE]);
        writer.append_int(2);

        let blocks = writer.body_blocks().to_vec();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].len(), INITIAL_POOL_SIZE);
        assert_eq!(&blocks[1][..], b"\x02\0\0\0");
    }

    #[test]
    fn test_pool_doubles_per_allocation() {
        let mut writer = BufferedConnectionWriter::new(false);
        for _ in 0..(1024 + 2048) / 4 {
            writer.append_int(5);
        }
        assert_eq!(writer.body_blocks().iter().map(|b| b.len()).collect::<Vec<_>>(), vec![1024, 2048]);
    }

    #[test]
    fn test_strings_go_into_the_pool() {
        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_string("a");
        writer.append_string("bc");
        assert_eq!(writer.body_blocks().len(), 1);
        assert_eq!(&writer.to_bytes()[..], b"\x02\0\0\0a\0\x03\0\0\0bc\0");

        let long = "x".repeat(5000);
        writer.append_string(&long);
        assert_eq!(writer.body_blocks().len(), 2);
        assert_eq!(writer.body_size(), 6 + 7 + long.len() + 5);
    }

    #[test]
    fn test_header_is_written_first() {
        let mut writer = BufferedConnectionWriter::new(true);
        writer.append_line("body");
        writer.add_to_header();
        writer.append_line("head");
        writer.add_to_body();
        writer.append_line("more");

        assert_eq!(writer.header_size(), 5);
        assert_eq!(writer.body_size(), 10);
        assert_eq!(&writer.to_bytes()[..], b"head\nbody\nmore\n");
        assert_eq!(&writer.header_bytes()[..], b"head\n");
    }

    #[test]
    fn test_clear() {
        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_int(1);
        writer.request_drop();
        let (tx, _rx) = oneshot::channel();
        writer.set_reply_handler(tx);

        writer.clear();
        assert_eq!(writer.data_size(), 0);
        assert_eq!(writer.num_blocks(), 0);
        assert!(!writer.is_drop_requested());
        assert!(!writer.has_reply_handler());
    }
}
