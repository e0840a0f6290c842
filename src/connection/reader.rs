use bytes::{Buf, Bytes};

use crate::connection::writer::BufferedConnectionWriter;
use crate::contact::Route;
use crate::util::buf_ext::BufExt;


/// The read side paired with [BufferedConnectionWriter]: a cursor over one received message.
///  Block boundaries from the sender are not visible here, the message is one logical stream.
#[derive(Debug)]
pub struct ConnectionReader {
    data: Bytes,
    size: usize,
    text_mode: bool,
    envelope: Option<String>,
    route: Route,
    reply: Option<BufferedConnectionWriter>,
}

impl ConnectionReader {
    pub fn new(data: Bytes, text_mode: bool) -> ConnectionReader {
        ConnectionReader {
            size: data.len(),
            data,
            text_mode,
            envelope: None,
            route: Route::default(),
            reply: None,
        }
    }

    pub fn with_route(mut self, route: Route) -> ConnectionReader {
        self.route = route;
        self
    }

    pub fn with_envelope(mut self, envelope: Option<String>) -> ConnectionReader {
        self.envelope = envelope;
        self
    }

    /// replaces the unread data, e.g. after a carrier transformed it
    pub fn with_data(mut self, data: Bytes) -> ConnectionReader {
        self.size = data.len();
        self.data = data;
        self
    }

    /// Makes a reply writer available, meaning the sender waits for a reply.
    pub fn with_reply_writer(mut self) -> ConnectionReader {
        self.reply = Some(BufferedConnectionWriter::new(self.text_mode));
        self
    }

    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    /// total size of the message in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn envelope(&self) -> Option<&str> {
        self.envelope.as_deref()
    }

    pub fn expect_int(&mut self) -> anyhow::Result<i32> {
        self.data.try_get_i32_le()
    }

    pub fn expect_int64(&mut self) -> anyhow::Result<i64> {
        self.data.try_get_i64_le()
    }

    pub fn expect_u32(&mut self) -> anyhow::Result<u32> {
        self.data.try_get_u32_le()
    }

    pub fn expect_double(&mut self) -> anyhow::Result<f64> {
        self.data.try_get_f64_le()
    }

    pub fn expect_string(&mut self) -> anyhow::Result<String> {
        self.data.try_get_string()
    }

    pub fn expect_block(&mut self, len: usize) -> anyhow::Result<Bytes> {
        self.data.try_get_bytes(len)
    }

    /// Reads text up to the next newline (which is consumed but not returned), or to the end of
    ///  the message if there is no newline.
    pub fn expect_text(&mut self) -> anyhow::Result<String> {
        let line = match self.data.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let line = self.data.split_to(idx);
                self.data.advance(1);
                line
            }
            None => self.data.split_to(self.data.len()),
        };

        let line = match line.last() {
            Some(b'\r') => line.slice(..line.len() - 1),
            _ => line,
        };
        Ok(String::from_utf8(line.to_vec())?)
    }

    /// the unread part of the message, without consuming it
    pub fn unread(&self) -> Bytes {
        self.data.clone()
    }

    /// the rest of the message, unparsed
    pub fn take_remaining(&mut self) -> Bytes {
        self.data.split_to(self.data.len())
    }

    /// Returns the writer for a reply if the sender waits for one.
    pub fn reply_writer(&mut self) -> Option<&mut BufferedConnectionWriter> {
        self.reply.as_mut()
    }

    pub fn is_reply_expected(&self) -> bool {
        self.reply.is_some()
    }

    pub fn take_reply_writer(&mut self) -> Option<BufferedConnectionWriter> {
        self.reply.take()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty(0)]
    #[case::one_int(1)]
    #[case::kilobyte_string(2)]
    #[case::megabyte_external(3)]
    fn test_round_trip(#[case] kind: u8) {
        let kilobyte_string = "x".repeat(1024);
        let megabyte = Bytes::from(vec![0x5au8; 1024*1024]);

        let mut writer = BufferedConnectionWriter::new(false);
        match kind {
            0 => {}
            1 => writer.append_int(14),
            2 => writer.append_string(&kilobyte_string),
            _ => {
                writer.append_int(megabyte.len() as i32);
                writer.append_external_block(megabyte.clone());
                writer.append_int(-1);
            }
        }

        let mut reader = ConnectionReader::new(writer.to_bytes(), false);
        match kind {
            0 => {}
            1 => assert_eq!(reader.expect_int().unwrap(), 14),
            2 => assert_eq!(reader.expect_string().unwrap(), kilobyte_string),
            _ => {
                let len = reader.expect_int().unwrap() as usize;
                assert_eq!(reader.expect_block(len).unwrap(), megabyte);
                assert_eq!(reader.expect_int().unwrap(), -1);
            }
        }
        assert_eq!(reader.remaining(), 0);
        assert!(reader.expect_int().is_err());
    }

    #[rstest]
    #[case::two_lines(b"abc\ndef\n", "abc", "def")]
    #[case::no_newline(b"abc", "abc", "")]
    #[case::crlf(b"abc\r\nx", "abc", "x")]
    fn test_expect_text(#[case] data: &'static [u8], #[case] first: &str, #[case] second: &str) {
        let mut reader = ConnectionReader::new(Bytes::from_static(data), true);
        assert_eq!(reader.expect_text().unwrap(), first);
        assert_eq!(reader.expect_text().unwrap(), second);
    }

    #[test]
    fn test_reply_writer_follows_mode() {
        let mut reader = ConnectionReader::new(Bytes::new(), true).with_reply_writer();
        assert!(reader.is_reply_expected());
        assert!(reader.reply_writer().unwrap().is_text_mode());
        assert!(reader.take_reply_writer().is_some());
        assert!(!reader.is_reply_expected());
    }
}
