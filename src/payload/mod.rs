pub mod bottle;

use bytes::Bytes;

use crate::connection::reader::ConnectionReader;
use crate::connection::writer::BufferedConnectionWriter;
use crate::payload::bottle::{Bottle, Value};


/// Anything that can be sent through a port. A payload is serialized separately for every
///  destination, in that connection's mode (binary or text), so implementations should check
///  [BufferedConnectionWriter::is_text_mode].
pub trait PortWriter: Send + Sync {
    fn write(&self, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()>;
}

/// Anything that can be read from a received message
pub trait PortReader: Send {
    /// returns `false` if the message's content was not acceptable to this reader
    fn read(&mut self, reader: &mut ConnectionReader) -> anyhow::Result<bool>;
}


/// A message's bytes, passed on unparsed (e.g. to logging connections). Sent to a connection
///  of the other mode, the data is converted as a [Bottle].
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub data: Bytes,
    pub text_mode: bool,
}

impl RawMessage {
    fn text_line(&self) -> &[u8] {
        let mut line: &[u8] = &self.data;
        while let [rest @ .., b'\n' | b'\r'] = line {
            line = rest;
        }
        line
    }

    /// binary data as a bottle's text, or as a blob if it is not a bottle
    fn binary_as_text(&self) -> String {
        let mut reader = ConnectionReader::new(self.data.clone(), false);
        match Bottle::read_binary(&mut reader) {
            Ok(bottle) if reader.remaining() == 0 => bottle.to_text(),
            _ => Bottle::from_values(vec![Value::Blob(self.data.clone())]).to_text(),
        }
    }

    /// text data parsed as a bottle, or kept as a single string if it does not parse
    fn text_as_bottle(&self) -> Bottle {
        let text = String::from_utf8_lossy(self.text_line());
        Bottle::from_text(&text)
            .unwrap_or_else(|_| Bottle::from_values(vec![Value::String(text.into_owned())]))
    }
}

impl PortWriter for RawMessage {
    fn write(&self, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        match (writer.is_text_mode(), self.text_mode) {
            (true, true) => {
                writer.append_block_copy(self.text_line());
                writer.append_block_copy(b"\n");
            }
            (true, false) => writer.append_line(&self.binary_as_text()),
            (false, true) => self.text_as_bottle().write_binary(writer),
            (false, false) => writer.append_external_block(self.data.clone()),
        }
        Ok(())
    }
}

impl PortReader for RawMessage {
    fn read(&mut self, reader: &mut ConnectionReader) -> anyhow::Result<bool> {
        self.text_mode = reader.is_text_mode();
        self.data = reader.take_remaining();
        Ok(true)
    }
}
