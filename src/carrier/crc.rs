use anyhow::bail;
use bytes::{Buf, Bytes};
use ::crc::Crc;

use crate::carrier::{Carrier, Header};
use crate::connection::reader::ConnectionReader;
use crate::connection::writer::BufferedConnectionWriter;


const CRC_CODE: u8 = 0x85;

/// A binary carrier that protects every payload and reply with a CRC-32 trailer. It is the
///  built-in example of a modifying carrier: it transforms data on the way in and out without
///  the port being aware of it.
#[derive(Debug, Clone, Default)]
pub struct CrcCarrier;

impl CrcCarrier {
    pub fn new() -> CrcCarrier {
        CrcCarrier
    }

    fn checksum(blocks: &[Bytes]) -> u32 {
        let hasher = Crc::<u32>::new(&::crc::CRC_32_ISO_HDLC);
        let mut digest = hasher.digest();
        for block in blocks {
            digest.update(block);
        }
        digest.finalize()
    }

    fn append_checksum(writer: &mut BufferedConnectionWriter) {
        let checksum = Self::checksum(writer.body_blocks());
        writer.append_u32(checksum);
    }
}

impl Carrier for CrcCarrier {
    fn name(&self) -> &'static str {
        "crc"
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(CrcCarrier::new())
    }

    fn check_header(&self, header: &Header) -> bool {
        header.binary_specifier() == Some(CRC_CODE)
    }

    fn set_parameters(&mut self, _header: &Header) {
    }

    fn get_header(&self) -> Header {
        Header::binary(CRC_CODE)
    }

    fn require_ack(&self) -> bool {
        true
    }

    fn support_reply(&self) -> bool {
        true
    }

    fn modifies_incoming_data(&self) -> bool {
        true
    }

    fn modify_incoming_data(&mut self, mut reader: ConnectionReader) -> anyhow::Result<ConnectionReader> {
        let mut data = reader.take_remaining();
        if data.len() < 4 {
            bail!("message too short for a checksum: {} bytes", data.len());
        }
        let mut trailer = data.split_off(data.len() - 4);
        let expected = trailer.get_u32_le();
        let actual = Self::checksum(&[data.clone()]);
        if actual != expected {
            bail!("checksum mismatch: expected {:08x}, was {:08x}", expected, actual);
        }
        Ok(reader.with_data(data))
    }

    fn modifies_outgoing_data(&self) -> bool {
        true
    }

    fn modify_outgoing_data(&mut self, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        Self::append_checksum(writer);
        Ok(())
    }

    fn modifies_reply(&self) -> bool {
        true
    }

    fn modify_reply(&mut self, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        Self::append_checksum(writer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_round_trip() {
        let mut sender = CrcCarrier::new();
        let mut receiver = sender.create();

        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_int(15);
        writer.append_external_block(Bytes::from_static(b"payload"));
        sender.modify_outgoing_data(&mut writer).unwrap();
        assert_eq!(writer.body_size(), 4 + 7 + 4);

        let reader = ConnectionReader::new(writer.body_bytes(), false);
        let mut reader = receiver.modify_incoming_data(reader).unwrap();
        assert_eq!(reader.expect_int().unwrap(), 15);
        assert_eq!(&reader.take_remaining()[..], b"payload");
    }

    #[test]
    fn test_corrupted_data() {
        let mut carrier = CrcCarrier::new();

        let mut writer = BufferedConnectionWriter::new(false);
        writer.append_int(15);
        carrier.modify_outgoing_data(&mut writer).unwrap();

        let mut raw = writer.body_bytes().to_vec();
        raw[0] ^= 1;
        assert!(carrier.modify_incoming_data(ConnectionReader::new(Bytes::from(raw), false)).is_err());
        assert!(carrier.modify_incoming_data(ConnectionReader::new(Bytes::from_static(b"ab"), false)).is_err());
    }
}
