use crate::carrier::{Carrier, Header};


const TCP_CODE: u8 = 3;
const ACK_FLAG: u8 = 0x80;

/// The default binary carrier over a TCP connection. The variant with acks (`tcp`) and the one
///  without (`fast_tcp`) share a header code; whether acks are used is a negotiated parameter.
#[derive(Debug, Clone)]
pub struct TcpCarrier {
    require_ack: bool,
}

impl TcpCarrier {
    pub fn new(require_ack: bool) -> TcpCarrier {
        TcpCarrier { require_ack }
    }
}

impl Carrier for TcpCarrier {
    fn name(&self) -> &'static str {
        if self.require_ack { "tcp" } else { "fast_tcp" }
    }

    fn create(&self) -> Box<dyn Carrier> {
        Box::new(self.clone())
    }

    fn check_header(&self, header: &Header) -> bool {
        header.binary_specifier()
            .map(|s| s & !ACK_FLAG == TCP_CODE)
            .unwrap_or(false)
    }

    fn set_parameters(&mut self, header: &Header) {
        if let Some(specifier) = header.binary_specifier() {
            self.require_ack = specifier & ACK_FLAG != 0;
        }
    }

    fn get_header(&self) -> Header {
        let ack = if self.require_ack { ACK_FLAG } else { 0 };
        Header::binary(TCP_CODE | ack)
    }

    fn require_ack(&self) -> bool {
        self.require_ack
    }

    fn support_reply(&self) -> bool {
        true
    }
}
