use std::fmt::{Debug, Display, Formatter};


/// A [Vocab] is a short command tag of up to four ASCII characters packed into an i32, the
///  first character in the least significant byte. It is used for administrative commands and
///  as a compact value type inside bottles.
///
/// Packing the characters this way keeps the tag human-readable when a message is inspected at
///  the wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Vocab(pub i32);

impl Vocab {
    pub const fn new(value: &[u8]) -> Vocab {
        let mut bytes = [0u8; 4];
        let mut i = 0;
        while i < value.len() && i < 4 {
            bytes[i] = value[i];
            i += 1;
        }
        Vocab(i32::from_le_bytes(bytes))
    }

    /// returns None if the string does not fit into a vocab
    pub fn try_from_str(s: &str) -> Option<Vocab> {
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return None;
        }
        Some(Vocab::new(s.as_bytes()))
    }

    pub fn as_string(&self) -> String {
        let bytes = self.0.to_le_bytes();
        let used = bytes.iter()
            .position(|&b| b == 0)
            .map(|len| &bytes[..len])
            .unwrap_or(&bytes);

        String::from_utf8_lossy(used).to_string()
    }
}

impl Debug for Vocab {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}({:?})", self.0, self.as_string())
    }
}

impl Display for Vocab {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.as_string())
    }
}

pub mod vocabs {
    use super::Vocab;

    pub const HELP: Vocab = Vocab::new(b"help");
    pub const VER: Vocab = Vocab::new(b"ver");
    pub const ADD: Vocab = Vocab::new(b"add");
    pub const DEL: Vocab = Vocab::new(b"del");
    pub const LIST: Vocab = Vocab::new(b"list");
    pub const SET: Vocab = Vocab::new(b"set");
    pub const GET: Vocab = Vocab::new(b"get");
    pub const PROP: Vocab = Vocab::new(b"prop");
    pub const IN: Vocab = Vocab::new(b"in");
    pub const OUT: Vocab = Vocab::new(b"out");
    pub const VERB: Vocab = Vocab::new(b"verb");
    pub const TOUT: Vocab = Vocab::new(b"tout");
    pub const OK: Vocab = Vocab::new(b"ok");
    pub const FAIL: Vocab = Vocab::new(b"fail");
    pub const MANY: Vocab = Vocab::new(b"many");
    pub const IS: Vocab = Vocab::new(b"is");
}
