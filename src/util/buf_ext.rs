use anyhow::bail;
use bytes::{Buf, BufMut};


// All multi-byte numbers on the wire are little endian, matching the established binary carriers.

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow::anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


pub trait BufExt: Buf {
    get_try_impl!(try_get_u8, u8, get_u8);
    get_try_impl!(try_get_u32_le, u32, get_u32_le);
    get_try_impl!(try_get_i32_le, i32, get_i32_le);
    get_try_impl!(try_get_i64_le, i64, get_i64_le);
    get_try_impl!(try_get_f64_le, f64, get_f64_le);

    /// reads a length that is then used for reading, rejecting negative values
    fn try_get_len(&mut self) -> anyhow::Result<usize> {
        let len = self.try_get_i32_le()?;
        if len < 0 {
            bail!("negative length {}", len);
        }
        Ok(len as usize)
    }

    fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<bytes::Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    /// Strings are length prefixed, and the length includes a terminating NUL byte that is
    ///  stripped from the result.
    fn try_get_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_len()?;
        let raw = self.try_get_bytes(len)?;
        let raw = match raw.last() {
            Some(0) => &raw[..len-1],
            _ => &raw[..],
        };
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

pub trait BufMutExt: BufMut {
    fn put_len(&mut self, len: usize) {
        self.put_i32_le(len as i32);
    }

    fn put_string(&mut self, s: &str) {
        self.put_len(s.len() + 1);
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("", b"\x01\0\0\0\0")]
    #[case::simple("abc", b"\x04\0\0\0abc\0")]
    fn test_put_string(#[case] s: &str, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_string(s);
        assert_eq!(&buf[..], expected);

        let mut b: &[u8] = &buf;
        assert_eq!(b.try_get_string().unwrap(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::truncated_len(b"\x04\0\0")]
    #[case::truncated_body(b"\x04\0\0\0ab")]
    #[case::negative_len(b"\xff\xff\xff\xff")]
    fn test_try_get_string_invalid(#[case] mut buf: &[u8]) {
        assert!(buf.try_get_string().is_err());
    }

    #[test]
    fn test_unterminated_string() {
        let mut buf: &[u8] = b"\x02\0\0\0hi";
        assert_eq!(buf.try_get_string().unwrap(), "hi");
    }
}
