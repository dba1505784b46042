//! RecordIO framing used by the Mesos scheduler event stream.
//!
//! Each record is `<length>\n<bytes>`, where `length` is the decimal byte
//! count of the record body. Chunks from the HTTP stream do not line up
//! with record boundaries, so bytes are buffered until a full record is
//! available.

use bytes::{Buf, Bytes, BytesMut};

use crate::cluster::DriverError;

/// Records larger than this are treated as a corrupt stream.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Longest accepted length header, in digits.
const MAX_HEADER_LEN: usize = 20;

#[derive(Debug, Default)]
pub struct RecordIoDecoder {
    buf: BytesMut,
}

impl RecordIoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned as a record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete record, if one is buffered.
    pub fn next_record(&mut self) -> Result<Option<Bytes>, DriverError> {
        let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_HEADER_LEN {
                return Err(DriverError::Decode("RecordIO header too long".to_string()));
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&self.buf[..newline])
            .map_err(|_| DriverError::Decode("RecordIO header is not UTF-8".to_string()))?;
        let len: usize = header
            .trim()
            .parse()
            .map_err(|_| DriverError::Decode(format!("invalid RecordIO header '{header}'")))?;
        if len > MAX_RECORD_LEN {
            return Err(DriverError::Decode(format!("RecordIO record of {len} bytes exceeds limit")));
        }

        if self.buf.len() < newline + 1 + len {
            return Ok(None);
        }

        self.buf.advance(newline + 1);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_records_split_across_chunks() {
        let mut decoder = RecordIoDecoder::new();
        decoder.push(b"5\nhel");
        assert!(decoder.next_record().unwrap().is_none());

        decoder.push(b"lo3\nabc1");
        assert_eq!(decoder.next_record().unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(decoder.next_record().unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(decoder.next_record().unwrap().is_none());
        assert_eq!(decoder.buffered(), 1);

        decoder.push(b"0\n0123456789");
        assert_eq!(decoder.next_record().unwrap().unwrap(), Bytes::from_static(b"0123456789"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut decoder = RecordIoDecoder::new();
        decoder.push(b"abc\n{}");
        assert!(matches!(decoder.next_record(), Err(DriverError::Decode(_))));
    }

    #[test]
    fn test_rejects_runaway_header() {
        let mut decoder = RecordIoDecoder::new();
        decoder.push(&[b'1'; 32]);
        assert!(decoder.next_record().is_err());
    }
}
