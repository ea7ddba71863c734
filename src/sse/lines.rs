use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

/// Splits an upstream body into `\n`-terminated lines.
///
/// Splitting happens on raw bytes and decoding only once a line is complete.
/// `\n` never occurs inside a multi-byte UTF-8 sequence, so a character torn
/// across two chunks stays buffered until its line is whole. Invalid UTF-8 is
/// replaced rather than treated as fatal. A `\r` before the terminator is kept
/// as part of the line.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes of the buffer already searched for a terminator.
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let Some(offset) = buf[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = buf.len();
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;
        let line = buf.split_to(end + 1);
        Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }

        self.scanned = 0;
        if buf.is_empty() {
            return Ok(None);
        }

        let rest = buf.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}
