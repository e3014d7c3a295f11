//! Netascii line-ending translation.
//!
//! Netascii requires line endings to appear on the wire as CR LF and a bare
//! carriage return to be escaped as CR NUL. The mapping is applied per input
//! byte, so the wire form decodes back to the original byte string no matter
//! how the stream is split into DATA blocks:
//!
//! | local | wire  |
//! |-------|-------|
//! | LF    | CR LF |
//! | CR    | CR NUL|
//!
//! Encoding is stateless. Decoding is not: a CR arriving at the end of one
//! buffer pairs with the first byte of the next, so [`Decoder`] carries that
//! byte across calls and [`Decoder::finish`] flushes a CR left dangling at
//! end of stream.

use bytes::{BufMut, BytesMut};

/// Translate local bytes into their netascii wire form, appending to `dst`.
pub fn encode_into(src: &[u8], dst: &mut BytesMut) {
    dst.reserve(src.len());
    for &byte in src {
        match byte {
            b'\n' => dst.put_slice(b"\r\n"),
            b'\r' => dst.put_slice(b"\r\0"),
            other => dst.put_u8(other),
        }
    }
}

/// Streaming wire-to-local translator.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate a chunk of wire bytes, appending the local form to `dst`.
    pub fn decode_into(&mut self, src: &[u8], dst: &mut BytesMut) {
        dst.reserve(src.len());
        for &byte in src {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => dst.put_u8(b'\n'),
                    0 => dst.put_u8(b'\r'),
                    b'\r' => {
                        // Unpaired CR followed by another CR; keep the first
                        // literally and let the second start a new pair.
                        dst.put_u8(b'\r');
                        self.pending_cr = true;
                    }
                    other => {
                        dst.put_u8(b'\r');
                        dst.put_u8(other);
                    }
                }
            } else if byte == b'\r' {
                self.pending_cr = true;
            } else {
                dst.put_u8(byte);
            }
        }
    }

    /// Flush a CR held back at end of stream.
    pub fn finish(&mut self, dst: &mut BytesMut) {
        if std::mem::take(&mut self.pending_cr) {
            dst.put_u8(b'\r');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(src: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_into(src, &mut out);
        out.to_vec()
    }

    fn decode_split(wire: &[u8], split: usize) -> Vec<u8> {
        let mut decoder = Decoder::new();
        let mut out = BytesMut::new();
        decoder.decode_into(&wire[..split], &mut out);
        decoder.decode_into(&wire[split..], &mut out);
        decoder.finish(&mut out);
        out.to_vec()
    }

    #[test]
    fn encodes_line_endings() {
        assert_eq!(encode(b"a\nb"), b"a\r\nb");
        assert_eq!(encode(b"a\rb"), b"a\r\0b");
        assert_eq!(encode(b"\r\n"), b"\r\0\r\n");
        assert_eq!(encode(b"plain"), b"plain");
    }

    #[test]
    fn decodes_line_endings() {
        assert_eq!(decode_split(b"a\r\nb", 0), b"a\nb");
        assert_eq!(decode_split(b"a\r\0b", 0), b"a\rb");
        assert_eq!(decode_split(b"\r\0\r\n", 0), b"\r\n");
    }

    #[test]
    fn roundtrip_across_all_splits() {
        let samples: [&[u8]; 6] = [
            b"",
            b"no endings at all",
            b"unix\nstyle\nlines\n",
            b"dos\r\nstyle\r\n",
            b"mac\rstyle\r",
            b"\r\r\n\n\r\0mixed\r",
        ];
        for sample in samples {
            let wire = encode(sample);
            for split in 0..=wire.len() {
                assert_eq!(
                    decode_split(&wire, split),
                    sample,
                    "sample {:?} split at {}",
                    sample,
                    split
                );
            }
        }
    }

    #[test]
    fn trailing_cr_is_flushed() {
        let mut decoder = Decoder::new();
        let mut out = BytesMut::new();
        decoder.decode_into(b"abc\r", &mut out);
        assert_eq!(&out[..], b"abc");
        decoder.finish(&mut out);
        assert_eq!(&out[..], b"abc\r");
    }
}
