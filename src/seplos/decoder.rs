use super::frame::{FRAME_MARKER, FRAME_TERMINATOR};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

const MAX_FRAME_SIZE: usize = 8192;

/// Scans the byte stream for `~`…CR frames and yields the frame body with
/// any non-hex noise bytes dropped. Everything before a marker is discarded.
#[derive(Debug, Default)]
pub struct FrameScanner;

impl Decoder for FrameScanner {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == FRAME_MARKER) {
            Some(start) if start > 0 => src.advance(start),
            Some(_) => {}
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let Some(end) = src.iter().position(|b| *b == FRAME_TERMINATOR) else {
            if src.len() > MAX_FRAME_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unterminated frame exceeds {MAX_FRAME_SIZE} bytes"),
                ));
            }
            return Ok(None);
        };

        let raw = src.split_to(end + 1);
        let body = raw[1..end]
            .iter()
            .copied()
            .filter(u8::is_ascii_hexdigit)
            .collect();

        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_one_frame_body() {
        let mut scanner = FrameScanner;
        let mut buf = BytesMut::from(&b"~20004600E00201ABCD\r"[..]);
        assert_eq!(
            scanner.decode(&mut buf).unwrap(),
            Some(b"20004600E00201ABCD".to_vec())
        );
        assert_eq!(scanner.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn discards_leading_noise_and_filters_non_hex() {
        let mut scanner = FrameScanner;
        let mut buf = BytesMut::from(&b"\x00garbage~20\n00\x0046\r"[..]);
        assert_eq!(scanner.decode(&mut buf).unwrap(), Some(b"200046".to_vec()));
    }

    #[test]
    fn waits_for_the_terminator() {
        let mut scanner = FrameScanner;
        let mut buf = BytesMut::from(&b"~2000"[..]);
        assert_eq!(scanner.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"4600\r~AB");
        assert_eq!(scanner.decode(&mut buf).unwrap(), Some(b"20004600".to_vec()));
        // second frame still incomplete
        assert_eq!(scanner.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"~AB");
    }
}
