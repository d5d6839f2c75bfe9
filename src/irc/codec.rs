/// IRC line codec — frames a TCP byte stream into IRC messages.
///
/// Splits on `\n` (tolerating a missing `\r`, which some clients and older
/// servers omit), parses each line into a [`Message`], and serializes outgoing
/// messages with `\r\n` termination. Blank lines are skipped.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum line length (including `\r\n`), per RFC 2812.
pub const MAX_LINE_LENGTH: usize = 512;

/// Codec error: either a protocol parse failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(lf_pos) = src.iter().position(|b| *b == b'\n') else {
                // No complete line yet. Check if buffer is getting too large.
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            if lf_pos + 1 > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            let mut line_bytes = src.split_to(lf_pos);
            src.advance(1); // skip \n
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }
            if line_bytes.is_empty() {
                continue;
            }

            let line = std::str::from_utf8(&line_bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            return Ok(Some(Message::parse(line)?));
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_registration_burst() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK alice\r\nUSER alice 0 * :Alice\r\n");

        let nick = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(nick.command, "NICK");

        let user = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(user.command, "USER");
        assert_eq!(user.params, vec!["alice", "0", "*", "Alice"]);

        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_uid_then_complete() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(":0AB UID alice 1 1000 +i ~a");

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" h 10.0.0.1 0ABAAAAAA :Alice\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "UID");
        assert_eq!(msg.params[7], "0ABAAAAAA");
    }

    #[test]
    fn decode_bare_lf() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK bob\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params, vec!["bob"]);
    }

    #[test]
    fn decode_skips_blank_lines() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("\r\n\r\nPING :x\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn decode_rejects_oversized_line() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE_LENGTH + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong));
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_kill_appends_crlf() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        let msg = Message::with_prefix(
            "0AA",
            "KILL",
            vec!["0ABAAAAAA".into(), "lon.lagun.co (Nick collision)".into()],
        );
        codec.encode(msg, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            b":0AA KILL 0ABAAAAAA :lon.lagun.co (Nick collision)\r\n"
        );
    }

    #[test]
    fn encoded_introduction_decodes_back() {
        let mut codec = IrcCodec;
        let original = Message::new(
            "NICK",
            vec![
                "bob".into(),
                "1".into(),
                "900".into(),
                "+i".into(),
                "~bob".into(),
                "b.example".into(),
                "per.lagun.co".into(),
                "Bob the Builder".into(),
            ],
        );
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
