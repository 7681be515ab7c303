//! Wire codec: pipeline encoding and reply decoding.
//!
//! Encoding emits one `*N` array frame per request with every argument as a
//! `$L` bulk. Decoding reads exactly one well-formed reply per call and
//! blocks until it has it; the caller drains one reply per wire request.

use std::io::{BufRead, Write};

use crate::error::{PipeError, Result};
use crate::freeze::{Freezer, ThawOpts};
use crate::reply::{Bulk, Reply, ServerError};
use crate::request::ParserOpts;
use crate::value::{MARKER, MARKER_BIN, MARKER_OBJ};

/// Encodes one request's argument payloads into the output buffer.
pub(crate) fn encode_request(args: &[Vec<u8>], out: &mut impl Write) -> Result<()> {
    write!(out, "*{}\r\n", args.len())?;
    for arg in args {
        write!(out, "${}\r\n", arg.len())?;
        out.write_all(arg)?;
        out.write_all(b"\r\n")?;
    }
    Ok(())
}

/// Reads one reply from the buffered reader.
///
/// `opts` carries the issuing request's decode options; `freezer` thaws
/// frozen bulk payloads. Malformed framing returns [`PipeError::Protocol`]
/// and poisons the connection; payload-level deserialization failures come
/// back as in-place `Reply::Error` values instead.
pub(crate) fn read_reply<R: BufRead>(
    reader: &mut R,
    opts: &ParserOpts,
    freezer: &dyn Freezer,
) -> Result<Reply> {
    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    let mut line = Vec::new();
    match kind[0] {
        b'+' => {
            read_line(reader, &mut line)?;
            Ok(Reply::Simple(String::from_utf8_lossy(&line).into_owned()))
        }
        b':' => {
            read_line(reader, &mut line)?;
            Ok(Reply::Int(parse_i64(&line)?))
        }
        b'-' => {
            read_line(reader, &mut line)?;
            let text = String::from_utf8_lossy(&line).into_owned();
            Ok(Reply::Error(ServerError::from_line(&text)))
        }
        b'$' => {
            read_line(reader, &mut line)?;
            let len = parse_i64(&line)?;
            if len == -1 {
                return Ok(Reply::Bulk(Bulk::Nil));
            }
            if len < 0 {
                return Err(PipeError::Protocol(format!("invalid bulk length {}", len)));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            discard_crlf(reader)?;
            Ok(decode_bulk(payload, opts, freezer))
        }
        b'*' => {
            read_line(reader, &mut line)?;
            let count = parse_i64(&line)?;
            if count == -1 {
                return Ok(Reply::Array(None));
            }
            if count < 0 {
                return Err(PipeError::Protocol(format!("invalid array length {}", count)));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(read_reply(reader, opts, freezer)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        other => Err(PipeError::Protocol(format!(
            "unknown reply type byte 0x{:02x}",
            other
        ))),
    }
}

/// Decodes a bulk payload per the in-bulk marker convention.
fn decode_bulk(payload: Vec<u8>, opts: &ParserOpts, freezer: &dyn Freezer) -> Reply {
    if opts.raw_bulk {
        return Reply::Bulk(Bulk::Bytes(payload));
    }

    if payload.len() >= 2 && payload[0] == MARKER {
        if payload[..2] == MARKER_OBJ {
            return thaw_payload(&payload[2..], opts, freezer);
        }
        if payload[..2] == MARKER_BIN {
            return Reply::Bulk(Bulk::Bytes(payload[2..].to_vec()));
        }
    }

    // Unmarked payloads written by historic clients may still be frozen;
    // a thaw failure there is non-fatal.
    if let Some(header) = freezer.header() {
        if !header.is_empty() && payload.starts_with(header) {
            let thaw = opts.thaw.clone().unwrap_or_default();
            if let Ok(value) = freezer.thaw(&payload, &thaw) {
                return Reply::Bulk(Bulk::Object(value));
            }
        }
    }

    match String::from_utf8(payload) {
        Ok(text) => Reply::Bulk(Bulk::Text(text)),
        Err(e) => Reply::Bulk(Bulk::Bytes(e.into_bytes())),
    }
}

fn thaw_payload(frozen: &[u8], opts: &ParserOpts, freezer: &dyn Freezer) -> Reply {
    let thaw: ThawOpts = opts.thaw.clone().unwrap_or_default();
    match freezer.thaw(frozen, &thaw) {
        Ok(value) => Reply::Bulk(Bulk::Object(value)),
        Err(_) if thaw.fallback_to_bytes => Reply::Bulk(Bulk::Bytes(frozen.to_vec())),
        Err(e) => Reply::Error(ServerError::synthesized(
            "thaw",
            format!("thaw failed: {}", e),
        )),
    }
}

/// reads one `\r\n`-terminated line, excluding the terminator
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(PipeError::Protocol("unexpected end of stream".to_string()));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(PipeError::Protocol("malformed reply line".to_string()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn discard_crlf<R: BufRead>(reader: &mut R) -> Result<()> {
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(PipeError::Protocol("bulk payload missing CRLF".to_string()));
    }
    Ok(())
}

fn parse_i64(data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            PipeError::Protocol(format!(
                "expected integer, got {:?}",
                String::from_utf8_lossy(data)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::JsonFreezer;
    use std::io::Cursor;

    fn decode(bytes: &[u8]) -> Result<Reply> {
        let mut reader = Cursor::new(bytes.to_vec());
        read_reply(&mut reader, &ParserOpts::default(), &JsonFreezer)
    }

    fn decode_with(bytes: &[u8], opts: ParserOpts) -> Result<Reply> {
        let mut reader = Cursor::new(bytes.to_vec());
        read_reply(&mut reader, &opts, &JsonFreezer)
    }

    #[test]
    fn encodes_a_request() {
        let mut out = Vec::new();
        encode_request(&[b"GET".to_vec(), b"key".to_vec()], &mut out).unwrap();
        assert_eq!(out, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(decode(b"+PONG\r\n").unwrap(), Reply::Simple("PONG".to_string()));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(decode(b":-17\r\n").unwrap(), Reply::Int(-17));
    }

    #[test]
    fn parses_error_with_prefix() {
        match decode(b"-WRONGTYPE bad\r\n").unwrap() {
            Reply::Error(e) => {
                assert_eq!(e.prefix, "wrongtype");
                assert_eq!(e.message, "WRONGTYPE bad");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn parses_null_bulk() {
        assert_eq!(decode(b"$-1\r\n").unwrap(), Reply::Bulk(Bulk::Nil));
    }

    #[test]
    fn parses_text_bulk() {
        assert_eq!(
            decode(b"$5\r\nhello\r\n").unwrap(),
            Reply::Bulk(Bulk::Text("hello".to_string()))
        );
    }

    #[test]
    fn parses_marked_binary_bulk() {
        assert_eq!(
            decode(b"$5\r\n\x00<\x01\x02\x03\r\n").unwrap(),
            Reply::Bulk(Bulk::Bytes(vec![0x01, 0x02, 0x03]))
        );
    }

    #[test]
    fn parses_marked_frozen_bulk() {
        assert_eq!(
            decode(b"$7\r\n\x00>[1,2]\r\n").unwrap(),
            Reply::Bulk(Bulk::Object(serde_json::json!([1, 2])))
        );
    }

    #[test]
    fn bad_frozen_payload_is_an_error_value() {
        match decode(b"$4\r\n\x00>{x\r\n").unwrap() {
            Reply::Error(e) => assert_eq!(e.prefix, "thaw"),
            other => panic!("expected thaw error, got {:?}", other),
        }
    }

    #[test]
    fn thaw_failure_can_fall_back_to_bytes() {
        let opts = ParserOpts {
            thaw: Some(ThawOpts {
                fallback_to_bytes: true,
            }),
            ..ParserOpts::default()
        };
        assert_eq!(
            decode_with(b"$4\r\n\x00>{x\r\n", opts).unwrap(),
            Reply::Bulk(Bulk::Bytes(b"{x".to_vec()))
        );
    }

    #[test]
    fn raw_bulk_skips_markers() {
        let opts = ParserOpts {
            raw_bulk: true,
            ..ParserOpts::default()
        };
        assert_eq!(
            decode_with(b"$4\r\n\x00>[]\r\n", opts).unwrap(),
            Reply::Bulk(Bulk::Bytes(b"\x00>[]".to_vec()))
        );
    }

    #[test]
    fn undecodable_text_stays_bytes() {
        assert_eq!(
            decode(b"$2\r\n\xfe\xff\r\n").unwrap(),
            Reply::Bulk(Bulk::Bytes(vec![0xfe, 0xff]))
        );
    }

    #[test]
    fn parses_nested_arrays() {
        let reply = decode(b"*2\r\n:1\r\n*2\r\n+a\r\n$-1\r\n").unwrap();
        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Int(1),
                Reply::Array(Some(vec![
                    Reply::Simple("a".to_string()),
                    Reply::Bulk(Bulk::Nil),
                ])),
            ]))
        );
    }

    #[test]
    fn parses_null_array() {
        assert_eq!(decode(b"*-1\r\n").unwrap(), Reply::Array(None));
    }

    #[test]
    fn unknown_reply_byte_is_a_protocol_error() {
        match decode(b"!boom\r\n") {
            Err(PipeError::Protocol(msg)) => assert!(msg.contains("unknown reply type")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn legacy_headered_payload_thaws_opportunistically() {
        struct HeaderedFreezer;
        impl Freezer for HeaderedFreezer {
            fn freeze(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
                let mut out = b"HDR".to_vec();
                out.extend_from_slice(&serde_json::to_vec(value)?);
                Ok(out)
            }
            fn thaw(&self, bytes: &[u8], _opts: &ThawOpts) -> Result<serde_json::Value> {
                let body = bytes.strip_prefix(b"HDR").unwrap_or(bytes);
                Ok(serde_json::from_slice(body)?)
            }
            fn header(&self) -> Option<&[u8]> {
                Some(b"HDR")
            }
        }

        let mut reader = Cursor::new(b"$6\r\nHDR[7]\r\n".to_vec());
        let reply = read_reply(&mut reader, &ParserOpts::default(), &HeaderedFreezer).unwrap();
        assert_eq!(reply, Reply::Bulk(Bulk::Object(serde_json::json!([7]))));

        // A payload that merely shares the header decays to bytes, not an error.
        let mut reader = Cursor::new(b"$5\r\nHDR{x\r\n".to_vec());
        let reply = read_reply(&mut reader, &ParserOpts::default(), &HeaderedFreezer).unwrap();
        assert_eq!(reply, Reply::Bulk(Bulk::Text("HDR{x".to_string())));
    }
}
