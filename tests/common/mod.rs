//! A scripted mock server speaking just enough RESP for the tests: it reads
//! command arrays off accepted connections and answers each with whatever
//! bytes the test's handler returns.

// not every test binary uses every helper
#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

/// Spawns a mock node that serves exactly `expected` commands across any
/// number of connections, answering each with `handler(idx, args)`.
/// Returns the node's `host:port`.
pub fn spawn_node<H>(expected: usize, handler: H) -> String
where
    H: Fn(usize, Vec<Vec<u8>>) -> Vec<u8> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    serve_on(listener, expected, handler);
    addr
}

/// Like [`spawn_node`], but over a listener the test bound itself (so the
/// node's address can appear in its own scripted replies).
pub fn serve_on<H>(listener: TcpListener, expected: usize, handler: H)
where
    H: Fn(usize, Vec<Vec<u8>>) -> Vec<u8> + Send + 'static,
{
    thread::spawn(move || {
        let mut served = 0;
        while served < expected {
            let (mut stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            while served < expected {
                let args = match read_command(&mut reader) {
                    Ok(args) => args,
                    Err(_) => break, // connection dropped; await the next one
                };
                let reply = handler(served, args);
                served += 1;
                if !reply.is_empty() {
                    let _ = stream.write_all(&reply);
                    let _ = stream.flush();
                }
            }
        }
    });
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(bad_data("expected array header"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(bad_data("expected bulk header"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(bad_data("missing argument CRLF"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(bad_data("malformed line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| bad_data("expected a length"))
}

fn bad_data(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// `+msg` reply bytes
pub fn simple(msg: &str) -> Vec<u8> {
    format!("+{}\r\n", msg).into_bytes()
}

/// `-msg` reply bytes
pub fn error(msg: &str) -> Vec<u8> {
    format!("-{}\r\n", msg).into_bytes()
}

/// `:n` reply bytes
pub fn integer(n: i64) -> Vec<u8> {
    format!(":{}\r\n", n).into_bytes()
}

/// `$len payload` reply bytes
pub fn bulk(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

/// the null bulk reply
pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// an array reply of pre-encoded elements
pub fn array(elements: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", elements.len()).into_bytes();
    for element in elements {
        out.extend_from_slice(element);
    }
    out
}
