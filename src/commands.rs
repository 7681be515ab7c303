//! Command builders.
//!
//! Each builder coerces its arguments once, computes the keyslot of its key
//! argument for cluster routing, and appends one request to the session's
//! queue annotated with the currently scoped parser. The full command
//! surface of a server is mechanical from here; this module carries the
//! slice the crate itself exercises plus generic escape hatches.

use crate::cluster::key_slot;
use crate::error::Result;
use crate::request::{Parser, Request};
use crate::session::Session;
use crate::value::Value;

impl Session {
    fn push_with_parser(
        &mut self,
        args: &[Value],
        key_index: Option<usize>,
        parser: Parser,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            encoded.push(arg.coerce(self.freezer())?);
        }
        let slot = key_index.map(|i| key_slot(&encoded[i]));
        self.push(Request::wire(encoded, parser, slot));
        Ok(())
    }

    /// queues an arbitrary command with no routable key
    pub fn cmd(&mut self, args: &[Value]) -> Result<()> {
        self.push_with_parser(args, None, self.current_parser())
    }

    /// queues an arbitrary command whose key is `args[key_index]`
    pub fn cmd_keyed(&mut self, args: &[Value], key_index: usize) -> Result<()> {
        self.push_with_parser(args, Some(key_index), self.current_parser())
    }

    /// `PING`
    pub fn ping(&mut self) -> Result<()> {
        self.cmd(&[Value::from("PING")])
    }

    /// `ECHO msg`
    pub fn echo(&mut self, msg: Value) -> Result<()> {
        self.cmd(&[Value::from("ECHO"), msg])
    }

    /// `GET key`
    pub fn get(&mut self, key: &str) -> Result<()> {
        self.cmd_keyed(&[Value::from("GET"), Value::from(key)], 1)
    }

    /// `SET key value`
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        self.cmd_keyed(&[Value::from("SET"), Value::from(key), value], 1)
    }

    /// `DEL key`
    pub fn del(&mut self, key: &str) -> Result<()> {
        self.cmd_keyed(&[Value::from("DEL"), Value::from(key)], 1)
    }

    /// `EXISTS key`
    pub fn exists(&mut self, key: &str) -> Result<()> {
        self.cmd_keyed(&[Value::from("EXISTS"), Value::from(key)], 1)
    }

    /// `INCR key`
    pub fn incr(&mut self, key: &str) -> Result<()> {
        self.cmd_keyed(&[Value::from("INCR"), Value::from(key)], 1)
    }

    /// `PTTL key`
    pub fn pttl(&mut self, key: &str) -> Result<()> {
        self.cmd_keyed(&[Value::from("PTTL"), Value::from(key)], 1)
    }

    /// `PEXPIRE key ms`
    pub fn pexpire(&mut self, key: &str, ms: i64) -> Result<()> {
        self.cmd_keyed(
            &[Value::from("PEXPIRE"), Value::from(key), Value::from(ms)],
            1,
        )
    }

    /// `DUMP key`, with the raw bulk payload returned as-is
    pub fn dump(&mut self, key: &str) -> Result<()> {
        let parser = self.current_parser().raw_bulk();
        self.push_with_parser(&[Value::from("DUMP"), Value::from(key)], Some(1), parser)
    }

    /// `RESTORE key ttl_ms blob`; the blob travels verbatim
    pub fn restore(&mut self, key: &str, ttl_ms: i64, blob: Vec<u8>) -> Result<()> {
        self.cmd_keyed(
            &[
                Value::from("RESTORE"),
                Value::from(key),
                Value::from(ttl_ms),
                Value::Raw(blob),
            ],
            1,
        )
    }

    /// `EVAL script numkeys key... arg...`, routed by the first key
    pub fn eval(&mut self, script: &str, keys: &[&str], args: &[Value]) -> Result<()> {
        let mut cmd = Vec::with_capacity(3 + keys.len() + args.len());
        cmd.push(Value::from("EVAL"));
        cmd.push(Value::from(script));
        cmd.push(Value::from(keys.len() as i64));
        for key in keys {
            cmd.push(Value::from(*key));
        }
        cmd.extend_from_slice(args);
        let key_index = if keys.is_empty() { None } else { Some(3) };
        self.push_with_parser(&cmd, key_index, self.current_parser())
    }
}
