//! Requests queued by a session, and the per-request parsers that rewrite
//! their replies.

use std::fmt;
use std::sync::Arc;

use crate::reply::{Bulk, Reply};
use crate::freeze::ThawOpts;

/// a pure reply-rewriting function attached to a request
pub type ParserFn = Arc<dyn Fn(Reply) -> Reply + Send + Sync>;

/// Per-request decode options, carried on the parser.
#[derive(Clone, Default)]
pub struct ParserOpts {
    /// return bulk payloads as raw bytes, skipping the marker convention
    pub raw_bulk: bool,
    /// options handed to the freezer when thawing a frozen bulk
    pub thaw: Option<ThawOpts>,
    /// when present, bypass the wire entirely and synthesize this reply
    pub dummy_reply: Option<Reply>,
    /// run the parser function even when the reply is an error
    pub parse_errors: bool,
}

/// A reply parser: an optional rewrite function plus decode options.
///
/// Setting a parser on a session *replaces* the current one; layering is the
/// explicit opt-in via [`Parser::compose`].
#[derive(Clone, Default)]
pub struct Parser {
    f: Option<ParserFn>,
    /// decode options for the request this parser is attached to
    pub opts: ParserOpts,
}

impl Parser {
    /// a parser that only rewrites replies
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(Reply) -> Reply + Send + Sync + 'static,
    {
        Parser {
            f: Some(Arc::new(f)),
            opts: ParserOpts::default(),
        }
    }

    /// a parser that only carries decode options
    pub fn with_opts(opts: ParserOpts) -> Self {
        Parser { f: None, opts }
    }

    /// a parser requesting the raw bulk payload
    pub fn raw() -> Self {
        Parser::with_opts(ParserOpts {
            raw_bulk: true,
            ..ParserOpts::default()
        })
    }

    /// returns this parser with `opts.raw_bulk` set
    pub fn raw_bulk(mut self) -> Self {
        self.opts.raw_bulk = true;
        self
    }

    /// returns this parser with the given thaw options
    pub fn thaw_opts(mut self, thaw: ThawOpts) -> Self {
        self.opts.thaw = Some(thaw);
        self
    }

    /// returns this parser with `opts.parse_errors` set
    pub fn on_errors(mut self) -> Self {
        self.opts.parse_errors = true;
        self
    }

    /// Layers `inner` inside `outer`: the inner function runs first, then the
    /// outer one. Option maps merge with the inner layer winning on conflict;
    /// `dummy_reply` is structural and is never inherited from either layer.
    pub fn compose(outer: &Parser, inner: &Parser) -> Parser {
        let f = match (outer.f.clone(), inner.f.clone()) {
            (Some(of), Some(inf)) => {
                Some(Arc::new(move |reply| of(inf(reply))) as ParserFn)
            }
            (Some(of), None) => Some(of),
            (None, Some(inf)) => Some(inf),
            (None, None) => None,
        };
        Parser {
            f,
            opts: ParserOpts {
                raw_bulk: inner.opts.raw_bulk || outer.opts.raw_bulk,
                thaw: inner.opts.thaw.clone().or_else(|| outer.opts.thaw.clone()),
                dummy_reply: None,
                parse_errors: inner.opts.parse_errors || outer.opts.parse_errors,
            },
        }
    }

    /// returns this parser with the given synthetic reply attached
    pub(crate) fn with_dummy(mut self, reply: Reply) -> Self {
        self.opts.dummy_reply = Some(reply);
        self
    }

    /// Applies the rewrite function, honoring the error gate: error replies
    /// pass through untouched unless `parse_errors` is set.
    pub(crate) fn apply(&self, reply: Reply) -> Reply {
        match &self.f {
            Some(f) if !reply.is_error() || self.opts.parse_errors => f(reply),
            _ => reply,
        }
    }

    /// Synthesizes the reply for a request that never touched the wire, then
    /// runs it through the rewrite function like any other reply.
    pub(crate) fn synthesize(&self) -> Reply {
        let reply = self
            .opts
            .dummy_reply
            .clone()
            .unwrap_or(Reply::Bulk(Bulk::Nil));
        self.apply(reply)
    }
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("f", &self.f.as_ref().map(|_| "fn"))
            .field("raw_bulk", &self.opts.raw_bulk)
            .field("dummy_reply", &self.opts.dummy_reply)
            .field("parse_errors", &self.opts.parse_errors)
            .finish()
    }
}

/// How a queued request reaches the server.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// an ordinary command: pre-coerced argument payloads, argument 0 being
    /// the command name
    Wire {
        /// the cached encoded argument list
        encoded: Vec<Vec<u8>>,
    },
    /// a placeholder that emits no wire bytes and synthesizes its reply
    Synthetic,
}

/// One queued request with its routing and decoding metadata.
#[derive(Debug, Clone)]
pub struct Request {
    /// wire arguments or a synthetic placeholder
    pub kind: RequestKind,
    /// the parser annotated onto this request at queue time
    pub parser: Parser,
    /// keyslot computed from the key argument, for cluster routing
    pub expected_slot: Option<u16>,
    /// original index in the flushed pipeline; set by the dispatcher
    pub pos: usize,
    /// one-shot redirect target from an ASK reply
    pub ask_target: Option<crate::pool::NodeSpec>,
    /// when set, the executor writes an `ASKING` prelude for this request
    pub asking: bool,
}

impl Request {
    /// builds an ordinary wire request
    pub(crate) fn wire(encoded: Vec<Vec<u8>>, parser: Parser, expected_slot: Option<u16>) -> Self {
        Request {
            kind: RequestKind::Wire { encoded },
            parser,
            expected_slot,
            pos: 0,
            ask_target: None,
            asking: false,
        }
    }

    /// builds a synthetic request carrying the given parser
    pub(crate) fn synthetic(parser: Parser) -> Self {
        Request {
            kind: RequestKind::Synthetic,
            parser,
            expected_slot: None,
            pos: 0,
            ask_target: None,
            asking: false,
        }
    }

    /// true when this request emits no wire bytes and reads no reply
    pub(crate) fn is_synthetic(&self) -> bool {
        matches!(self.kind, RequestKind::Synthetic) || self.parser.opts.dummy_reply.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ServerError;

    #[test]
    fn parsers_skip_errors_by_default() {
        let parser = Parser::map(|_| Reply::Int(99));
        let err = Reply::Error(ServerError::from_line("ERR nope"));
        assert_eq!(parser.apply(err.clone()), err);
        assert_eq!(parser.apply(Reply::Int(1)), Reply::Int(99));
    }

    #[test]
    fn parse_errors_opt_in() {
        let parser = Parser::map(|_| Reply::Int(99)).on_errors();
        let err = Reply::Error(ServerError::from_line("ERR nope"));
        assert_eq!(parser.apply(err), Reply::Int(99));
    }

    #[test]
    fn compose_runs_inner_first() {
        let inner = Parser::map(|r| match r {
            Reply::Int(n) => Reply::Int(n + 1),
            other => other,
        });
        let outer = Parser::map(|r| match r {
            Reply::Int(n) => Reply::Int(n * 10),
            other => other,
        });
        let composed = Parser::compose(&outer, &inner);
        assert_eq!(composed.apply(Reply::Int(4)), Reply::Int(50));
    }

    #[test]
    fn compose_never_inherits_dummy_replies() {
        let inner = Parser::default().with_dummy(Reply::Int(1));
        let outer = Parser::default().with_dummy(Reply::Int(2));
        let composed = Parser::compose(&outer, &inner);
        assert!(composed.opts.dummy_reply.is_none());
    }

    #[test]
    fn synthesize_threads_through_the_function() {
        let parser = Parser::map(|r| match r {
            Reply::Int(n) => Reply::Int(n * 2),
            other => other,
        })
        .with_dummy(Reply::Int(21));
        assert_eq!(parser.synthesize(), Reply::Int(42));
    }
}
