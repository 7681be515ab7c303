//! Single-node pipelined execution: write every queued request in one burst,
//! then drain exactly one reply per wire request in order.

use std::io::{BufRead, Write};

use tracing::trace;

use crate::error::Result;
use crate::freeze::Freezer;
use crate::pool::Connection;
use crate::reply::Reply;
use crate::request::{Request, RequestKind};
use crate::resp;

/// one-shot redirect prelude; its `+OK` reply is read and discarded inline
const ASKING_FRAME: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// Runs a pipeline over one connection and returns its replies in order.
///
/// Synthetic requests emit no wire bytes and synthesize their reply from the
/// parser's dummy value; a pipeline made solely of them never touches the
/// connection. Error replies stay values here; the session layer decides
/// whether to raise them.
pub(crate) fn execute(
    conn: &mut Connection,
    requests: &[Request],
    freezer: &dyn Freezer,
) -> Result<Vec<Reply>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    if requests.iter().all(Request::is_synthetic) {
        return Ok(synthesize_all(requests));
    }

    write_pipeline(requests, conn.write_buf())?;
    conn.send_staged()?;
    read_replies(requests, conn.reader(), freezer)
}

/// Encodes the wire half of a pipeline into `out`. The caller flushes once.
pub(crate) fn write_pipeline<W: Write>(requests: &[Request], out: &mut W) -> Result<()> {
    let mut wire = 0usize;
    for request in requests {
        if request.is_synthetic() {
            continue;
        }
        if request.asking {
            out.write_all(ASKING_FRAME)?;
        }
        if let RequestKind::Wire { encoded } = &request.kind {
            resp::encode_request(encoded, out)?;
            wire += 1;
        }
    }
    trace!(requests = requests.len(), wire, "encoded pipeline");
    Ok(())
}

/// Decodes one reply per request, applying each request's parser exactly once.
pub(crate) fn read_replies<R: BufRead>(
    requests: &[Request],
    reader: &mut R,
    freezer: &dyn Freezer,
) -> Result<Vec<Reply>> {
    let mut replies = Vec::with_capacity(requests.len());
    for request in requests {
        if request.is_synthetic() {
            replies.push(request.parser.synthesize());
            continue;
        }
        if request.asking {
            // the prelude's +OK; alignment only
            resp::read_reply(reader, &request.parser.opts, freezer)?;
        }
        let reply = resp::read_reply(reader, &request.parser.opts, freezer)?;
        replies.push(request.parser.apply(reply));
    }
    Ok(replies)
}

/// Replies for a pipeline that never touches the wire.
pub(crate) fn synthesize_all(requests: &[Request]) -> Vec<Reply> {
    requests.iter().map(|r| r.parser.synthesize()).collect()
}
