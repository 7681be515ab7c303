//! End-to-end pipeline behavior against a scripted server.

mod common;

use common::{bulk, error, integer, nil, simple, spawn_node};
use kvpipe::{Bulk, Client, PipeError, Replies, Reply, Value};

fn connect(addr: String) -> Client {
    Client::connect(&addr).expect("client")
}

#[test]
fn mixed_pipeline_interleaves_synthetic_replies() {
    // the dummy request must not reach the wire: the server expects
    // exactly two commands
    let addr = spawn_node(2, |idx, args| match idx {
        0 => {
            assert_eq!(args[0], b"PING");
            simple("PONG")
        }
        _ => {
            assert_eq!(args[0], b"INCR");
            assert_eq!(args[1], b"n");
            integer(1)
        }
    });

    let client = connect(addr);
    let replies = client
        .pipeline(|s| {
            s.ping()?;
            s.return_value(Reply::Int(42));
            s.incr("n")
        })
        .expect("pipeline");
    assert_eq!(
        replies,
        vec![
            Reply::Simple("PONG".to_string()),
            Reply::Int(42),
            Reply::Int(1),
        ]
    );
}

#[test]
fn binary_values_round_trip_through_the_marker() {
    let payload: &[u8] = &[0x00, b'<', 0x01, 0x02, 0x03];
    let addr = spawn_node(2, move |idx, args| match idx {
        0 => {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[1], b"k");
            // the five on-wire bytes: marker plus payload
            assert_eq!(args[2], payload);
            simple("OK")
        }
        _ => {
            assert_eq!(args[0], b"GET");
            bulk(payload)
        }
    });

    let client = connect(addr);
    let replies = client
        .pipeline(|s| {
            s.set("k", Value::Bytes(vec![0x01, 0x02, 0x03]))?;
            s.get("k")
        })
        .expect("pipeline");
    assert_eq!(replies[0], Reply::Simple("OK".to_string()));
    assert_eq!(replies[1], Reply::Bulk(Bulk::Bytes(vec![0x01, 0x02, 0x03])));
}

#[test]
fn frozen_objects_round_trip() {
    let expected = serde_json::json!({"id": 7, "tags": ["a"]});
    let frozen = {
        let mut out = vec![0x00, b'>'];
        out.extend_from_slice(&serde_json::to_vec(&expected).unwrap());
        out
    };
    let wire = frozen.clone();
    let addr = spawn_node(2, move |idx, args| match idx {
        0 => {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[2], wire);
            simple("OK")
        }
        _ => bulk(&wire),
    });

    let client = connect(addr);
    let replies = client
        .pipeline(|s| {
            s.set("obj", Value::Json(expected.clone()))?;
            s.get("obj")
        })
        .expect("pipeline");
    assert_eq!(replies[1], Reply::Bulk(Bulk::Object(expected)));
}

#[test]
fn lone_error_reply_is_raised() {
    let addr = spawn_node(1, |_, args| {
        assert_eq!(args[0], b"GET");
        error("WRONGTYPE Operation against a key holding the wrong kind of value")
    });

    let client = connect(addr);
    let err = client.execute(|s| s.get("missing-hash")).unwrap_err();
    match err {
        PipeError::Reply { source } => assert_eq!(source.prefix, "wrongtype"),
        other => panic!("expected raised server error, got {:?}", other),
    }
}

#[test]
fn pipeline_mode_returns_error_replies_in_place() {
    let addr = spawn_node(1, |_, _| error("WRONGTYPE nope"));

    let client = connect(addr);
    let replies = client.pipeline(|s| s.get("missing-hash")).expect("pipeline");
    assert_eq!(replies.len(), 1);
    match &replies[0] {
        Reply::Error(e) => assert_eq!(e.prefix, "wrongtype"),
        other => panic!("expected in-place error, got {:?}", other),
    }
}

#[test]
fn dump_returns_the_payload_verbatim() {
    // DUMP output is opaque server bytes; markers must not be interpreted
    let payload: &[u8] = b"\x00\x09verbatim";
    let addr = spawn_node(1, move |_, args| {
        assert_eq!(args[0], b"DUMP");
        bulk(payload)
    });

    let client = connect(addr);
    let reply = client.execute(|s| s.dump("k")).expect("dump").one().unwrap();
    assert_eq!(reply, Reply::Bulk(Bulk::Bytes(payload.to_vec())));
}

#[test]
fn null_bulk_decodes_as_nil() {
    let addr = spawn_node(1, |_, _| nil());
    let client = connect(addr);
    let reply = client.execute(|s| s.get("gone")).expect("get").one().unwrap();
    assert_eq!(reply, Reply::Bulk(Bulk::Nil));
}

#[test]
fn nested_with_replies_flushes_early_and_preserves_order() {
    let addr = spawn_node(3, |idx, args| match idx {
        0 => {
            assert_eq!(args[0], b"SET");
            simple("OK")
        }
        1 => {
            assert_eq!(args[0], b"GET");
            bulk(b"inner")
        }
        _ => {
            assert_eq!(args[0], b"INCR");
            integer(9)
        }
    });

    let client = connect(addr);
    let replies = client
        .pipeline(|s| {
            s.set("k", Value::from("v"))?;
            let inner = s.with_replies(|s| s.get("k"))?;
            assert_eq!(
                inner,
                Replies::One(Reply::Bulk(Bulk::Text("inner".to_string())))
            );
            s.incr("n")
        })
        .expect("pipeline");
    assert_eq!(
        replies,
        vec![
            Reply::Simple("OK".to_string()),
            Reply::Int(9),
        ]
    );
}
