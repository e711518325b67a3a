//! Ping/pong health protocol.
//!
//! A ping is exactly `{id, PING: "PING", sent}`; its pong echoes `id` and
//! `sent` untouched and adds the responder's `pid`, exactly
//! `{id, PING: "PONG", sent, pid}`. The strict shapes are what let a client
//! distinguish a live daemon from a wedged process that happens to own the
//! endpoint: anything that is not byte-for-byte a pong is treated as a dead
//! peer.

use std::sync::OnceLock;
use std::time::Instant;

use serde_json::{json, Value};

const PING: &str = "PING";
const PONG: &str = "PONG";

fn clock_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds on a process-local monotonic clock.
///
/// Only ever compared against itself within one process; peers echo `sent`
/// back rather than interpreting it.
pub fn now_ms() -> u64 {
    clock_epoch().elapsed().as_millis() as u64
}

/// Build a ping carrying a fresh `sent` timestamp.
pub fn ping(id: &str) -> Value {
    json!({ "id": id, "PING": PING, "sent": now_ms() })
}

/// Build the pong for `ping`: same `id` and `sent`, sentinel flipped, `pid`
/// of the responder added.
pub fn pong(ping: &Value, pid: u32) -> Value {
    let mut fields = ping.as_object().cloned().unwrap_or_default();
    fields.insert("PING".to_string(), Value::from(PONG));
    fields.insert("pid".to_string(), Value::from(pid));
    Value::Object(fields)
}

/// Exactly `{id, PING: "PING", sent}` - no missing fields, no extras.
pub fn is_ping(msg: &Value) -> bool {
    let Some(fields) = msg.as_object() else {
        return false;
    };
    fields.len() == 3
        && fields.get("id").is_some_and(Value::is_string)
        && fields.get("PING").and_then(Value::as_str) == Some(PING)
        && fields.get("sent").is_some_and(Value::is_u64)
}

/// Exactly `{id, PING: "PONG", sent, pid}` - no missing fields, no extras.
pub fn is_pong(msg: &Value) -> bool {
    let Some(fields) = msg.as_object() else {
        return false;
    };
    fields.len() == 4
        && fields.get("id").is_some_and(Value::is_string)
        && fields.get("PING").and_then(Value::as_str) == Some(PONG)
        && fields.get("sent").is_some_and(Value::is_u64)
        && fields.get("pid").is_some_and(Value::is_u64)
}

/// A well-shaped pong whose `id` and `sent` echo `ping` exactly.
pub fn pong_matches(msg: &Value, ping: &Value) -> bool {
    is_pong(msg) && msg.get("id") == ping.get("id") && msg.get("sent") == ping.get("sent")
}

/// Attach the round-trip time to a resolved pong as `duration`, measured
/// against the echoed `sent` on the local monotonic clock.
pub fn attach_duration(pong: &mut Value) {
    let Some(sent) = pong.get("sent").and_then(Value::as_u64) else {
        return;
    };
    let duration = now_ms().saturating_sub(sent);
    if let Some(fields) = pong.as_object_mut() {
        fields.insert("duration".to_string(), Value::from(duration));
    }
}
