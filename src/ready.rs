//! Readiness markers on stdout.
//!
//! A daemon writes exactly one marker, once: [`READY`] after it has bound
//! the endpoint and published its PID, or [`ALREADY_RUNNING`] when it defers
//! to a live peer. Spawners do not parse the text; the first stdout byte is
//! the signal that the endpoint is settled and worth another connect. The
//! words are for humans running the daemon by hand.

use std::io::{self, Write};

/// Marker printed by a daemon that is listening and committed.
pub const READY: &str = "READY";

/// Marker printed by a daemon deferring to an existing peer.
pub const ALREADY_RUNNING: &str = "ALREADY RUNNING";

pub(crate) fn announce(marker: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{marker}")?;
    out.flush()
}
