// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-Sent Events framing.
//!
//! ```text
//! event: <kind>
//! id: <timestamp>
//! data: {"subject_id":"radarr:queue","kind":"updated",...}
//!
//! : keepalive
//! ```
//!
//! Heartbeats are written as comments so clients ignore them. Transport
//! (HTTP headers, flushing) is left to the host server.

use std::time::Duration;

use super::event::Event;

/// Frame written for heartbeats.
pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Encode one event as an SSE frame.
pub fn encode(event: &Event) -> Result<String, serde_json::Error> {
    if event.is_heartbeat() {
        return Ok(KEEPALIVE_FRAME.to_string());
    }
    // serde_json never emits raw newlines, so `data` stays a single line.
    let data = serde_json::to_string(event)?;
    Ok(format!(
        "event: {}\nid: {}\ndata: {}\n\n",
        single_line(&event.kind),
        event.timestamp,
        data
    ))
}

/// `retry:` frame telling the client how long to wait before reconnecting.
#[must_use]
pub fn retry_hint(delay: Duration) -> String {
    format!("retry: {}\n\n", delay.as_millis())
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
