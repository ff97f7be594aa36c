//! Env-gated packet tracing. When `ASHFALL_PACKET_TRACE` is set, every
//! connection dumps its clear-text packet bodies to a per-session file
//! under `<root>/log/`. Off by default; tracing must never affect the
//! session outcome, so every write error is swallowed.

use std::fmt::Write as FmtWrite;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

const TRACE_ENV: &str = "ASHFALL_PACKET_TRACE";
const TRACE_MAX_BYTES: usize = 2048;

pub struct PacketTrace {
    file: std::fs::File,
}

impl PacketTrace {
    pub fn new(root: Option<&Path>, session_id: u64, peer: SocketAddr) -> Option<Self> {
        if !trace_enabled() {
            return None;
        }
        let root = root?;
        let path = root
            .join("log")
            .join(format!("packet_trace_session_{session_id}.log"));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()?;
        let _ = writeln!(
            file,
            "# session {session_id} peer={peer} ts={}",
            unix_millis()
        );
        Some(Self { file })
    }

    pub fn record_in(&mut self, body: &[u8]) {
        self.record("in", body);
    }

    pub fn record_out(&mut self, body: &[u8]) {
        self.record("out", body);
    }

    fn record(&mut self, direction: &str, body: &[u8]) {
        let shown = TRACE_MAX_BYTES.min(body.len());
        let mut line = String::with_capacity(32 + shown * 3);
        let _ = write!(line, "{} {direction} len={}", unix_millis(), body.len());
        if body.len() > shown {
            let _ = write!(line, " trunc={}", body.len() - shown);
        }
        line.push_str(" data=");
        for (idx, byte) in body[..shown].iter().enumerate() {
            if idx > 0 {
                line.push(' ');
            }
            let _ = write!(line, "{byte:02x}");
        }
        line.push('\n');
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

fn trace_enabled() -> bool {
    match std::env::var(TRACE_ENV) {
        Ok(value) => {
            let value = value.trim().to_ascii_lowercase();
            !value.is_empty() && value != "0" && value != "false" && value != "off"
        }
        Err(_) => false,
    }
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
