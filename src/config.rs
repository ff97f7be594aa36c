use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::net::opcodes::OpcodeTable;

/// Network tuning bundle. Resolved once at startup from
/// `<root>/net.yml` plus argument and environment overrides; immutable
/// for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub bind_addr: String,
    pub worker_threads: usize,
    /// Upper bound on one whole frame, length field included.
    pub max_frame_bytes: usize,
    pub idle_timeout_secs: u64,
    /// Idle notice before the kick; `None` disables the warning.
    pub idle_warning_secs: Option<u64>,
    pub outbound_ceiling_messages: usize,
    pub outbound_ceiling_bytes: usize,
    pub drain_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub protocol_revision: u32,
    /// Custom opcode table, relative to the data root. Overrides the
    /// built-in table for `protocol_revision` when set.
    pub opcode_table_file: Option<PathBuf>,
    pub session_cap: usize,
    pub throttle_window_secs: u64,
    pub throttle_max_per_ip: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7777".to_string(),
            worker_threads: 4,
            max_frame_bytes: 8192,
            idle_timeout_secs: 900,
            idle_warning_secs: Some(840),
            outbound_ceiling_messages: 512,
            outbound_ceiling_bytes: 256 * 1024,
            drain_timeout_ms: 2000,
            auth_timeout_ms: 5000,
            protocol_revision: 830,
            opcode_table_file: None,
            session_cap: 1000,
            throttle_window_secs: 10,
            throttle_max_per_ip: 20,
        }
    }
}

impl NetConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_warning_after(&self) -> Option<Duration> {
        self.idle_warning_secs.map(Duration::from_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_secs(self.throttle_window_secs)
    }

    /// Reads `<root>/net.yml`; a missing file means defaults.
    pub fn load(root: &Path) -> Result<Self, String> {
        let path = root.join("net.yml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(err) => {
                return Err(format!(
                    "net config read failed for {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        serde_yaml::from_str(&text)
            .map_err(|err| format!("net config parse failed for {}: {}", path.display(), err))
    }

    /// Resolves the opcode table this deployment speaks.
    pub fn opcode_table(&self, root: &Path) -> Result<OpcodeTable, String> {
        if let Some(file) = self.opcode_table_file.as_ref() {
            return OpcodeTable::load(&root.join(file));
        }
        OpcodeTable::for_revision(self.protocol_revision).ok_or_else(|| {
            format!(
                "no built-in opcode table for protocol revision {}",
                self.protocol_revision
            )
        })
    }
}

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub net: NetConfig,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 2 {
            return Err("usage: ashfall <data-root> [bind_addr]".to_string());
        }
        let root = Path::new(&args[1]).to_path_buf();
        let mut net = NetConfig::load(&root)?;
        if args.len() > 2 {
            net.bind_addr = args[2].clone();
        } else if let Some(addr) = env_override("ASHFALL_BIND_ADDR") {
            net.bind_addr = addr;
        }
        if let Some(workers) = env_override("ASHFALL_WORKERS") {
            match workers.parse::<usize>() {
                Ok(parsed) if parsed > 0 => net.worker_threads = parsed,
                _ => {
                    eprintln!("ashfall: invalid ASHFALL_WORKERS '{}', keeping {}", workers, net.worker_threads);
                }
            }
        }
        if let Some(revision) = env_override("ASHFALL_REVISION") {
            match revision.parse::<u32>() {
                Ok(parsed) => net.protocol_revision = parsed,
                Err(_) => {
                    eprintln!(
                        "ashfall: invalid ASHFALL_REVISION '{}', keeping {}",
                        revision, net.protocol_revision
                    );
                }
            }
        }
        Ok(Self { root, net })
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NetConfig::default();
        assert!(config.worker_threads > 0);
        assert!(config.max_frame_bytes >= 256);
        assert!(config.idle_warning_secs.unwrap() < config.idle_timeout_secs);
        assert!(config.opcode_table(Path::new("/nonexistent")).is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_the_rest() {
        let config: NetConfig =
            serde_yaml::from_str("bind_addr: 127.0.0.1:9000\nworker_threads: 8\n")
                .expect("config");
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.max_frame_bytes, NetConfig::default().max_frame_bytes);
    }

    #[test]
    fn unknown_revision_without_table_file_is_an_error() {
        let config = NetConfig {
            protocol_revision: 1,
            ..NetConfig::default()
        };
        assert!(config.opcode_table(Path::new("/nonexistent")).is_err());
    }

    #[test]
    fn from_args_requires_a_root() {
        let err = AppConfig::from_args(&["ashfall".to_string()]).unwrap_err();
        assert!(err.contains("usage"), "{err}");
    }
}
