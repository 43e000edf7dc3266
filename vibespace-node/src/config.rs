use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use vibespace_core::{MAX_PEER_ID_LEN, PeerId};

/// `vibespace.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_RELAY_URL_LEN: usize = 512;
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9090/ws";

pub fn default_rendezvous() -> Vec<PeerId> {
    (1..=3).map(|n| format!("vibespace-rendezvous-{n}")).collect()
}

/// Timing and bootstrap parameters for one mesh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    /// A peer silent for longer than this is removed by the next sweep.
    pub stale_after: Duration,
    pub rendezvous: Vec<PeerId>,
    pub capture_video: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2_500),
            sweep_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(10),
            rendezvous: default_rendezvous(),
            capture_video: false,
        }
    }
}

/// On-disk node settings. Every field is optional; absent ones fall back to
/// command-line values or [`MeshConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedNodeConfig {
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Seed for a stable peer id across restarts.
    #[serde(default)]
    pub identity_seed: Option<String>,
    #[serde(default)]
    pub rendezvous: Option<Vec<PeerId>>,
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
    #[serde(default)]
    pub sweep_ms: Option<u64>,
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

impl SavedNodeConfig {
    pub fn mesh_config(&self) -> MeshConfig {
        let defaults = MeshConfig::default();
        MeshConfig {
            heartbeat_interval: self
                .heartbeat_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            sweep_interval: self
                .sweep_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            stale_after: self
                .stale_after_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stale_after),
            rendezvous: self.rendezvous.clone().unwrap_or(defaults.rendezvous),
            capture_video: defaults.capture_video,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
    #[error("invalid config:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

pub fn config_path() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VIBESPACE_CONFIG_DIR") {
        return PathBuf::from(override_dir).join("vibespace.json");
    }
    PathBuf::from("vibespace.json")
}

pub fn validate_saved_config(cfg: &SavedNodeConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if let Some(relay_url) = cfg.relay_url.as_deref().map(str::trim) {
        if relay_url.is_empty() {
            errors.push("Relay URL must not be empty.".to_owned());
        } else if relay_url.len() > MAX_RELAY_URL_LEN {
            errors.push(format!(
                "Relay URL is too long ({} > {} chars).",
                relay_url.len(),
                MAX_RELAY_URL_LEN
            ));
        } else {
            match Url::parse(relay_url) {
                Ok(url) => {
                    let scheme = url.scheme();
                    if scheme != "ws" && scheme != "wss" {
                        errors.push(
                            "Relay URL must start with ws:// or wss:// (WebSocket).".to_owned(),
                        );
                    }
                }
                Err(err) => errors.push(format!("Relay URL is invalid: {err}")),
            }
        }
    }

    if let Some(name) = cfg.display_name.as_deref().map(str::trim) {
        if name.is_empty() {
            errors.push("Display name must not be empty.".to_owned());
        } else if name.len() > MAX_DISPLAY_NAME_LEN {
            errors.push(format!(
                "Display name is too long ({} > {} chars).",
                name.len(),
                MAX_DISPLAY_NAME_LEN
            ));
        }
    }

    if let Some(rendezvous) = &cfg.rendezvous {
        for id in rendezvous {
            if id.trim().is_empty() || id.len() > MAX_PEER_ID_LEN {
                errors.push(format!("Rendezvous id {id:?} is not a valid peer id."));
            }
        }
    }

    let mesh = cfg.mesh_config();
    if mesh.heartbeat_interval.is_zero() || mesh.sweep_interval.is_zero() {
        errors.push("Heartbeat and sweep intervals must be positive.".to_owned());
    }
    if mesh.heartbeat_interval >= mesh.stale_after {
        errors.push(format!(
            "Heartbeat ({} ms) must be shorter than the stale threshold ({} ms).",
            mesh.heartbeat_interval.as_millis(),
            mesh.stale_after.as_millis()
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

pub fn parse_config_json(data: &str) -> Result<SavedNodeConfig, ConfigError> {
    serde_json::from_str::<SavedNodeConfig>(data).map_err(ConfigError::Parse)
}

/// Returns `Ok(None)` when no file exists at `path`.
pub fn load_config_from_path(path: &Path) -> Result<Option<SavedNodeConfig>, ConfigError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ConfigError::Metadata(err)),
    };
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigError::Read)?;
    let cfg = parse_config_json(&data)?;
    validate_saved_config(&cfg)?;
    Ok(Some(cfg))
}

/// Write through a sibling tmp file and rename into place.
pub fn save_config_to_path(path: &Path, cfg: &SavedNodeConfig) -> Result<(), ConfigError> {
    validate_saved_config(cfg)?;
    let payload = serde_json::to_string_pretty(cfg).map_err(ConfigError::Serialize)?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload.as_bytes()).map_err(ConfigError::WriteTmp)?;
    fs::rename(&tmp_path, path).map_err(ConfigError::Rename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_mesh_timing() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(2_500));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.stale_after, Duration::from_secs(10));
        assert_eq!(cfg.rendezvous[0], "vibespace-rendezvous-1");
        assert_eq!(cfg.rendezvous.len(), 3);
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let cfg = parse_config_json(r#"{"heartbeat_ms": 1000, "rendezvous": ["hub"]}"#).unwrap();
        let mesh = cfg.mesh_config();
        assert_eq!(mesh.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(mesh.stale_after, Duration::from_secs(10));
        assert_eq!(mesh.rendezvous, vec!["hub".to_owned()]);
    }

    #[test]
    fn validation_collects_every_problem() {
        let cfg = SavedNodeConfig {
            relay_url: Some("http://example.invalid".to_owned()),
            display_name: Some("   ".to_owned()),
            heartbeat_ms: Some(20_000),
            ..Default::default()
        };
        match validate_saved_config(&cfg) {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(validate_saved_config(&SavedNodeConfig::default()).is_ok());
    }
}
