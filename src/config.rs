//! Process-level configuration and the on-disk port/data-point records
//! (section 3, "Configuration loading (ambient)"), mirroring the teacher's
//! `DaemonConfig::from_env()` pattern.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{DataPoint, Port};

/// Process-wide configuration: bind address for the diagnostic HTTP
/// surface, default transport timeout, default skip threshold, and the
/// directory holding `ports.toml`/`data_points.toml`.
#[derive(Debug, Clone, Serialize)]
pub struct CoreConfig {
    pub bind_addr: String,
    pub default_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub config_dir: PathBuf,
    /// When true, every non-virtual port is backed by a [`crate::simulated::SimulatedDevice`]
    /// instead of a real transport driver, regardless of its configured protocol.
    pub simulation_mode: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8088".to_string(),
            default_timeout_ms: 3000,
            max_consecutive_timeouts: 3,
            config_dir: PathBuf::from("./config"),
            simulation_mode: false,
        }
    }
}

impl CoreConfig {
    /// Build a config from defaults, overridden by environment variables
    /// when present and parseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HENHOUSE_BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Ok(ms) = std::env::var("HENHOUSE_DEFAULT_TIMEOUT_MS") {
            if let Ok(val) = ms.parse() {
                config.default_timeout_ms = val;
            }
        }

        if let Ok(n) = std::env::var("HENHOUSE_MAX_CONSECUTIVE_TIMEOUTS") {
            if let Ok(val) = n.parse() {
                config.max_consecutive_timeouts = val;
            }
        }

        if let Ok(dir) = std::env::var("HENHOUSE_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }

        if let Ok(flag) = std::env::var("HENHOUSE_SIMULATION_MODE") {
            config.simulation_mode = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }
}

/// Disk schema for a single port entry in `ports.toml`. `path` becomes the
/// registry key (`Port.path` in the runtime model); everything else maps
/// directly onto [`Port`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRecord {
    pub path: String,
    #[serde(flatten)]
    pub port: Port,
}

/// Disk schema for `data_points.toml`. Identical shape to [`DataPoint`];
/// kept as a distinct type so the on-disk schema can evolve independently
/// of the in-process model.
pub type DataPointRecord = DataPoint;

#[derive(Debug, Deserialize)]
struct PortsFile {
    #[serde(default)]
    port: Vec<PortRecord>,
}

#[derive(Debug, Deserialize)]
struct DataPointsFile {
    #[serde(default)]
    data_point: Vec<DataPointRecord>,
}

/// Load `ports.toml` from `config_dir`. An absent file is treated as zero
/// ports, matching a fresh install with no configured hardware yet.
pub fn load_ports(config_dir: &Path) -> anyhow::Result<Vec<PortRecord>> {
    let path = config_dir.join("ports.toml");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    let parsed: PortsFile =
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
    Ok(parsed.port)
}

/// Load `data_points.toml` from `config_dir`, same absent-file convention
/// as [`load_ports`].
pub fn load_data_points(config_dir: &Path) -> anyhow::Result<Vec<DataPointRecord>> {
    let path = config_dir.join("data_points.toml");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    let parsed: DataPointsFile =
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
    for dp in &parsed.data_point {
        if dp.read_fn.is_none() && dp.write_fn.is_none() {
            anyhow::bail!(
                "data point '{}' has neither read_fn nor write_fn configured",
                dp.name
            );
        }
    }
    Ok(parsed.data_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn env_override_is_parsed() {
        std::env::set_var("HENHOUSE_DEFAULT_TIMEOUT_MS", "4500");
        let config = CoreConfig::from_env();
        assert_eq!(config.default_timeout_ms, 4500);
        std::env::remove_var("HENHOUSE_DEFAULT_TIMEOUT_MS");
    }

    #[test]
    fn missing_config_dir_yields_empty_vecs() {
        let dir = std::env::temp_dir().join("henhouse-io-core-test-missing");
        let ports = load_ports(&dir).unwrap();
        let points = load_data_points(&dir).unwrap();
        assert!(ports.is_empty());
        assert!(points.is_empty());
    }

    #[test]
    fn rejects_data_point_without_any_fn() {
        let dir = std::env::temp_dir().join("henhouse-io-core-test-badpoint");
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("data_points.toml")).unwrap();
        writeln!(
            f,
            r#"[[data_point]]
name = "bad"
type = "digital"
port_path = "virtualA"
slave_id = 1
register = 0
"#
        )
        .unwrap();
        let err = load_data_points(&dir).unwrap_err();
        assert!(err.to_string().contains("neither read_fn nor write_fn"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
