// Configuration management for the meshfence CLI
//
// Node config stored as JSON in:
// - macOS: ~/Library/Application Support/meshfence/config.json
// - Linux: ~/.config/meshfence/config.json
// - Windows: %APPDATA%\meshfence\config.json

use anyhow::{Context, Result};
use meshfence_core::StackConfig;
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("meshfence");
    Ok(config_dir)
}

/// Get the config file path, honouring an explicit override
pub fn config_file(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join("config.json")),
    }
}

/// Load the config file, or fall back to defaults if there is none
pub fn load(path: Option<&Path>) -> Result<StackConfig> {
    let config_file = config_file(path)?;

    if config_file.exists() {
        StackConfig::load(&config_file)
            .with_context(|| format!("Failed to load {}", config_file.display()))
    } else {
        Ok(StackConfig::default())
    }
}

/// Save config to file, creating the parent directory
pub fn save(config: &StackConfig, path: Option<&Path>) -> Result<PathBuf> {
    let config_file = config_file(path)?;
    if let Some(parent) = config_file.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let contents = config
        .to_json_pretty()
        .context("Failed to serialize config")?;
    std::fs::write(&config_file, contents).context("Failed to write config file")?;
    Ok(config_file)
}

/// Set a config value by key
pub fn set(config: &mut StackConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "node_id" => config.node_id = value.parse().context("Invalid node id")?,
        "rssi_threshold" => config.rssi_threshold = value.parse().context("Invalid RSSI")?,
        "topology_mask" => {
            config.topology_mask = parse_mask(value).context("Invalid topology mask")?
        }
        "rssi_avg_count" => config.rssi_avg_count = value.parse().context("Invalid number")?,
        "pkt_ack_timeout_ms" => {
            config.pkt_ack_timeout_ms = value.parse().context("Invalid duration")?
        }
        "tx_msg_retry_delay_ms" => {
            config.tx_msg_retry_delay_ms = value.parse().context("Invalid duration")?
        }
        "pong_delay_ms" => config.pong_delay_ms = value.parse().context("Invalid duration")?,
        "ping_period_ms" => config.ping_period_ms = value.parse().context("Invalid duration")?,
        "heal_routes" => config.heal_routes = value.parse().context("Invalid boolean value")?,
        "tx_queue_size" => config.tx_queue_size = value.parse().context("Invalid number")?,
        "rcv_queue_size" => config.rcv_queue_size = value.parse().context("Invalid number")?,
        "tx_msg_queue_size" => {
            config.tx_msg_queue_size = value.parse().context("Invalid number")?
        }
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    config.validate().context("Rejected config value")?;
    Ok(())
}

/// Get a config value by key
pub fn get(config: &StackConfig, key: &str) -> Option<String> {
    list(config)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

/// List all config values
pub fn list(config: &StackConfig) -> Vec<(String, String)> {
    vec![
        ("node_id".to_string(), config.node_id.to_string()),
        ("rssi_threshold".to_string(), config.rssi_threshold.to_string()),
        ("topology_mask".to_string(), format!("{:#010x}", config.topology_mask)),
        ("rssi_avg_count".to_string(), config.rssi_avg_count.to_string()),
        ("pkt_ack_timeout_ms".to_string(), config.pkt_ack_timeout_ms.to_string()),
        ("tx_msg_retry_delay_ms".to_string(), config.tx_msg_retry_delay_ms.to_string()),
        ("pong_delay_ms".to_string(), config.pong_delay_ms.to_string()),
        ("ping_period_ms".to_string(), config.ping_period_ms.to_string()),
        ("heal_routes".to_string(), config.heal_routes.to_string()),
        ("tx_queue_size".to_string(), config.tx_queue_size.to_string()),
        ("rcv_queue_size".to_string(), config.rcv_queue_size.to_string()),
        ("tx_msg_queue_size".to_string(), config.tx_msg_queue_size.to_string()),
    ]
}

/// Accepts decimal or `0x`-prefixed hex
fn parse_mask(value: &str) -> Result<u32> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config, StackConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = StackConfig::for_node(4);
        set(&mut config, "heal_routes", "true").unwrap();
        save(&config, Some(&path)).unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.node_id, 4);
        assert!(loaded.heal_routes);
    }

    #[test]
    fn test_set_and_get() {
        let mut config = StackConfig::default();
        set(&mut config, "topology_mask", "0x04").unwrap();
        assert_eq!(config.topology_mask, 4);
        assert_eq!(get(&config, "topology_mask").as_deref(), Some("0x00000004"));

        assert!(set(&mut config, "bogus", "1").is_err());
        assert!(set(&mut config, "node_id", "0").is_err());
        assert!(set(&mut config, "heal_routes", "maybe").is_err());
        assert_eq!(get(&config, "bogus"), None);
    }
}
