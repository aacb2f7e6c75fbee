use indexmap::IndexMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::device::types::{DeviceConfig, DeviceConfigError, DeviceConfigResult};

/// Load device blocks from a config file.
pub fn load_device_configs(path: impl AsRef<Path>) -> DeviceConfigResult<Vec<DeviceConfig>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => DeviceConfigError::NotFound {
            path: path.to_path_buf(),
        },
        _ => DeviceConfigError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    Ok(parse_device_configs(&text))
}

/// Parse the block-structured config format.
///
/// Blocks are separated by lines made only of underscores. Inside a block,
/// blank lines and `#` comments are skipped and `KEY=VALUE` lines populate
/// the device's parameters. Empty blocks produce no device.
pub fn parse_device_configs(text: &str) -> Vec<DeviceConfig> {
    let mut devices = Vec::new();
    let mut current: IndexMap<String, String> = IndexMap::new();

    for raw in text.lines() {
        let line = raw.trim();
        if is_separator(line) {
            if !current.is_empty() {
                devices.push(DeviceConfig::from_params(std::mem::take(&mut current)));
            }
            continue;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            current.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        devices.push(DeviceConfig::from_params(current));
    }

    devices
}

fn is_separator(line: &str) -> bool {
    !line.is_empty() && line.chars().all(|c| c == '_')
}
