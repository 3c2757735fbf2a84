//! Field extraction from decoded device documents
//!
//! Two selector shapes cover the supported device families:
//! - probe selectors for Shelly add-ons (`ext_temperature.<index>.tC`)
//! - dotted key paths for cloud payloads (`data.outdoor.temperature`)

use serde_json::Value;

use crate::config::SelectorConfig;
use crate::error::{BridgeError, MissingField};

pub const DEFAULT_CONTAINER: &str = "ext_temperature";
pub const DEFAULT_FIELD: &str = "tC";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldSelector {
    Probe {
        container: String,
        index: String,
        field: String,
    },
    KeyPath(Vec<String>),
}

impl FieldSelector {
    pub fn probe(index: impl Into<String>) -> Self {
        FieldSelector::Probe {
            container: DEFAULT_CONTAINER.to_string(),
            index: index.into(),
            field: DEFAULT_FIELD.to_string(),
        }
    }

    pub fn key_path(path: &str) -> Self {
        FieldSelector::KeyPath(path.split('.').map(str::to_string).collect())
    }

    pub fn from_config(config: &SelectorConfig) -> Result<Self, BridgeError> {
        match (&config.probe, &config.key_path) {
            (Some(_), Some(_)) => Err(BridgeError::Configuration(
                "selector: probe and key_path are mutually exclusive".into(),
            )),
            (Some(index), None) => Ok(FieldSelector::Probe {
                container: config.container.clone().unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
                index: index.clone(),
                field: config.field.clone().unwrap_or_else(|| DEFAULT_FIELD.to_string()),
            }),
            (None, Some(path)) => {
                if path.split('.').any(str::is_empty) {
                    return Err(BridgeError::Configuration(format!("selector: invalid key_path '{}'", path)));
                }
                Ok(FieldSelector::key_path(path))
            }
            (None, None) => Err(BridgeError::Configuration(
                "selector: one of probe or key_path is required".into(),
            )),
        }
    }

    /// Dotted form, for log records
    pub fn describe(&self) -> String {
        match self {
            FieldSelector::Probe { container, index, field } => format!("{}.{}.{}", container, index, field),
            FieldSelector::KeyPath(keys) => keys.join("."),
        }
    }
}

/// Pull the reading selected by `selector` out of `document`
pub fn extract(document: &Value, selector: &FieldSelector) -> Result<f64, BridgeError> {
    match selector {
        FieldSelector::Probe { container, index, field } => {
            let probes = document
                .get(container)
                .ok_or_else(|| BridgeError::missing(MissingField::Container, container.as_str()))?;
            let probe = probes
                .get(index)
                .ok_or_else(|| BridgeError::missing(MissingField::Probe, format!("{}.{}", container, index)))?;
            let leaf = non_null(probe.get(field))
                .ok_or_else(|| BridgeError::missing(MissingField::Leaf, selector.describe()))?;
            numeric(leaf, &selector.describe())
        }
        FieldSelector::KeyPath(keys) => {
            let mut current = document;
            let last = keys.len().saturating_sub(1);
            for (depth, key) in keys.iter().enumerate() {
                let kind = match depth {
                    0 if last > 0 => MissingField::Container,
                    d if d == last => MissingField::Leaf,
                    _ => MissingField::Probe,
                };
                current = non_null(current.get(key))
                    .ok_or_else(|| BridgeError::missing(kind, keys[..=depth].join(".")))?;
            }
            numeric(current, &selector.describe())
        }
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Numbers, numeric strings and `{"value": ...}` wrappers are accepted
fn numeric(value: &Value, path: &str) -> Result<f64, BridgeError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| BridgeError::Decode(format!("{}: number out of range", path))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| BridgeError::Decode(format!("{}: '{}' is not a number", path, s))),
        Value::Object(map) if map.contains_key("value") => numeric(&map["value"], path),
        other => Err(BridgeError::Decode(format!("{}: unexpected value {}", path, other))),
    }
}

/// Serial and firmware version, resolved once per device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub firmware: String,
}

impl DeviceIdentity {
    /// Identity from an on-premise `/status` document
    pub fn from_status(document: &Value) -> Result<Self, BridgeError> {
        let serial = non_empty_str(document.get("mac"))
            .ok_or_else(|| BridgeError::missing(MissingField::Leaf, "mac"))?;
        let update = document
            .get("update")
            .ok_or_else(|| BridgeError::missing(MissingField::Container, "update"))?;
        let firmware = non_empty_str(update.get("old_version"))
            .ok_or_else(|| BridgeError::missing(MissingField::Leaf, "update.old_version"))?;

        Ok(DeviceIdentity {
            serial: serial.to_string(),
            firmware: firmware.to_string(),
        })
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Human-readable temperature, rounded to two decimals
pub fn format_celsius(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{:.1}°C", rounded)
    } else {
        format!("{}°C", rounded)
    }
}
