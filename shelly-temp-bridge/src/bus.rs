//! Bus value store for one device service
//!
//! A [`BusService`] is the set of paths one poller registered. It keeps the
//! current value of every path, renders it as text for display and queues a
//! [`BusUpdate`] for the transport each time a value changes. Nothing here is
//! shared between pollers: each one owns its service outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::BridgeError;

pub const PATH_PROCESS_NAME: &str = "/Mgmt/ProcessName";
pub const PATH_PROCESS_VERSION: &str = "/Mgmt/ProcessVersion";
pub const PATH_CONNECTION: &str = "/Mgmt/Connection";
pub const PATH_DEVICE_INSTANCE: &str = "/DeviceInstance";
pub const PATH_PRODUCT_ID: &str = "/ProductId";
pub const PATH_PRODUCT_NAME: &str = "/ProductName";
pub const PATH_CUSTOM_NAME: &str = "/CustomName";
pub const PATH_CONNECTED: &str = "/Connected";
pub const PATH_FIRMWARE_VERSION: &str = "/FirmwareVersion";
pub const PATH_HARDWARE_VERSION: &str = "/HardwareVersion";
pub const PATH_SERIAL: &str = "/Serial";
pub const PATH_UPDATE_INDEX: &str = "/UpdateIndex";
pub const PATH_TEMPERATURE: &str = "/Temperature";
pub const PATH_TEMPERATURE_TYPE: &str = "/TemperatureType";

/// A typed bus value; `Invalid` is the "no value yet" state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum BusValue {
    #[default]
    Invalid,
    Int(i64),
    Float(f64),
    Text(String),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(i) => Some(*i as f64),
            BusValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Scalars only; arrays and objects have no bus representation
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(BusValue::Invalid),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(BusValue::Int(i)),
                None => n.as_f64().map(BusValue::Float),
            },
            Value::String(s) => Some(BusValue::Text(s.clone())),
            Value::Bool(b) => Some(BusValue::Int(i64::from(*b))),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Invalid => f.write_str("---"),
            BusValue::Int(i) => write!(f, "{}", i),
            BusValue::Float(v) => write!(f, "{}", v),
            BusValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for BusValue {
    fn from(v: i64) -> Self {
        BusValue::Int(v)
    }
}

impl From<u32> for BusValue {
    fn from(v: u32) -> Self {
        BusValue::Int(i64::from(v))
    }
}

impl From<u8> for BusValue {
    fn from(v: u8) -> Self {
        BusValue::Int(i64::from(v))
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        BusValue::Float(v)
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self {
        BusValue::Text(v.to_string())
    }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self {
        BusValue::Text(v)
    }
}

/// Renders a value for display (`gettextcallback` on the bus)
pub type TextFormatter = fn(&BusValue) -> String;

/// Called on external writes; returning `false` rejects the value
pub type ChangeCallback = fn(&str, &BusValue) -> bool;

pub fn plain_text(value: &BusValue) -> String {
    value.to_string()
}

pub fn celsius_text(value: &BusValue) -> String {
    match value.as_f64() {
        Some(v) => crate::extract::format_celsius(v),
        None => value.to_string(),
    }
}

/// One value change, queued for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct BusUpdate {
    pub service: String,
    pub path: String,
    pub value: BusValue,
    pub text: String,
}

/// A write coming from another process on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalWrite {
    pub service: String,
    pub path: String,
    pub value: BusValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Accepted,
    Rejected(String),
}

struct PathEntry {
    value: BusValue,
    formatter: TextFormatter,
    writable: bool,
    on_change: Option<ChangeCallback>,
}

pub struct BusService {
    name: String,
    paths: BTreeMap<String, PathEntry>,
    updates: UnboundedSender<BusUpdate>,
}

impl BusService {
    pub fn new(name: impl Into<String>, updates: UnboundedSender<BusUpdate>) -> Self {
        Self {
            name: name.into(),
            paths: BTreeMap::new(),
            updates,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a path and publish its initial value
    pub fn add_path(
        &mut self,
        path: &str,
        initial: impl Into<BusValue>,
        formatter: TextFormatter,
        writable: bool,
        on_change: Option<ChangeCallback>,
    ) -> Result<(), BridgeError> {
        if self.paths.contains_key(path) {
            return Err(BridgeError::Configuration(format!(
                "{}: path {} registered twice",
                self.name, path
            )));
        }

        self.paths.insert(
            path.to_string(),
            PathEntry {
                value: initial.into(),
                formatter,
                writable,
                on_change,
            },
        );
        self.publish(path);
        Ok(())
    }

    /// Read-only path rendered as plain text
    pub fn add_static(&mut self, path: &str, value: impl Into<BusValue>) -> Result<(), BridgeError> {
        self.add_path(path, value, plain_text, false, None)
    }

    pub fn get(&self, path: &str) -> Option<&BusValue> {
        self.paths.get(path).map(|entry| &entry.value)
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.paths.get(path).map(|entry| (entry.formatter)(&entry.value))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }

    /// Owner-side write. Returns whether the stored value changed.
    pub fn set(&mut self, path: &str, value: impl Into<BusValue>) -> bool {
        let value = value.into();
        let Some(entry) = self.paths.get_mut(path) else {
            warn!("{}: write to unregistered path {}", self.name, path);
            return false;
        };
        if entry.value == value {
            return false;
        }
        entry.value = value;
        self.publish(path);
        true
    }

    /// Write from another process
    pub fn handle_external_write(&mut self, path: &str, value: BusValue) -> WriteOutcome {
        let Some(entry) = self.paths.get_mut(path) else {
            return WriteOutcome::Rejected(format!("unknown path {}", path));
        };
        if !entry.writable {
            return WriteOutcome::Rejected(format!("{} is read-only", path));
        }
        if let Some(callback) = entry.on_change {
            if !callback(path, &value) {
                return WriteOutcome::Rejected(format!("{} refused {}", path, value));
            }
        }
        if entry.value != value {
            entry.value = value;
            self.publish(path);
        }
        WriteOutcome::Accepted
    }

    fn publish(&self, path: &str) {
        let Some(entry) = self.paths.get(path) else {
            return;
        };
        let update = BusUpdate {
            service: self.name.clone(),
            path: path.to_string(),
            value: entry.value.clone(),
            text: (entry.formatter)(&entry.value),
        };
        if self.updates.send(update).is_err() {
            debug!("{}: bus transport gone, {} not published", self.name, path);
        }
    }
}
