//! Endpoint reader for Shelly devices
//!
//! Builds the request URL for the configured access type and turns the HTTP
//! response into a JSON document. No retries here: a failed fetch is reported
//! to the caller and the schedule decides what happens next.

use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::BridgeError;

/// Resource polled on on-premise devices
pub const STATUS_PATH: &str = "status";

/// How to reach one device
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionDescriptor {
    OnPremise {
        host: String,
        username: String,
        password: String,
    },
    Cloud {
        endpoint: String,
        application_key: String,
        api_key: String,
        mac: String,
    },
}

impl ConnectionDescriptor {
    /// Resolve the access type tag of a device section
    pub fn from_device(device: &DeviceConfig) -> Result<Self, BridgeError> {
        match device.access_type.as_str() {
            "OnPremise" => {
                let c = device.on_premise.as_ref().ok_or_else(|| {
                    BridgeError::Configuration("AccessType OnPremise requires an on_premise section".into())
                })?;
                Ok(ConnectionDescriptor::OnPremise {
                    host: c.host.clone(),
                    username: c.username.clone(),
                    password: c.password.clone(),
                })
            }
            "Cloud" => {
                let c = device.cloud.as_ref().ok_or_else(|| {
                    BridgeError::Configuration("AccessType Cloud requires a cloud section".into())
                })?;
                Ok(ConnectionDescriptor::Cloud {
                    endpoint: c.endpoint.clone(),
                    application_key: c.application_key.clone(),
                    api_key: c.api_key.clone(),
                    mac: c.mac.clone(),
                })
            }
            other => Err(BridgeError::Configuration(format!(
                "AccessType {} is not supported",
                other
            ))),
        }
    }

    /// Request URL for `path` (ignored by the cloud variant, which has one resource)
    pub fn url(&self, path: &str) -> Result<Url, BridgeError> {
        match self {
            ConnectionDescriptor::OnPremise { host, username, password } => {
                let mut url = Url::parse(&format!("http://{}/", host))
                    .map_err(|e| BridgeError::Configuration(format!("invalid host '{}': {}", host, e)))?;
                url.set_path(path);

                // userinfo only when at least one credential is set
                if !username.is_empty() || !password.is_empty() {
                    url.set_username(username)
                        .map_err(|_| BridgeError::Configuration(format!("cannot set username on {}", host)))?;
                    if !password.is_empty() {
                        url.set_password(Some(password))
                            .map_err(|_| BridgeError::Configuration(format!("cannot set password on {}", host)))?;
                    }
                }
                Ok(url)
            }
            ConnectionDescriptor::Cloud { endpoint, application_key, api_key, mac } => {
                let mut url = Url::parse(endpoint)
                    .map_err(|e| BridgeError::Configuration(format!("invalid endpoint '{}': {}", endpoint, e)))?;
                url.query_pairs_mut()
                    .append_pair("application_key", application_key)
                    .append_pair("api_key", api_key)
                    .append_pair("mac", mac)
                    .append_pair("call_back", "all");
                Ok(url)
            }
        }
    }

    /// Value of `/Mgmt/Connection`
    pub fn connection_label(&self) -> &'static str {
        match self {
            ConnectionDescriptor::OnPremise { .. } => "Shelly HTTP JSON service",
            ConnectionDescriptor::Cloud { .. } => "Cloud API HTTP JSON service",
        }
    }
}

/// URL without credentials or keys, safe to log
pub fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.set_query(None);
    clean.to_string()
}

/// HTTP fetcher shared by all pollers of the process
#[derive(Debug, Clone)]
pub struct EndpointReader {
    client: Client,
    timeout: Duration,
}

impl EndpointReader {
    pub fn new(timeout: Duration) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BridgeError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    /// Same connection pool, different per-request timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            client: self.client.clone(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch and decode one JSON document
    pub async fn fetch(&self, descriptor: &ConnectionDescriptor, path: &str) -> Result<Value, BridgeError> {
        let url = descriptor.url(path)?;
        debug!("GET {}", redacted(&url));

        let response = self.client.get(url.clone()).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Network(format!(
                "HTTP {} from {}",
                status,
                redacted(&url)
            )));
        }

        let body = response.bytes().await?;
        let document = decode_body(&body)?;

        if let ConnectionDescriptor::Cloud { .. } = descriptor {
            check_cloud_code(&document)?;
        }
        Ok(document)
    }
}

/// Empty, null, non-object and `{}` bodies are all decode failures
pub fn decode_body(body: &[u8]) -> Result<Value, BridgeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(BridgeError::Decode("empty response body".into()));
    }

    let document: Value = serde_json::from_slice(body)
        .map_err(|e| BridgeError::Decode(format!("invalid JSON: {}", e)))?;

    match &document {
        Value::Object(map) if !map.is_empty() => Ok(document),
        Value::Object(_) => Err(BridgeError::Decode("empty JSON object".into())),
        Value::Null => Err(BridgeError::Decode("JSON body is null".into())),
        _ => Err(BridgeError::Decode("expected a JSON object".into())),
    }
}

fn check_cloud_code(document: &Value) -> Result<(), BridgeError> {
    match document.get("code").and_then(Value::as_i64) {
        None | Some(0) => Ok(()),
        Some(code) => {
            let msg = document.get("msg").and_then(Value::as_str).unwrap_or("no message");
            Err(BridgeError::Network(format!("cloud API returned code {}: {}", code, msg)))
        }
    }
}
