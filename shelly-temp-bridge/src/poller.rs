//! Device poller: the per-device scheduling core
//!
//! A poller is built once per device (identity fetched up front), then driven
//! by its own timers:
//! - the poll timer fetches, extracts and publishes the reading
//! - the sign-of-life timer logs a liveness summary
//!
//! A tick never returns an error. Whatever goes wrong is logged and the
//! previously published values stay on the bus until the device recovers.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::*;
use crate::config::DeviceConfig;
use crate::error::BridgeError;
use crate::extract::{extract, DeviceIdentity, FieldSelector};
use crate::source::{ConnectionDescriptor, EndpointReader, STATUS_PATH};

const MIN_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Extract,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Fetch => f.write_str("fetch"),
            Step::Extract => f.write_str("extract"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Published { temperature: f64, update_index: u8 },
    Skipped { step: Step, kind: &'static str },
}

/// Mutable state owned by one poller
#[derive(Debug, Clone, Default)]
pub struct PollerState {
    pub last_update: Option<DateTime<Utc>>,
    pub update_index: u8,
    pub consecutive_failures: u32,
}

/// Snapshot emitted by the sign-of-life timer
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessReport {
    pub service: String,
    pub last_update: Option<DateTime<Utc>>,
    pub temperature: BusValue,
    pub update_index: u8,
    pub stale: bool,
}

pub struct DevicePoller {
    config: DeviceConfig,
    descriptor: ConnectionDescriptor,
    selector: FieldSelector,
    identity: DeviceIdentity,
    reader: EndpointReader,
    service: BusService,
    state: PollerState,
}

impl DevicePoller {
    /// Resolve the device identity and register its bus paths.
    ///
    /// Fails when the configuration is unusable or the device cannot be
    /// identified; such a device is never scheduled.
    pub async fn connect(
        config: DeviceConfig,
        reader: EndpointReader,
        service_prefix: &str,
        updates: UnboundedSender<BusUpdate>,
    ) -> Result<Self, BridgeError> {
        let descriptor = ConnectionDescriptor::from_device(&config)?;
        let selector = FieldSelector::from_config(&config.selector)?;
        let identity = resolve_identity(&reader, &descriptor).await?;

        let mut service = BusService::new(config.service_name(service_prefix), updates);
        register_paths(&mut service, &config, &descriptor, &identity)?;

        info!(
            instance = config.instance,
            service = service.name(),
            serial = %identity.serial,
            firmware = %identity.firmware,
            "Device registered, reading {}",
            selector.describe()
        );

        Ok(Self {
            config,
            descriptor,
            selector,
            identity,
            reader,
            service,
            state: PollerState::default(),
        })
    }

    pub fn instance(&self) -> u32 {
        self.config.instance
    }

    pub fn service(&self) -> &BusService {
        &self.service
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    /// One poll cycle: fetch, extract, publish
    pub async fn tick(&mut self) -> TickOutcome {
        match self.read_temperature().await {
            Ok(temperature) => {
                self.service.set(PATH_TEMPERATURE, temperature);
                self.state.update_index = self.state.update_index.wrapping_add(1);
                self.service.set(PATH_UPDATE_INDEX, self.state.update_index);
                self.state.last_update = Some(Utc::now());

                if self.state.consecutive_failures > 0 {
                    info!(
                        instance = self.config.instance,
                        "Device recovered after {} failed ticks", self.state.consecutive_failures
                    );
                    self.state.consecutive_failures = 0;
                }
                debug!(
                    instance = self.config.instance,
                    "Temperature: {}",
                    self.service.text(PATH_TEMPERATURE).unwrap_or_default()
                );

                TickOutcome::Published {
                    temperature,
                    update_index: self.state.update_index,
                }
            }
            Err((step, e)) => {
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                error!(
                    instance = self.config.instance,
                    service = self.service.name(),
                    step = %step,
                    kind = e.kind(),
                    streak = self.state.consecutive_failures,
                    "Update failed: {}", e
                );

                TickOutcome::Skipped { step, kind: e.kind() }
            }
        }
    }

    async fn read_temperature(&self) -> Result<f64, (Step, BridgeError)> {
        let document = self
            .reader
            .fetch(&self.descriptor, STATUS_PATH)
            .await
            .map_err(|e| (Step::Fetch, e))?;
        extract(&document, &self.selector).map_err(|e| (Step::Extract, e))
    }

    /// No success within ten poll periods (at least a minute)
    pub fn stale_after(&self) -> Duration {
        (Duration::from_millis(self.config.poll_interval_ms) * 10).max(MIN_STALE_AFTER)
    }

    pub fn liveness(&self) -> LivenessReport {
        let stale = match self.state.last_update {
            Some(at) => (Utc::now() - at).to_std().map_or(false, |age| age > self.stale_after()),
            None => true,
        };
        LivenessReport {
            service: self.service.name().to_string(),
            last_update: self.state.last_update,
            temperature: self.service.get(PATH_TEMPERATURE).cloned().unwrap_or_default(),
            update_index: self.state.update_index,
            stale,
        }
    }

    /// Log the liveness summary
    pub fn report_liveness(&self) -> LivenessReport {
        let report = self.liveness();
        let last = report
            .last_update
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());

        info!(
            instance = self.config.instance,
            last_update = %last,
            temperature = %self.service.text(PATH_TEMPERATURE).unwrap_or_default(),
            update_index = report.update_index,
            "Sign of life"
        );
        if report.stale {
            warn!(
                instance = self.config.instance,
                "No successful update for more than {}s",
                self.stale_after().as_secs()
            );
        }
        report
    }

    pub fn handle_external_write(&mut self, write: ExternalWrite) -> WriteOutcome {
        let outcome = self.service.handle_external_write(&write.path, write.value);
        if let WriteOutcome::Rejected(reason) = &outcome {
            warn!(instance = self.config.instance, "External write rejected: {}", reason);
        }
        outcome
    }

    /// Drive the poller until the process stops
    pub async fn run(mut self, mut writes: UnboundedReceiver<ExternalWrite>) {
        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sign_of_life = (self.config.sign_of_life_minutes > 0).then(|| {
            let period = Duration::from_secs(self.config.sign_of_life_minutes * 60);
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let mut writes_open = true;

        info!(
            instance = self.config.instance,
            "Polling every {}ms", self.config.poll_interval_ms
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.tick().await;
                }
                _ = next_tick(&mut sign_of_life) => {
                    self.report_liveness();
                }
                write = writes.recv(), if writes_open => match write {
                    Some(write) => {
                        self.handle_external_write(write);
                    }
                    None => writes_open = false,
                },
            }
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn resolve_identity(
    reader: &EndpointReader,
    descriptor: &ConnectionDescriptor,
) -> Result<DeviceIdentity, BridgeError> {
    let document = reader.fetch(descriptor, STATUS_PATH).await?;
    match descriptor {
        ConnectionDescriptor::OnPremise { .. } => DeviceIdentity::from_status(&document),
        ConnectionDescriptor::Cloud { mac, .. } => Ok(DeviceIdentity {
            serial: mac.clone(),
            firmware: "cloud".to_string(),
        }),
    }
}

fn log_external_change(path: &str, value: &BusValue) -> bool {
    info!("someone else updated {} to {}", path, value);
    true
}

fn register_paths(
    service: &mut BusService,
    config: &DeviceConfig,
    descriptor: &ConnectionDescriptor,
    identity: &DeviceIdentity,
) -> Result<(), BridgeError> {
    service.add_static(PATH_PROCESS_NAME, env!("CARGO_PKG_NAME"))?;
    service.add_static(PATH_PROCESS_VERSION, format!("{} (Rust)", env!("CARGO_PKG_VERSION")))?;
    service.add_static(PATH_CONNECTION, descriptor.connection_label())?;

    service.add_static(PATH_DEVICE_INSTANCE, config.instance)?;
    service.add_static(PATH_PRODUCT_ID, 0xFFFF_i64)?;
    service.add_static(PATH_PRODUCT_NAME, config.product_name.as_str())?;
    service.add_static(PATH_CONNECTED, 1_i64)?;
    service.add_static(PATH_FIRMWARE_VERSION, identity.firmware.as_str())?;
    service.add_static(PATH_HARDWARE_VERSION, 0_i64)?;
    service.add_static(PATH_SERIAL, identity.serial.as_str())?;
    service.add_static(PATH_UPDATE_INDEX, 0_i64)?;

    service.add_path(PATH_TEMPERATURE, BusValue::Invalid, celsius_text, true, Some(log_external_change))?;
    service.add_path(
        PATH_TEMPERATURE_TYPE,
        config.temperature_type,
        plain_text,
        true,
        Some(log_external_change),
    )?;
    service.add_path(
        PATH_CUSTOM_NAME,
        config.custom_name.as_str(),
        plain_text,
        true,
        Some(log_external_change),
    )?;
    Ok(())
}
