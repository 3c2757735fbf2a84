//! Multi-device supervisor
//!
//! Turns the `[[device]]` sections into running pollers. A section that does
//! not parse, reuses an instance id or whose device cannot be identified is
//! left out; the remaining devices start regardless. Each poller runs as its
//! own task with its own timers, so nothing one device does reaches another.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::BusUpdate;
use crate::config::{BridgeConfig, DeviceConfig, MAX_REQUEST_TIMEOUT_MS};
use crate::mqtt::BusRoutes;
use crate::poller::DevicePoller;
use crate::source::EndpointReader;

/// A device the supervisor left out, with the reason
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedDevice {
    pub section: usize,
    pub instance: Option<u32>,
    pub reason: String,
}

pub struct Supervisor {
    tasks: JoinSet<u32>,
    services: Vec<(u32, String)>,
    routes: BusRoutes,
    skipped: Vec<SkippedDevice>,
}

impl Supervisor {
    /// A supervisor with nothing to run
    pub fn idle() -> Self {
        Self {
            tasks: JoinSet::new(),
            services: Vec::new(),
            routes: BusRoutes::new(),
            skipped: Vec::new(),
        }
    }

    /// Build and schedule one poller per valid device section
    pub async fn start(config: &BridgeConfig, updates: UnboundedSender<BusUpdate>) -> Self {
        let mut supervisor = Self::idle();

        let default_timeout = Duration::from_millis(MAX_REQUEST_TIMEOUT_MS);
        let reader = match EndpointReader::new(default_timeout) {
            Ok(reader) => reader,
            Err(e) => {
                error!("Cannot create HTTP client, no device will be polled: {}", e);
                return supervisor;
            }
        };

        let mut instances = HashSet::new();
        for (section, raw) in config.devices.iter().enumerate() {
            let device = match DeviceConfig::from_section(raw) {
                Ok(device) => device,
                Err(e) => {
                    warn!(section, "Skipping device section: {}", e);
                    supervisor.skip(section, None, e.to_string());
                    continue;
                }
            };

            if !instances.insert(device.instance) {
                error!(section, instance = device.instance, "Device instance already in use, section skipped");
                supervisor.skip(section, Some(device.instance), "duplicate instance".to_string());
                continue;
            }

            let timeout = config.bridge.request_timeout(device.poll_interval_ms);
            if timeout >= Duration::from_millis(device.poll_interval_ms) {
                warn!(
                    instance = device.instance,
                    "Request timeout ({}ms) is not below the poll period ({}ms)",
                    timeout.as_millis(),
                    device.poll_interval_ms
                );
            }

            let instance = device.instance;
            let reader = reader.with_timeout(timeout);
            match DevicePoller::connect(device, reader, &config.bridge.service_prefix, updates.clone()).await {
                Ok(poller) => supervisor.spawn(poller),
                Err(e) => {
                    error!(instance, kind = e.kind(), "Device excluded: {}", e);
                    supervisor.skip(section, Some(instance), e.to_string());
                }
            }
        }

        if supervisor.services.is_empty() {
            warn!("No device could be started, idling");
        } else {
            info!("{} device(s) polling", supervisor.services.len());
        }
        supervisor
    }

    fn skip(&mut self, section: usize, instance: Option<u32>, reason: String) {
        self.skipped.push(SkippedDevice { section, instance, reason });
    }

    fn spawn(&mut self, poller: DevicePoller) {
        let instance = poller.instance();
        let service = poller.service().name().to_string();
        debug!(instance, serial = %poller.identity().serial, "Scheduling poller for {}", service);
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();

        self.routes.insert(service.clone(), writes_tx);
        self.services.push((instance, service));
        self.tasks.spawn(async move {
            poller.run(writes_rx).await;
            instance
        });
    }

    /// `(instance, service name)` of every running poller
    pub fn services(&self) -> &[(u32, String)] {
        &self.services
    }

    pub fn skipped(&self) -> &[SkippedDevice] {
        &self.skipped
    }

    /// Write routes for the bus transport
    pub fn routes(&self) -> BusRoutes {
        self.routes.clone()
    }

    /// Keep the pollers running until `shutdown` resolves
    pub async fn run_until<F: Future<Output = ()>>(mut self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => match result {
                    Ok(instance) => error!(instance, "Poller stopped unexpectedly"),
                    Err(e) if e.is_panic() => error!("Poller task panicked: {}", e),
                    Err(_) => {}
                },
            }
        }
        info!("Stopping {} poller(s)", self.tasks.len());
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusValue, PATH_TEMPERATURE};
    use shelly_bridge_devkit::{FakeShelly, ShellyFixtures};

    fn section(instance: u32, host: &str) -> toml::Table {
        toml::from_str(&format!(
            r#"
instance = {instance}
access_type = "OnPremise"
on_premise = {{ host = "{host}" }}
selector = {{ probe = "1" }}
poll_interval_ms = 3000
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_zero_devices_is_idle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::start(&BridgeConfig::default(), tx).await;
        assert!(supervisor.services().is_empty());
        assert!(supervisor.routes().is_empty());

        // returns as soon as shutdown fires
        tokio::time::timeout(Duration::from_secs(1), supervisor.run_until(async {}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_sections_are_skipped() {
        let good = FakeShelly::start().await.unwrap();
        good.set_json(ShellyFixtures::uni_status(&[("1", 21.5)]));
        let unidentified = FakeShelly::start().await.unwrap();
        unidentified.set_status(503);

        let mut config = BridgeConfig::default();
        config.devices.push(section(10, &good.host()));
        config.devices.push(toml::from_str("custom_name = \"no instance\"").unwrap());
        config.devices.push(section(10, &good.host()));
        config.devices.push(section(11, &unidentified.host()));
        let mut unsupported = section(12, &good.host());
        unsupported.insert("access_type".into(), toml::Value::String("Zigbee".into()));
        config.devices.push(unsupported);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::start(&config, tx).await;

        assert_eq!(
            supervisor.services(),
            &[(10, "com.victronenergy.temperature.http_10".to_string())]
        );
        let skipped: Vec<usize> = supervisor.skipped().iter().map(|s| s.section).collect();
        assert_eq!(skipped, vec![1, 2, 3, 4]);
        assert_eq!(supervisor.skipped()[1].reason, "duplicate instance");
        assert_eq!(supervisor.skipped()[2].instance, Some(11));
        assert!(supervisor.routes().contains_key("com.victronenergy.temperature.http_10"));

        // the started device publishes its first reading right away
        let first_reading = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let update = rx.recv().await.unwrap();
                if update.path == PATH_TEMPERATURE && update.value != BusValue::Invalid {
                    return update;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(first_reading.value, BusValue::Float(21.5));
        assert_eq!(first_reading.service, "com.victronenergy.temperature.http_10");
    }
}
