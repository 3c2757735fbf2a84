//! Supervisor-level scenarios against fake devices

use shelly_bridge_devkit::{FakeShelly, ShellyFixtures};
use shelly_temp_bridge::bus::{PATH_CUSTOM_NAME, PATH_SERIAL, PATH_TEMPERATURE, PATH_UPDATE_INDEX};
use shelly_temp_bridge::mqtt::{notify_topic, route_write};
use shelly_temp_bridge::{BridgeConfig, BusUpdate, BusValue, Supervisor};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const PREFIX: &str = "com.victronenergy.temperature";

fn on_premise_section(instance: u32, host: &str, poll_ms: u64) -> toml::Table {
    toml::from_str(&format!(
        r#"
instance = {instance}
custom_name = "Probe {instance}"
access_type = "OnPremise"
on_premise = {{ host = "{host}" }}
selector = {{ probe = "1" }}
poll_interval_ms = {poll_ms}
sign_of_life_minutes = 0
"#
    ))
    .unwrap()
}

fn cloud_section(instance: u32, endpoint: &str) -> toml::Table {
    toml::from_str(&format!(
        r#"
instance = {instance}
access_type = "Cloud"
cloud = {{ endpoint = "{endpoint}", application_key = "app", api_key = "key", mac = "AA:BB:CC:DD:EE:FF" }}
selector = {{ key_path = "data.outdoor.temperature" }}
poll_interval_ms = 50
sign_of_life_minutes = 0
"#
    ))
    .unwrap()
}

fn config(sections: Vec<toml::Table>) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.bridge.request_timeout_ms = Some(500);
    config.devices = sections;
    config
}

fn drain(rx: &mut UnboundedReceiver<BusUpdate>) -> Vec<BusUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

async fn wait_for(rx: &mut UnboundedReceiver<BusUpdate>, service: &str, path: &str) -> BusUpdate {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let update = rx.recv().await.expect("bus channel closed");
            if update.service == service && update.path == path && update.value != BusValue::Invalid {
                return update;
            }
        }
    })
    .await
    .expect("no matching bus update")
}

#[tokio::test]
async fn failing_device_does_not_disturb_its_neighbour() {
    let a = FakeShelly::start().await.unwrap();
    a.set_json(ShellyFixtures::uni_status(&[("1", 21.5)]));
    let b = FakeShelly::start().await.unwrap();
    b.set_json(ShellyFixtures::uni_status(&[("1", 19.0)]));

    let config = config(vec![
        on_premise_section(1, &a.host(), 50),
        on_premise_section(2, &b.host(), 50),
    ]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = Supervisor::start(&config, tx).await;
    assert_eq!(supervisor.services().len(), 2);
    let service_a = format!("{}.http_01", PREFIX);
    let service_b = format!("{}.http_02", PREFIX);

    let runner = tokio::spawn(supervisor.run_until(std::future::pending()));

    let first = wait_for(&mut rx, &service_a, PATH_TEMPERATURE).await;
    assert_eq!(first.value, BusValue::Float(21.5));
    wait_for(&mut rx, &service_b, PATH_TEMPERATURE).await;

    a.set_status(500);
    tokio::time::sleep(Duration::from_millis(150)).await;
    drain(&mut rx);
    let a_hits = a.hits();

    tokio::time::sleep(Duration::from_millis(600)).await;
    let updates = drain(&mut rx);

    assert!(
        updates.iter().all(|u| u.service != service_a),
        "device A published while failing"
    );
    assert!(a.hits() > a_hits + 3, "device A stopped being polled");

    let b_indices: Vec<i64> = updates
        .iter()
        .filter(|u| u.service == service_b && u.path == PATH_UPDATE_INDEX)
        .filter_map(|u| u.value.as_i64())
        .collect();
    assert!(b_indices.len() >= 5, "device B only advanced {} times", b_indices.len());
    for pair in b_indices.windows(2) {
        assert_eq!(pair[1], (pair[0] + 1) % 256);
    }

    runner.abort();
}

#[tokio::test]
async fn cloud_device_publishes_key_path_reading() {
    let cloud = FakeShelly::start().await.unwrap();
    cloud.set_json(ShellyFixtures::cloud_real_time(8.4));

    let config = config(vec![cloud_section(7, &cloud.url("api/v3/device/real_time"))]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = Supervisor::start(&config, tx).await;
    let service = format!("{}.http_07", PREFIX);

    let serial = wait_for(&mut rx, &service, PATH_SERIAL).await;
    assert_eq!(serial.value, BusValue::Text("AA:BB:CC:DD:EE:FF".into()));

    let runner = tokio::spawn(supervisor.run_until(std::future::pending()));
    let reading = wait_for(&mut rx, &service, PATH_TEMPERATURE).await;
    assert_eq!(reading.value, BusValue::Float(8.4));
    assert_eq!(reading.text, "8.4°C");
    assert_eq!(cloud.last_path().as_deref(), Some("/api/v3/device/real_time"));

    // a refusal from the API freezes the published values
    cloud.set_json(ShellyFixtures::cloud_error(40010, "illegal application_key"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    drain(&mut rx);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut rx).is_empty());

    runner.abort();
}

#[tokio::test]
async fn device_without_addon_runs_but_never_publishes() {
    let bare = FakeShelly::start().await.unwrap();
    bare.set_json(ShellyFixtures::uni_status_without_addon());

    let config = config(vec![on_premise_section(3, &bare.host(), 50)]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = Supervisor::start(&config, tx).await;

    // identity resolves, so the device runs, but no reading is ever published
    assert_eq!(supervisor.services().len(), 1);
    let runner = tokio::spawn(supervisor.run_until(std::future::pending()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let updates = drain(&mut rx);
    assert!(updates
        .iter()
        .filter(|u| u.path == PATH_TEMPERATURE)
        .all(|u| u.value == BusValue::Invalid));
    assert!(bare.hits() > 3);

    runner.abort();
}

#[tokio::test]
async fn external_write_reaches_owning_service() {
    let device = FakeShelly::start().await.unwrap();
    device.set_json(ShellyFixtures::uni_status(&[("1", 21.5)]));

    let config = config(vec![on_premise_section(4, &device.host(), 5000)]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let supervisor = Supervisor::start(&config, tx).await;
    let routes = supervisor.routes();
    let service = format!("{}.http_04", PREFIX);

    let runner = tokio::spawn(supervisor.run_until(std::future::pending()));
    wait_for(&mut rx, &service, PATH_TEMPERATURE).await;

    let topic = format!("shelly-bridge/W/{}/CustomName", service);
    assert!(route_write("shelly-bridge", &routes, &topic, br#"{"value": "Garage"}"#));

    let renamed = wait_for(&mut rx, &service, PATH_CUSTOM_NAME).await;
    assert_eq!(renamed.value, BusValue::Text("Garage".into()));
    assert_eq!(
        notify_topic("shelly-bridge", &renamed.service, &renamed.path),
        format!("shelly-bridge/N/{}/CustomName", service)
    );

    runner.abort();
}
