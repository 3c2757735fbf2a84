//! MQTT transport for the bus
//!
//! Bus updates queued by the pollers are published retained on
//! `<prefix>/N/<service><path>`. Writes from other processes arrive on
//! `<prefix>/W/<service><path>` and are routed to the poller owning that
//! service. The transport is the only task that talks to the broker.

use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::bus::{BusUpdate, BusValue, ExternalWrite};
use crate::config::MqttConfig;

/// Service name -> channel of the poller that owns it
pub type BusRoutes = HashMap<String, UnboundedSender<ExternalWrite>>;

const REQUEST_CAPACITY: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub fn notify_topic(prefix: &str, service: &str, path: &str) -> String {
    format!("{}/N/{}{}", prefix, service, path)
}

/// Split a write topic into `(service, path)`
pub fn parse_write_topic(prefix: &str, topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/W/")?;
    let (service, path) = rest.split_once('/')?;
    if service.is_empty() || path.is_empty() {
        return None;
    }
    Some((service.to_string(), format!("/{}", path)))
}

/// `{"value": ...}` or a bare JSON scalar
pub fn parse_write_payload(payload: &[u8]) -> Option<BusValue> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    match value {
        Value::Object(mut map) => BusValue::from_json(&map.remove("value")?),
        other => BusValue::from_json(&other),
    }
}

pub fn encode_update(update: &BusUpdate) -> Vec<u8> {
    json!({ "value": update.value, "text": update.text }).to_string().into_bytes()
}

/// Hand an incoming write to its owner; returns whether it was delivered
pub fn route_write(prefix: &str, routes: &BusRoutes, topic: &str, payload: &[u8]) -> bool {
    let Some((service, path)) = parse_write_topic(prefix, topic) else {
        debug!("Ignoring message on {}", topic);
        return false;
    };
    let Some(value) = parse_write_payload(payload) else {
        warn!("Unreadable write payload on {}", topic);
        return false;
    };
    let Some(owner) = routes.get(&service) else {
        debug!("Write for unknown service {}", service);
        return false;
    };
    owner.send(ExternalWrite { service, path, value }).is_ok()
}

/// Start the broker connection and the publish loop
pub fn spawn_bus_transport(
    config: MqttConfig,
    mut updates: UnboundedReceiver<BusUpdate>,
    routes: BusRoutes,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        opts.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        let write_filter = format!("{}/W/#", config.topic_prefix);
        // last payload per topic, replayed after each reconnect
        let mut retained: HashMap<String, Vec<u8>> = HashMap::new();

        info!("Bus transport connecting to {}:{}", config.host, config.port);

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => {
                        let topic = notify_topic(&config.topic_prefix, &update.service, &update.path);
                        let payload = encode_update(&update);
                        if let Err(e) = client.try_publish(topic.as_str(), QoS::AtLeastOnce, true, payload.clone()) {
                            debug!("Publish of {} deferred: {}", topic, e);
                        }
                        retained.insert(topic, payload);
                    }
                    None => {
                        info!("All bus services closed, stopping transport");
                        break;
                    }
                },
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("Connected to bus broker, {} values to replay", retained.len());
                        if let Err(e) = client.try_subscribe(write_filter.as_str(), QoS::AtLeastOnce) {
                            error!("Subscribe to {} failed: {}", write_filter, e);
                        }
                        for (topic, payload) in &retained {
                            if let Err(e) = client.try_publish(topic.as_str(), QoS::AtLeastOnce, true, payload.clone()) {
                                warn!("Replay of {} failed: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        route_write(&config.topic_prefix, &routes, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Bus connection error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const PREFIX: &str = "shelly-bridge";
    const SERVICE: &str = "com.victronenergy.temperature.http_40";

    #[test]
    fn test_notify_topic() {
        assert_eq!(
            notify_topic(PREFIX, SERVICE, "/Mgmt/ProcessName"),
            "shelly-bridge/N/com.victronenergy.temperature.http_40/Mgmt/ProcessName"
        );
    }

    #[test]
    fn test_parse_write_topic() {
        let topic = format!("{}/W/{}/CustomName", PREFIX, SERVICE);
        assert_eq!(
            parse_write_topic(PREFIX, &topic),
            Some((SERVICE.to_string(), "/CustomName".to_string()))
        );

        let nested = format!("{}/W/{}/Mgmt/Connection", PREFIX, SERVICE);
        assert_eq!(parse_write_topic(PREFIX, &nested).unwrap().1, "/Mgmt/Connection");

        assert_eq!(parse_write_topic(PREFIX, "shelly-bridge/N/svc/Temperature"), None);
        assert_eq!(parse_write_topic(PREFIX, "other/W/svc/Temperature"), None);
        assert_eq!(parse_write_topic(PREFIX, "shelly-bridge/W/svc"), None);
        assert_eq!(parse_write_topic(PREFIX, "shelly-bridge/W/svc/"), None);
    }

    #[test]
    fn test_parse_write_payload() {
        assert_eq!(parse_write_payload(br#"{"value": 3}"#), Some(BusValue::Int(3)));
        assert_eq!(parse_write_payload(br#""Pool""#), Some(BusValue::Text("Pool".into())));
        assert_eq!(parse_write_payload(b"21.5"), Some(BusValue::Float(21.5)));
        assert_eq!(parse_write_payload(br#"{"text": "x"}"#), None);
        assert_eq!(parse_write_payload(b"garbage"), None);
    }

    #[test]
    fn test_encode_update() {
        let update = BusUpdate {
            service: SERVICE.into(),
            path: "/Temperature".into(),
            value: BusValue::Float(21.5),
            text: "21.5°C".into(),
        };
        let payload: Value = serde_json::from_slice(&encode_update(&update)).unwrap();
        assert_eq!(payload, json!({"value": 21.5, "text": "21.5°C"}));
    }

    #[test]
    fn test_route_write() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut routes = BusRoutes::new();
        routes.insert(SERVICE.to_string(), tx);

        let topic = format!("{}/W/{}/CustomName", PREFIX, SERVICE);
        assert!(route_write(PREFIX, &routes, &topic, br#"{"value": "Pool"}"#));
        let write = rx.try_recv().unwrap();
        assert_eq!(write.service, SERVICE);
        assert_eq!(write.path, "/CustomName");
        assert_eq!(write.value, BusValue::Text("Pool".into()));

        let unknown = format!("{}/W/com.victronenergy.temperature.http_99/CustomName", PREFIX);
        assert!(!route_write(PREFIX, &routes, &unknown, br#"{"value": "Pool"}"#));
        assert!(!route_write(PREFIX, &routes, &topic, b"not json"));
        assert!(rx.try_recv().is_err());
    }
}
