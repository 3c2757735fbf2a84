/*!
JSON fixtures shaped like real device responses

Trimmed-down copies of what a Shelly Uni `/status` and the cloud real-time
API return, with only the fields the bridge reads plus a few neighbours so
the extractor sees realistic documents.
*/

use serde_json::{json, Map, Value};

pub struct ShellyFixtures;

impl ShellyFixtures {
    pub const MAC: &'static str = "C45BBE6B2F1A";
    pub const FIRMWARE: &'static str = "20230913-112003/v1.14.0-gcb84623";

    /// Shelly Uni `/status` with one `ext_temperature` entry per probe
    pub fn uni_status(probes: &[(&str, f64)]) -> Value {
        let mut temperatures = Map::new();
        for (index, celsius) in probes {
            temperatures.insert(
                index.to_string(),
                json!({ "hwID": format!("28ff64d1{}", index), "tC": celsius, "tF": celsius * 1.8 + 32.0 }),
            );
        }

        json!({
            "wifi_sta": { "connected": true, "ssid": "lab", "ip": "192.168.1.50", "rssi": -61 },
            "mac": Self::MAC,
            "update": {
                "status": "idle",
                "has_update": false,
                "new_version": Self::FIRMWARE,
                "old_version": Self::FIRMWARE
            },
            "ext_sensors": { "temperature_unit": "C" },
            "ext_temperature": Value::Object(temperatures),
            "ext_humidity": {},
            "uptime": 86400
        })
    }

    /// `/status` of a device with no add-on attached
    pub fn uni_status_without_addon() -> Value {
        let mut status = Self::uni_status(&[]);
        if let Value::Object(map) = &mut status {
            map.remove("ext_temperature");
        }
        status
    }

    /// Cloud real-time response; numeric values are strings, as the API sends them
    pub fn cloud_real_time(outdoor_celsius: f64) -> Value {
        json!({
            "code": 0,
            "msg": "success",
            "time": "1700000000",
            "data": {
                "outdoor": {
                    "temperature": { "time": "1700000000", "unit": "℃", "value": format!("{:.1}", outdoor_celsius) },
                    "humidity": { "time": "1700000000", "unit": "%", "value": "71" }
                },
                "wind": {
                    "wind_speed": { "time": "1700000000", "unit": "m/s", "value": "1.2" }
                }
            }
        })
    }

    /// Cloud API refusal (HTTP 200 with a non-zero code)
    pub fn cloud_error(code: i64, msg: &str) -> Value {
        json!({ "code": code, "msg": msg, "time": "1700000000", "data": [] })
    }
}
