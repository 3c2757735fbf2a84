//! Shelly Temp Bridge - temperature probes on the energy-monitoring bus
//!
//! Polls Shelly devices (local HTTP or cloud API) and republishes the
//! reading of each one as its own bus service:
//! - `source`: request URL building and JSON fetching
//! - `extract`: locating the reading in the device document
//! - `bus`: per-service value store and update queue
//! - `poller`: per-device schedule, liveness and failure isolation
//! - `supervisor`: one poller per configured device
//! - `mqtt`: broker transport of the bus

pub mod bus;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod mqtt;
pub mod poller;
pub mod source;
pub mod supervisor;

pub use bus::{BusService, BusUpdate, BusValue, ExternalWrite};
pub use config::{BridgeConfig, DeviceConfig};
pub use error::{BridgeError, MissingField};
pub use poller::{DevicePoller, LivenessReport, TickOutcome};
pub use supervisor::Supervisor;
