/*!
# Shelly Bridge DevKit - test doubles for device polling

Lets the bridge be tested without real hardware:
- `FakeShelly`: local HTTP server answering like a Shelly device, with a
  response that tests can change between requests
- `ShellyFixtures`: JSON documents shaped like real device responses
*/

pub mod fake_device;
pub mod fixtures;

pub use fake_device::FakeShelly;
pub use fixtures::ShellyFixtures;
