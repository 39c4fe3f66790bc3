//! Hardware abstraction layer
//!
//! Capability traits, the device registry and the simulated devices used when
//! no real instrument backend is configured.

pub mod capabilities;
pub mod mock;
pub mod registry;

pub use capabilities::{Movable, MultiChannel, Readable, Triggerable};
pub use mock::{MockAreaDetector, MockBehavior, MockMotor, MockScaler, MockSignal};
pub use registry::{
    Capability, ConnectionState, DeviceComponents, DeviceConfig, DeviceFactory, DeviceHandle,
    DeviceId, DeviceRegistry,
};
