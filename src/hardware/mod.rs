//! Concrete battery and meter backends.

pub mod factory;
#[cfg(feature = "modbus")]
pub mod modbus;
#[cfg(feature = "sim")]
pub mod simulated;

pub use factory::{DeviceFactory, Devices};
