//! Modbus TCP battery drivers. Each device call opens its own session.

pub mod marstek;
pub mod session;

pub use marstek::{register_power, MarstekBattery, MarstekSettings};
pub use session::ModbusSession;
