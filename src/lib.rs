//! Zero-feed battery dispatch: keeps the grid connection near zero watts by
//! charging and discharging a fleet of home batteries from a grid meter.

pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod meter;
pub mod telemetry;
