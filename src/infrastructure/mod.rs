//! Infrastructure Module
//!
//! ## Modules
//!
//! - [`transport`] - BLE transport capability and the simulated controller
//! - [`logging`] - tracing subscriber setup

pub mod logging;
pub mod transport;
