//! Host-side driver for Nuimo rotary BLE controllers.
//!
//! ## Modules
//!
//! - [`domain`] - LED matrix, gesture decoding, models and settings
//! - [`infrastructure`] - Transport capability, simulated controller, logging
//! - [`session`] - Per-connection state machine and LED matrix writer
//! - [`discovery`] - Registry of controllers seen while scanning
//! - [`error`] - Transport errors

pub mod discovery;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod session;

pub use discovery::{DiscoveryListener, DiscoveryManager};
pub use domain::gestures::{Gesture, GestureEvent};
pub use domain::led_matrix::LedMatrix;
pub use domain::models::{
    Characteristic, ConnectionState, ControllerEvent, DisplayOptions, FailReason,
};
pub use error::TransportError;
pub use session::{ControllerListener, ControllerSession, SessionHandle};
