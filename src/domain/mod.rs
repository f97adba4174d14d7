//! Domain Module
//!
//! Plain values and pure decoding, no I/O.
//!
//! ## Modules
//!
//! - [`led_matrix`] - 9x9 LED bitmap and its wire encoding
//! - [`gestures`] - Sensor notification decoding
//! - [`models`] - Characteristics, connection state and listener events
//! - [`settings`] - Persisted configuration

pub mod gestures;
pub mod led_matrix;
pub mod models;
pub mod settings;
