//! Session Module
//!
//! Everything bound to one controller connection.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ControllerSession               │
//! │  (state machine, routes transport events)     │
//! └───────┬───────────────┬───────────────┬──────┘
//!         │               │               │
//!         ▼               ▼               ▼
//! ┌──────────────┐ ┌─────────────┐ ┌────────────┐
//! │ LedMatrix    │ │ WriteQueue  │ │ Listeners  │
//! │ Writer       │─▶│ (one GATT   │ │            │
//! │ (coalescing) │ │  op at once)│ │            │
//! └──────────────┘ └─────────────┘ └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`controller`] - Connection state machine
//! - [`driver`] - Async loop and remote handle
//! - [`write_queue`] - Serialized GATT operations
//! - [`matrix_writer`] - LED matrix coalescing and write recovery
//! - [`listener`] - Listener trait and registry

pub mod controller;
pub mod driver;
pub mod listener;
pub mod matrix_writer;
pub mod write_queue;

pub use controller::ControllerSession;
pub use driver::{SessionCommand, SessionHandle};
pub use listener::{ChannelListener, ControllerListener, Listeners};
pub use matrix_writer::{LedMatrixWriter, WriteOutcome};
pub use write_queue::{GattOperation, WriteQueue};
