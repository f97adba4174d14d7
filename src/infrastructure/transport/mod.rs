//! Transport Module
//!
//! The narrow capability the session engine drives. A platform binding
//! implements [`Transport`] and marshals its callbacks, as [`TransportEvent`]s,
//! onto the task that owns the session.
//!
//! ## Modules
//!
//! - [`simulated`] - In-process virtual controller for demos and tests

pub mod simulated;

use crate::domain::models::Characteristic;
use crate::error::Result;
use std::fmt;

pub use simulated::{SimulatedRemote, SimulatedTransport, TransportCall};

/// Opaque handle to an established (or pending) link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status code reported with every transport callback, 0 = success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const FAILURE: GattStatus = GattStatus(0x85);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Callbacks emitted by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LinkStateChanged {
        link: LinkHandle,
        state: LinkState,
        status: GattStatus,
    },
    ServicesDiscovered {
        link: LinkHandle,
        status: GattStatus,
        characteristics: Vec<Characteristic>,
    },
    /// The notification descriptor write for `characteristic` finished
    SubscriptionComplete {
        link: LinkHandle,
        characteristic: Characteristic,
        status: GattStatus,
    },
    CharacteristicWriteComplete {
        link: LinkHandle,
        characteristic: Characteristic,
        status: GattStatus,
    },
    CharacteristicReadComplete {
        link: LinkHandle,
        characteristic: Characteristic,
        status: GattStatus,
        value: Vec<u8>,
    },
    Notification {
        link: LinkHandle,
        characteristic: Characteristic,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn link(&self) -> LinkHandle {
        match self {
            Self::LinkStateChanged { link, .. }
            | Self::ServicesDiscovered { link, .. }
            | Self::SubscriptionComplete { link, .. }
            | Self::CharacteristicWriteComplete { link, .. }
            | Self::CharacteristicReadComplete { link, .. }
            | Self::Notification { link, .. } => *link,
        }
    }
}

/// BLE stack capability used by a controller session.
///
/// Every method only issues a request and returns immediately; outcomes
/// arrive later as [`TransportEvent`]s.
pub trait Transport {
    /// Start connecting to `address`
    fn establish_link(&mut self, address: &str) -> Result<LinkHandle>;

    /// Ask the stack to tear the link down; a `Disconnected` event follows
    fn disconnect(&mut self, link: LinkHandle);

    /// Release all resources held for `link`
    fn close(&mut self, link: LinkHandle);

    fn discover_services(&mut self, link: LinkHandle) -> Result<()>;

    fn write_characteristic(
        &mut self,
        link: LinkHandle,
        characteristic: Characteristic,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    fn read_characteristic(&mut self, link: LinkHandle, characteristic: Characteristic)
        -> Result<()>;

    /// Enable or disable notifications. Returns `false` when the characteristic
    /// has no notification descriptor.
    fn subscribe_notifications(
        &mut self,
        link: LinkHandle,
        characteristic: Characteristic,
        enable: bool,
    ) -> bool;
}
