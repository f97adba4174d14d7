//! Simulated Transport
//!
//! A virtual controller living in-process. Every request is recorded; in
//! auto-respond mode the matching callbacks are pushed into an event channel
//! the way a real BLE stack would deliver them.

use crate::domain::models::Characteristic;
use crate::error::{Result, TransportError};
use crate::infrastructure::transport::{
    GattStatus, LinkHandle, LinkState, Transport, TransportEvent, WriteMode,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub const SIMULATED_BATTERY_PERCENTAGE: u8 = 87;
pub const SIMULATED_FIRMWARE_VERSION: &str = "2.5.1";
pub const SIMULATED_HARDWARE_VERSION: &str = "1.1";
pub const SIMULATED_COLOR: &str = "black";

/// A request received by the simulated transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    EstablishLink(String),
    Disconnect(LinkHandle),
    Close(LinkHandle),
    DiscoverServices(LinkHandle),
    Write {
        link: LinkHandle,
        characteristic: Characteristic,
        value: Vec<u8>,
        mode: WriteMode,
    },
    Read {
        link: LinkHandle,
        characteristic: Characteristic,
    },
    Subscribe {
        link: LinkHandle,
        characteristic: Characteristic,
        enable: bool,
    },
}

#[derive(Default)]
struct SimulatedState {
    calls: Vec<TransportCall>,
    current_link: Option<LinkHandle>,
}

/// Shared view on the simulated device, usable after the transport has been
/// handed to a session
#[derive(Clone)]
pub struct SimulatedRemote {
    state: Arc<Mutex<SimulatedState>>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl SimulatedRemote {
    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All requests received so far, in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    /// Values written to `characteristic`, in order
    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write {
                    characteristic: c,
                    value,
                    ..
                } if *c == characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn current_link(&self) -> Option<LinkHandle> {
        self.state().current_link
    }

    /// Push a sensor notification on the current link
    pub fn notify(&self, characteristic: Characteristic, value: Vec<u8>) -> bool {
        let (Some(link), Some(events)) = (self.current_link(), self.events.as_ref()) else {
            return false;
        };
        events
            .send(TransportEvent::Notification {
                link,
                characteristic,
                value,
            })
            .is_ok()
    }

    /// Drop the current link as if the device went out of range
    pub fn drop_link(&self) -> bool {
        let Some(link) = self.state().current_link.take() else {
            return false;
        };
        match self.events.as_ref() {
            Some(events) => events
                .send(TransportEvent::LinkStateChanged {
                    link,
                    state: LinkState::Disconnected,
                    status: GattStatus::FAILURE,
                })
                .is_ok(),
            None => false,
        }
    }
}

/// In-process [`Transport`] implementation
pub struct SimulatedTransport {
    remote: SimulatedRemote,
    characteristics: Vec<Characteristic>,
    missing_descriptors: HashSet<Characteristic>,
    reject_links: bool,
    acknowledge_unresponsive_writes: bool,
    next_link: u64,
}

impl SimulatedTransport {
    /// Transport that records requests but never answers; callers feed events themselves
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Transport that answers every request through `events`
    pub fn with_auto_respond(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self::build(Some(events))
    }

    fn build(events: Option<mpsc::UnboundedSender<TransportEvent>>) -> Self {
        let mut characteristics = vec![Characteristic::LedMatrix];
        characteristics.extend(Characteristic::NOTIFICATION_SOURCES);
        characteristics.extend(Characteristic::DEVICE_INFORMATION);
        characteristics.push(Characteristic::RebootToDfu);
        characteristics.push(Characteristic::FlyCalibration);

        Self {
            remote: SimulatedRemote {
                state: Arc::new(Mutex::new(SimulatedState::default())),
                events,
            },
            characteristics,
            missing_descriptors: HashSet::new(),
            reject_links: false,
            acknowledge_unresponsive_writes: true,
            next_link: 1,
        }
    }

    /// Characteristics reported by service discovery
    pub fn with_characteristics(mut self, characteristics: Vec<Characteristic>) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Pretend `characteristic` lacks a notification descriptor
    pub fn without_descriptor(mut self, characteristic: Characteristic) -> Self {
        self.missing_descriptors.insert(characteristic);
        self
    }

    pub fn rejecting_links(mut self) -> Self {
        self.reject_links = true;
        self
    }

    /// Never confirm writes-without-response, like some stacks do
    pub fn silent_on_unresponsive_writes(mut self) -> Self {
        self.acknowledge_unresponsive_writes = false;
        self
    }

    pub fn remote(&self) -> SimulatedRemote {
        self.remote.clone()
    }

    fn record(&self, call: TransportCall) {
        trace!("Simulated transport call: {:?}", call);
        self.remote.state().calls.push(call);
    }

    fn respond(&self, event: TransportEvent) {
        if let Some(events) = self.remote.events.as_ref() {
            let _ = events.send(event);
        }
    }

    fn check_link(&self, link: LinkHandle) -> Result<()> {
        if self.remote.current_link() == Some(link) {
            Ok(())
        } else {
            Err(TransportError::UnknownLink(link))
        }
    }

    fn check_characteristic(&self, characteristic: Characteristic) -> Result<()> {
        if self.characteristics.contains(&characteristic) {
            Ok(())
        } else {
            Err(TransportError::CharacteristicNotFound(characteristic))
        }
    }

    fn read_value(characteristic: Characteristic) -> Vec<u8> {
        match characteristic {
            Characteristic::Battery => vec![SIMULATED_BATTERY_PERCENTAGE],
            Characteristic::FirmwareVersion => SIMULATED_FIRMWARE_VERSION.as_bytes().to_vec(),
            Characteristic::HardwareVersion => SIMULATED_HARDWARE_VERSION.as_bytes().to_vec(),
            Characteristic::ModelColor => SIMULATED_COLOR.as_bytes().to_vec(),
            _ => Vec::new(),
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedTransport {
    fn establish_link(&mut self, address: &str) -> Result<LinkHandle> {
        self.record(TransportCall::EstablishLink(address.to_string()));
        if self.reject_links {
            return Err(TransportError::LinkRejected {
                address: address.to_string(),
            });
        }

        let link = LinkHandle(self.next_link);
        self.next_link += 1;
        self.remote.state().current_link = Some(link);
        debug!("Simulated link {} to {}", link, address);

        self.respond(TransportEvent::LinkStateChanged {
            link,
            state: LinkState::Connected,
            status: GattStatus::SUCCESS,
        });
        Ok(link)
    }

    fn disconnect(&mut self, link: LinkHandle) {
        self.record(TransportCall::Disconnect(link));
        let was_current = {
            let mut state = self.remote.state();
            if state.current_link == Some(link) {
                state.current_link = None;
                true
            } else {
                false
            }
        };
        if was_current {
            self.respond(TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Disconnected,
                status: GattStatus::SUCCESS,
            });
        }
    }

    fn close(&mut self, link: LinkHandle) {
        self.record(TransportCall::Close(link));
    }

    fn discover_services(&mut self, link: LinkHandle) -> Result<()> {
        self.record(TransportCall::DiscoverServices(link));
        self.check_link(link)?;
        self.respond(TransportEvent::ServicesDiscovered {
            link,
            status: GattStatus::SUCCESS,
            characteristics: self.characteristics.clone(),
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        link: LinkHandle,
        characteristic: Characteristic,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.record(TransportCall::Write {
            link,
            characteristic,
            value: value.to_vec(),
            mode,
        });
        self.check_link(link)?;
        self.check_characteristic(characteristic)?;

        if mode == WriteMode::WithResponse || self.acknowledge_unresponsive_writes {
            self.respond(TransportEvent::CharacteristicWriteComplete {
                link,
                characteristic,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        link: LinkHandle,
        characteristic: Characteristic,
    ) -> Result<()> {
        self.record(TransportCall::Read {
            link,
            characteristic,
        });
        self.check_link(link)?;
        self.check_characteristic(characteristic)?;

        self.respond(TransportEvent::CharacteristicReadComplete {
            link,
            characteristic,
            status: GattStatus::SUCCESS,
            value: Self::read_value(characteristic),
        });
        Ok(())
    }

    fn subscribe_notifications(
        &mut self,
        link: LinkHandle,
        characteristic: Characteristic,
        enable: bool,
    ) -> bool {
        self.record(TransportCall::Subscribe {
            link,
            characteristic,
            enable,
        });
        if self.check_link(link).is_err() || self.missing_descriptors.contains(&characteristic) {
            return false;
        }

        self.respond(TransportEvent::SubscriptionComplete {
            link,
            characteristic,
            status: GattStatus::SUCCESS,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_respond_link_and_services() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::with_auto_respond(tx);

        let link = transport.establish_link("AA:BB").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::LinkStateChanged {
                link,
                state: LinkState::Connected,
                status: GattStatus::SUCCESS,
            }
        );

        transport.discover_services(link).unwrap();
        match rx.try_recv().unwrap() {
            TransportEvent::ServicesDiscovered {
                characteristics, ..
            } => assert!(characteristics.contains(&Characteristic::LedMatrix)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_missing_descriptor_fails_subscription() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::with_auto_respond(tx)
            .without_descriptor(Characteristic::TouchSensor);
        let link = transport.establish_link("AA:BB").unwrap();
        let _ = rx.try_recv();

        assert!(!transport.subscribe_notifications(link, Characteristic::TouchSensor, true));
        assert!(rx.try_recv().is_err());
        assert!(transport.subscribe_notifications(link, Characteristic::ButtonSensor, true));
    }

    #[test]
    fn test_silent_unresponsive_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = SimulatedTransport::with_auto_respond(tx).silent_on_unresponsive_writes();
        let link = transport.establish_link("AA:BB").unwrap();
        let _ = rx.try_recv();

        transport
            .write_characteristic(link, Characteristic::LedMatrix, &[1], WriteMode::WithoutResponse)
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.remote().writes_to(Characteristic::LedMatrix), vec![vec![1]]);
    }

    #[test]
    fn test_stale_link_is_rejected() {
        let mut transport = SimulatedTransport::new();
        let link = transport.establish_link("AA:BB").unwrap();
        transport.disconnect(link);
        assert_eq!(
            transport.read_characteristic(link, Characteristic::Battery),
            Err(TransportError::UnknownLink(link))
        );
    }
}
