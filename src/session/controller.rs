//! Controller Session
//!
//! Connection state machine for one controller address. Drives the transport
//! through connect, service discovery and notification setup, routes write and
//! read confirmations, and reports everything to the registered listeners.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──subscriptions done──▶ Connected
//!      ▲                          │                                  │
//!      │                      link lost                       disconnect()
//!      │                  (fail to connect)                          ▼
//!      └─────────────────────── link lost ◀──────────────── Disconnecting
//! ```
//!
//! The session never blocks and never returns errors: failures become state
//! transitions plus listener callbacks.

use crate::domain::gestures::{self, GestureEvent};
use crate::domain::led_matrix::LedMatrix;
use crate::domain::models::{
    Characteristic, ConnectionState, DeviceInformation, DisplayOptions, FailReason,
};
use crate::domain::settings::SessionSettings;
use crate::infrastructure::transport::{
    GattStatus, LinkHandle, LinkState, Transport, TransportEvent, WriteMode,
};
use crate::session::driver::SessionCommand;
use crate::session::listener::{ControllerListener, Listeners};
use crate::session::matrix_writer::{LedMatrixWriter, WriteOutcome};
use crate::session::write_queue::{Dispatcher, Envelope, GattOperation, Posted, WriteQueue};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Value written to the command characteristics to trigger them
const COMMAND_TRIGGER: [u8; 1] = [0x01];

pub struct ControllerSession<T: Transport> {
    address: String,
    transport: T,
    settings: SessionSettings,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    link: Option<LinkHandle>,
    /// Link being torn down after `disconnect()`
    closing_link: Option<LinkHandle>,
    /// Set once all subscriptions of the current connection are confirmed
    services_ready: bool,
    failure: Option<FailReason>,
    generation: u64,
    pub(crate) mailbox_tx: mpsc::UnboundedSender<Envelope>,
    pub(crate) mailbox_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    pub(crate) commands_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) commands_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,
    write_queue: WriteQueue,
    matrix_writer: Option<LedMatrixWriter>,
    characteristics: Vec<Characteristic>,
    pending_information_reads: HashSet<Characteristic>,
    information: DeviceInformation,
    listeners: Listeners,
    default_matrix_display_interval: f64,
}

impl<T: Transport> ControllerSession<T> {
    pub fn new(address: impl Into<String>, transport: T, settings: SessionSettings) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let generation = 0;

        Self {
            address: address.into(),
            transport,
            default_matrix_display_interval: settings.default_matrix_display_interval_secs,
            settings,
            state: ConnectionState::Disconnected,
            state_tx,
            link: None,
            closing_link: None,
            services_ready: false,
            failure: None,
            generation,
            write_queue: WriteQueue::new(Dispatcher::new(mailbox_tx.clone(), generation)),
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            commands_tx,
            commands_rx: Some(commands_rx),
            matrix_writer: None,
            characteristics: Vec::new(),
            pending_information_reads: HashSet::new(),
            information: DeviceInformation::default(),
            listeners: Listeners::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Receiver following every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn battery_percentage(&self) -> Option<u8> {
        self.information.battery_percentage
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.information.firmware_version.as_deref()
    }

    pub fn hardware_version(&self) -> Option<&str> {
        self.information.hardware_version.as_deref()
    }

    pub fn color(&self) -> Option<&str> {
        self.information.color.as_deref()
    }

    /// Writes-without-response still waiting for confirmation
    pub fn pending_unacknowledged_writes(&self) -> u32 {
        self.matrix_writer
            .as_ref()
            .map_or(0, LedMatrixWriter::pending_without_response)
    }

    /// Whether the recovery ticker for unconfirmed LED writes is alive
    pub fn is_write_recovery_running(&self) -> bool {
        self.matrix_writer
            .as_ref()
            .is_some_and(LedMatrixWriter::is_recovery_timer_running)
    }

    pub fn device_information(&self) -> &DeviceInformation {
        &self.information
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn default_matrix_display_interval(&self) -> f64 {
        self.default_matrix_display_interval
    }

    pub fn set_default_matrix_display_interval(&mut self, seconds: f64) {
        self.default_matrix_display_interval = seconds;
    }

    /// Shared registry, usable from listener callbacks
    pub fn listeners(&self) -> Listeners {
        self.listeners.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ControllerListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ControllerListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!("connect() ignored while {:?}", self.state);
            return;
        }

        info!("Connecting to controller {}", self.address);
        self.reset();
        self.failure = None;
        self.information = DeviceInformation::default();
        self.set_state(ConnectionState::Connecting);

        match self.transport.establish_link(&self.address) {
            Ok(link) => self.link = Some(link),
            Err(e) => {
                warn!("Link request to {} failed: {}", self.address, e);
                self.set_state(ConnectionState::Disconnected);
                self.listeners
                    .notify(|l| l.on_fail_to_connect(FailReason::GattError));
            }
        }
    }

    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        info!("Disconnecting from controller {}", self.address);
        self.set_state(ConnectionState::Disconnecting);

        if let Some(link) = self.link.take() {
            self.closing_link = Some(link);
            self.transport.disconnect(link);
        } else if self.closing_link.is_none() {
            // No link will ever report back, finish the teardown here
            self.reset();
            self.on_link_lost(None);
            return;
        }

        self.reset();
    }

    /// Show `matrix` for `display_interval_secs`. Does nothing until services are discovered.
    pub fn display_led_matrix(
        &mut self,
        matrix: LedMatrix,
        display_interval_secs: f64,
        options: DisplayOptions,
    ) -> Option<WriteOutcome> {
        let Some(writer) = self.matrix_writer.as_mut() else {
            debug!("No LED matrix writer yet, matrix dropped");
            return None;
        };
        Some(writer.write(&mut self.write_queue, matrix, display_interval_secs, options))
    }

    /// Show `matrix` for the default interval without options
    pub fn display_led_matrix_default(&mut self, matrix: LedMatrix) -> Option<WriteOutcome> {
        let interval = self.default_matrix_display_interval;
        self.display_led_matrix(matrix, interval, DisplayOptions::NONE)
    }

    /// Restart the controller into its firmware update mode
    pub fn reboot_to_dfu(&mut self) -> bool {
        self.write_command(Characteristic::RebootToDfu)
    }

    /// Start calibrating the fly sensor
    pub fn calibrate_fly(&mut self) -> bool {
        self.write_command(Characteristic::FlyCalibration)
    }

    fn write_command(&mut self, characteristic: Characteristic) -> bool {
        if self.state != ConnectionState::Connected || !self.characteristics.contains(&characteristic)
        {
            debug!("{} unavailable while {:?}", characteristic, self.state);
            return false;
        }
        self.write_queue.push(GattOperation::Write {
            characteristic,
            value: COMMAND_TRIGGER.to_vec(),
            mode: WriteMode::WithResponse,
        });
        true
    }

    /// Run everything posted to the session so far. Returns how many items ran.
    ///
    /// Not needed when the session is driven by [`ControllerSession::run`].
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let Some(mailbox) = self.mailbox_rx.as_mut() else {
                break;
            };
            let Ok(envelope) = mailbox.try_recv() else {
                break;
            };
            processed += 1;
            self.handle_posted(envelope);
        }
        processed
    }

    pub(crate) fn handle_posted(&mut self, envelope: Envelope) {
        if envelope.generation != self.generation {
            trace!("Discarding {:?} from an old connection", envelope.posted);
            return;
        }
        match envelope.posted {
            Posted::Operation(operation) => self.execute(operation),
            Posted::RecoveryTick => {
                if let Some(writer) = self.matrix_writer.as_mut() {
                    writer.on_recovery_tick(&mut self.write_queue, Instant::now());
                }
            }
        }
    }

    fn execute(&mut self, operation: GattOperation) {
        let Some(link) = self.link else {
            trace!("No link, dropping {:?}", operation);
            return;
        };

        let result = match operation {
            GattOperation::Subscribe(characteristic) => {
                if !self
                    .transport
                    .subscribe_notifications(link, characteristic, true)
                {
                    warn!("{} has no notification descriptor", characteristic);
                    self.abort(FailReason::MissingNotificationDescriptor(characteristic));
                }
                return;
            }
            GattOperation::Write {
                characteristic,
                value,
                mode,
            } => self
                .transport
                .write_characteristic(link, characteristic, &value, mode),
            GattOperation::Read(characteristic) => {
                self.transport.read_characteristic(link, characteristic)
            }
        };

        if let Err(e) = result {
            warn!("Transport request failed: {}", e);
            self.abort(FailReason::GattError);
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if let TransportEvent::LinkStateChanged {
            link,
            state: LinkState::Disconnected,
            status,
        } = event
        {
            self.on_link_down(link, status);
            return;
        }

        if self.link != Some(event.link()) {
            self.on_stale_event(event);
            return;
        }

        match event {
            TransportEvent::LinkStateChanged { status, .. } => self.on_link_up(status),
            TransportEvent::ServicesDiscovered {
                status,
                characteristics,
                ..
            } => self.on_services_discovered(status, characteristics),
            TransportEvent::SubscriptionComplete {
                characteristic,
                status,
                ..
            } => self.on_subscription_complete(characteristic, status),
            TransportEvent::CharacteristicWriteComplete {
                characteristic,
                status,
                ..
            } => self.on_write_complete(characteristic, status),
            TransportEvent::CharacteristicReadComplete {
                characteristic,
                status,
                value,
                ..
            } => self.on_read_complete(characteristic, status, &value),
            TransportEvent::Notification {
                characteristic,
                value,
                ..
            } => self.on_notification(characteristic, &value),
        }
    }

    fn on_stale_event(&mut self, event: TransportEvent) {
        trace!("Ignoring event for stale link: {:?}", event);
        if let TransportEvent::LinkStateChanged {
            link,
            state: LinkState::Connected,
            ..
        } = event
        {
            if self.closing_link != Some(link) {
                self.transport.disconnect(link);
            }
        }
    }

    fn on_link_up(&mut self, status: GattStatus) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        if !status.is_success() {
            warn!("Link came up with status {}", status);
            self.abort(FailReason::GattError);
            return;
        }

        debug!("Link to {} established, discovering services", self.address);
        if let Some(link) = self.link {
            if let Err(e) = self.transport.discover_services(link) {
                warn!("Service discovery failed: {}", e);
                self.abort(FailReason::GattError);
            }
        }
    }

    fn on_link_down(&mut self, link: LinkHandle, status: GattStatus) {
        self.transport.close(link);
        if self.link != Some(link) && self.closing_link != Some(link) {
            trace!("Stale link {} closed", link);
            return;
        }
        if !status.is_success() {
            info!("Link {} lost with status {}", link, status);
        }
        self.link = None;
        self.closing_link = None;
        self.reset();
        self.on_link_lost(Some(link));
    }

    fn on_link_lost(&mut self, link: Option<LinkHandle>) {
        let previous = self.state;
        self.set_state(ConnectionState::Disconnected);
        let failure = self.failure.take();

        // A failure is only recorded while connecting, so it marks an aborted attempt
        let failure = match previous {
            ConnectionState::Connecting => {
                Some(failure.unwrap_or(FailReason::ConnectionNotEstablished))
            }
            ConnectionState::Disconnecting => failure,
            ConnectionState::Connected => None,
            ConnectionState::Disconnected => return,
        };

        match failure {
            Some(reason) => {
                info!("Failed to connect to {}: {}", self.address, reason);
                self.listeners.notify(|l| l.on_fail_to_connect(reason));
            }
            None => {
                info!("Disconnected from {} (link {:?})", self.address, link);
                self.listeners.notify(|l| l.on_disconnect());
            }
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus, characteristics: Vec<Characteristic>) {
        if self.state != ConnectionState::Connecting || self.services_ready {
            return;
        }
        if !status.is_success() {
            warn!("Service discovery returned status {}", status);
            self.abort(FailReason::GattError);
            return;
        }

        debug!("Discovered {} characteristics", characteristics.len());
        for characteristic in &characteristics {
            if *characteristic == Characteristic::LedMatrix {
                self.matrix_writer = Some(LedMatrixWriter::new(&self.settings));
            } else if characteristic.is_notification_source() {
                self.write_queue
                    .push(GattOperation::Subscribe(*characteristic));
            }
        }
        self.characteristics = characteristics;

        if self.write_queue.is_idle() {
            self.promote_to_connected();
        }
    }

    fn on_subscription_complete(&mut self, characteristic: Characteristic, status: GattStatus) {
        if !status.is_success() {
            warn!("Subscribing to {} failed with status {}", characteristic, status);
            self.abort(FailReason::GattError);
            return;
        }
        trace!("Subscribed to {}", characteristic);

        if !self.write_queue.on_operation_acknowledged() && !self.services_ready {
            self.promote_to_connected();
        } else {
            self.flush_matrix_writer();
        }
    }

    fn promote_to_connected(&mut self) {
        self.services_ready = true;
        self.set_state(ConnectionState::Connected);
        info!("Connected to controller {}", self.address);

        if self.settings.read_device_information {
            for characteristic in Characteristic::DEVICE_INFORMATION {
                if self.characteristics.contains(&characteristic) {
                    self.pending_information_reads.insert(characteristic);
                    self.write_queue.push(GattOperation::Read(characteristic));
                }
            }
        }

        self.listeners.notify(|l| l.on_connect());
    }

    fn on_write_complete(&mut self, characteristic: Characteristic, status: GattStatus) {
        match characteristic {
            Characteristic::LedMatrix => {
                let acknowledged = match self.matrix_writer.as_mut() {
                    Some(writer) => writer.on_write_acknowledged(&mut self.write_queue),
                    None => false,
                };
                if status.is_success() && acknowledged {
                    self.listeners.notify(|l| l.on_led_matrix_write());
                }
            }
            _ => {
                self.write_queue.on_operation_acknowledged();
                self.flush_matrix_writer();
            }
        }

        if !status.is_success() {
            warn!("Write to {} failed with status {}", characteristic, status);
            self.disconnect();
        }
    }

    fn on_read_complete(&mut self, characteristic: Characteristic, status: GattStatus, value: &[u8]) {
        self.write_queue.on_operation_acknowledged();

        if !status.is_success() {
            warn!("Read of {} failed with status {}", characteristic, status);
            self.disconnect();
            return;
        }

        match characteristic {
            Characteristic::Battery => self.update_battery(value),
            Characteristic::FirmwareVersion => {
                self.information.firmware_version = Some(decode_text(value))
            }
            Characteristic::HardwareVersion => {
                self.information.hardware_version = Some(decode_text(value))
            }
            Characteristic::ModelColor => self.information.color = Some(decode_text(value)),
            _ => {}
        }

        if self.pending_information_reads.remove(&characteristic)
            && self.pending_information_reads.is_empty()
        {
            let information = self.information.clone();
            debug!("Device information read: {:?}", information);
            self.listeners.notify(|l| {
                l.on_information_read(
                    information.hardware_version.as_deref(),
                    information.firmware_version.as_deref(),
                    information.color.as_deref(),
                )
            });
        }

        self.flush_matrix_writer();
    }

    fn on_notification(&mut self, characteristic: Characteristic, value: &[u8]) {
        if characteristic == Characteristic::Battery {
            self.update_battery(value);
            return;
        }
        if let Some(event) = gestures::decode(characteristic, value) {
            trace!("Gesture {:?}", event);
            self.emit_gesture(event);
        }
    }

    fn emit_gesture(&self, event: GestureEvent) {
        self.listeners.notify(|l| l.on_gesture_event(event));
    }

    fn update_battery(&mut self, value: &[u8]) {
        let Some(percentage) = value.first().copied() else {
            return;
        };
        self.information.battery_percentage = Some(percentage);
        self.listeners
            .notify(|l| l.on_battery_percentage_change(percentage));
    }

    fn flush_matrix_writer(&mut self) {
        if let Some(writer) = self.matrix_writer.as_mut() {
            writer.flush_pending(&mut self.write_queue);
        }
    }

    /// Connection-fatal error: remember why, then tear down
    fn abort(&mut self, reason: FailReason) {
        if self.state == ConnectionState::Connecting && self.failure.is_none() {
            self.failure = Some(reason);
        }
        self.disconnect();
    }

    /// Forget everything bound to the current connection
    fn reset(&mut self) {
        self.write_queue.clear();
        self.generation += 1;
        self.write_queue = WriteQueue::new(Dispatcher::new(self.mailbox_tx.clone(), self.generation));
        self.matrix_writer = None;
        self.characteristics.clear();
        self.services_ready = false;
        self.pending_information_reads.clear();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{}: {:?} -> {:?}", self.address, self.state, state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    pub(crate) fn apply(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect => self.connect(),
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::DisplayLedMatrix {
                matrix,
                display_interval_secs,
                options,
            } => {
                let interval = display_interval_secs.unwrap_or(self.default_matrix_display_interval);
                self.display_led_matrix(matrix, interval, options);
            }
            SessionCommand::RebootToDfu => {
                self.reboot_to_dfu();
            }
            SessionCommand::CalibrateFly => {
                self.calibrate_fly();
            }
            SessionCommand::Shutdown => self.disconnect(),
        }
    }
}

fn decode_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::{SimulatedTransport, TransportCall};
    use crate::session::listener::ChannelListener;
    use crate::domain::models::ControllerEvent;

    const ADDRESS: &str = "C4:D7:00:00:00:01";

    fn session() -> (
        ControllerSession<SimulatedTransport>,
        mpsc::UnboundedReceiver<ControllerEvent>,
    ) {
        let session = ControllerSession::new(ADDRESS, SimulatedTransport::new(), SessionSettings::default());
        let (listener, events) = ChannelListener::channel();
        session.add_listener(listener);
        (session, events)
    }

    fn link(session: &ControllerSession<SimulatedTransport>) -> LinkHandle {
        session.link.expect("link requested")
    }

    #[test]
    fn test_connect_is_synchronous_and_idempotent() {
        let (mut session, _events) = session();
        session.connect();
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        session.connect();

        let requests = session
            .transport()
            .remote()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::EstablishLink(_)))
            .count();
        assert_eq!(requests, 1);
    }

    #[test]
    fn test_rejected_link_fails_immediately() {
        let transport = SimulatedTransport::new().rejecting_links();
        let mut session = ControllerSession::new(ADDRESS, transport, SessionSettings::default());
        let (listener, mut events) = ChannelListener::channel();
        session.add_listener(listener);

        session.connect();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            events.try_recv().unwrap(),
            ControllerEvent::FailedToConnect(FailReason::GattError)
        );
    }

    #[test]
    fn test_disconnect_without_link_finishes_locally() {
        let (mut session, mut events) = session();
        session.connect();
        session.link = None;

        session.disconnect();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(events.try_recv().unwrap(), ControllerEvent::Disconnected);
    }

    #[test]
    fn test_posts_from_old_connection_are_discarded() {
        let (mut session, _events) = session();
        session.connect();
        let old = session.write_queue.dispatcher().clone();
        session.disconnect();

        old.post(Posted::Operation(GattOperation::Read(Characteristic::Battery)));
        session.process_pending();
        let reads = session
            .transport()
            .remote()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Read { .. }))
            .count();
        assert_eq!(reads, 0);
    }

    #[test]
    fn test_stale_link_up_is_torn_down() {
        let (mut session, _events) = session();
        session.connect();
        let current = link(&session);
        let stale = LinkHandle(current.0 + 40);

        session.handle_transport_event(TransportEvent::LinkStateChanged {
            link: stale,
            state: LinkState::Connected,
            status: GattStatus::SUCCESS,
        });
        assert!(session
            .transport()
            .remote()
            .calls()
            .contains(&TransportCall::Disconnect(stale)));
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_decode_text_trims_padding() {
        assert_eq!(decode_text(b"2.5.1\0\0"), "2.5.1");
        assert_eq!(decode_text(b" black "), "black");
    }
}
