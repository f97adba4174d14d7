//! Session Driver
//!
//! Runs a [`ControllerSession`] on one task. Transport events, commands from
//! any number of [`SessionHandle`]s and work posted by the write queue are
//! all serialized through a single `select!` loop.

use crate::domain::led_matrix::LedMatrix;
use crate::domain::models::{ConnectionState, DisplayOptions};
use crate::infrastructure::transport::{Transport, TransportEvent};
use crate::session::controller::ControllerSession;
use crate::session::listener::{ControllerListener, Listeners};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Requests accepted by a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Connect,
    Disconnect,
    DisplayLedMatrix {
        matrix: LedMatrix,
        /// `None` uses the session's default interval
        display_interval_secs: Option<f64>,
        options: DisplayOptions,
    },
    RebootToDfu,
    CalibrateFly,
    /// Disconnect, wait for the link to go down, then leave the loop
    Shutdown,
}

/// Cloneable remote control for a session driven by [`ControllerSession::run`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    listeners: Listeners,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    /// Returns `false` once the session loop has ended
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn connect(&self) -> bool {
        self.send(SessionCommand::Connect)
    }

    pub fn disconnect(&self) -> bool {
        self.send(SessionCommand::Disconnect)
    }

    pub fn display_led_matrix(
        &self,
        matrix: LedMatrix,
        display_interval_secs: Option<f64>,
        options: DisplayOptions,
    ) -> bool {
        self.send(SessionCommand::DisplayLedMatrix {
            matrix,
            display_interval_secs,
            options,
        })
    }

    pub fn reboot_to_dfu(&self) -> bool {
        self.send(SessionCommand::RebootToDfu)
    }

    pub fn calibrate_fly(&self) -> bool {
        self.send(SessionCommand::CalibrateFly)
    }

    pub fn shutdown(&self) -> bool {
        self.send(SessionCommand::Shutdown)
    }

    pub fn add_listener(&self, listener: Arc<dyn ControllerListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ControllerListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `state`. Returns `false` if the session is gone.
    pub async fn wait_for_state(&mut self, state: ConnectionState) -> bool {
        self.state.wait_for(|current| *current == state).await.is_ok()
    }
}

impl<T: Transport> ControllerSession<T> {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
            listeners: self.listeners(),
            state: self.watch_state(),
        }
    }

    /// Drive the session until `events` closes or a shutdown completes.
    ///
    /// Returns the session so callers can inspect its final state.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        let (Some(mut mailbox), Some(mut commands)) =
            (self.mailbox_rx.take(), self.commands_rx.take())
        else {
            warn!("Session for {} is already running", self.address());
            return self;
        };

        info!("Session loop for {} started", self.address());
        let mut shutting_down = false;

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    debug!("Session command {:?}", command);
                    if command == SessionCommand::Shutdown {
                        shutting_down = true;
                    }
                    self.apply(command);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        info!("Transport event stream closed");
                        break;
                    }
                },
                Some(envelope) = mailbox.recv() => self.handle_posted(envelope),
            }

            if shutting_down && self.connection_state() == ConnectionState::Disconnected {
                break;
            }
        }

        info!("Session loop for {} stopped", self.address());
        self.mailbox_rx = Some(mailbox);
        self.commands_rx = Some(commands);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ControllerEvent;
    use crate::domain::settings::SessionSettings;
    use crate::infrastructure::transport::SimulatedTransport;
    use crate::session::listener::ChannelListener;

    fn spawn_session() -> (
        SessionHandle,
        mpsc::UnboundedReceiver<ControllerEvent>,
        tokio::task::JoinHandle<ControllerSession<SimulatedTransport>>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::with_auto_respond(events_tx);
        let session = ControllerSession::new("C4:D7:00:00:00:02", transport, SessionSettings::default());
        let handle = session.handle();
        let (listener, events) = ChannelListener::channel();
        handle.add_listener(listener);
        (handle, events, tokio::spawn(session.run(events_rx)))
    }

    #[tokio::test]
    async fn test_connect_and_shutdown_through_handle() {
        let (mut handle, mut events, task) = spawn_session();

        assert!(handle.connect());
        assert!(handle.wait_for_state(ConnectionState::Connected).await);
        assert_eq!(events.recv().await, Some(ControllerEvent::Connected));

        assert!(handle.shutdown());
        let session = task.await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if event == ControllerEvent::Disconnected {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_led_matrix_write_through_handle() {
        let (mut handle, mut events, task) = spawn_session();
        handle.connect();
        handle.wait_for_state(ConnectionState::Connected).await;

        handle.display_led_matrix(LedMatrix::all_on(), None, DisplayOptions::NONE);
        loop {
            match events.recv().await {
                Some(ControllerEvent::LedMatrixWritten) => break,
                Some(_) => continue,
                None => panic!("listener channel closed"),
            }
        }

        handle.shutdown();
        let session = task.await.unwrap();
        let writes = session
            .transport()
            .remote()
            .writes_to(crate::domain::models::Characteristic::LedMatrix);
        assert_eq!(writes.len(), 1);
        assert_eq!(&writes[0][..11], &LedMatrix::all_on().encode());
    }
}
