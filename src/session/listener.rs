//! Controller Listeners
//!
//! Callbacks through which a session reports everything observable. Every
//! method has a no-op default, implement only what you need.

use crate::domain::gestures::GestureEvent;
use crate::domain::models::{ControllerEvent, FailReason};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub trait ControllerListener: Send + Sync {
    fn on_connect(&self) {}
    fn on_fail_to_connect(&self, _reason: FailReason) {}
    fn on_disconnect(&self) {}
    fn on_led_matrix_write(&self) {}
    fn on_gesture_event(&self, _event: GestureEvent) {}
    fn on_battery_percentage_change(&self, _percentage: u8) {}
    fn on_information_read(
        &self,
        _hardware_version: Option<&str>,
        _firmware_version: Option<&str>,
        _color: Option<&str>,
    ) {
    }
}

/// Shared, cloneable listener registry.
///
/// Notification runs over a snapshot, so a callback may register or remove
/// listeners (including itself) while being notified.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<Vec<Arc<dyn ControllerListener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn ControllerListener>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, listener: Arc<dyn ControllerListener>) {
        self.lock().push(listener);
    }

    /// Remove a listener by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn ControllerListener>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn notify(&self, event: impl Fn(&dyn ControllerListener)) {
        let snapshot: Vec<_> = self.lock().clone();
        for listener in snapshot {
            event(listener.as_ref());
        }
    }
}

/// Forwards every callback into a channel as a [`ControllerEvent`]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<ControllerEvent>,
}

impl ChannelListener {
    pub fn new(sender: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self { sender }
    }

    /// Listener plus the receiving end of its channel
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }

    fn send(&self, event: ControllerEvent) {
        let _ = self.sender.send(event);
    }
}

impl ControllerListener for ChannelListener {
    fn on_connect(&self) {
        self.send(ControllerEvent::Connected);
    }

    fn on_fail_to_connect(&self, reason: FailReason) {
        self.send(ControllerEvent::FailedToConnect(reason));
    }

    fn on_disconnect(&self) {
        self.send(ControllerEvent::Disconnected);
    }

    fn on_led_matrix_write(&self) {
        self.send(ControllerEvent::LedMatrixWritten);
    }

    fn on_gesture_event(&self, event: GestureEvent) {
        self.send(ControllerEvent::Gesture(event));
    }

    fn on_battery_percentage_change(&self, percentage: u8) {
        self.send(ControllerEvent::BatteryPercentage(percentage));
    }

    fn on_information_read(
        &self,
        hardware_version: Option<&str>,
        firmware_version: Option<&str>,
        color: Option<&str>,
    ) {
        self.send(ControllerEvent::InformationRead {
            hardware_version: hardware_version.map(str::to_string),
            firmware_version: firmware_version.map(str::to_string),
            color: color.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        connects: AtomicUsize,
    }

    impl ControllerListener for Counter {
        fn on_connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Registers another counter the first time it is notified
    struct Spawner {
        listeners: Listeners,
        spawned: Arc<Counter>,
        done: AtomicUsize,
    }

    impl ControllerListener for Spawner {
        fn on_connect(&self) {
            if self.done.fetch_add(1, Ordering::SeqCst) == 0 {
                self.listeners.add(self.spawned.clone());
            }
        }
    }

    #[test]
    fn test_remove_by_identity() {
        let listeners = Listeners::new();
        let a: Arc<dyn ControllerListener> = Arc::new(Counter::default());
        let b: Arc<dyn ControllerListener> = Arc::new(Counter::default());
        listeners.add(a.clone());
        listeners.add(b.clone());

        assert!(listeners.remove(&a));
        assert!(!listeners.remove(&a));
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_listener_may_register_while_notified() {
        let listeners = Listeners::new();
        let spawned = Arc::new(Counter::default());
        listeners.add(Arc::new(Spawner {
            listeners: listeners.clone(),
            spawned: spawned.clone(),
            done: AtomicUsize::new(0),
        }));

        listeners.notify(|l| l.on_connect());
        assert_eq!(spawned.connects.load(Ordering::SeqCst), 0);
        assert_eq!(listeners.len(), 2);

        listeners.notify(|l| l.on_connect());
        assert_eq!(spawned.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_listener_forwards_events() {
        let (listener, mut rx) = ChannelListener::channel();
        listener.on_battery_percentage_change(42);
        listener.on_information_read(Some("1.1"), None, Some("white"));

        assert_eq!(rx.try_recv().unwrap(), ControllerEvent::BatteryPercentage(42));
        assert_eq!(
            rx.try_recv().unwrap(),
            ControllerEvent::InformationRead {
                hardware_version: Some("1.1".to_string()),
                firmware_version: None,
                color: Some("white".to_string()),
            }
        );
    }
}
