//! Write Queue
//!
//! GATT allows a single outstanding request per link. Every write, read and
//! subscription goes through this queue; the next one is dispatched only when
//! the previous one has been acknowledged.

use crate::domain::models::Characteristic;
use crate::infrastructure::transport::WriteMode;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::trace;

/// A request against the device, executed by the session when dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOperation {
    Subscribe(Characteristic),
    Write {
        characteristic: Characteristic,
        value: Vec<u8>,
        mode: WriteMode,
    },
    Read(Characteristic),
}

/// Work posted to the session's execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posted {
    Operation(GattOperation),
    /// Periodic check for stuck writes-without-response
    RecoveryTick,
}

/// Posted work tagged with the connection generation it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub generation: u64,
    pub posted: Posted,
}

/// Posts work to the session mailbox for one connection generation
#[derive(Debug, Clone)]
pub struct Dispatcher {
    mailbox: mpsc::UnboundedSender<Envelope>,
    generation: u64,
}

impl Dispatcher {
    pub fn new(mailbox: mpsc::UnboundedSender<Envelope>, generation: u64) -> Self {
        Self {
            mailbox,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session is gone
    pub fn post(&self, posted: Posted) -> bool {
        self.mailbox
            .send(Envelope {
                generation: self.generation,
                posted,
            })
            .is_ok()
    }
}

pub struct WriteQueue {
    dispatcher: Dispatcher,
    pending: VecDeque<GattOperation>,
    idle: bool,
}

impl WriteQueue {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            pending: VecDeque::new(),
            idle: true,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Operations waiting behind the one in flight
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatch `operation` now if idle, otherwise append it
    pub fn push(&mut self, operation: GattOperation) {
        if self.idle {
            self.idle = false;
            self.dispatch(operation);
        } else {
            trace!("Queueing {:?} behind {} pending", operation, self.pending.len());
            self.pending.push_back(operation);
        }
    }

    /// Post an operation that bypasses ordering and never occupies the queue
    pub fn fire_and_forget(&mut self, operation: GattOperation) {
        self.dispatch(operation);
    }

    /// The in-flight operation completed. Returns whether another one is now in flight.
    pub fn on_operation_acknowledged(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(operation) => self.dispatch(operation),
            None => self.idle = true,
        }
        !self.idle
    }

    /// Drop everything pending and become idle
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            trace!("Dropping {} pending operations", self.pending.len());
        }
        self.pending.clear();
        self.idle = true;
    }

    fn dispatch(&self, operation: GattOperation) {
        if !self.dispatcher.post(Posted::Operation(operation)) {
            trace!("Session mailbox closed, operation dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (WriteQueue, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WriteQueue::new(Dispatcher::new(tx, 7)), rx)
    }

    fn read(characteristic: Characteristic) -> GattOperation {
        GattOperation::Read(characteristic)
    }

    fn next_operation(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Option<GattOperation> {
        match rx.try_recv().ok()?.posted {
            Posted::Operation(operation) => Some(operation),
            Posted::RecoveryTick => None,
        }
    }

    #[test]
    fn test_dispatches_one_at_a_time_in_order() {
        let (mut queue, mut rx) = queue();
        queue.push(read(Characteristic::Battery));
        queue.push(read(Characteristic::FirmwareVersion));
        queue.push(read(Characteristic::HardwareVersion));

        assert!(!queue.is_idle());
        assert_eq!(queue.len(), 2);
        assert_eq!(next_operation(&mut rx), Some(read(Characteristic::Battery)));
        assert!(rx.try_recv().is_err());

        assert!(queue.on_operation_acknowledged());
        assert_eq!(next_operation(&mut rx), Some(read(Characteristic::FirmwareVersion)));
        assert!(queue.on_operation_acknowledged());
        assert_eq!(next_operation(&mut rx), Some(read(Characteristic::HardwareVersion)));
        assert!(!queue.on_operation_acknowledged());
        assert!(queue.is_idle());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_never_runs_inline() {
        let (mut queue, mut rx) = queue();
        queue.push(read(Characteristic::Battery));
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.generation, 7);
        assert_eq!(envelope.posted, Posted::Operation(read(Characteristic::Battery)));
    }

    #[test]
    fn test_clear_makes_queue_idle() {
        let (mut queue, mut rx) = queue();
        queue.push(read(Characteristic::Battery));
        queue.push(read(Characteristic::ModelColor));
        queue.clear();

        assert!(queue.is_idle());
        assert!(!queue.on_operation_acknowledged());
        let _ = rx.try_recv();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fire_and_forget_keeps_queue_idle() {
        let (mut queue, mut rx) = queue();
        queue.fire_and_forget(read(Characteristic::Battery));
        assert!(queue.is_idle());
        assert_eq!(next_operation(&mut rx), Some(read(Characteristic::Battery)));
    }
}
