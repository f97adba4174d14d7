//! LED Matrix Writer
//!
//! Accepts display requests faster than the controller can render them. While
//! a write is in flight only the newest request is kept, so the device always
//! ends up on the most recent matrix instead of working through a backlog.
//!
//! Writes-without-response are fired immediately and counted. Some stacks never
//! confirm them, so a ticker checks the counter and gives up on it after a
//! timeout. Confirmations do not say which write they belong to: once a
//! write-without-response is in play the ticker keeps running until the
//! acknowledged write has cleared as well, so the shared queue cannot stay
//! occupied by a confirmation that was counted against the other mode.

use crate::domain::led_matrix::LedMatrix;
use crate::domain::models::{Characteristic, DisplayOptions};
use crate::domain::settings::SessionSettings;
use crate::infrastructure::transport::WriteMode;
use crate::session::write_queue::{Dispatcher, GattOperation, Posted, WriteQueue};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// What happened to a display request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Handed to the transport
    Written,
    /// Stashed until the in-flight write is acknowledged, replacing any older stash
    Coalesced,
    /// Identical to the matrix on display and its interval has not elapsed
    Suppressed,
}

#[derive(Debug, Clone, Copy)]
struct DisplayRequest {
    matrix: LedMatrix,
    display_interval_secs: f64,
    options: DisplayOptions,
}

#[derive(Debug, Clone, Copy)]
struct WrittenMatrix {
    matrix: LedMatrix,
    written_at: Instant,
    display_interval: Duration,
}

/// Ticker posting [`Posted::RecoveryTick`] to the session; stops when dropped
struct RecoveryTimer {
    task: JoinHandle<()>,
}

impl RecoveryTimer {
    fn start(dispatcher: Dispatcher, period: Duration) -> Option<Self> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No tokio runtime, write-without-response recovery disabled");
                return None;
            }
        };
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !dispatcher.post(Posted::RecoveryTick) {
                    break;
                }
            }
        });
        Some(Self { task })
    }
}

impl Drop for RecoveryTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct LedMatrixWriter {
    pending: Option<DisplayRequest>,
    last_written: Option<WrittenMatrix>,
    awaiting_response: bool,
    pending_without_response: u32,
    last_write_at: Option<Instant>,
    without_response_timeout: Duration,
    recovery_check_interval: Duration,
    recovery_timer: Option<RecoveryTimer>,
}

impl LedMatrixWriter {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            pending: None,
            last_written: None,
            awaiting_response: false,
            pending_without_response: 0,
            last_write_at: None,
            without_response_timeout: settings.write_without_response_timeout(),
            recovery_check_interval: settings.write_recovery_check_interval(),
            recovery_timer: None,
        }
    }

    /// Writes-without-response not yet confirmed
    pub fn pending_without_response(&self) -> u32 {
        self.pending_without_response
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_recovery_timer_running(&self) -> bool {
        self.recovery_timer.is_some()
    }

    pub fn write(
        &mut self,
        queue: &mut WriteQueue,
        matrix: LedMatrix,
        display_interval_secs: f64,
        options: DisplayOptions,
    ) -> WriteOutcome {
        let now = Instant::now();

        if !options.contains(DisplayOptions::RESEND_DUPLICATES) && self.is_on_display(&matrix, now) {
            // The newest request is what the device shows; an older stash must not replace it
            self.pending = None;
            trace!("Matrix already on display, request dropped");
            return WriteOutcome::Suppressed;
        }

        let request = DisplayRequest {
            matrix,
            display_interval_secs,
            options,
        };

        if options.contains(DisplayOptions::WITHOUT_WRITE_RESPONSE) || queue.is_idle() {
            // Anything stashed is older than this request
            if self.pending.take().is_some() {
                trace!("Stashed matrix superseded by a direct write");
            }
            self.write_now(queue, request, now);
            WriteOutcome::Written
        } else {
            if self.pending.replace(request).is_some() {
                trace!("Replaced stashed matrix with a newer one");
            }
            WriteOutcome::Coalesced
        }
    }

    /// The transport confirmed a write to the LED matrix characteristic.
    ///
    /// Returns `false` when no write of this writer was outstanding, e.g. a late
    /// confirmation after recovery already gave up on it.
    pub fn on_write_acknowledged(&mut self, queue: &mut WriteQueue) -> bool {
        if self.pending_without_response > 0 {
            self.pending_without_response -= 1;
        } else if self.awaiting_response {
            self.advance(queue);
        } else {
            debug!("Unexpected LED matrix write confirmation ignored");
            return false;
        }
        self.stop_recovery_when_settled();
        true
    }

    /// Write the stashed request if the queue has become idle
    pub fn flush_pending(&mut self, queue: &mut WriteQueue) {
        if !queue.is_idle() {
            return;
        }
        if let Some(request) = self.pending.take() {
            self.write_now(queue, request, Instant::now());
        }
    }

    /// Periodic check for LED writes that were never confirmed once a
    /// write-without-response has been issued.
    ///
    /// Returns `true` when the writer had to recover.
    pub fn on_recovery_tick(&mut self, queue: &mut WriteQueue, now: Instant) -> bool {
        if self.is_settled() {
            self.recovery_timer = None;
            return false;
        }
        let Some(issued_at) = self.last_write_at else {
            return false;
        };
        if now.duration_since(issued_at) <= self.without_response_timeout {
            return false;
        }

        warn!(
            "LED matrix writes unconfirmed after {:?} ({} without response, acknowledged write {}), resetting",
            self.without_response_timeout,
            self.pending_without_response,
            if self.awaiting_response { "pending" } else { "clear" }
        );
        self.pending_without_response = 0;
        self.recovery_timer = None;
        self.advance(queue);
        true
    }

    fn is_settled(&self) -> bool {
        self.pending_without_response == 0 && !self.awaiting_response
    }

    fn stop_recovery_when_settled(&mut self) {
        if self.is_settled() {
            self.recovery_timer = None;
        }
    }

    fn advance(&mut self, queue: &mut WriteQueue) {
        if self.awaiting_response {
            self.awaiting_response = false;
            queue.on_operation_acknowledged();
        }
        self.flush_pending(queue);
    }

    fn is_on_display(&self, matrix: &LedMatrix, now: Instant) -> bool {
        match &self.last_written {
            Some(last) => {
                last.matrix == *matrix && now.duration_since(last.written_at) < last.display_interval
            }
            None => false,
        }
    }

    fn write_now(&mut self, queue: &mut WriteQueue, request: DisplayRequest, now: Instant) {
        let fade_in = request.options.contains(DisplayOptions::WITH_FADE_IN);
        let value = request
            .matrix
            .gatt_payload(request.display_interval_secs, fade_in)
            .to_vec();

        self.last_written = Some(WrittenMatrix {
            matrix: request.matrix,
            written_at: now,
            display_interval: Duration::try_from_secs_f64(request.display_interval_secs)
                .unwrap_or(Duration::ZERO),
        });

        self.last_write_at = Some(now);

        if request.options.contains(DisplayOptions::WITHOUT_WRITE_RESPONSE) {
            self.pending_without_response += 1;
            queue.fire_and_forget(GattOperation::Write {
                characteristic: Characteristic::LedMatrix,
                value,
                mode: WriteMode::WithoutResponse,
            });
            if self.recovery_timer.is_none() {
                self.recovery_timer =
                    RecoveryTimer::start(queue.dispatcher().clone(), self.recovery_check_interval);
            }
        } else {
            self.awaiting_response = true;
            queue.push(GattOperation::Write {
                characteristic: Characteristic::LedMatrix,
                value,
                mode: WriteMode::WithResponse,
            });
        }
        trace!("Writing {:?}", request.matrix);
    }
}
