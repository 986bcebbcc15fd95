//! Nanosecond ledger of when an invocation reached each lifecycle phase.
//!
//! Consumer side:
//!
//! ```text
//! start -> create -> handlers-request -> filters-request -> get-connection
//!       -> send -> write-to-buffer -> receive-response -> filters-response
//!       -> handlers-response -> finish
//! ```
//!
//! Provider side:
//!
//! ```text
//! start -> schedule -> execution -> create -> handlers-request
//!       -> business-method -> handlers-response -> send-response -> finish
//! ```
//!
//! An edge invocation records the union of both. Every instant is written by
//! the pipeline's own call sequence, at most once per phase; writing a phase
//! twice is a caller bug and simply overwrites the earlier value.

use std::fmt;
use std::sync::Arc;

use crate::clock::{MonotonicClock, NanoClock};

/// Value returned by duration accessors when either instant is unset.
pub const NOT_REACHED: f64 = f64::NAN;

/// Stage labels, as reported by [`StageTrace::stages`].
pub mod stage {
    pub const PREPARE: &str = "prepare";
    pub const QUEUE: &str = "queue";
    pub const HANDLERS_REQUEST: &str = "handlers-request";
    pub const CONNECTION: &str = "connection";
    pub const WRITE: &str = "write";
    pub const WAIT: &str = "wait";
    pub const BUSINESS: &str = "business";
    pub const FILTERS_RESPONSE: &str = "filters-response";
    pub const HANDLERS_RESPONSE: &str = "handlers-response";
    pub const SEND_RESPONSE: &str = "send-response";
    pub const TOTAL: &str = "total";
}

/// Timestamp ledger for one invocation. `0` means "not reached".
#[derive(Clone)]
pub struct StageTrace {
    clock: Arc<dyn NanoClock>,
    start_millis: u64,
    start: u64,
    finish_create_invocation: u64,
    start_schedule: u64,
    start_execution: u64,
    start_handlers_request: u64,
    start_filters_request: u64,
    start_get_connection: u64,
    finish_get_connection: u64,
    start_send: u64,
    finish_write_to_buffer: u64,
    finish_receive_response: u64,
    start_business_method: u64,
    finish_business_method: u64,
    start_filters_response: u64,
    finish_filters_response: u64,
    finish_handlers_response: u64,
    start_send_response: u64,
    finish: u64,
}

impl fmt::Debug for StageTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StageTrace");
        s.field("start", &self.start);
        for (name, nanos) in self.stages() {
            if !nanos.is_nan() {
                s.field(name, &nanos);
            }
        }
        s.finish()
    }
}

impl Default for StageTrace {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock))
    }
}

/// Subtracts two instants, yielding [`NOT_REACHED`] if either is unset.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calc(finish: u64, start: u64) -> f64 {
    if finish == 0 || start == 0 {
        return NOT_REACHED;
    }
    finish.saturating_sub(start) as f64
}

macro_rules! instants {
    ($($(#[$doc:meta])* $field:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $field(&mut self) {
                self.$field = self.clock.nano_time();
            }
        )*
    };
}

impl StageTrace {
    /// Empty trace reading instants from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn NanoClock>) -> Self {
        Self {
            clock,
            start_millis: 0,
            start: 0,
            finish_create_invocation: 0,
            start_schedule: 0,
            start_execution: 0,
            start_handlers_request: 0,
            start_filters_request: 0,
            start_get_connection: 0,
            finish_get_connection: 0,
            start_send: 0,
            finish_write_to_buffer: 0,
            finish_receive_response: 0,
            start_business_method: 0,
            finish_business_method: 0,
            start_filters_response: 0,
            finish_filters_response: 0,
            finish_handlers_response: 0,
            start_send_response: 0,
            finish: 0,
        }
    }

    /// The clock all instants are read from.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn NanoClock> {
        &self.clock
    }

    /// Current reading of the trace's clock.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.nano_time()
    }

    /// Anchors the call start at `nanos` (e.g. when the inbound frame arrived),
    /// and records the wall-clock start.
    pub fn start(&mut self, nanos: u64) {
        self.start = nanos;
        self.start_millis = self.clock.millis_time();
    }

    instants! {
        finish_create_invocation,
        /// Provider: handed to the operation's executor.
        start_schedule,
        /// Provider: began running on the executor.
        start_execution,
        start_handlers_request,
        /// Consumer: request reached the transport filters.
        start_filters_request,
        start_get_connection,
        finish_get_connection,
        start_send,
        finish_write_to_buffer,
        finish_receive_response,
        start_business_method,
        finish_business_method,
        start_filters_response,
        finish_filters_response,
        finish_handlers_response,
        start_send_response,
        finish,
    }

    /// Records the queue-in instant taken before this trace existed.
    pub fn start_schedule_at(&mut self, nanos: u64) {
        self.start_schedule = nanos;
    }

    /// Records the executor start instant taken before this trace existed.
    pub fn start_execution_at(&mut self, nanos: u64) {
        self.start_execution = nanos;
    }

    /// Records when the transport's reader task saw the reply.
    pub fn finish_receive_response_at(&mut self, nanos: u64) {
        self.finish_receive_response = nanos;
    }

    /// Wall-clock start in Unix millis, `0` before [`start`](Self::start).
    #[must_use]
    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    /// Call start instant.
    #[must_use]
    pub fn start_nanos(&self) -> u64 {
        self.start
    }

    /// Call finish instant.
    #[must_use]
    pub fn finish_nanos(&self) -> u64 {
        self.finish
    }

    /// Instant the provider call was queued.
    #[must_use]
    pub fn start_schedule_nanos(&self) -> u64 {
        self.start_schedule
    }

    /// Instant the business method was entered.
    #[must_use]
    pub fn start_business_method_nanos(&self) -> u64 {
        self.start_business_method
    }

    /// Instant the business method returned.
    #[must_use]
    pub fn finish_business_method_nanos(&self) -> u64 {
        self.finish_business_method
    }

    /// Instant a connection was obtained.
    #[must_use]
    pub fn finish_get_connection_nanos(&self) -> u64 {
        self.finish_get_connection
    }

    /// Instant the request was queued for writing.
    #[must_use]
    pub fn finish_write_to_buffer_nanos(&self) -> u64 {
        self.finish_write_to_buffer
    }

    /// Instant the reply was read off the socket.
    #[must_use]
    pub fn finish_receive_response_nanos(&self) -> u64 {
        self.finish_receive_response
    }

    /// Instant reply decoding began.
    #[must_use]
    pub fn start_filters_response_nanos(&self) -> u64 {
        self.start_filters_response
    }

    /// Instant reply decoding ended.
    #[must_use]
    pub fn finish_filters_response_nanos(&self) -> u64 {
        self.finish_filters_response
    }

    /// Time spent building the record.
    #[must_use]
    pub fn calc_prepare(&self) -> f64 {
        calc(self.finish_create_invocation, self.start)
    }

    /// Time waiting on the executor queue.
    #[must_use]
    pub fn calc_queue(&self) -> f64 {
        calc(self.start_execution, self.start_schedule)
    }

    /// Time in handlers before the transport or business method.
    #[must_use]
    pub fn calc_handlers_request(&self) -> f64 {
        let end = if self.start_filters_request != 0 {
            self.start_filters_request
        } else {
            self.start_business_method
        };
        calc(end, self.start_handlers_request)
    }

    /// Time to obtain a connection.
    #[must_use]
    pub fn calc_get_connection(&self) -> f64 {
        calc(self.finish_get_connection, self.start_get_connection)
    }

    /// Time to encode and queue the request.
    #[must_use]
    pub fn calc_write(&self) -> f64 {
        calc(self.finish_write_to_buffer, self.start_send)
    }

    /// Time between queueing the request and reading the reply.
    #[must_use]
    pub fn calc_wait(&self) -> f64 {
        calc(self.finish_receive_response, self.finish_write_to_buffer)
    }

    /// Time inside the business method.
    #[must_use]
    pub fn calc_business(&self) -> f64 {
        calc(self.finish_business_method, self.start_business_method)
    }

    /// Time decoding the reply.
    #[must_use]
    pub fn calc_filters_response(&self) -> f64 {
        calc(self.finish_filters_response, self.start_filters_response)
    }

    /// Time in handlers after the reply or business method.
    #[must_use]
    pub fn calc_handlers_response(&self) -> f64 {
        let begin = if self.finish_filters_response != 0 {
            self.finish_filters_response
        } else {
            self.finish_business_method
        };
        calc(self.finish_handlers_response, begin)
    }

    /// Time to send the provider response.
    #[must_use]
    pub fn calc_send_response(&self) -> f64 {
        calc(self.finish, self.start_send_response)
    }

    /// Start to finish.
    #[must_use]
    pub fn calc_total(&self) -> f64 {
        calc(self.finish, self.start)
    }

    /// All derived durations in pipeline order, unset ones as [`NOT_REACHED`].
    #[must_use]
    pub fn stages(&self) -> [(&'static str, f64); 11] {
        [
            (stage::PREPARE, self.calc_prepare()),
            (stage::QUEUE, self.calc_queue()),
            (stage::HANDLERS_REQUEST, self.calc_handlers_request()),
            (stage::CONNECTION, self.calc_get_connection()),
            (stage::WRITE, self.calc_write()),
            (stage::WAIT, self.calc_wait()),
            (stage::BUSINESS, self.calc_business()),
            (stage::FILTERS_RESPONSE, self.calc_filters_response()),
            (stage::HANDLERS_RESPONSE, self.calc_handlers_response()),
            (stage::SEND_RESPONSE, self.calc_send_response()),
            (stage::TOTAL, self.calc_total()),
        ]
    }
}
