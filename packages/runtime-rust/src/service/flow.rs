//! Invocation flow orchestration.
//!
//! Drives one invocation through its full lifecycle:
//!
//! - **Provider**: create the record, anchor its stage trace at frame arrival,
//!   run the provider chain, send exactly one response, publish metrics.
//! - **Consumer**: anchor at call time, run the consumer chain keyed by the
//!   target microservice, hand the response back to the caller.
//!
//! Both paths are fail-safe: a failure at any step becomes a failure
//! [`Response`] and the flow still completes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use tramline_core::context::keys;
use tramline_core::{Invocation, InvocationError, Response};

use super::handler::{ChainKind, HandlerChainRegistry};
use super::metrics::InvocationMetrics;
use super::timeout::TimeoutGuard;

// ---------------------------------------------------------------------------
// ResponseSender
// ---------------------------------------------------------------------------

/// Delivers a provider response back to the caller.
///
/// `invocation` is `None` when the record could not be created.
#[async_trait]
pub trait ResponseSender: Send {
    /// # Errors
    ///
    /// Returns an error if the response could not be encoded or written.
    async fn send_response(
        &mut self,
        invocation: Option<&Invocation>,
        response: &Response,
    ) -> anyhow::Result<()>;
}

/// Instants recorded by the front end before the record existed. `0` means
/// the phase did not happen (e.g. a reactive executor never queues).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartTimes {
    pub received: u64,
    pub scheduled: u64,
    pub executed: u64,
}

// ---------------------------------------------------------------------------
// InvocationFlow
// ---------------------------------------------------------------------------

/// Orchestrates provider and consumer invocations.
pub struct InvocationFlow {
    microservice: String,
    guard: Arc<TimeoutGuard>,
    chains: Arc<HandlerChainRegistry>,
    metrics: InvocationMetrics,
}

fn ensure_trace_id(invocation: &mut Invocation) {
    if invocation.trace_id().map_or(true, str::is_empty) {
        let id = uuid::Uuid::new_v4().simple().to_string();
        invocation.add_context(keys::TRACE_ID, id);
    }
}

impl InvocationFlow {
    #[must_use]
    pub fn new(
        microservice: impl Into<String>,
        guard: Arc<TimeoutGuard>,
        chains: Arc<HandlerChainRegistry>,
        metrics: InvocationMetrics,
    ) -> Self {
        Self {
            microservice: microservice.into(),
            guard,
            chains,
            metrics,
        }
    }

    async fn run_chain(&self, invocation: &mut Invocation, key: &str, kind: ChainKind) -> Response {
        match self.chains.resolve(key, kind) {
            Some(chain) => chain.run(invocation).await,
            None => Response::failure(InvocationError::producer_fail(format!(
                "no {kind:?} handler chain for {key}"
            ))),
        }
    }

    fn finish_guarded(&self, invocation: &mut Invocation, response: Response) -> Response {
        match self.guard.finish(invocation) {
            Ok(()) => response,
            Err(timeout) => Response::failure(timeout),
        }
    }

    /// Runs an inbound request to completion and sends its response.
    ///
    /// `create` builds the record; a failure there is still answered.
    pub async fn run_provider<F, S>(&self, times: StartTimes, create: F, sender: &mut S)
    where
        F: FnOnce() -> Result<Invocation, InvocationError> + Send,
        S: ResponseSender + ?Sized,
    {
        let mut invocation = match create() {
            Ok(invocation) => invocation,
            Err(err) => {
                let response = Response::failure(err);
                if let Err(send_err) = sender.send_response(None, &response).await {
                    error!(error = %send_err, "failed to send response for undecodable request");
                }
                log_residual(None, &response);
                return;
            }
        };

        invocation.on_start(times.received);
        if times.scheduled != 0 {
            invocation.trace_mut().start_schedule_at(times.scheduled);
        }
        if times.executed != 0 {
            invocation.trace_mut().start_execution_at(times.executed);
        }
        invocation.trace_mut().finish_create_invocation();
        ensure_trace_id(&mut invocation);

        let started = self.guard.start(&mut invocation).and_then(|()| {
            if times.executed == 0 {
                Ok(())
            } else {
                self.guard.start_run_in_executor(&mut invocation)
            }
        });
        let response = match started {
            Ok(()) => {
                self.run_chain(&mut invocation, &self.microservice, ChainKind::Provider)
                    .await
            }
            Err(err) => Response::failure(err),
        };
        let response = self.finish_guarded(&mut invocation, response);

        invocation.trace_mut().start_send_response();
        let sent = sender.send_response(Some(&invocation), &response).await;
        invocation.on_finish();
        self.metrics.publish(&invocation, &response);

        if let Err(send_err) = sent {
            error!(
                operation = %invocation.qualified_name(),
                uri = invocation.request_uri().unwrap_or_default(),
                error = %send_err,
                "failed to send response"
            );
        }
        log_residual(Some(&invocation), &response);
    }

    /// Runs an outbound call on the caller's task.
    pub async fn run_consumer(&self, invocation: &mut Invocation) -> Response {
        if invocation.trace().start_nanos() == 0 {
            let now = invocation.trace().now();
            invocation.on_start(now);
        }
        invocation.trace_mut().finish_create_invocation();
        ensure_trace_id(invocation);

        let response = match self.guard.start(invocation) {
            Ok(()) => {
                let target = invocation.microservice_name().to_string();
                self.run_chain(invocation, &target, ChainKind::Consumer).await
            }
            Err(err) => Response::failure(err),
        };
        let response = self.finish_guarded(invocation, response);
        invocation.on_finish();
        self.metrics.publish(invocation, &response);
        if !response.is_success() {
            debug!(
                operation = %invocation.qualified_name(),
                status = response.status().as_u16(),
                reason = response.reason(),
                "consumer invocation failed"
            );
        }
        response
    }
}

/// Server errors still present at the end of a provider flow.
fn log_residual(invocation: Option<&Invocation>, response: &Response) {
    if !response.status().is_server_error() {
        return;
    }
    let (operation, uri) = invocation.map_or_else(
        || (String::from("<undecoded>"), ""),
        |inv| (inv.qualified_name(), inv.request_uri().unwrap_or_default()),
    );
    error!(
        %operation,
        uri,
        status = response.status().as_u16(),
        reason = response.reason(),
        "invocation failed"
    );
}
