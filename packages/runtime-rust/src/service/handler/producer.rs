//! Terminal provider handler: runs the business method.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, error};
use tramline_core::{Invocation, InvocationError, Response};

use super::{Handler, Next};
use crate::service::operation::{OperationError, OperationRegistry};
use crate::service::timeout::TimeoutGuard;

/// Invokes the registered method for the invocation's operation.
pub struct ProducerHandler {
    operations: Arc<OperationRegistry>,
    guard: Arc<TimeoutGuard>,
}

impl ProducerHandler {
    #[must_use]
    pub fn new(operations: Arc<OperationRegistry>, guard: Arc<TimeoutGuard>) -> Self {
        Self { operations, guard }
    }
}

#[async_trait]
impl Handler for ProducerHandler {
    fn name(&self) -> &'static str {
        "producer"
    }

    async fn handle(&self, invocation: &mut Invocation, _next: Next<'_>) -> Response {
        let Some(operation) = self.operations.get(invocation.op_ref()) else {
            return Response::failure(
                OperationError::NotFound {
                    operation: invocation.op_ref().clone(),
                }
                .into(),
            );
        };

        if let Err(err) = self.guard.start_business_method(invocation) {
            return Response::failure(err);
        }

        invocation.trace_mut().start_business_method();
        let result = AssertUnwindSafe(operation.method.invoke(invocation))
            .catch_unwind()
            .await;
        invocation.trace_mut().finish_business_method();

        let response = match result {
            Ok(Ok(value)) => Response::ok(value),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(operation = %invocation.qualified_name(), panic = %message, "business method panicked");
                Response::failure(InvocationError::producer_fail(message))
            }
            Ok(Err(err)) => {
                debug!(operation = %invocation.qualified_name(), error = %err, "business method failed");
                let meta = &operation.meta;
                Response::failure(
                    InvocationError::from_business(&err).scoped_to(|s| meta.declares_error(s)),
                )
            }
        };

        match self.guard.finish_business_method(invocation) {
            Ok(()) => response,
            Err(timeout) => Response::failure(timeout),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "business method panicked".to_string()
    }
}
