//! Provider operations and contract resolution.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tramline_core::{Invocation, InvocationError, OperationMeta, OperationRef};

/// A business method bound to one operation.
#[async_trait]
pub trait ProducerMethod: Send + Sync {
    /// Runs the business logic. `Ok(None)` is a void result.
    ///
    /// # Errors
    ///
    /// Any error is unwrapped to its root cause and becomes a failure
    /// response. Return an [`InvocationError`] to pick the status yourself.
    async fn invoke(&self, invocation: &Invocation) -> anyhow::Result<Option<rmpv::Value>>;
}

struct FnProducer<F>(F);

#[async_trait]
impl<F, Fut> ProducerMethod for FnProducer<F>
where
    F: Fn(Vec<rmpv::Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<rmpv::Value>>> + Send,
{
    async fn invoke(&self, invocation: &Invocation) -> anyhow::Result<Option<rmpv::Value>> {
        (self.0)(invocation.args().to_vec()).await
    }
}

/// Wraps an async closure over the positional arguments.
pub fn fn_producer<F, Fut>(f: F) -> Arc<dyn ProducerMethod>
where
    F: Fn(Vec<rmpv::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<rmpv::Value>>> + Send + 'static,
{
    Arc::new(FnProducer(f))
}

/// Decodes positional argument `index` into `T`. A missing argument decodes
/// from `Nil`.
///
/// # Errors
///
/// Returns a 400 failure if the value does not match `T`.
pub fn arg<T: DeserializeOwned>(args: &[rmpv::Value], index: usize) -> Result<T, InvocationError> {
    let value = args.get(index).cloned().unwrap_or(rmpv::Value::Nil);
    rmpv::ext::from_value(value)
        .map_err(|e| InvocationError::bad_request(format!("argument {index}: {e}")))
}

/// Errors from resolving an operation.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("operation not found: {operation}")]
    NotFound { operation: OperationRef },
    #[error("operation already registered: {operation}")]
    Duplicate { operation: OperationRef },
}

impl From<OperationError> for InvocationError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::NotFound { .. } => Self::not_found(err.to_string()),
            OperationError::Duplicate { .. } => Self::producer_fail(err.to_string()),
        }
    }
}

/// A registered provider operation: contract plus business method.
pub struct ProducerOperation {
    pub meta: Arc<OperationMeta>,
    pub method: Arc<dyn ProducerMethod>,
}

/// Contract resolution for locally served operations.
#[derive(Default)]
pub struct OperationRegistry {
    operations: DashMap<OperationRef, Arc<ProducerOperation>>,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`OperationError::Duplicate`] if the triple is already bound.
    pub fn register(
        &self,
        meta: OperationMeta,
        method: Arc<dyn ProducerMethod>,
    ) -> Result<Arc<OperationMeta>, OperationError> {
        let key = meta.op_ref().clone();
        let meta = Arc::new(meta);
        match self.operations.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(OperationError::Duplicate {
                operation: e.key().clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Arc::new(ProducerOperation {
                    meta: Arc::clone(&meta),
                    method,
                }));
                Ok(meta)
            }
        }
    }

    /// Looks up `microservice.schema.operation`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::NotFound`], terminal for the request.
    pub fn resolve(
        &self,
        microservice: &str,
        schema_id: &str,
        operation: &str,
    ) -> Result<Arc<ProducerOperation>, OperationError> {
        let key = OperationRef::new(microservice, schema_id, operation);
        match self.operations.get(&key) {
            Some(op) => Ok(Arc::clone(op.value())),
            None => Err(OperationError::NotFound { operation: key }),
        }
    }

    #[must_use]
    pub fn get(&self, op_ref: &OperationRef) -> Option<Arc<ProducerOperation>> {
        self.operations.get(op_ref).map(|op| Arc::clone(op.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    fn meta(op: &str) -> OperationMeta {
        OperationMeta::new(OperationRef::new("svc", "Schema", op))
    }

    fn noop() -> Arc<dyn ProducerMethod> {
        fn_producer(|_args| async { Ok(None) })
    }

    #[test]
    fn resolve_registered_operation() {
        let registry = OperationRegistry::new();
        registry.register(meta("get"), noop()).unwrap();
        let op = registry.resolve("svc", "Schema", "get").unwrap();
        assert_eq!(op.meta.op_ref().operation, "get");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_operation_is_not_found() {
        let registry = OperationRegistry::new();
        let err = registry.resolve("svc", "Schema", "missing").err().unwrap();
        let failure = InvocationError::from(err);
        assert_eq!(failure.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = OperationRegistry::new();
        registry.register(meta("get"), noop()).unwrap();
        assert!(matches!(
            registry.register(meta("get"), noop()),
            Err(OperationError::Duplicate { .. })
        ));
    }

    #[test]
    fn typed_argument_decoding() {
        let args = vec![rmpv::Value::from("x"), rmpv::Value::from(7)];
        assert_eq!(arg::<String>(&args, 0).unwrap(), "x");
        assert_eq!(arg::<u32>(&args, 1).unwrap(), 7);
        assert_eq!(arg::<Option<u32>>(&args, 5).unwrap(), None);
        assert_eq!(arg::<u32>(&args, 0).unwrap_err().status, StatusCode::BAD_REQUEST);
    }
}
