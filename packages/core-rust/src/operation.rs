//! Operation contract descriptors.
//!
//! An [`OperationMeta`] is what schema resolution hands back for a
//! (microservice, schema, operation) lookup: declared parameters, declared
//! error statuses, the executor that runs it and its timeout budget.

use std::collections::BTreeSet;

use http::StatusCode;

use crate::types::OperationRef;

/// Name of the inline executor that runs on the I/O runtime.
pub const REACTIVE_EXECUTOR: &str = "reactive";

/// Name of the executor used when an operation does not configure one.
pub const DEFAULT_EXECUTOR: &str = "default";

/// Contract of a single operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMeta {
    op_ref: OperationRef,
    params: Vec<String>,
    declared_errors: BTreeSet<u16>,
    executor: String,
    timeout_nanos: i64,
}

impl OperationMeta {
    /// Creates a contract with no parameters, the default executor and the
    /// timeout guard disabled.
    #[must_use]
    pub fn new(op_ref: OperationRef) -> Self {
        Self {
            op_ref,
            params: Vec::new(),
            declared_errors: BTreeSet::new(),
            executor: DEFAULT_EXECUTOR.to_string(),
            timeout_nanos: 0,
        }
    }

    /// Declares positional parameter names, in call order.
    #[must_use]
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Declares a failure status whose error payload is part of the contract.
    #[must_use]
    pub fn with_declared_error(mut self, status: StatusCode) -> Self {
        self.declared_errors.insert(status.as_u16());
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    /// Sets the timeout budget in nanoseconds. `<= 0` disables the guard.
    #[must_use]
    pub fn with_timeout_nanos(mut self, nanos: i64) -> Self {
        self.timeout_nanos = nanos;
        self
    }

    #[must_use]
    pub fn op_ref(&self) -> &OperationRef {
        &self.op_ref
    }

    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    #[must_use]
    pub fn executor(&self) -> &str {
        &self.executor
    }

    #[must_use]
    pub fn timeout_nanos(&self) -> i64 {
        self.timeout_nanos
    }

    #[must_use]
    pub fn declares_error(&self, status: StatusCode) -> bool {
        self.declared_errors.contains(&status.as_u16())
    }

    /// `microservice.schema.operation`, used in logs.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        self.op_ref.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_timeout() {
        let meta = OperationMeta::new(OperationRef::new("svc", "Schema", "op"));
        assert_eq!(meta.timeout_nanos(), 0);
        assert_eq!(meta.executor(), DEFAULT_EXECUTOR);
        assert!(meta.params().is_empty());
    }

    #[test]
    fn builder_sets_fields() {
        let meta = OperationMeta::new(OperationRef::new("svc", "Schema", "op"))
            .with_params(["a", "b"])
            .with_executor(REACTIVE_EXECUTOR)
            .with_timeout_nanos(5_000)
            .with_declared_error(StatusCode::BAD_REQUEST);
        assert_eq!(meta.params(), ["a", "b"]);
        assert_eq!(meta.executor(), REACTIVE_EXECUTOR);
        assert_eq!(meta.timeout_nanos(), 5_000);
        assert!(meta.declares_error(StatusCode::BAD_REQUEST));
        assert!(!meta.declares_error(StatusCode::CONFLICT));
        assert_eq!(meta.qualified_name(), "svc.Schema.op");
    }
}
