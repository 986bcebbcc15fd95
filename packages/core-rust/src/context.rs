//! Invocation metadata: the serialized context map and the in-process side table.

use std::collections::HashMap;

/// Outbound/inbound metadata that travels in frame headers.
pub type InvocationContext = HashMap<String, String>;

/// Metadata keys with engine-defined meaning.
pub mod keys {
    /// Distributed trace id, generated at call start when absent.
    pub const TRACE_ID: &str = "X-B3-TraceId";
    /// Microservice name of the caller, stamped on consumer creation.
    pub const SOURCE_MICROSERVICE: &str = "x-tramline-src-microservice";
    /// Processing time already spent upstream, decimal nanoseconds.
    pub const ELAPSED_NANOS: &str = "x-tramline-elapsed-nanos";
    /// Wall-clock start of the first hop, decimal Unix millis.
    pub const START_MILLIS: &str = "x-tramline-start-millis";
}

/// Version of the [`LocalKey`] set. Bumped whenever a key is added or its
/// value type changes.
pub const LOCAL_CONTEXT_VERSION: u32 = 1;

/// Closed set of keys for cross-stage signals that never leave the process.
///
/// | key | value | writer |
/// |---|---|---|
/// | `TimedOut` | `Flag` | timeout guard, once |
/// | `UpstreamElapsedNanos` | `Nanos` | timeout strategy at start |
/// | `InheritedElapsedNanos` | `Nanos` | factory, for nested consumer calls |
/// | `InheritedStartMillis` | `Nanos` | factory, for nested consumer calls |
/// | `RequestUri` | `Text` | front end, for failure logs |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKey {
    TimedOut,
    UpstreamElapsedNanos,
    InheritedElapsedNanos,
    InheritedStartMillis,
    RequestUri,
}

/// Value stored under a [`LocalKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalValue {
    Flag(bool),
    Nanos(u64),
    Text(String),
}

/// Per-invocation side table keyed by [`LocalKey`].
#[derive(Debug, Clone, Default)]
pub struct LocalContext {
    entries: HashMap<LocalKey, LocalValue>,
}

impl LocalContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: LocalKey, value: LocalValue) -> Option<LocalValue> {
        self.entries.insert(key, value)
    }

    #[must_use]
    pub fn get(&self, key: LocalKey) -> Option<&LocalValue> {
        self.entries.get(&key)
    }

    pub fn remove(&mut self, key: LocalKey) -> Option<LocalValue> {
        self.entries.remove(&key)
    }

    #[must_use]
    pub fn flag(&self, key: LocalKey) -> bool {
        matches!(self.entries.get(&key), Some(LocalValue::Flag(true)))
    }

    #[must_use]
    pub fn nanos(&self, key: LocalKey) -> Option<u64> {
        match self.entries.get(&key) {
            Some(LocalValue::Nanos(n)) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn text(&self, key: LocalKey) -> Option<&str> {
        match self.entries.get(&key) {
            Some(LocalValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Whether the timeout guard already raised for this invocation.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.flag(LocalKey::TimedOut)
    }

    pub fn mark_timed_out(&mut self) {
        self.insert(LocalKey::TimedOut, LocalValue::Flag(true));
    }
}
