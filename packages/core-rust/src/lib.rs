//! Tramline Core: invocation record, stage trace, responses and wire schemas.

pub mod clock;
pub mod context;
pub mod error;
pub mod invocation;
pub mod operation;
pub mod response;
pub mod stage_trace;
pub mod types;
pub mod wire;

pub use clock::{ManualClock, MonotonicClock, NanoClock};
pub use context::{InvocationContext, LocalContext, LocalKey, LocalValue};
pub use error::{InvocationError, ProtocolError};
pub use invocation::{Invocation, InvocationFactory};
pub use operation::{OperationMeta, DEFAULT_EXECUTOR, REACTIVE_EXECUTOR};
pub use response::Response;
pub use stage_trace::StageTrace;
pub use types::{Endpoint, InvocationType, OperationRef, ReferenceConfig};

