//! Stage-duration publishing at invocation finish.
//!
//! Durations go to the `metrics` facade; no exporter is installed here. The
//! binary decides whether to expose them.

use std::fmt::Write as _;
use std::time::Duration;

use metrics::{counter, histogram};
use tracing::warn;
use tramline_core::{Invocation, Response};

/// Histogram of per-stage durations, labeled by `role` and `stage`.
pub const STAGE_SECONDS: &str = "tramline_invocation_stage_seconds";

/// Counter of finished invocations, labeled by `role` and `status`.
pub const INVOCATIONS_TOTAL: &str = "tramline_invocations_total";

#[derive(Debug, Clone)]
pub struct InvocationMetrics {
    slow_threshold: Duration,
}

impl InvocationMetrics {
    #[must_use]
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    /// Records every reached stage and logs the call if it was slow.
    pub fn publish(&self, invocation: &Invocation, response: &Response) {
        let role = invocation.invocation_type().as_str();
        let stages = invocation.trace().stages();

        for (stage, nanos) in stages {
            if nanos.is_nan() {
                continue;
            }
            histogram!(STAGE_SECONDS, "role" => role, "stage" => stage).record(nanos / 1e9);
        }
        counter!(
            INVOCATIONS_TOTAL,
            "role" => role,
            "status" => response.status().as_str().to_string()
        )
        .increment(1);

        let total = invocation.trace().calc_total();
        #[allow(clippy::cast_precision_loss)]
        let threshold = self.slow_threshold.as_nanos() as f64;
        if threshold > 0.0 && !total.is_nan() && total > threshold {
            warn!(
                operation = %invocation.qualified_name(),
                role,
                status = response.status().as_u16(),
                trace_id = invocation.trace_id().unwrap_or_default(),
                stages = %format_stages(&stages),
                "slow invocation"
            );
        }
    }
}

/// `name=1.234ms` pairs for every reached stage.
fn format_stages(stages: &[(&'static str, f64)]) -> String {
    let mut out = String::new();
    for (stage, nanos) in stages.iter().filter(|(_, n)| !n.is_nan()) {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{stage}={:.3}ms", nanos / 1e6);
    }
    out
}
