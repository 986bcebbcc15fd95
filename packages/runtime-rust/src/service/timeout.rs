//! Checkpoint-based deadline enforcement.
//!
//! The guard is cooperative: it never interrupts a running business method,
//! it raises at the next checkpoint after the budget is exceeded. Checkpoints
//! in call order:
//!
//! ```text
//! start -> (start_run_in_executor) -> start_handlers -> start_business_method
//!       -> finish_business_method -> before_send_request -> finish
//! ```
//!
//! Once raised, the invocation's local `TimedOut` marker turns every later
//! checkpoint into a no-op, so the failure is signaled exactly once.

use std::sync::Arc;

use tracing::warn;
use tramline_core::context::keys;
use tramline_core::{Invocation, InvocationError, LocalKey, LocalValue, NanoClock};

use crate::config::{TimeoutConfig, TimeoutStrategyKind};

/// Measures how much of an invocation's budget has been used.
pub trait TimeoutStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves the baseline carried in from upstream. Called once, after the
    /// stage trace is anchored.
    fn start(&self, invocation: &mut Invocation);

    /// Elapsed nanoseconds charged against the budget, including upstream.
    fn elapsed(&self, invocation: &Invocation) -> u64;

    /// Writes the baseline into outbound metadata for the next hop.
    fn before_send_request(&self, invocation: &mut Invocation);
}

fn parse_upstream(invocation: &Invocation, key: &str) -> Option<u64> {
    let raw = invocation.context_value(key)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(
                operation = %invocation.qualified_name(),
                key,
                value = raw,
                error = %e,
                "malformed upstream timeout metadata, treating as zero"
            );
            None
        }
    }
}

/// Charges the time each hop spent processing. Time on the network between
/// hops is not counted.
///
/// elapsed = (now - this invocation's start) + upstream elapsed
#[derive(Debug, Default)]
pub struct ProcessingTimeStrategy;

impl TimeoutStrategy for ProcessingTimeStrategy {
    fn name(&self) -> &'static str {
        "processing-time"
    }

    fn start(&self, invocation: &mut Invocation) {
        // A nested call's inherited value wins over metadata copied from its parent.
        let upstream = invocation
            .local()
            .nanos(LocalKey::InheritedElapsedNanos)
            .or_else(|| parse_upstream(invocation, keys::ELAPSED_NANOS))
            .unwrap_or(0);
        invocation
            .local_mut()
            .insert(LocalKey::UpstreamElapsedNanos, LocalValue::Nanos(upstream));
    }

    fn elapsed(&self, invocation: &Invocation) -> u64 {
        let upstream = invocation
            .local()
            .nanos(LocalKey::UpstreamElapsedNanos)
            .unwrap_or(0);
        let trace = invocation.trace();
        let own = match trace.start_nanos() {
            0 => 0,
            start => trace.now().saturating_sub(start),
        };
        upstream.saturating_add(own)
    }

    fn before_send_request(&self, invocation: &mut Invocation) {
        let elapsed = self.elapsed(invocation);
        invocation.add_context(keys::ELAPSED_NANOS, elapsed.to_string());
    }
}

/// Charges wall-clock time since the first hop started, network included.
pub struct PassingTimeStrategy {
    clock: Arc<dyn NanoClock>,
}

impl PassingTimeStrategy {
    #[must_use]
    pub fn new(clock: Arc<dyn NanoClock>) -> Self {
        Self { clock }
    }

    fn origin_millis(invocation: &Invocation) -> u64 {
        invocation
            .local()
            .nanos(LocalKey::InheritedStartMillis)
            .unwrap_or_else(|| invocation.trace().start_millis())
    }
}

impl TimeoutStrategy for PassingTimeStrategy {
    fn name(&self) -> &'static str {
        "passing-time"
    }

    fn start(&self, invocation: &mut Invocation) {
        let inherited = invocation.local().nanos(LocalKey::InheritedStartMillis);
        let origin = inherited
            .or_else(|| parse_upstream(invocation, keys::START_MILLIS))
            .unwrap_or_else(|| invocation.trace().start_millis());
        invocation
            .local_mut()
            .insert(LocalKey::InheritedStartMillis, LocalValue::Nanos(origin));
    }

    fn elapsed(&self, invocation: &Invocation) -> u64 {
        let origin = Self::origin_millis(invocation);
        self.clock
            .millis_time()
            .saturating_sub(origin)
            .saturating_mul(1_000_000)
    }

    fn before_send_request(&self, invocation: &mut Invocation) {
        let origin = Self::origin_millis(invocation);
        invocation.add_context(keys::START_MILLIS, origin.to_string());
    }
}

/// Named checkpoint, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Start,
    StartRunInExecutor,
    StartHandlers,
    StartBusinessMethod,
    FinishBusinessMethod,
    BeforeSendRequest,
    Finish,
}

impl Checkpoint {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StartRunInExecutor => "start-run-in-executor",
            Self::StartHandlers => "start-handlers",
            Self::StartBusinessMethod => "start-business-method",
            Self::FinishBusinessMethod => "finish-business-method",
            Self::BeforeSendRequest => "before-send-request",
            Self::Finish => "finish",
        }
    }
}

/// Applies a [`TimeoutStrategy`] at each checkpoint.
pub struct TimeoutGuard {
    enabled: bool,
    strategy: Arc<dyn TimeoutStrategy>,
}

impl TimeoutGuard {
    #[must_use]
    pub fn new(enabled: bool, strategy: Arc<dyn TimeoutStrategy>) -> Self {
        Self { enabled, strategy }
    }

    #[must_use]
    pub fn from_config(config: &TimeoutConfig, clock: Arc<dyn NanoClock>) -> Self {
        let strategy: Arc<dyn TimeoutStrategy> = match config.strategy {
            TimeoutStrategyKind::ProcessingTime => Arc::new(ProcessingTimeStrategy),
            TimeoutStrategyKind::PassingTime => Arc::new(PassingTimeStrategy::new(clock)),
        };
        Self::new(config.enabled, strategy)
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Elapsed nanoseconds the strategy currently charges.
    #[must_use]
    pub fn elapsed(&self, invocation: &Invocation) -> u64 {
        self.strategy.elapsed(invocation)
    }

    fn check(&self, invocation: &mut Invocation, at: Checkpoint) -> Result<(), InvocationError> {
        if !self.enabled {
            return Ok(());
        }
        let Ok(budget) = u64::try_from(invocation.timeout_nanos()) else {
            return Ok(());
        };
        if budget == 0 || invocation.local().is_timed_out() {
            return Ok(());
        }
        let elapsed = self.strategy.elapsed(invocation);
        if elapsed <= budget {
            return Ok(());
        }
        invocation.local_mut().mark_timed_out();
        warn!(
            operation = %invocation.qualified_name(),
            checkpoint = at.as_str(),
            strategy = self.strategy.name(),
            elapsed_nanos = elapsed,
            budget_nanos = budget,
            "invocation timed out"
        );
        Err(InvocationError::invocation_timeout())
    }

    /// Resolves the upstream baseline, then checks.
    ///
    /// # Errors
    ///
    /// Returns the timeout failure if the budget is already spent.
    pub fn start(&self, invocation: &mut Invocation) -> Result<(), InvocationError> {
        if self.enabled {
            self.strategy.start(invocation);
        }
        self.check(invocation, Checkpoint::Start)
    }

    /// # Errors
    ///
    /// Returns the timeout failure, at most once per invocation.
    pub fn start_run_in_executor(&self, invocation: &mut Invocation) -> Result<(), InvocationError> {
        self.check(invocation, Checkpoint::StartRunInExecutor)
    }

    /// # Errors
    ///
    /// Returns the timeout failure, at most once per invocation.
    pub fn start_handlers(&self, invocation: &mut Invocation) -> Result<(), InvocationError> {
        self.check(invocation, Checkpoint::StartHandlers)
    }

    /// # Errors
    ///
    /// Returns the timeout failure, at most once per invocation.
    pub fn start_business_method(&self, invocation: &mut Invocation) -> Result<(), InvocationError> {
        self.check(invocation, Checkpoint::StartBusinessMethod)
    }

    /// # Errors
    ///
    /// Returns the timeout failure, at most once per invocation.
    pub fn finish_business_method(
        &self,
        invocation: &mut Invocation,
    ) -> Result<(), InvocationError> {
        self.check(invocation, Checkpoint::FinishBusinessMethod)
    }

    /// Checks, then serializes the budget state into outbound metadata so the
    /// next hop continues the same budget.
    ///
    /// # Errors
    ///
    /// Returns the timeout failure, at most once per invocation.
    pub fn before_send_request(&self, invocation: &mut Invocation) -> Result<(), InvocationError> {
        self.check(invocation, Checkpoint::BeforeSendRequest)?;
        if self.enabled {
            self.strategy.before_send_request(invocation);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the timeout failure, at most once per invocation.
    pub fn finish(&self, invocation: &mut Invocation) -> Result<(), InvocationError> {
        self.check(invocation, Checkpoint::Finish)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tramline_core::{
        Endpoint, InvocationFactory, ManualClock, OperationMeta, OperationRef, ReferenceConfig,
    };

    use super::*;

    const MS: u64 = 1_000_000;

    fn factory(clock: &Arc<ManualClock>) -> InvocationFactory {
        InvocationFactory::new("orders", clock.clone())
    }

    fn meta(budget_ms: i64) -> Arc<OperationMeta> {
        Arc::new(
            OperationMeta::new(OperationRef::new("orders", "OrderSchema", "create"))
                .with_timeout_nanos(budget_ms * 1_000_000),
        )
    }

    fn provider(clock: &Arc<ManualClock>, budget_ms: i64) -> Invocation {
        let mut inv = factory(clock).for_provider(
            Endpoint::new("127.0.0.1:1", false),
            meta(budget_ms),
            Vec::new(),
        );
        inv.on_start(clock.nano_time());
        inv
    }

    fn processing_guard() -> TimeoutGuard {
        TimeoutGuard::new(true, Arc::new(ProcessingTimeStrategy))
    }

    #[test]
    fn disabled_budget_never_raises() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = provider(&clock, 0);
        guard.start(&mut inv).unwrap();
        clock.advance(Duration::from_secs(3600));
        assert!(guard.finish_business_method(&mut inv).is_ok());
        assert!(!inv.local().is_timed_out());
    }

    #[test]
    fn negative_budget_is_disabled() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = provider(&clock, -5);
        clock.advance(Duration::from_secs(1));
        assert!(guard.finish(&mut inv).is_ok());
    }

    #[test]
    fn master_switch_disables_every_checkpoint() {
        let clock = Arc::new(ManualClock::default());
        let guard = TimeoutGuard::new(false, Arc::new(ProcessingTimeStrategy));
        let mut inv = provider(&clock, 1);
        clock.advance(Duration::from_secs(1));
        assert!(guard.start(&mut inv).is_ok());
        assert!(guard.finish(&mut inv).is_ok());
    }

    #[test]
    fn slow_business_method_raises_at_finish_checkpoint() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = provider(&clock, 100);
        guard.start(&mut inv).unwrap();
        guard.start_handlers(&mut inv).unwrap();
        guard.start_business_method(&mut inv).unwrap();
        clock.advance(Duration::from_millis(150));
        let err = guard.finish_business_method(&mut inv).unwrap_err();
        assert!(err.is_invocation_timeout());
        assert!(inv.local().is_timed_out());
    }

    #[test]
    fn raises_exactly_once() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = provider(&clock, 10);
        guard.start(&mut inv).unwrap();
        clock.advance(Duration::from_millis(20));

        let raised = [
            guard.start_handlers(&mut inv),
            guard.start_business_method(&mut inv),
            guard.finish_business_method(&mut inv),
            guard.finish(&mut inv),
        ]
        .into_iter()
        .filter(Result::is_err)
        .count();
        assert_eq!(raised, 1);
        assert!(guard.elapsed(&inv) > 10 * MS);
    }

    #[test]
    fn upstream_elapsed_counts_against_budget() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = provider(&clock, 100);
        inv.add_context(keys::ELAPSED_NANOS, (90 * MS).to_string());
        guard.start(&mut inv).unwrap();
        clock.advance(Duration::from_millis(20));
        assert!(guard.start_business_method(&mut inv).is_err());
    }

    #[test]
    fn malformed_upstream_is_zero() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = provider(&clock, 100);
        inv.add_context(keys::ELAPSED_NANOS, "not-a-number");
        guard.start(&mut inv).unwrap();
        assert_eq!(inv.local().nanos(LocalKey::UpstreamElapsedNanos), Some(0));
        clock.advance(Duration::from_millis(50));
        assert!(guard.finish(&mut inv).is_ok());
    }

    #[test]
    fn before_send_serializes_elapsed() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let mut inv = factory(&clock).for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            meta(1_000),
            Vec::new(),
        );
        inv.on_start(clock.nano_time());
        guard.start(&mut inv).unwrap();
        clock.advance(Duration::from_millis(7));
        guard.before_send_request(&mut inv).unwrap();
        assert_eq!(
            inv.context_value(keys::ELAPSED_NANOS),
            Some((7 * MS).to_string().as_str())
        );
    }

    #[test]
    fn two_hop_chain_never_resets_budget() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let factory = factory(&clock);

        // Hop 1 receives a request that already spent 10ms upstream.
        let mut hop1 = provider(&clock, 1_000);
        hop1.add_context(keys::ELAPSED_NANOS, (10 * MS).to_string());
        guard.start(&mut hop1).unwrap();
        clock.advance(Duration::from_millis(5));

        // Hop 1 calls onward.
        let mut outbound = factory.for_consumer_in(
            &hop1,
            ReferenceConfig::new("app", "stock", "0+"),
            meta(1_000),
            Vec::new(),
        );
        outbound.on_start(clock.nano_time());
        guard.start(&mut outbound).unwrap();
        clock.advance(Duration::from_millis(2));
        guard.before_send_request(&mut outbound).unwrap();
        let e1: u64 = outbound
            .context_value(keys::ELAPSED_NANOS)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(e1, 17 * MS);

        // Network time is not charged; hop 2 starts from E1.
        clock.advance(Duration::from_millis(30));
        let mut hop2 = provider(&clock, 1_000);
        hop2.add_context(keys::ELAPSED_NANOS, e1.to_string());
        guard.start(&mut hop2).unwrap();
        assert!(guard.elapsed(&hop2) >= e1);
        clock.advance(Duration::from_millis(1));
        assert_eq!(guard.elapsed(&hop2), e1 + MS);
    }

    #[test]
    fn same_task_reused_for_two_legs_does_not_double_count() {
        let clock = Arc::new(ManualClock::default());
        let guard = processing_guard();
        let factory = factory(&clock);
        let mut parent = provider(&clock, 1_000);
        guard.start(&mut parent).unwrap();
        clock.advance(Duration::from_millis(4));

        let reference = ReferenceConfig::new("app", "stock", "0+");
        let mut first =
            factory.for_consumer_in(&parent, reference.clone(), meta(1_000), Vec::new());
        first.on_start(clock.nano_time());
        guard.start(&mut first).unwrap();
        clock.advance(Duration::from_millis(3));
        guard.before_send_request(&mut first).unwrap();

        let mut second = factory.for_consumer_in(&parent, reference, meta(1_000), Vec::new());
        second.on_start(clock.nano_time());
        guard.start(&mut second).unwrap();
        guard.before_send_request(&mut second).unwrap();

        // Each leg is measured from the parent's anchor, not from the first leg.
        assert_eq!(first.context_value(keys::ELAPSED_NANOS), Some("7000000"));
        assert_eq!(second.context_value(keys::ELAPSED_NANOS), Some("7000000"));
    }

    #[test]
    fn passing_time_uses_origin_wall_clock() {
        let clock = Arc::new(ManualClock::new(1_000, 10_000));
        let guard = TimeoutGuard::new(true, Arc::new(PassingTimeStrategy::new(clock.clone())));
        let mut inv = provider(&clock, 100);
        // First hop started 60ms before this one.
        inv.add_context(keys::START_MILLIS, "9940");
        guard.start(&mut inv).unwrap();
        clock.advance(Duration::from_millis(30));
        assert!(guard.start_handlers(&mut inv).is_ok());
        clock.advance(Duration::from_millis(20));
        assert!(guard.finish(&mut inv).is_err());
    }

    #[test]
    fn passing_time_propagates_origin() {
        let clock = Arc::new(ManualClock::new(1_000, 10_000));
        let guard = TimeoutGuard::new(true, Arc::new(PassingTimeStrategy::new(clock.clone())));
        let mut inv = factory(&clock).for_consumer(
            ReferenceConfig::new("app", "orders", "0+"),
            meta(1_000),
            Vec::new(),
        );
        inv.on_start(clock.nano_time());
        guard.start(&mut inv).unwrap();
        guard.before_send_request(&mut inv).unwrap();
        assert_eq!(inv.context_value(keys::START_MILLIS), Some("10000"));
    }

    type CheckFn = fn(&TimeoutGuard, &mut Invocation) -> Result<(), InvocationError>;

    proptest::proptest! {
        #[test]
        fn raises_at_most_once_and_only_past_budget(
            budget_ms in 1u64..50,
            steps in proptest::collection::vec(0u64..20, 7),
        ) {
            let clock = Arc::new(ManualClock::default());
            let guard = processing_guard();
            let mut inv = provider(&clock, i64::try_from(budget_ms).unwrap());
            let checkpoints: [CheckFn; 7] = [
                TimeoutGuard::start,
                TimeoutGuard::start_run_in_executor,
                TimeoutGuard::start_handlers,
                TimeoutGuard::start_business_method,
                TimeoutGuard::finish_business_method,
                TimeoutGuard::before_send_request,
                TimeoutGuard::finish,
            ];
            let mut raised = 0;
            let mut spent = 0;
            for (checkpoint, step) in checkpoints.iter().zip(&steps) {
                clock.advance(Duration::from_millis(*step));
                spent += step;
                let result = checkpoint(&guard, &mut inv);
                if result.is_err() {
                    raised += 1;
                    proptest::prop_assert!(spent > budget_ms);
                }
                // Once past the budget the marker stays set.
                proptest::prop_assert_eq!(inv.local().is_timed_out(), spent > budget_ms);
            }
            proptest::prop_assert_eq!(raised, usize::from(spent > budget_ms));
        }
    }
}
