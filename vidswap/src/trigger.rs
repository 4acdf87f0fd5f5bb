/*!
    Swap trigger: decides when a swap starts and which source replaces the
    current one.

    Both decisions are pluggable. The coordinator only consults the trigger
    while the state is steady with no swap pending, so a policy never has to
    guard against re-entry itself.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::state::SwapPhase;

/**
    What a policy gets to see, once per buffer crossing the checkpoint.
*/
#[derive(Clone, Debug)]
pub struct TriggerContext<'a> {
    /// Time since the last swap was triggered, or since startup.
    pub elapsed: Duration,
    pub phase: SwapPhase,
    pub pending_swap: bool,
    pub current_source: &'a str,
    pub swaps_completed: u64,
}

pub trait SwapPolicy: Send + Sync {
    fn should_swap(&self, ctx: &TriggerContext<'_>) -> bool;
}

pub trait SourceSelector: Send + Sync {
    fn next_source(&self, ctx: &TriggerContext<'_>) -> String;
}

/**
    Swap once the current source has been live for `interval`.
*/
#[derive(Clone, Copy, Debug)]
pub struct IntervalPolicy {
    pub interval: Duration,
}

impl IntervalPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl SwapPolicy for IntervalPolicy {
    fn should_swap(&self, ctx: &TriggerContext<'_>) -> bool {
        ctx.elapsed > self.interval
    }
}

/**
    Externally signaled swaps. Each [`ManualPolicy::request`] fires at most
    one swap.
*/
#[derive(Debug, Default)]
pub struct ManualPolicy {
    armed: AtomicBool,
}

impl ManualPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl SwapPolicy for ManualPolicy {
    fn should_swap(&self, _ctx: &TriggerContext<'_>) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }
}

/**
    Fires when any of its policies fires.

    Every policy is consulted on each call, so a pending one-shot request is
    used up by a swap another policy started.
*/
#[derive(Clone, Default)]
pub struct AnyPolicy {
    policies: Vec<Arc<dyn SwapPolicy>>,
}

impl AnyPolicy {
    pub fn new(policies: Vec<Arc<dyn SwapPolicy>>) -> Self {
        Self { policies }
    }
}

impl SwapPolicy for AnyPolicy {
    fn should_swap(&self, ctx: &TriggerContext<'_>) -> bool {
        let mut fired = false;
        for policy in &self.policies {
            fired |= policy.should_swap(ctx);
        }
        fired
    }
}

/// Always the same replacement.
#[derive(Clone, Debug)]
pub struct StaticSelector {
    uri: String,
}

impl StaticSelector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl SourceSelector for StaticSelector {
    fn next_source(&self, _ctx: &TriggerContext<'_>) -> String {
        self.uri.clone()
    }
}

/**
    Cycles through a list of locators, skipping the one currently live.

    With a single entry equal to the current source it keeps returning that
    entry, which reconnects to the same origin.
*/
#[derive(Clone, Debug)]
pub struct RotatingSelector {
    uris: Vec<String>,
}

impl RotatingSelector {
    /// `None` when `uris` is empty.
    pub fn new(uris: Vec<String>) -> Option<Self> {
        if uris.is_empty() {
            return None;
        }
        Some(Self { uris })
    }
}

impl SourceSelector for RotatingSelector {
    fn next_source(&self, ctx: &TriggerContext<'_>) -> String {
        let start = self
            .uris
            .iter()
            .position(|uri| uri == ctx.current_source)
            .map(|i| i + 1)
            .unwrap_or(0);
        (0..self.uris.len())
            .map(|i| &self.uris[(start + i) % self.uris.len()])
            .find(|uri| uri.as_str() != ctx.current_source)
            .unwrap_or(&self.uris[0])
            .clone()
    }
}

/**
    A policy paired with a selector.
*/
#[derive(Clone)]
pub struct SwapTrigger {
    policy: Arc<dyn SwapPolicy>,
    selector: Arc<dyn SourceSelector>,
}

impl SwapTrigger {
    pub fn new(policy: Arc<dyn SwapPolicy>, selector: Arc<dyn SourceSelector>) -> Self {
        Self { policy, selector }
    }

    /// The sample policy: swap to `next` every `interval`.
    pub fn interval(interval: Duration, next: impl Into<String>) -> Self {
        Self::new(
            Arc::new(IntervalPolicy::new(interval)),
            Arc::new(StaticSelector::new(next)),
        )
    }

    /**
        Returns the locator to swap to when the policy fires.

        Never fires outside the steady phase or while a swap is pending,
        whatever the policy says.
    */
    pub fn evaluate(&self, ctx: &TriggerContext<'_>) -> Option<String> {
        if ctx.phase != SwapPhase::Steady || ctx.pending_swap {
            return None;
        }
        if !self.policy.should_swap(ctx) {
            return None;
        }
        Some(self.selector.next_source(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(elapsed: u64, current: &str) -> TriggerContext<'_> {
        TriggerContext {
            elapsed: Duration::from_secs(elapsed),
            phase: SwapPhase::Steady,
            pending_swap: false,
            current_source: current,
            swaps_completed: 0,
        }
    }

    #[test]
    fn interval_fires_after_threshold() {
        let policy = IntervalPolicy::default();
        assert!(!policy.should_swap(&ctx(29, "a")));
        assert!(!policy.should_swap(&ctx(30, "a")));
        assert!(policy.should_swap(&ctx(31, "a")));
    }

    #[test]
    fn manual_policy_fires_once_per_request() {
        let policy = ManualPolicy::new();
        assert!(!policy.should_swap(&ctx(0, "a")));
        policy.request();
        policy.request();
        assert!(policy.should_swap(&ctx(0, "a")));
        assert!(!policy.should_swap(&ctx(0, "a")));
    }

    #[test]
    fn any_policy_fires_for_either_and_consumes_requests() {
        let manual = Arc::new(ManualPolicy::new());
        let policy = AnyPolicy::new(vec![Arc::new(IntervalPolicy::default()), manual.clone()]);
        assert!(!policy.should_swap(&ctx(5, "a")));
        assert!(policy.should_swap(&ctx(31, "a")));

        manual.request();
        assert!(policy.should_swap(&ctx(5, "a")));
        assert!(!policy.should_swap(&ctx(5, "a")));

        // served by the interval, the request does not cause a second swap
        manual.request();
        assert!(policy.should_swap(&ctx(31, "a")));
        assert!(!manual.is_armed());
        assert!(!AnyPolicy::default().should_swap(&ctx(31, "a")));
    }

    #[test]
    fn rotating_selector_skips_current() {
        let selector =
            RotatingSelector::new(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        assert_eq!(selector.next_source(&ctx(0, "a")), "b");
        assert_eq!(selector.next_source(&ctx(0, "c")), "a");
        assert_eq!(selector.next_source(&ctx(0, "z")), "a");

        let single = RotatingSelector::new(vec!["a".into()]).unwrap();
        assert_eq!(single.next_source(&ctx(0, "a")), "a");
        assert!(RotatingSelector::new(Vec::new()).is_none());
    }

    #[test]
    fn trigger_is_inert_outside_steady() {
        let trigger = SwapTrigger::interval(Duration::from_secs(30), "rtsp://b");
        assert_eq!(trigger.evaluate(&ctx(31, "a")).as_deref(), Some("rtsp://b"));

        let mut draining = ctx(31, "a");
        draining.phase = SwapPhase::Draining;
        assert_eq!(trigger.evaluate(&draining), None);

        let mut pending = ctx(31, "a");
        pending.pending_swap = true;
        assert_eq!(trigger.evaluate(&pending), None);
    }

    #[test]
    fn manual_request_survives_non_steady_phases() {
        let policy = Arc::new(ManualPolicy::new());
        let trigger = SwapTrigger::new(policy.clone(), Arc::new(StaticSelector::new("b")));
        policy.request();

        let mut relinking = ctx(0, "a");
        relinking.phase = SwapPhase::Relinking;
        assert_eq!(trigger.evaluate(&relinking), None);
        assert!(policy.is_armed());
        assert_eq!(trigger.evaluate(&ctx(0, "a")).as_deref(), Some("b"));
    }
}
