/*!
    Shared swap state.

    One `SwapState` lives behind the coordinator's mutex and is touched from
    the streaming threads, the engine's callback threads and the deadline
    timer. Fields are private: every change goes through a transition method
    that checks the current phase first, so a stale or duplicated event can
    never move the state machine twice.
*/

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::clock;
use crate::engine::NodeId;
use crate::error::SwapError;
use crate::trigger::TriggerContext;

const HISTORY_LEN: usize = 32;

/**
    Phase of the swap protocol.

    `Steady -> Draining -> Detached -> Relinking -> Steady` is the normal
    cycle. `Failed` is terminal until restart, `Stopped` is entered once on
    shutdown.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapPhase {
    Steady,
    Draining,
    Detached,
    Relinking,
    Failed,
    Stopped,
}

impl SwapPhase {
    /// True while a swap is in flight.
    pub fn is_swapping(self) -> bool {
        matches!(self, Self::Draining | Self::Detached | Self::Relinking)
    }

    fn allows(self, to: SwapPhase) -> bool {
        use SwapPhase::*;
        match (self, to) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (Steady, Draining)
            | (Draining, Detached)
            | (Detached, Relinking)
            | (Relinking, Relinking)
            | (Relinking, Steady) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Steady => "STEADY",
            Self::Draining => "DRAINING",
            Self::Detached => "DETACHED",
            Self::Relinking => "RELINKING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid swap transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SwapPhase,
    pub to: SwapPhase,
}

/**
    One recorded phase change.
*/
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    pub from: SwapPhase,
    pub to: SwapPhase,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/**
    Deadlines and retry limits for the drain and relink waits.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub drain_timeout: Duration,
    pub relink_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_relink_attempts: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            relink_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(1),
            max_relink_attempts: 3,
        }
    }
}

impl Timings {
    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << exponent)
    }
}

/**
    What an expired deadline asks the coordinator to do.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Due {
    Nothing,
    /// The drain never completed; the state is already `Detached`.
    ForceDetach { old: Option<NodeId> },
    /// The replacement never announced output. Remove it and try again later.
    RetryLater {
        discard: NodeId,
        attempt: u32,
        backoff: Duration,
    },
    /// Out of attempts; the state is already `Failed`.
    Exhausted { discard: NodeId, attempts: u32 },
    /// A backoff elapsed; create the replacement again.
    Relink,
}

/**
    Read-only copy of the state for reporting.
*/
#[derive(Clone, Debug, Serialize)]
pub struct SwapSnapshot {
    pub phase: SwapPhase,
    pub current_source: String,
    pub next_source: Option<String>,
    pub pending_swap: bool,
    pub swaps_completed: u64,
    pub relink_attempts: u32,
    pub swap_started_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
    pub history: Vec<Transition>,
}

#[derive(Debug)]
pub struct SwapState {
    phase: SwapPhase,
    pending_swap: bool,
    swap_started: Option<Instant>,
    swap_started_at: Option<DateTime<Utc>>,
    next_source: Option<String>,
    baseline: Instant,
    current_source: String,
    current_node: Option<NodeId>,
    pending_node: Option<NodeId>,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
    relink_attempts: u32,
    sources_created: u64,
    swaps_completed: u64,
    timings: Timings,
    history: VecDeque<Transition>,
    last_failure: Option<String>,
}

impl SwapState {
    pub fn new(current_source: impl Into<String>, timings: Timings, now: Instant) -> Self {
        Self {
            phase: SwapPhase::Steady,
            pending_swap: false,
            swap_started: None,
            swap_started_at: None,
            next_source: None,
            baseline: now,
            current_source: current_source.into(),
            current_node: None,
            pending_node: None,
            deadline: None,
            retry_at: None,
            relink_attempts: 0,
            sources_created: 0,
            swaps_completed: 0,
            timings,
            history: VecDeque::with_capacity(HISTORY_LEN),
            last_failure: None,
        }
    }

    pub fn phase(&self) -> SwapPhase {
        self.phase
    }

    pub fn pending_swap(&self) -> bool {
        self.pending_swap
    }

    pub fn current_source(&self) -> &str {
        &self.current_source
    }

    pub fn current_node(&self) -> Option<NodeId> {
        self.current_node
    }

    pub fn pending_node(&self) -> Option<NodeId> {
        self.pending_node
    }

    pub fn next_source(&self) -> Option<&str> {
        self.next_source.as_deref()
    }

    pub fn swaps_completed(&self) -> u64 {
        self.swaps_completed
    }

    /// Unique graph name for the next source node.
    pub fn next_source_name(&mut self) -> String {
        let name = format!("source-{}", self.sources_created);
        self.sources_created += 1;
        name
    }

    /// Record the node that carries the initial source.
    pub fn adopt_source(&mut self, node: NodeId) {
        self.current_node = Some(node);
    }

    pub fn reset_baseline(&mut self, now: Instant) {
        self.baseline = now;
    }

    pub fn can_trigger(&self) -> bool {
        self.phase == SwapPhase::Steady && !self.pending_swap
    }

    pub fn trigger_context(&self, now: Instant) -> TriggerContext<'_> {
        TriggerContext {
            elapsed: now.saturating_duration_since(self.baseline),
            phase: self.phase,
            pending_swap: self.pending_swap,
            current_source: &self.current_source,
            swaps_completed: self.swaps_completed,
        }
    }

    /// Node `node` is the replacement this swap is waiting for.
    pub fn is_pending(&self, node: NodeId) -> bool {
        self.phase == SwapPhase::Relinking && self.pending_node == Some(node)
    }

    /// Node `node` is the live source and no swap is running.
    pub fn is_current(&self, node: NodeId) -> bool {
        self.phase == SwapPhase::Steady && self.current_node == Some(node)
    }

    /**
        `Steady -> Draining`. Marks the swap pending and restarts the trigger
        baseline so the policy cannot fire again for this swap.
    */
    pub fn begin_drain(&mut self, next: String, now: Instant) -> Result<(), InvalidTransition> {
        if self.pending_swap {
            return Err(self.invalid(SwapPhase::Draining));
        }
        let reason = format!("swap {} -> {}", self.current_source, next);
        self.transition(SwapPhase::Draining, reason)?;
        self.pending_swap = true;
        self.baseline = now;
        self.swap_started = Some(now);
        self.swap_started_at = Some(clock::now());
        self.next_source = Some(next);
        self.deadline = Some(now + self.timings.drain_timeout);
        Ok(())
    }

    /**
        `Draining -> Detached`. Returns the old source node, which from here
        on is no longer live.
    */
    pub fn drained(&mut self, reason: &str) -> Result<Option<NodeId>, InvalidTransition> {
        self.transition(SwapPhase::Detached, reason.to_string())?;
        self.deadline = None;
        Ok(self.current_node.take())
    }

    /**
        `Detached -> Relinking`, or a retry while relinking. Returns the
        locator to open and the node name to use.
    */
    pub fn begin_relink(&mut self, now: Instant) -> Result<(String, String), InvalidTransition> {
        let waiting_retry = self.phase == SwapPhase::Relinking && self.pending_node.is_none();
        if self.phase != SwapPhase::Detached && !waiting_retry {
            return Err(self.invalid(SwapPhase::Relinking));
        }
        let Some(uri) = self.next_source.clone() else {
            return Err(self.invalid(SwapPhase::Relinking));
        };
        let reason = if waiting_retry {
            format!("retry {} for {}", self.relink_attempts + 1, uri)
        } else {
            format!("opening {}", uri)
        };
        self.transition(SwapPhase::Relinking, reason)?;
        self.deadline = Some(now + self.timings.relink_timeout);
        self.retry_at = None;
        Ok((uri, self.next_source_name()))
    }

    /// The replacement node exists; wait for it to announce output.
    pub fn source_created(&mut self, node: NodeId) {
        if self.phase == SwapPhase::Relinking {
            self.pending_node = Some(node);
        }
    }

    /**
        `Relinking -> Steady` once `node` is linked into the chain.
    */
    pub fn complete(&mut self, node: NodeId, now: Instant) -> Result<(), InvalidTransition> {
        if !self.is_pending(node) {
            return Err(self.invalid(SwapPhase::Steady));
        }
        let uri = self.next_source.take().unwrap_or_default();
        let took = self
            .swap_started
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        self.transition(SwapPhase::Steady, format!("{} linked after {:?}", uri, took))?;
        self.current_source = uri;
        self.current_node = Some(node);
        self.pending_node = None;
        self.pending_swap = false;
        self.baseline = now;
        self.swap_started = None;
        self.swap_started_at = None;
        self.deadline = None;
        self.retry_at = None;
        self.relink_attempts = 0;
        self.swaps_completed += 1;
        Ok(())
    }

    /**
        Enter `Failed`. Returns false when already failed or stopped.
    */
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.transition(SwapPhase::Failed, reason.clone()).is_err() {
            return false;
        }
        self.deadline = None;
        self.retry_at = None;
        self.last_failure = Some(reason);
        true
    }

    /**
        Enter `Stopped`. Returns the replacement node still waiting for
        output, if any.
    */
    pub fn stop(&mut self) -> Option<NodeId> {
        if self.transition(SwapPhase::Stopped, "shutdown".to_string()).is_err() {
            return None;
        }
        self.deadline = None;
        self.retry_at = None;
        self.pending_node.take()
    }

    /**
        Apply whichever deadline has passed at `now`.
    */
    pub fn check_deadlines(&mut self, now: Instant) -> Due {
        let expired = self.deadline.is_some_and(|deadline| now >= deadline);
        match self.phase {
            SwapPhase::Draining if expired => match self.drained("drain timeout") {
                Ok(old) => Due::ForceDetach { old },
                Err(_) => Due::Nothing,
            },
            SwapPhase::Relinking => {
                if let Some(discard) = self.pending_node.filter(|_| expired) {
                    self.pending_node = None;
                    self.deadline = None;
                    self.relink_attempts += 1;
                    let attempts = self.relink_attempts;
                    if attempts >= self.timings.max_relink_attempts {
                        self.fail(SwapError::RelinkExhausted { attempts }.to_string());
                        return Due::Exhausted { discard, attempts };
                    }
                    let backoff = self.timings.backoff(attempts);
                    self.retry_at = Some(now + backoff);
                    return Due::RetryLater {
                        discard,
                        attempt: attempts,
                        backoff,
                    };
                }
                match self.retry_at {
                    Some(at) if self.pending_node.is_none() && now >= at => {
                        self.retry_at = None;
                        Due::Relink
                    }
                    _ => Due::Nothing,
                }
            }
            _ => Due::Nothing,
        }
    }

    pub fn snapshot(&self) -> SwapSnapshot {
        SwapSnapshot {
            phase: self.phase,
            current_source: self.current_source.clone(),
            next_source: self.next_source.clone(),
            pending_swap: self.pending_swap,
            swaps_completed: self.swaps_completed,
            relink_attempts: self.relink_attempts,
            swap_started_at: self.swap_started_at,
            last_failure: self.last_failure.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }

    fn invalid(&self, to: SwapPhase) -> InvalidTransition {
        InvalidTransition {
            from: self.phase,
            to,
        }
    }

    fn transition(&mut self, to: SwapPhase, reason: String) -> Result<(), InvalidTransition> {
        let from = self.phase;
        if !from.allows(to) {
            return Err(self.invalid(to));
        }
        if to == SwapPhase::Failed {
            error!(%from, %to, "{}", reason);
        } else {
            info!(%from, %to, "{}", reason);
        }
        self.phase = to;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            at: clock::now(),
            reason,
        });
        Ok(())
    }
}
