/*!
    Swap coordinator.

    Drives the engine from [`SwapState`] transitions. Every entry point
    (checkpoint probe, drain watch, pad-added, deadline tick) first moves the
    state under its lock, then releases the lock and acts on the engine.
    Engine calls can re-enter the coordinator through callbacks, so no lock
    is ever held across one.

    Graph mutation never happens on a streaming thread: detaching the old
    source and creating the new one are handed to [`Engine::call_async`].
*/

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::attach::AttachHandler;
use crate::chain::StageChain;
use crate::clock::Clock;
use crate::engine::{
    self, Engine, EngineExt, NodeId, PadRef, ProbeData, ProbeId, ProbeMode, ProbeReturn,
    PropValue,
};
use crate::error::SwapError;
use crate::state::{Due, SwapPhase, SwapSnapshot, SwapState, Timings};
use crate::trigger::SwapTrigger;

/**
    How source nodes are created.
*/
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub factory: String,
    /// Jitter buffer, in milliseconds.
    pub latency: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            factory: "rtspsrc".to_string(),
            latency: 0,
        }
    }
}

#[derive(Default)]
struct Probes {
    trigger: Option<ProbeId>,
    /// Sits on the old source's output pad, upstream of the checkpoint.
    block: Option<(PadRef, ProbeId)>,
    drain: Option<ProbeId>,
}

enum Announcer {
    Replacement,
    Live,
    Stale,
}

struct Shared {
    engine: Arc<dyn Engine>,
    clock: Arc<dyn Clock>,
    trigger: SwapTrigger,
    source: SourceSettings,
    checkpoint: PadRef,
    drain_point: PadRef,
    state: Mutex<SwapState>,
    probes: Mutex<Probes>,
    phase_tx: watch::Sender<SwapPhase>,
}

/**
    Owns the swap protocol for one pipeline. Cheap to clone.
*/
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn Engine>,
        clock: Arc<dyn Clock>,
        trigger: SwapTrigger,
        chain: &StageChain,
        initial_source: &str,
        source: SourceSettings,
        timings: Timings,
    ) -> engine::Result<Self> {
        let checkpoint = chain.checkpoint(engine.as_ref())?;
        let drain_point = chain.drain_point(engine.as_ref())?;
        let state = SwapState::new(initial_source, timings, clock.now());
        let (phase_tx, _) = watch::channel(SwapPhase::Steady);
        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                clock,
                trigger,
                source,
                checkpoint,
                drain_point,
                state: Mutex::new(state),
                probes: Mutex::new(Probes::default()),
                phase_tx,
            }),
        })
    }

    /**
        Create the initial source and arm the trigger. The source starts
        producing once the pipeline goes to playing.
    */
    pub fn start(&self) -> Result<NodeId, SwapError> {
        let shared = &self.shared;
        let (uri, name) = {
            let mut state = shared.state.lock();
            (state.current_source().to_string(), state.next_source_name())
        };
        let node = shared
            .create_source(&uri, &name)
            .map_err(|source| SwapError::SourceCreate {
                uri: uri.clone(),
                source,
            })?;
        shared.state.lock().adopt_source(node);
        shared.install_trigger().map_err(SwapError::Probe)?;
        info!(%uri, %node, "initial source created");
        Ok(node)
    }

    pub fn phase(&self) -> SwapPhase {
        self.shared.state.lock().phase()
    }

    pub fn snapshot(&self) -> SwapSnapshot {
        self.shared.state.lock().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SwapPhase> {
        self.shared.phase_tx.subscribe()
    }

    pub fn checkpoint(&self) -> &PadRef {
        &self.shared.checkpoint
    }

    /**
        Enforce protocol deadlines. Call periodically.
    */
    pub fn tick(&self) {
        let shared = &self.shared;
        let now = shared.clock.now();
        let due = shared.state.lock().check_deadlines(now);
        match due {
            Due::Nothing => {}
            Due::ForceDetach { old } => {
                warn!("drain did not complete in time, forcing detach");
                shared.publish();
                shared.schedule(move |shared| shared.detach(old));
            }
            Due::RetryLater {
                discard,
                attempt,
                backoff,
            } => {
                warn!(
                    %discard,
                    attempt,
                    ?backoff,
                    "replacement source produced no output, retrying"
                );
                shared.schedule(move |shared| shared.discard(discard));
            }
            Due::Exhausted { discard, attempts } => {
                warn!(%discard, attempts, "giving up on replacement source");
                shared.publish();
                shared.schedule(move |shared| shared.discard(discard));
            }
            Due::Relink => shared.schedule(|shared| shared.relink()),
        }
    }

    /**
        Stop reacting to events. A swap in flight is abandoned: its probes are
        removed and a replacement that has not linked yet is discarded.
    */
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let pending = {
            let mut state = shared.state.lock();
            if state.phase() == SwapPhase::Stopped {
                return;
            }
            if state.phase().is_swapping() {
                warn!(phase = %state.phase(), "shutting down mid-swap");
            }
            state.stop()
        };
        shared.publish();

        let probes = std::mem::take(&mut *shared.probes.lock());
        if let Some(id) = probes.trigger {
            shared.engine.remove_probe(&shared.checkpoint, id);
        }
        if let Some((pad, id)) = probes.block {
            shared.engine.remove_probe(&pad, id);
        }
        if let Some(id) = probes.drain {
            shared.engine.remove_probe(&shared.drain_point, id);
        }
        if let Some(node) = pending {
            shared.discard(node);
        }
    }
}

impl Shared {
    fn publish(&self) {
        let phase = self.state.lock().phase();
        self.phase_tx.send_replace(phase);
    }

    fn fail(&self, err: SwapError) {
        let changed = self.state.lock().fail(err.to_string());
        if changed {
            self.publish();
        }
    }

    fn schedule(self: &Arc<Self>, task: impl FnOnce(&Arc<Shared>) + Send + 'static) {
        let weak = Arc::downgrade(self);
        self.engine.call_async(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                task(&shared);
            }
        }));
    }

    fn install_trigger(self: &Arc<Self>) -> engine::Result<()> {
        let weak = Arc::downgrade(self);
        let id = self.engine.add_probe(
            &self.checkpoint,
            ProbeMode::Observe,
            Arc::new(move |_: &PadRef, data: &ProbeData| match weak.upgrade() {
                Some(shared) => shared.on_checkpoint(data),
                None => ProbeReturn::Remove,
            }),
        )?;
        self.probes.lock().trigger = Some(id);
        Ok(())
    }

    // Trigger probe: runs for every item reaching the checkpoint.
    fn on_checkpoint(self: &Arc<Self>, data: &ProbeData) -> ProbeReturn {
        if !data.is_buffer() {
            return ProbeReturn::Ok;
        }
        let now = self.clock.now();
        let fired = {
            let mut state = self.state.lock();
            if !state.can_trigger() {
                return ProbeReturn::Ok;
            }
            let next = self.trigger.evaluate(&state.trigger_context(now));
            match next {
                Some(next) => state.begin_drain(next, now).is_ok(),
                None => false,
            }
        };
        if !fired {
            return ProbeReturn::Ok;
        }

        self.publish();
        self.probes.lock().trigger = None;
        if let Err(e) = self.begin_drain() {
            self.fail(SwapError::Probe(e));
        }
        ProbeReturn::Remove
    }

    /**
        Hold new data on the old source's output pad, watch the first stage's
        output for the marker, and inject the marker off the streaming thread.

        The block goes upstream of the checkpoint: a thread parked on the
        checkpoint itself would own its stream lock and the marker could
        never get in.
    */
    fn begin_drain(self: &Arc<Self>) -> engine::Result<()> {
        if let Some(upstream) = self.engine.peer(&self.checkpoint) {
            let block = self.engine.add_probe(
                &upstream,
                ProbeMode::Block,
                Arc::new(|_: &PadRef, data: &ProbeData| {
                    if data.is_buffer() {
                        ProbeReturn::Ok
                    } else {
                        ProbeReturn::Pass
                    }
                }),
            )?;
            self.probes.lock().block = Some((upstream, block));
        }

        let weak: Weak<Shared> = Arc::downgrade(self);
        let drain = self.engine.add_probe(
            &self.drain_point,
            ProbeMode::Observe,
            Arc::new(move |_: &PadRef, data: &ProbeData| {
                if !data.is_eos() {
                    return ProbeReturn::Ok;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.on_drained();
                }
                ProbeReturn::Drop
            }),
        )?;
        self.probes.lock().drain = Some(drain);

        self.schedule(|shared| shared.inject_eos());
        Ok(())
    }

    fn inject_eos(&self) {
        if self.state.lock().phase() != SwapPhase::Draining {
            debug!("drain already over, not injecting end-of-stream");
            return;
        }
        if let Err(e) = self.engine.send_eos(&self.checkpoint) {
            warn!(error = %e, "end-of-stream injection failed, waiting for drain deadline");
        }
    }

    // Drain watch saw the marker leave the first stage.
    fn on_drained(self: &Arc<Self>) {
        let drained = self.state.lock().drained("first stage drained");
        match drained {
            Ok(old) => {
                self.publish();
                self.schedule(move |shared| shared.detach(old));
            }
            Err(e) => debug!(error = %e, "ignoring late end-of-stream"),
        }
    }

    fn detach(self: &Arc<Self>, old: Option<NodeId>) {
        if self.state.lock().phase() != SwapPhase::Detached {
            debug!("swap no longer detaching, skipping");
            return;
        }
        let drain = self.probes.lock().drain.take();
        if let Some(drain) = drain {
            self.engine.remove_probe(&self.drain_point, drain);
        }
        if let Err(e) = self.unlink_old(old) {
            self.fail(SwapError::Detach(e));
            return;
        }
        // whatever the block still held went away with the old source
        let block = self.probes.lock().block.take();
        if let Some((pad, block)) = block {
            self.engine.remove_probe(&pad, block);
        }
        self.relink();
    }

    fn unlink_old(&self, old: Option<NodeId>) -> engine::Result<()> {
        if let Some(peer) = self.engine.peer(&self.checkpoint) {
            self.engine.unlink(&peer, &self.checkpoint)?;
        }
        if let Some(node) = old {
            self.engine.remove(node)?;
            info!(%node, "old source removed");
        }
        Ok(())
    }

    fn relink(self: &Arc<Self>) {
        let now = self.clock.now();
        let begun = self.state.lock().begin_relink(now);
        let (uri, name) = match begun {
            Ok(next) => next,
            Err(e) => {
                debug!(error = %e, "relink skipped");
                return;
            }
        };
        self.publish();

        let node = match self.create_source(&uri, &name) {
            Ok(node) => node,
            Err(source) => {
                self.fail(SwapError::SourceCreate { uri, source });
                return;
            }
        };
        // the pad may be announced from inside sync_node_state
        self.state.lock().source_created(node);
        if let Err(source) = self.engine.sync_node_state(node) {
            self.fail(SwapError::SourceCreate { uri, source });
        }
    }

    fn create_source(self: &Arc<Self>, uri: &str, name: &str) -> engine::Result<NodeId> {
        let properties = [
            ("location".to_string(), PropValue::from(uri)),
            ("latency".to_string(), PropValue::from(self.source.latency)),
        ];
        let node = self.engine.add_node(&self.source.factory, name, &properties)?;
        let weak = Arc::downgrade(self);
        let connected = self.engine.connect_pad_added(
            node,
            Arc::new(move |node: NodeId, pad: &PadRef| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_pad_added(node, pad);
                }
            }),
        );
        if let Err(e) = connected {
            let _ = self.engine.remove(node);
            return Err(e);
        }
        debug!(%uri, %name, %node, "source created");
        Ok(node)
    }

    fn on_pad_added(self: &Arc<Self>, node: NodeId, pad: &PadRef) {
        let announcer = {
            let state = self.state.lock();
            if state.is_pending(node) {
                Announcer::Replacement
            } else if state.is_current(node) {
                Announcer::Live
            } else {
                Announcer::Stale
            }
        };
        let attached = match announcer {
            Announcer::Stale => {
                debug!(%node, %pad, "ignoring pad from a source that is not wanted");
                return;
            }
            _ => AttachHandler::new(self.engine.as_ref(), &self.checkpoint).attach(pad),
        };

        match (announcer, attached) {
            (Announcer::Replacement, Ok(())) => self.complete(node),
            (Announcer::Replacement, Err(e)) => self.fail(SwapError::Link(e)),
            (_, Ok(())) => {
                self.state.lock().reset_baseline(self.clock.now());
                info!(%pad, "source linked");
            }
            (_, Err(e)) => warn!(%pad, error = %e, "source output not linked"),
        }
    }

    // Replacement is linked: back to steady and watching for the next swap.
    fn complete(self: &Arc<Self>, node: NodeId) {
        let now = self.clock.now();
        let completed = self.state.lock().complete(node, now);
        if let Err(e) = completed {
            debug!(error = %e, "late completion ignored");
            return;
        }
        self.publish();

        if let Err(e) = self.install_trigger() {
            self.fail(SwapError::Probe(e));
        }
        let (source, swaps) = {
            let state = self.state.lock();
            (state.current_source().to_string(), state.swaps_completed())
        };
        info!(%source, swaps, "swap complete");
    }

    fn discard(&self, node: NodeId) {
        match self.engine.remove(node) {
            Ok(()) => debug!(%node, "discarded replacement source"),
            Err(e) => warn!(%node, error = %e, "could not discard replacement source"),
        }
    }
}
