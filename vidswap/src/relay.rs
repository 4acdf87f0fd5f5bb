/*!
    The whole relay: stage chain, initial source and swap coordinator on one
    engine, plus the loop that services the bus and protocol deadlines.
*/

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::{StageChain, default_stages};
use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::coordinator::{Coordinator, SourceSettings};
use crate::engine::{BusMessage, BusReceiver, Engine, NodeId, RunState};
use crate::trigger::ManualPolicy;

/// How often protocol deadlines are checked.
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Why [`Relay::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    EndOfStream,
}

pub struct Relay {
    engine: Arc<dyn Engine>,
    chain: StageChain,
    coordinator: Coordinator,
    initial_source: NodeId,
    requests: Arc<ManualPolicy>,
    bus: BusReceiver,
}

impl Relay {
    /**
        Validate `config` and assemble the pipeline. Nothing runs until
        [`Relay::start`].
    */
    pub fn build(
        engine: Arc<dyn Engine>,
        clock: Arc<dyn Clock>,
        config: &RelayConfig,
    ) -> Result<Self> {
        config.validate()?;
        let bus = engine.watch_bus();
        let requests = Arc::new(ManualPolicy::new());

        let chain = StageChain::build(engine.as_ref(), &default_stages(&config.sink))
            .context("Failed to build stage chain")?;
        let coordinator = Coordinator::new(
            Arc::clone(&engine),
            clock,
            config.trigger(Arc::clone(&requests)),
            &chain,
            &config.source,
            SourceSettings {
                latency: config.source_latency,
                ..SourceSettings::default()
            },
            config.swap.timings(),
        )
        .context("Failed to set up swap coordinator")?;
        let initial_source = coordinator
            .start()
            .context("Failed to create initial source")?;

        Ok(Self {
            engine,
            chain,
            coordinator,
            initial_source,
            requests,
            bus,
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    pub fn initial_source(&self) -> NodeId {
        self.initial_source
    }

    /**
        Handle for asking for a swap now. The next buffer at the checkpoint
        starts it, unless a swap is already under way.
    */
    pub fn swap_requests(&self) -> Arc<ManualPolicy> {
        Arc::clone(&self.requests)
    }

    pub fn start(&self) -> Result<()> {
        self.engine
            .set_state(RunState::Playing)
            .context("Unable to set the pipeline to the playing state")?;
        info!("pipeline playing");
        Ok(())
    }

    /**
        Service the bus and deadlines until shutdown is signalled, the
        pipeline reaches end-of-stream, or the bus reports an error.

        The pipeline is brought down to null on every exit path.
    */
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ExitReason> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => self.coordinator.tick(),
                message = self.bus.recv() => match message {
                    Some(BusMessage::Error { source, message }) => {
                        error!(%source, "{}", message);
                        break Err(anyhow!("Pipeline error from {}: {}", source, message));
                    }
                    Some(BusMessage::Warning { source, message }) => {
                        warn!(%source, "{}", message);
                    }
                    Some(BusMessage::Eos) => {
                        info!("end of stream reached");
                        break Ok(ExitReason::EndOfStream);
                    }
                    Some(BusMessage::StateChanged { old, new }) => {
                        debug!(%old, %new, "pipeline state changed");
                    }
                    None => break Ok(ExitReason::Shutdown),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(ExitReason::Shutdown);
                    }
                }
            }
        };

        self.coordinator.shutdown();
        if let Err(e) = self.engine.set_state(RunState::Null) {
            warn!(error = %e, "pipeline did not stop cleanly");
        }
        let snapshot = self.coordinator.snapshot();
        info!(
            swaps = snapshot.swaps_completed,
            source = %snapshot.current_source,
            "relay stopped"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::sim::SimEngine;
    use crate::state::SwapPhase;

    fn relay(engine: &SimEngine, config: &RelayConfig) -> Relay {
        Relay::build(
            Arc::new(engine.clone()),
            Arc::new(ManualClock::new()),
            config,
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_before_building() {
        let engine = SimEngine::new();
        let mut config = RelayConfig::default();
        config.source = "nonsense".to_string();
        let built = Relay::build(Arc::new(engine.clone()), Arc::new(ManualClock::new()), &config);
        assert!(built.is_err());
        assert_eq!(engine.created("rtph264depay"), 0);
    }

    #[test]
    fn start_plays_and_links_initial_source() {
        let engine = SimEngine::new();
        let relay = relay(&engine, &RelayConfig::default());
        relay.start().unwrap();
        assert_eq!(engine.state(), RunState::Playing);
        let checkpoint = relay.coordinator().checkpoint().clone();
        assert_eq!(engine.peer(&checkpoint).map(|p| p.node), Some(relay.initial_source()));
        assert_eq!(relay.chain().len(), 5);
    }

    #[test]
    fn requested_swap_runs_without_waiting_for_interval() {
        let engine = SimEngine::new();
        let relay = relay(&engine, &RelayConfig::default());
        relay.start().unwrap();
        engine.pump();
        assert_eq!(relay.coordinator().snapshot().swaps_completed, 0);

        relay.swap_requests().request();
        engine.pump();
        assert_eq!(relay.coordinator().phase(), SwapPhase::Draining);
        engine.run_async();

        let snapshot = relay.coordinator().snapshot();
        assert_eq!(snapshot.swaps_completed, 1);
        assert_eq!(snapshot.current_source, crate::config::DEFAULT_NEXT_SOURCE);
        assert!(!relay.swap_requests().is_armed());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_loop() {
        let engine = SimEngine::new();
        let relay = relay(&engine, &RelayConfig::default());
        relay.start().unwrap();
        let coordinator = relay.coordinator().clone();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(rx));
        tx.send(true).unwrap();
        let reason = handle.await.unwrap().unwrap();

        assert_eq!(reason, ExitReason::Shutdown);
        assert_eq!(coordinator.phase(), SwapPhase::Stopped);
        assert_eq!(engine.state(), RunState::Null);
    }

    #[tokio::test]
    async fn bus_error_is_fatal() {
        let engine = SimEngine::new();
        let relay = relay(&engine, &RelayConfig::default());
        relay.start().unwrap();
        engine.post(BusMessage::Error {
            source: "sink".to_string(),
            message: "could not connect".to_string(),
        });

        let (_tx, rx) = watch::channel(false);
        let err = relay.run(rx).await.unwrap_err();
        assert!(err.to_string().contains("could not connect"));
        assert_eq!(engine.state(), RunState::Null);
    }

    #[tokio::test]
    async fn end_of_stream_ends_the_run() {
        let engine = SimEngine::new();
        let relay = relay(&engine, &RelayConfig::default());
        relay.start().unwrap();
        let checkpoint = relay.coordinator().checkpoint().clone();
        engine.send_eos(&checkpoint).unwrap();

        let (_tx, rx) = watch::channel(false);
        assert_eq!(relay.run(rx).await.unwrap(), ExitReason::EndOfStream);
    }
}
