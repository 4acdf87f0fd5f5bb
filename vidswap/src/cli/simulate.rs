use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use vidswap::clock::ManualClock;
use vidswap::config::{DEFAULT_NEXT_SOURCE, DEFAULT_SOURCE, RelayConfig};
use vidswap::engine::sim::{Item, SimEngine};
use vidswap::relay::Relay;

#[derive(Parser, Debug)]
pub struct SimulateCommand {
    /// Simulated seconds to run
    #[arg(long, default_value_t = 90)]
    pub duration: u64,

    /// Seconds between swaps
    #[arg(long, default_value_t = 30)]
    pub swap_interval: u64,

    /// Frames per second pushed by each live source
    #[arg(long, default_value_t = 25)]
    pub fps: u32,
}

impl SimulateCommand {
    /**
        Runs on a manual clock, so ninety simulated seconds take a blink.
        Sources alternate between the two default locators.
    */
    pub async fn run(self) -> Result<()> {
        if self.fps == 0 {
            bail!("--fps must be at least 1");
        }

        let mut config = RelayConfig::default();
        config.next_sources = vec![DEFAULT_NEXT_SOURCE.to_string(), DEFAULT_SOURCE.to_string()];
        config.swap.interval_secs = self.swap_interval;

        let engine = SimEngine::new();
        let clock = ManualClock::new();
        let relay = Relay::build(Arc::new(engine.clone()), Arc::new(clock.clone()), &config)
            .context("Failed to build simulated relay")?;
        relay.start()?;
        let sink = relay.chain().last();
        let coordinator = relay.coordinator().clone();

        println!(
            "Simulating {}s at {} fps, swapping every {}s",
            self.duration, self.fps, self.swap_interval
        );

        let frame = Duration::from_secs(1) / self.fps;
        let frames = self.duration.saturating_mul(u64::from(self.fps));
        for _ in 0..frames {
            clock.advance(frame);
            engine.pump();
            coordinator.tick();
        }
        engine.run_async();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true)?;
        relay.run(shutdown_rx).await?;

        let snapshot = coordinator.snapshot();
        println!();
        print!("{}", serde_yaml::to_string(&snapshot)?);

        println!();
        println!("Delivered to sink:");
        for (origin, summary) in summarize(&engine.sink_log(sink)) {
            println!(
                "  {:<40} {:>6} buffers{}",
                origin,
                summary.buffers,
                if summary.in_order { "" } else { "  (out of order)" }
            );
        }

        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct OriginSummary {
    buffers: usize,
    in_order: bool,
}

fn summarize(log: &[Item]) -> BTreeMap<String, OriginSummary> {
    let mut last_seq: BTreeMap<&str, u64> = BTreeMap::new();
    let mut out: BTreeMap<String, OriginSummary> = BTreeMap::new();
    for buffer in log.iter().filter_map(Item::as_buffer) {
        let entry = out.entry(buffer.origin.clone()).or_insert(OriginSummary {
            buffers: 0,
            in_order: true,
        });
        entry.buffers += 1;
        if let Some(previous) = last_seq.insert(&buffer.origin, buffer.seq) {
            if buffer.seq <= previous {
                entry.in_order = false;
            }
        }
    }
    out
}

/**
    Feed a shared simulated engine in real time until shutdown is signalled.
*/
pub fn spawn_pump(
    engine: SimEngine,
    fps: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = Duration::from_secs(1) / fps.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.pump();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use vidswap::engine::sim::SimBuffer;

    use super::*;

    fn buffer(origin: &str, seq: u64) -> Item {
        Item::Buffer(SimBuffer {
            origin: origin.to_string(),
            seq,
            pts: Duration::ZERO,
        })
    }

    #[test]
    fn summary_counts_and_checks_order_per_origin() {
        let log = [buffer("a", 0), buffer("a", 1), buffer("b", 0), buffer("b", 2), buffer("b", 1)];
        let summary = summarize(&log);
        assert_eq!(summary["a"], OriginSummary { buffers: 2, in_order: true });
        assert_eq!(summary["b"], OriginSummary { buffers: 3, in_order: false });
    }

    #[tokio::test]
    async fn short_simulation_swaps_sources() {
        let cmd = SimulateCommand {
            duration: 7,
            swap_interval: 2,
            fps: 10,
        };
        cmd.run().await.unwrap();
    }
}
