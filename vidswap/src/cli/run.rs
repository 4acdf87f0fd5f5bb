use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, ValueEnum};
use tokio::{signal, sync::watch};

use vidswap::clock::SystemClock;
use vidswap::config::{RelayConfig, SinkKind};
use vidswap::engine::Engine;
use vidswap::engine::sim::SimEngine;
use vidswap::error::ConfigError;
use vidswap::relay::{ExitReason, Relay};
use vidswap::trigger::ManualPolicy;

use super::simulate::spawn_pump;

/// Configuration file plus command-line overrides.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Initial source locator
    #[arg(long)]
    pub source: Option<String>,

    /// Replacement source locator (repeat to rotate through several)
    #[arg(long = "next-source")]
    pub next_sources: Vec<String>,

    /// Output kind
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// RTSP publish location
    #[arg(long)]
    pub sink_location: Option<String>,

    /// UDP destination host
    #[arg(long)]
    pub sink_host: Option<String>,

    /// UDP destination port
    #[arg(long)]
    pub sink_port: Option<u16>,

    /// Seconds a source stays live before it is swapped
    #[arg(long)]
    pub swap_interval: Option<u64>,
}

impl ConfigArgs {
    /// Defaults, then the file, then flags.
    pub fn resolve(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = RelayConfig::load(self.config.as_deref())?;
        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if !self.next_sources.is_empty() {
            config.next_sources = self.next_sources.clone();
        }
        if let Some(kind) = self.sink {
            config.sink.kind = kind;
        }
        if let Some(location) = &self.sink_location {
            config.sink.location = location.clone();
        }
        if let Some(host) = &self.sink_host {
            config.sink.host = host.clone();
        }
        if let Some(port) = self.sink_port {
            config.sink.port = port;
        }
        if let Some(interval) = self.swap_interval {
            config.swap.interval_secs = interval;
        }
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// GStreamer (needs the `gst` build feature)
    Gst,
    /// In-process simulation, fed at 25 frames per second
    Sim,
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "gst") { Self::Gst } else { Self::Sim }
    }
}

#[derive(Parser, Debug, Default)]
pub struct RunCommand {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Pipeline engine
    #[arg(long, value_enum, default_value_t = EngineKind::default())]
    pub engine: EngineKind,
}

impl RunCommand {
    pub async fn run(self) -> Result<()> {
        let config = self.config.resolve()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (engine, pump) = match self.engine {
            EngineKind::Sim => {
                let sim = SimEngine::new();
                let pump = spawn_pump(sim.clone(), 25, shutdown_rx.clone());
                (Arc::new(sim) as Arc<dyn Engine>, Some(pump))
            }
            EngineKind::Gst => (gst_engine()?, None),
        };

        println!("Source: {}", config.source);
        println!("Replacements: {}", config.next_sources.join(", "));
        println!("Swap interval: {}s", config.swap.interval_secs);

        let relay = Relay::build(engine, Arc::new(SystemClock), &config)?;
        relay.start()?;
        listen_for_swap_requests(relay.swap_requests())?;

        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                println!("\nShutting down...");
            }
            let _ = shutdown_tx.send(true);
        });

        let reason = relay.run(shutdown_rx).await?;
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        match reason {
            ExitReason::EndOfStream => println!("End of stream reached."),
            ExitReason::Shutdown => println!("Done."),
        }
        Ok(())
    }
}

/// SIGUSR1 asks for a swap right away.
#[cfg(unix)]
fn listen_for_swap_requests(requests: Arc<ManualPolicy>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    println!("Send SIGUSR1 to swap now");
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            println!("Swap requested");
            requests.request();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn listen_for_swap_requests(_requests: Arc<ManualPolicy>) -> Result<()> {
    Ok(())
}

#[cfg(feature = "gst")]
fn gst_engine() -> Result<Arc<dyn Engine>> {
    Ok(Arc::new(vidswap::engine::gst::GstEngine::new()?))
}

#[cfg(not(feature = "gst"))]
fn gst_engine() -> Result<Arc<dyn Engine>> {
    anyhow::bail!(
        "Built without GStreamer support; rebuild with `--features gst` or pass `--engine sim`"
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "source: rtsp://file/src\nswap:\n  interval_secs: 12\n").unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            swap_interval: Some(7),
            sink: Some(SinkKind::Udp),
            ..ConfigArgs::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.source, "rtsp://file/src");
        assert_eq!(config.swap.interval_secs, 7);
        assert_eq!(config.sink.kind, SinkKind::Udp);
    }
}
