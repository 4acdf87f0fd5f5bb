use anyhow::Result;
use clap::{Parser, Subcommand};

mod check_config;
mod run;
mod simulate;

pub use check_config::CheckConfigCommand;
pub use run::{ConfigArgs, RunCommand};
pub use simulate::SimulateCommand;

#[derive(Parser, Debug)]
#[command(name = "vidswap")]
#[command(about = "Relay a live source through a transcode chain, hot-swapping the source")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay (default)
    Run(RunCommand),
    /// Run the relay against the in-process engine and print a swap summary
    Simulate(SimulateCommand),
    /// Validate the configuration and print the effective values
    CheckConfig(CheckConfigCommand),
}

impl Args {
    pub async fn run(self) -> Result<()> {
        let command = self
            .command
            .unwrap_or(Command::Run(RunCommand::default()));

        match command {
            Command::Run(cmd) => cmd.run().await,
            Command::Simulate(cmd) => cmd.run().await,
            Command::CheckConfig(cmd) => cmd.run().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn run_is_the_default() {
        let args = Args::try_parse_from(["vidswap"]).unwrap();
        assert!(args.command.is_none());
    }

    #[test]
    fn run_flags_parse() {
        let args = Args::try_parse_from([
            "vidswap",
            "run",
            "--source",
            "rtsp://a/x",
            "--next-source",
            "rtsp://b/x",
            "--next-source",
            "rtsp://c/x",
            "--sink",
            "udp",
            "--sink-port",
            "5000",
            "--swap-interval",
            "10",
            "--engine",
            "sim",
        ])
        .unwrap();
        let Some(Command::Run(cmd)) = args.command else {
            panic!("expected run");
        };
        let config = cmd.config.resolve().unwrap();
        assert_eq!(config.source, "rtsp://a/x");
        assert_eq!(config.next_sources, ["rtsp://b/x", "rtsp://c/x"]);
        assert_eq!(config.sink.port, 5000);
        assert_eq!(config.swap.interval_secs, 10);
    }
}
