use anyhow::{Context, Result};
use clap::Parser;

use super::ConfigArgs;

#[derive(Parser, Debug)]
pub struct CheckConfigCommand {
    #[command(flatten)]
    pub config: ConfigArgs,
}

impl CheckConfigCommand {
    pub async fn run(self) -> Result<()> {
        let config = self.config.resolve()?;
        config.validate().context("Configuration is invalid")?;
        println!("Configuration OK");
        println!();
        print!("{}", config.to_yaml()?);
        Ok(())
    }
}
