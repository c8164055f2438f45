use anyhow::Result as AResult;
use clap::Parser;

mod config;
mod display;
mod events;
mod session;

fn main() -> AResult<()> {
    env_logger::init();

    let cli = config::Cli::parse();
    let config = config::Config::load(&cli)?;

    session::run(config)
}
