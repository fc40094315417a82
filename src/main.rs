use anyhow::Result;
use clap::Parser;
use qcapture::app::{self, App};
use qcapture::args::{Args, Command};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command.clone() {
        Command::Run(run) => App::new(&args, &run).await?.run().await,
        Command::Capture(cap) => app::run_capture(&args, &cap).await,
    }
}
