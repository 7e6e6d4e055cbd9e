//! testforge - generate and manage API test projects from the command line

use std::io::stderr;

use anyhow::Result;
use clap::Parser as _;
use testforge_cli::cli::Cli;
use testforge_cli::handlers;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Log to stderr so command output on stdout stays parseable.
fn init_logging() {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "testforge=info".into()))
        .with(
            fmt::layer()
                .with_writer(stderr)
                .with_target(true)
                .with_level(true),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    handlers::run(cli).await
}
