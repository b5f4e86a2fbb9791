#![deny(clippy::as_conversions)]

mod opts;

use std::io;

use opts::Opts;
use raftkvd::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();
    let config = Config::load(&opts.config)?;

    init_logging(config.log_level.as_deref());

    let node = raftkvd::Node::new(config.to_parameters()?)?;

    let node_ctrl = node.get_ctrl();
    node_ctrl.install_signal_handler()?;

    node.wait();

    Ok(())
}

fn init_logging(config_level: Option<&str>) {
    let default_filter = match config_level {
        Some("debug") => "debug",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
