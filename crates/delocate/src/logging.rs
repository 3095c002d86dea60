use std::env;

use anstream::ColorChoice;
use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_tree::HierarchicalLayer;
use tracing_tree::time::Uptime;

use delocate_logging::DelocateFormat;
use delocate_static::EnvVars;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    /// Show warnings only (overridable by `RUST_LOG`).
    #[default]
    Default,
    /// Show debug messages by default (overridable by `RUST_LOG`).
    Verbose,
    /// Show messages in a hierarchical span tree. By default, trace messages are shown (overridable by `RUST_LOG`).
    ExtraVerbose,
}

impl Level {
    fn default_directives(self) -> &'static str {
        match self {
            Self::Default => "warn",
            Self::Verbose => "warn,delocate=debug,delocate_core=debug",
            Self::ExtraVerbose => "warn,delocate=trace,delocate_core=trace",
        }
    }
}

/// Configure `tracing` based on the given [`Level`], taking into account the `RUST_LOG` environment
/// variable.
///
/// The [`Level`] is used to dictate the default filters (which can be overridden by the `RUST_LOG`
/// environment variable) along with the formatting of the output. For example, [`Level::Verbose`]
/// includes targets, along with all `delocate=debug` messages by default.
pub(crate) fn setup_logging(level: Level) -> anyhow::Result<()> {
    let filter = match env::var(EnvVars::RUST_LOG) {
        Ok(directives) if !directives.is_empty() => EnvFilter::builder()
            .parse(&directives)
            .context("Invalid RUST_LOG directives")?,
        _ => EnvFilter::builder().parse_lossy(level.default_directives()),
    };

    match level {
        Level::Default | Level::Verbose => {
            let format = if level == Level::Verbose {
                DelocateFormat::verbose()
            } else {
                DelocateFormat::default()
            };
            let ansi = match anstream::Stderr::choice(&std::io::stderr()) {
                ColorChoice::Always | ColorChoice::AlwaysAnsi => true,
                ColorChoice::Never => false,
                // We just asked anstream for a choice, that can't be auto
                ColorChoice::Auto => unreachable!(),
            };
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .event_format(format)
                        .with_writer(std::io::stderr)
                        .with_ansi(ansi)
                        .with_filter(filter),
                )
                .init();
        }
        Level::ExtraVerbose => {
            // Regardless of the tracing level, include the uptime and target for each message.
            tracing_subscriber::registry()
                .with(
                    HierarchicalLayer::default()
                        .with_targets(true)
                        .with_timer(Uptime::default())
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .init();
        }
    }

    Ok(())
}
