//! Tracing subscriber setup.

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use shapeshare_core::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, else the configured level plus
/// per-crate directives, else `info` (`debug` with `--verbose`).
pub fn env_filter(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let mut filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))?;
    for directive in &logging.filters {
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("invalid log filter '{directive}'"))?,
        );
    }
    Ok(filter)
}

pub fn init(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = env_filter(logging, verbose)?;
    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_reported() {
        // Only meaningful when RUST_LOG is not set for the test run.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let logging = LoggingConfig {
            filters: vec!["shapeshare_sync=loud".into()],
            ..Default::default()
        };
        assert!(env_filter(&logging, false).is_err());

        let logging = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["shapeshare_sync=debug".into()],
            ..Default::default()
        };
        assert!(env_filter(&logging, false).is_ok());
    }
}
