use std::env;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs console logging on stderr, filtered by `RUST_LOG` (default `info`).
pub fn init(service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (ansi, ansi_warning) = parse_ansi(env::var("ASSEMBLIT_LOG_ANSI").ok().as_deref());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi),
        )
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;

    if let Some(message) = ansi_warning {
        warn!("{message}");
    }
    info!(service = service_name, ansi, "telemetry configured");
    Ok(())
}

pub fn parse_ansi(raw: Option<&str>) -> (bool, Option<String>) {
    match raw.map(str::trim) {
        None => (true, None),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => (true, None),
            "0" | "false" | "no" | "off" => (false, None),
            _ => (
                true,
                Some(format!(
                    "ASSEMBLIT_LOG_ANSI='{value}' is not a boolean; defaulting to true"
                )),
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::parse_ansi;

    #[test]
    fn parse_known_flags() {
        assert_eq!(parse_ansi(None), (true, None));
        assert_eq!(parse_ansi(Some(" off ")), (false, None));
        assert_eq!(parse_ansi(Some("TRUE")), (true, None));
    }

    #[test]
    fn parse_invalid_flag() {
        let (ansi, warning) = parse_ansi(Some("maybe"));
        assert!(ansi);
        assert!(warning
            .unwrap()
            .contains("ASSEMBLIT_LOG_ANSI='maybe' is not a boolean"));
    }
}
