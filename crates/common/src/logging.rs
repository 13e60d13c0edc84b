//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates whose events follow the configured level; everything else logs warnings only
const BRIDGE_CRATES: [&str; 4] = ["aoa_bridge", "host", "common", "protocol"];

/// Filter directives for `level` when `RUST_LOG` is not set
fn default_directives(level: &str) -> String {
    let mut directives = String::from("warn");
    for target in BRIDGE_CRATES {
        directives.push_str(&format!(",{}={}", target, level));
    }
    directives
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `level`. Thread names are printed so
/// bridge loop output (`aoa-usb-in`, `aoa-usb-out`, `aoa-usb-events`) can be
/// told apart.
pub fn setup_logging(level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives("debug"),
            "warn,aoa_bridge=debug,host=debug,common=debug,protocol=debug"
        );
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }
}
