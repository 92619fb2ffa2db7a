// ABOUTME: Tracing setup shared by the convoke router, orchestrator and agents.
// ABOUTME: Logs go to stderr so stdout stays free for command output.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber at INFO. `RUST_LOG` wins when set.
pub fn init() {
    init_with_verbosity(0);
}

/// Install the stderr subscriber with the level raised by `-v` flags.
///
/// `0` is INFO for convoke crates and WARN for dependencies, `1` is DEBUG
/// for convoke crates, `2` or more is TRACE everywhere.
pub fn init_with_verbosity(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbosity))
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0)
        .try_init();
}

const CRATES: [&str; 7] = [
    "convoke",
    "convoke_cli",
    "convoke_connect",
    "convoke_correlator",
    "convoke_orchestrator",
    "convoke_proto",
    "convoke_serve",
];

fn directives(verbosity: u8) -> String {
    let (ours, rest) = match verbosity {
        0 => (Level::INFO, Level::WARN),
        1 => (Level::DEBUG, Level::WARN),
        _ => (Level::TRACE, Level::TRACE),
    };
    let ours = ours.to_string().to_lowercase();
    let mut parts = vec![rest.to_string().to_lowercase()];
    parts.extend(CRATES.iter().map(|name| format!("{}={}", name, ours)));
    parts.join(",")
}

fn filter_for(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(verbosity)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_keeps_dependencies_at_warn() {
        let d = directives(0);
        assert!(d.starts_with("warn,"));
        assert!(d.contains("convoke_serve=info"));
        assert!(d.contains("convoke_proto=info"));
    }

    #[test]
    fn verbose_raises_only_our_crates() {
        let d = directives(1);
        assert!(d.starts_with("warn,"));
        assert!(d.contains("convoke_orchestrator=debug"));
    }

    #[test]
    fn very_verbose_traces_everything() {
        assert!(directives(3).starts_with("trace,"));
    }

    #[test]
    fn directives_parse() {
        for v in 0..3 {
            assert!(EnvFilter::try_new(directives(v)).is_ok());
        }
    }

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init_with_verbosity(2);
    }
}
