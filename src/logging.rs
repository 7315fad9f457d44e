//! tracing-subscriber setup for the daemon. Library code only emits events.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn setup_logging(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // journald adds its own timestamp and host
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_timer(HostTimer {
                    hostname: short_hostname(),
                })
                .compact()
                .init();
        }
    }
}

fn short_hostname() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    hostname.split('.').next().unwrap_or(&hostname).to_string()
}

/// UTC time plus host, e.g. "2025-12-10 18:09:43.150 [server1]".
struct HostTimer {
    hostname: String,
}

impl fmt::time::FormatTime for HostTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::fmt::time::FormatTime;

    #[test]
    fn test_timer_includes_hostname() {
        let timer = HostTimer {
            hostname: "node1".to_string(),
        };
        let mut out = String::new();
        timer
            .format_time(&mut fmt::format::Writer::new(&mut out))
            .unwrap();
        assert!(out.ends_with(" [node1]"));
        assert_eq!(out.len(), "2025-12-10 18:09:43.150 [node1]".len());
    }

    #[test]
    fn test_short_hostname_has_no_domain() {
        assert!(!short_hostname().contains('.'));
    }
}
