//! Process-wide tracing setup

use tenure_config::LoggingConfig;
use tracing::Level;

/// Parse a configured level name; unknown names fall back to `info`
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

/// Install a stderr fmt subscriber at the configured level
///
/// Returns false when a global subscriber was already installed, which is the
/// normal case in tests and embedding hosts.
pub fn init_logging(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(&config.level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level(" warn "), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
        assert_eq!(parse_level("1"), Level::ERROR);
    }

    #[test]
    fn test_second_init_is_refused() {
        let config = LoggingConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
