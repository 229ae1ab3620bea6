use std::time::Duration;

/// Server tunables, fixed at startup.
///
/// The cleanup thresholds are deliberately configuration rather than
/// hard-coded behavior; deployments disagree on how long a finished match
/// should stay observable.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Clock allotment per side at session creation.
    pub initial_allotment: Duration,
    /// How long a disconnected participant may stay away before forfeiting.
    pub grace_period: Duration,
    /// Granularity of clock-update broadcasts. Accounting is exact-elapsed,
    /// so this only affects how often clients hear about it.
    pub tick_interval: Duration,
    /// How often the janitor scans the registry.
    pub janitor_period: Duration,
    /// Idle time after which an ended, fully-disconnected session is reaped.
    pub ended_cooldown: Duration,
    /// Idle time after which a still-active but fully-disconnected session
    /// is forcibly ended and reaped.
    pub stuck_threshold: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            initial_allotment: Duration::from_secs(900),
            grace_period: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            janitor_period: Duration::from_secs(120),
            ended_cooldown: Duration::from_secs(120),
            stuck_threshold: Duration::from_secs(600),
        }
    }
}

impl ServerConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("MATCH_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.initial_allotment = env_secs("MATCH_INITIAL_SECS", config.initial_allotment);
        config.grace_period = env_secs("MATCH_GRACE_SECS", config.grace_period);
        config.tick_interval = env_millis("MATCH_TICK_MS", config.tick_interval);
        config.janitor_period = env_secs("MATCH_JANITOR_SECS", config.janitor_period);
        config.ended_cooldown = env_secs("MATCH_ENDED_COOLDOWN_SECS", config.ended_cooldown);
        config.stuck_threshold = env_secs("MATCH_STUCK_SECS", config.stuck_threshold);
        config
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_ordered_sensibly() {
        let config = ServerConfig::default();
        assert!(config.tick_interval < config.grace_period);
        assert!(config.ended_cooldown <= config.stuck_threshold);
        assert_eq!(config.initial_allotment, Duration::from_secs(900));
    }

    #[test]
    fn env_secs_ignores_garbage() {
        std::env::set_var("MATCH_TEST_GARBAGE", "not-a-number");
        assert_eq!(
            env_secs("MATCH_TEST_GARBAGE", Duration::from_secs(7)),
            Duration::from_secs(7)
        );
        std::env::remove_var("MATCH_TEST_GARBAGE");
    }

    #[test]
    fn env_millis_parses_millisecond_overrides() {
        std::env::set_var("MATCH_TEST_TICK_MS", "250");
        assert_eq!(
            env_millis("MATCH_TEST_TICK_MS", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        assert_eq!(
            env_millis("MATCH_TEST_TICK_UNSET", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        std::env::remove_var("MATCH_TEST_TICK_MS");
    }
}
