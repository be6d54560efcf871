use serde::Deserialize;
use std::time::Duration;

const POLL_INTERVAL_BOUNDS_SECS: (u64, u64) = (10, 60);

#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_poll_interval_secs")]
    pub(crate) poll_interval_secs: u64,

    /// How many ticks may try to send the post before it's given up on
    #[serde(default = "default_max_send_attempts")]
    pub(crate) max_send_attempts: u32,
}

impl Config {
    pub(crate) fn poll_interval(&self) -> Duration {
        let (min, max) = POLL_INTERVAL_BOUNDS_SECS;
        Duration::from_secs(self.poll_interval_secs.clamp(min, max))
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_send_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()));

        envy::prefixed("PUBLISHER_").from_iter(vars).unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = load(&[]);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.max_send_attempts, 3);
    }

    #[test]
    fn poll_interval_is_clamped() {
        let cfg = load(&[("PUBLISHER_POLL_INTERVAL_SECS", "1")]);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));

        let cfg = load(&[("PUBLISHER_POLL_INTERVAL_SECS", "3600")]);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));

        let cfg = load(&[
            ("PUBLISHER_POLL_INTERVAL_SECS", "15"),
            ("PUBLISHER_MAX_SEND_ATTEMPTS", "5"),
        ]);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(15));
        assert_eq!(cfg.max_send_attempts, 5);
    }
}
