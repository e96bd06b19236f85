use std::env;
use std::time::Duration;

use crate::constants::{
    DEFAULT_TIMEOUT_MS, HARD_KILL_GRACE_MS, HOOK_INSTRUCTION_INTERVAL, MAX_TIMEOUT_MS,
    MEMORY_LIMIT_BYTES, OUTPUT_CAP_CHARS, STARTUP_TIMEOUT_MS,
};

/// Runtime configuration.
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub output_cap_chars: usize,
    /// Treat hitting the output cap as a failure instead of truncating.
    pub overflow_is_fatal: bool,
    /// Interpreter instructions between two interrupt/deadline checks.
    pub hook_instruction_interval: u32,
    pub memory_limit_bytes: Option<usize>,
    pub startup_timeout_ms: u64,
    /// Extra time granted to the worker past the script deadline before the
    /// worker context is abandoned and recreated.
    pub hard_kill_grace_ms: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            default_timeout_ms: parsed("SCRIPTRUNNER_TIMEOUT_MS")
                .unwrap_or(defaults.default_timeout_ms),
            max_timeout_ms: parsed("SCRIPTRUNNER_MAX_TIMEOUT_MS").unwrap_or(defaults.max_timeout_ms),
            output_cap_chars: parsed("SCRIPTRUNNER_OUTPUT_CAP")
                .map(|v| v as usize)
                .unwrap_or(defaults.output_cap_chars),
            overflow_is_fatal: lookup("SCRIPTRUNNER_OVERFLOW_FATAL")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(defaults.overflow_is_fatal),
            hook_instruction_interval: parsed("SCRIPTRUNNER_HOOK_INTERVAL")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.hook_instruction_interval),
            memory_limit_bytes: match parsed("SCRIPTRUNNER_MEMORY_LIMIT") {
                Some(0) => None,
                Some(v) => Some(v as usize),
                None => defaults.memory_limit_bytes,
            },
            startup_timeout_ms: parsed("SCRIPTRUNNER_STARTUP_TIMEOUT_MS")
                .unwrap_or(defaults.startup_timeout_ms),
            hard_kill_grace_ms: parsed("SCRIPTRUNNER_HARD_KILL_GRACE_MS")
                .unwrap_or(defaults.hard_kill_grace_ms),
        }
    }

    /// Resolves the timeout of one run: the per-call override clamped to
    /// `max_timeout_ms`, or the default.
    pub fn effective_timeout(&self, override_ms: Option<u64>) -> Duration {
        let ms = override_ms
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn hard_kill_grace(&self) -> Duration {
        Duration::from_millis(self.hard_kill_grace_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: MAX_TIMEOUT_MS,
            output_cap_chars: OUTPUT_CAP_CHARS,
            overflow_is_fatal: false,
            hook_instruction_interval: HOOK_INSTRUCTION_INTERVAL,
            memory_limit_bytes: Some(MEMORY_LIMIT_BYTES),
            startup_timeout_ms: STARTUP_TIMEOUT_MS,
            hard_kill_grace_ms: HARD_KILL_GRACE_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.output_cap_chars, 50_000);
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("SCRIPTRUNNER_TIMEOUT_MS", "250"),
            ("SCRIPTRUNNER_OUTPUT_CAP", "10"),
            ("SCRIPTRUNNER_OVERFLOW_FATAL", "true"),
            ("SCRIPTRUNNER_MEMORY_LIMIT", "0"),
        ]));
        assert_eq!(config.default_timeout_ms, 250);
        assert_eq!(config.output_cap_chars, 10);
        assert!(config.overflow_is_fatal);
        assert_eq!(config.memory_limit_bytes, None);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("SCRIPTRUNNER_TIMEOUT_MS", "soon"),
            ("SCRIPTRUNNER_HOOK_INTERVAL", "0"),
        ]));
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.hook_instruction_interval, HOOK_INSTRUCTION_INTERVAL);
    }

    #[test]
    fn test_effective_timeout_is_clamped() {
        let config = RuntimeConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_millis(5000));
        assert_eq!(
            config.effective_timeout(Some(120)),
            Duration::from_millis(120)
        );
        assert_eq!(
            config.effective_timeout(Some(10 * MAX_TIMEOUT_MS)),
            Duration::from_millis(MAX_TIMEOUT_MS)
        );
    }
}
