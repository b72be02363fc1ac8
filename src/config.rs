use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for the orchestration core. Loaded from an optional TOML
/// file; missing or malformed files fall back to defaults so the host app
/// always starts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct CoreConfig {
    /// Preferred hook server port; 0 or an occupied port falls back to an
    /// ephemeral one.
    pub hook_port: u16,
    /// Milliseconds of silence after which a running session counts as idle.
    pub quiet_interval_ms: u64,
    /// Milliseconds a derived attention state must hold before it is
    /// reported externally.
    pub debounce_window_ms: u64,
    /// Milliseconds between graceful stop and forced kill.
    pub termination_grace_ms: u64,
    /// Milliseconds the hook server waits for in-flight requests on stop.
    pub drain_timeout_ms: u64,
    /// Maximum idle reserved worktrees kept per repository.
    pub pool_ceiling: usize,
    /// Minutes after which an unowned on-disk worktree counts as orphaned.
    pub orphan_age_minutes: i64,
    /// Milliseconds budget for a single worktree delete during cleanup.
    pub cleanup_item_timeout_ms: u64,
    /// Bounded event buffer size while no remote sink is attached.
    pub event_buffer_size: usize,
    /// Whether needs-attention transitions raise native notifications.
    pub notifications_enabled: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hook_port: 8547,
            quiet_interval_ms: 10_000,
            debounce_window_ms: 1_500,
            termination_grace_ms: 2_000,
            drain_timeout_ms: 3_000,
            pool_ceiling: 4,
            orphan_age_minutes: 60,
            cleanup_item_timeout_ms: 5_000,
            event_buffer_size: 512,
            notifications_enabled: true,
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read config at {}: {e}", path.display());
                return Self::default();
            }
        };

        match toml::from_str::<CoreConfig>(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to parse config, using defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn cleanup_item_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_item_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CoreConfig::load(&temp.path().join("absent.toml"));
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.toml");
        std::fs::write(&path, "quiet_interval_ms = 250\npool_ceiling = 9\n").unwrap();

        let config = CoreConfig::load(&path);
        assert_eq!(config.quiet_interval(), Duration::from_millis(250));
        assert_eq!(config.pool_ceiling, 9);
        assert_eq!(
            config.debounce_window_ms,
            CoreConfig::default().debounce_window_ms
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core.toml");
        std::fs::write(&path, "quiet_interval_ms = \"not a number\"").unwrap();

        assert_eq!(CoreConfig::load(&path), CoreConfig::default());
    }
}
