//! Exchange configuration.

use std::time::Duration;

use tether_core::ForceMode;

/// Exchange configuration parameters (immutable after construction).
///
/// `nneighs`, the force mode, and the channel's precision are fixed for the
/// channel's lifetime; only the particle count may change between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Per-particle neighbor capacity. Zero skips the neighbor send
    /// entirely (the force computation is not neighbor-dependent).
    pub nneighs: usize,
    /// How received forces combine with the simulation's accumulator.
    pub mode: ForceMode,
    /// Whether to receive and accumulate the per-particle virial.
    pub receive_virial: bool,
    /// Optional bound on each blocking receive; `None` waits indefinitely.
    pub receive_timeout: Option<Duration>,
}

impl ExchangeConfig {
    /// Create a configuration with virial reception off and no timeout.
    pub const fn new(nneighs: usize, mode: ForceMode) -> Self {
        Self {
            nneighs,
            mode,
            receive_virial: false,
            receive_timeout: None,
        }
    }

    /// Enable virial reception.
    #[must_use]
    pub const fn with_virial(mut self) -> Self {
        self.receive_virial = true;
        self
    }

    /// Bound each blocking receive.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::new(0, ForceMode::Overwrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = ExchangeConfig::new(8, ForceMode::Add)
            .with_virial()
            .with_timeout(Duration::from_secs(1));
        assert_eq!(config.nneighs, 8);
        assert_eq!(config.mode, ForceMode::Add);
        assert!(config.receive_virial);
        assert_eq!(config.receive_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_config_default() {
        let config = ExchangeConfig::default();
        assert_eq!(config.nneighs, 0);
        assert_eq!(config.mode, ForceMode::Overwrite);
        assert!(!config.receive_virial);
        assert_eq!(config.receive_timeout, None);
    }
}
