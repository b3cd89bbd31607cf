//! Operational modes for mock devices.
//!
//! - **Instant**: readbacks follow a write before the write is acknowledged
//! - **Realistic**: readbacks evolve on a background tick (lag, ramp, latency)
//! - **Chaos**: realistic, plus noise on every published readback

use serde::Deserialize;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Readback jumps to the written value. For unit tests.
    #[default]
    Instant,
    /// Hardware-like dynamics. For integration tests.
    Realistic,
    /// Hardware-like dynamics with noise. For resilience testing.
    Chaos,
}

impl MockMode {
    /// Whether writes take effect immediately with no dynamics.
    pub fn is_instant(&self) -> bool {
        matches!(self, MockMode::Instant)
    }

    /// Whether readbacks carry random noise.
    pub fn is_noisy(&self) -> bool {
        matches!(self, MockMode::Chaos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(MockMode::default().is_instant());
    }

    #[test]
    fn test_only_chaos_is_noisy() {
        assert!(!MockMode::Instant.is_noisy());
        assert!(!MockMode::Realistic.is_noisy());
        assert!(MockMode::Chaos.is_noisy());
    }

    #[test]
    fn test_mode_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            mode: MockMode,
        }
        let doc: Doc = toml::from_str("mode = \"chaos\"").unwrap();
        assert_eq!(doc.mode, MockMode::Chaos);
    }
}
