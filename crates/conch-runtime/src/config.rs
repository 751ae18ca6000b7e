//! Environment probing and tracing setup.

use std::io;

/// Runtime switches collected from the environment at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// `DEBUG_ENABLED` (any non-empty value): diagnostic trace to stderr.
    pub debug: bool,
    /// `MOUSE_ENABLED` switch: default mouse reporting when interactive.
    pub mouse: bool,
    /// `CI` / `GITHUB_ACTIONS` (any non-empty value): CI output mode.
    pub ci: bool,
}

impl RuntimeConfig {
    /// Probe the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("DEBUG_ENABLED").ok().as_deref(),
            std::env::var("MOUSE_ENABLED").ok().as_deref(),
            std::env::var("CI").ok().as_deref(),
            std::env::var("GITHUB_ACTIONS").ok().as_deref(),
        )
    }

    fn from_vars(
        debug: Option<&str>,
        mouse: Option<&str>,
        ci: Option<&str>,
        github_actions: Option<&str>,
    ) -> Self {
        Self {
            debug: debug.is_some_and(|v| !v.is_empty()),
            mouse: mouse.is_some_and(is_enabled_switch),
            ci: ci.is_some_and(|v| !v.is_empty())
                || github_actions.is_some_and(|v| !v.is_empty()),
        }
    }

    /// Whether the runtime should drive the terminal interactively
    /// (alternate screen, mouse capture).
    pub fn interactive(&self) -> bool {
        !self.ci
    }

    /// Install the stderr tracing layer when debugging is enabled.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn init_tracing(&self) {
        if !self.debug {
            return;
        }
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init();
    }
}

/// `MOUSE_ENABLED` accepts the usual affirmative spellings.
fn is_enabled_switch(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enable" | "enabled"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_any_non_empty() {
        assert!(RuntimeConfig::from_vars(Some("x"), None, None, None).debug);
        assert!(!RuntimeConfig::from_vars(Some(""), None, None, None).debug);
        assert!(!RuntimeConfig::from_vars(None, None, None, None).debug);
    }

    #[test]
    fn mouse_switch_spellings() {
        for on in ["1", "true", "YES", "On", "enable", "Enabled"] {
            assert!(RuntimeConfig::from_vars(None, Some(on), None, None).mouse);
        }
        for off in ["0", "false", "no", "off", "", "2"] {
            assert!(!RuntimeConfig::from_vars(None, Some(off), None, None).mouse);
        }
    }

    #[test]
    fn ci_detection() {
        assert!(RuntimeConfig::from_vars(None, None, Some("true"), None).ci);
        assert!(RuntimeConfig::from_vars(None, None, None, Some("1")).ci);
        let cfg = RuntimeConfig::from_vars(None, None, None, None);
        assert!(!cfg.ci);
        assert!(cfg.interactive());
    }
}
