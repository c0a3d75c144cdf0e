//! Allocator configuration.
//!
//! Two environment variables configure the process allocator:
//! - `LMEM_MODE`: `compat` (default) keeps the historical arithmetic and copy
//!   behavior bit-for-bit, including the unchecked `count * size` product and
//!   the resize copy of the *new* length. `checked` opts into overflow checks
//!   and a resize copy clamped to the old payload.
//! - `LMEM_MMAP`: `on` (default when the `mmap` feature is enabled) or `off`.
//!   When off, every request is served from the break segment.
//!
//! Embedders that own a [`crate::malloc::MallocState`] pass an
//! [`AllocatorConfig`] directly and never consult the environment.

use std::sync::atomic::{AtomicU8, Ordering};

/// Arithmetic and copy discipline of the public operations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckMode {
    /// Drop-in behavior: sizes wrap on overflow and heap resize copies the
    /// requested length even when the old payload was smaller.
    #[default]
    Compat,
    /// Overflowing size computations fail with
    /// [`crate::malloc::AllocError::SizeOverflow`], and heap resize copies
    /// only the bytes the old payload actually holds.
    Checked,
}

impl CheckMode {
    /// Parse from string (case-insensitive). Unknown values fall back to
    /// [`CheckMode::Compat`].
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "checked" | "strict" | "safe" => Self::Checked,
            _ => Self::Compat,
        }
    }

    /// Returns true if size arithmetic must be overflow-checked.
    #[must_use]
    pub const fn checks_overflow(self) -> bool {
        matches!(self, Self::Checked)
    }

    /// Stable label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compat => "compat",
            Self::Checked => "checked",
        }
    }
}

/// Per-instance allocator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Arithmetic/copy discipline.
    pub mode: CheckMode,
    /// Serve requests at or above the mapping threshold from dedicated
    /// anonymous mappings.
    pub mmap_enabled: bool,
    /// Record [`crate::malloc::AllocatorLogRecord`]s. Recording allocates, so
    /// this must stay off when the state backs the process allocator.
    pub lifecycle_logging: bool,
}

impl AllocatorConfig {
    /// Configuration with every field at its compiled default.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: CheckMode::Compat,
            mmap_enabled: cfg!(feature = "mmap"),
            lifecycle_logging: false,
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_mmap(mut self, enabled: bool) -> Self {
        self.mmap_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_lifecycle_logging(mut self, enabled: bool) -> Self {
        self.lifecycle_logging = enabled;
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

// Atomic cache: 0=unresolved, 255=resolving, otherwise RESOLVED_BIT plus
// one bit per setting. Must not block: std::env::var allocates, which
// re-enters malloc while resolution is in progress.
static CACHED_CONFIG: AtomicU8 = AtomicU8::new(0);

const CONFIG_UNRESOLVED: u8 = 0;
const CONFIG_RESOLVING: u8 = 255;
const RESOLVED_BIT: u8 = 0x80;
const CHECKED_BIT: u8 = 0x01;
const MMAP_BIT: u8 = 0x02;

fn parse_mmap_env(raw: &str) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "off" | "0" | "false" | "no" | "disabled" => false,
        "on" | "1" | "true" | "yes" | "enabled" => true,
        _ => cfg!(feature = "mmap"),
    }
}

fn encode(config: AllocatorConfig) -> u8 {
    let mut bits = RESOLVED_BIT;
    if config.mode.checks_overflow() {
        bits |= CHECKED_BIT;
    }
    if config.mmap_enabled {
        bits |= MMAP_BIT;
    }
    bits
}

fn decode(bits: u8) -> AllocatorConfig {
    let mode = if bits & CHECKED_BIT != 0 {
        CheckMode::Checked
    } else {
        CheckMode::Compat
    };
    AllocatorConfig::new()
        .with_mode(mode)
        .with_mmap(bits & MMAP_BIT != 0)
}

/// Get the process configuration (reads the environment on first call,
/// caches thereafter). Lifecycle logging is always off.
///
/// A reentrant call that arrives while the environment is being read
/// receives [`AllocatorConfig::new`] instead of blocking.
#[must_use]
pub fn process_config() -> AllocatorConfig {
    let cached = CACHED_CONFIG.load(Ordering::Relaxed);

    if cached != CONFIG_UNRESOLVED && cached != CONFIG_RESOLVING {
        return decode(cached);
    }
    if cached == CONFIG_RESOLVING {
        return AllocatorConfig::new();
    }

    if CACHED_CONFIG
        .compare_exchange(
            CONFIG_UNRESOLVED,
            CONFIG_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_CONFIG.load(Ordering::Relaxed);
        return if v != CONFIG_UNRESOLVED && v != CONFIG_RESOLVING {
            decode(v)
        } else {
            AllocatorConfig::new()
        };
    }

    let mode = std::env::var("LMEM_MODE")
        .map(|v| CheckMode::from_str_loose(&v))
        .unwrap_or_default();
    let mmap_enabled = std::env::var("LMEM_MMAP")
        .map(|v| parse_mmap_env(&v))
        .unwrap_or(cfg!(feature = "mmap"));
    let config = AllocatorConfig::new()
        .with_mode(mode)
        .with_mmap(mmap_enabled);
    CACHED_CONFIG.store(encode(config), Ordering::Release);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_check_modes() {
        assert_eq!(CheckMode::from_str_loose("compat"), CheckMode::Compat);
        assert_eq!(CheckMode::from_str_loose("CHECKED"), CheckMode::Checked);
        assert_eq!(CheckMode::from_str_loose("strict"), CheckMode::Checked);
        assert_eq!(CheckMode::from_str_loose("bogus"), CheckMode::Compat);
    }

    #[test]
    fn default_is_compat_without_logging() {
        let config = AllocatorConfig::default();
        assert_eq!(config.mode, CheckMode::Compat);
        assert!(!config.lifecycle_logging);
        assert_eq!(config.mmap_enabled, cfg!(feature = "mmap"));
    }

    #[test]
    fn mmap_env_parser() {
        assert!(!parse_mmap_env("off"));
        assert!(!parse_mmap_env("0"));
        assert!(parse_mmap_env("ON"));
        assert_eq!(parse_mmap_env("maybe"), cfg!(feature = "mmap"));
    }

    #[test]
    fn encoding_round_trips_every_combination() {
        for mode in [CheckMode::Compat, CheckMode::Checked] {
            for mmap in [false, true] {
                let config = AllocatorConfig::new().with_mode(mode).with_mmap(mmap);
                let bits = encode(config);
                assert_ne!(bits, CONFIG_UNRESOLVED);
                assert_ne!(bits, CONFIG_RESOLVING);
                assert_eq!(decode(bits), config);
            }
        }
    }

    #[test]
    fn cached_config_is_process_sticky_until_cache_reset() {
        let checked = AllocatorConfig::new()
            .with_mode(CheckMode::Checked)
            .with_mmap(false);
        let previous = CACHED_CONFIG.swap(encode(checked), Ordering::SeqCst);
        assert_eq!(process_config(), checked);
        assert_eq!(process_config(), checked);

        CACHED_CONFIG.store(CONFIG_RESOLVING, Ordering::SeqCst);
        assert_eq!(
            process_config(),
            AllocatorConfig::new(),
            "reentrant resolution must see the defaults"
        );

        CACHED_CONFIG.store(previous, Ordering::SeqCst);
    }
}
