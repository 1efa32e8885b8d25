//! Interpreter configuration
//!
//! Every knob has a default and an environment override:
//!
//! | Variable                | Default     | Meaning                                   |
//! |-------------------------|-------------|-------------------------------------------|
//! | `CELLVM_STACK_LIMIT`    | 1 MiB       | native stack bytes before a fatal overflow|
//! | `CELLVM_MAX_DEPTH`      | 4096        | frame depth before a fatal overflow       |
//! | `CELLVM_GC_BALLAST`     | 3,000,000   | bytes allocated between collections       |
//! | `CELLVM_GC_DISABLE`     | unset       | `1`/`true` turns the collector off        |
//! | `CELLVM_HEAP_LIMIT`     | unset       | live bytes after collection that are fatal|
//! | `CELLVM_VARLIST_CACHE`  | 32          | recycled varlist buffers kept per size    |
//!
//! Malformed values are ignored with a warning rather than aborting startup.

use cellvm_core::heap::DEFAULT_BALLAST;
use std::str::FromStr;

pub const DEFAULT_STACK_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_MAX_DEPTH: usize = 4096;
pub const DEFAULT_VARLIST_CACHE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Native stack bytes the evaluator may use below its entry point.
    pub stack_limit: usize,
    /// Maximum number of live frames.
    pub max_depth: usize,
    pub gc_ballast: usize,
    pub gc_disabled: bool,
    pub heap_limit: Option<usize>,
    /// Buffers kept per parameter-count bucket in the varlist arena.
    pub varlist_cache: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_limit: DEFAULT_STACK_LIMIT,
            max_depth: DEFAULT_MAX_DEPTH,
            gc_ballast: DEFAULT_BALLAST,
            gc_disabled: false,
            heap_limit: None,
            varlist_cache: DEFAULT_VARLIST_CACHE,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            stack_limit: env_parse("CELLVM_STACK_LIMIT")
                .filter(|&v: &usize| v > 0)
                .unwrap_or(defaults.stack_limit),
            max_depth: env_parse("CELLVM_MAX_DEPTH")
                .filter(|&v: &usize| v > 0)
                .unwrap_or(defaults.max_depth),
            gc_ballast: env_parse("CELLVM_GC_BALLAST").unwrap_or(defaults.gc_ballast),
            gc_disabled: env_flag("CELLVM_GC_DISABLE"),
            heap_limit: env_parse("CELLVM_HEAP_LIMIT"),
            varlist_cache: env_parse("CELLVM_VARLIST_CACHE").unwrap_or(defaults.varlist_cache),
        }
    }

    pub fn with_stack_limit(mut self, bytes: usize) -> Self {
        self.stack_limit = bytes;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_gc_ballast(mut self, bytes: usize) -> Self {
        self.gc_ballast = bytes;
        self
    }

    pub fn with_gc_disabled(mut self, disabled: bool) -> Self {
        self.gc_disabled = disabled;
        self
    }

    pub fn with_heap_limit(mut self, limit: Option<usize>) -> Self {
        self.heap_limit = limit;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring malformed setting");
            None
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "CELLVM_STACK_LIMIT",
        "CELLVM_MAX_DEPTH",
        "CELLVM_GC_BALLAST",
        "CELLVM_GC_DISABLE",
        "CELLVM_HEAP_LIMIT",
        "CELLVM_VARLIST_CACHE",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: tests touching the environment are serialized
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("CELLVM_MAX_DEPTH", "128");
            std::env::set_var("CELLVM_GC_DISABLE", "true");
            std::env::set_var("CELLVM_HEAP_LIMIT", "1000000");
        }
        let config = Config::from_env();
        assert_eq!(config.max_depth, 128);
        assert!(config.gc_disabled);
        assert_eq!(config.heap_limit, Some(1_000_000));
        assert_eq!(config.stack_limit, DEFAULT_STACK_LIMIT);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_malformed_values_fall_back() {
        clear_env();
        unsafe {
            std::env::set_var("CELLVM_STACK_LIMIT", "lots");
            std::env::set_var("CELLVM_MAX_DEPTH", "0");
        }
        let config = Config::from_env();
        assert_eq!(config.stack_limit, DEFAULT_STACK_LIMIT);
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        clear_env();
    }
}
