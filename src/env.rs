//! Environment variable names read by this crate.
//!
//! These are read once, the first time they are needed; later changes to
//! the process environment have no effect.

use std::sync::OnceLock;

/// Maximum nesting depth accepted by the markup parser.
pub const LOG_PIPELINE_MARKUP_MAX_DEPTH_ENV: &str = "LOG_PIPELINE_MARKUP_MAX_DEPTH";

/// Lenient default, deep enough for nested tracebacks and data dumps.
pub const DEFAULT_MARKUP_MAX_DEPTH: usize = 200;

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Depth limit for markup parsing, cached after the first call.
pub fn markup_max_depth() -> usize {
    static DEPTH: OnceLock<usize> = OnceLock::new();
    *DEPTH.get_or_init(|| {
        let raw = env_or(
            LOG_PIPELINE_MARKUP_MAX_DEPTH_ENV,
            &DEFAULT_MARKUP_MAX_DEPTH.to_string(),
        );
        parse_depth(&raw)
    })
}

fn parse_depth(raw: &str) -> usize {
    match raw.trim().parse::<usize>() {
        Ok(depth) if depth > 0 => depth,
        _ => {
            tracing::warn!(
                value = raw,
                default = DEFAULT_MARKUP_MAX_DEPTH,
                "invalid {}, using default",
                LOG_PIPELINE_MARKUP_MAX_DEPTH_ENV
            );
            DEFAULT_MARKUP_MAX_DEPTH
        }
    }
}
