//! Environment and launcher-flag filtering.

use std::collections::BTreeMap;

use tracing::debug;

/// Substrings that mark an environment key as credential-bearing.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "API_KEY", "APIKEY", "SECRET", "TOKEN", "PASSWORD", "PASSWD", "CREDENTIAL",
];

/// Prefixes used by cloud-credential variables.
const SENSITIVE_KEY_PREFIXES: &[&str] = &["AWS_", "GOOGLE_", "GCLOUD_", "AZURE_"];

/// Dynamic-linker and interpreter injection variables, stripped
/// unconditionally; no configuration can reintroduce them.
const LINKER_INJECTION_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "PYTHONPATH",
    "NODE_PATH",
    "DYLD_INSERT_LIBRARIES",
];

const MAX_ENV_VALUE_LEN: usize = 1000;

/// Launcher flags are passed through only when they start with one of
/// these prefixes; everything else is dropped.
const RECOGNIZED_FLAG_PREFIXES: &[&str] = &[
    "--read-only",
    "--tmpfs",
    "--memory",
    "--cpu-shares",
    "--network",
    "--ipc",
    "--pid",
    "--uts",
];

/// Build the child environment from a requested map.
///
/// Drops credential-bearing keys regardless of caller intent, keys that
/// are not shaped like environment variable names, over-long values, and
/// always strips dynamic-linker injection variables.
pub(crate) fn filter_environment(
    requested: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    requested
        .iter()
        .filter(|(key, value)| {
            has_env_key_shape(key)
                && !is_sensitive_key(key)
                && !LINKER_INJECTION_VARS.contains(&key.as_str())
                && value.len() <= MAX_ENV_VALUE_LEN
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Keep only flags starting with a recognized prefix. Dropped flags are
/// logged at debug level only.
pub(crate) fn filter_flags(flags: &[String]) -> Vec<String> {
    flags
        .iter()
        .filter(|flag| {
            let recognized = RECOGNIZED_FLAG_PREFIXES
                .iter()
                .any(|prefix| flag.starts_with(prefix));
            if !recognized {
                debug!(flag = %flag, "dropping unrecognized sandbox flag");
            }
            recognized
        })
        .cloned()
        .collect()
}

/// `^[A-Z_][A-Z0-9_]*$`
fn has_env_key_shape(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| key.contains(fragment))
        || SENSITIVE_KEY_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
}
