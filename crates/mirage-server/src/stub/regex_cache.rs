//! Process-wide cache of compiled regular expressions.
//!
//! Patterns come from stub definitions, which are few and stable, so entries
//! are never evicted during the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;

use super::matching::MatchError;

static COMPILED: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Compiles a pattern, returning the cached instance when available.
pub fn compile(pattern: &str) -> Result<Arc<Regex>, MatchError> {
    if let Some(r) = COMPILED.read().get(pattern) {
        return Ok(Arc::clone(r));
    }

    let mut cache = COMPILED.write();
    // Another writer may have raced us here
    if let Some(r) = cache.get(pattern) {
        return Ok(Arc::clone(r));
    }

    let compiled = Regex::new(pattern)
        .map_err(|e| MatchError::Invalid(format!("invalid regex {pattern}: {e}")))?;

    let compiled = Arc::new(compiled);
    cache.insert(pattern.to_string(), Arc::clone(&compiled));
    Ok(compiled)
}
