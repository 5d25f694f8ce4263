//! Refresh tokens: which run last (re)created the remote result of a case.
//!
//! Keys are `<PROJECT>-T<n>` plus the parameterization suffix. A remote result
//! is reused only while the token of its key equals the active run key;
//! otherwise a fresh result is created so notes of an older run sharing the
//! same run key do not accumulate.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshTokens {
    tokens: BTreeMap<String, Option<String>>,
}

impl RefreshTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key as not yet touched by any run.
    pub fn register(&mut self, key: impl Into<String>) {
        self.tokens.insert(key.into(), None);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tokens.get(key).and_then(|run| run.as_deref())
    }

    pub fn is_current(&self, key: &str, run_key: &str) -> bool {
        self.get(key) == Some(run_key)
    }

    pub fn touch(&mut self, key: &str, run_key: &str) {
        self.tokens
            .insert(key.to_string(), Some(run_key.to_string()));
    }

    /// Touch every parameterized or repeated variant of `case_key`.
    pub fn touch_related(&mut self, case_key: &str, run_key: &str) {
        for (key, run) in &mut self.tokens {
            if is_variant_of(key, case_key) {
                *run = Some(run_key.to_string());
            }
        }
    }

    /// Mark the first variant of `case_key` (or the bare key) as created by `run_key`.
    ///
    /// Used right after a run is created with the case already in it.
    pub fn mark_first(&mut self, case_key: &str, run_key: &str) {
        let key = self
            .tokens
            .keys()
            .find(|key| is_variant_of(key, case_key))
            .cloned()
            .unwrap_or_else(|| case_key.to_string());
        self.touch(&key, run_key);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn is_variant_of(key: &str, case_key: &str) -> bool {
    key.match_indices(case_key).any(|(index, _)| {
        matches!(
            key[index + case_key.len()..].chars().next(),
            Some(' ') | Some('[')
        )
    })
}
