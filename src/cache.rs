use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::providers::ProviderUsage;

/// Process-wide translation cache keyed by whitespace-normalized source text.
///
/// Shared by the span and image pipelines. Also tallies backend token usage.
#[derive(Debug, Default)]
pub struct TranslationCache {
    inner: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    map: HashMap<String, String>,
    model: Option<String>,
    usage: ProviderUsage,
    hits: usize,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, text: &str) -> Option<String> {
        let mut state = self.lock();
        let found = state.map.get(&normalize_key(text)).cloned();
        if found.is_some() {
            state.hits += 1;
        }
        found
    }

    pub fn insert(&self, text: &str, translated: &str) {
        self.lock()
            .map
            .insert(normalize_key(text), translated.to_string());
    }

    pub fn record_usage(&self, model: Option<String>, usage: Option<ProviderUsage>) {
        let mut state = self.lock();
        if state.model.is_none() {
            state.model = model;
        }
        if let Some(usage) = usage {
            state.usage = merge_usage(&state.usage, &usage);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.lock().hits
    }

    pub fn model(&self) -> Option<String> {
        self.lock().model.clone()
    }

    pub fn usage(&self) -> ProviderUsage {
        self.lock().usage.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic elsewhere leaves the map intact; keep serving it.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn normalize_key(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn merge_usage(current: &ProviderUsage, incoming: &ProviderUsage) -> ProviderUsage {
    fn add(left: Option<u64>, right: Option<u64>) -> Option<u64> {
        match (left, right) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
    ProviderUsage {
        prompt_tokens: add(current.prompt_tokens, incoming.prompt_tokens),
        completion_tokens: add(current.completion_tokens, incoming.completion_tokens),
        total_tokens: add(current.total_tokens, incoming.total_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_ignore_whitespace_differences() {
        let cache = TranslationCache::new();
        cache.insert("Out-of-pocket  maximum", "Máximo de gastos");
        assert_eq!(
            cache.get(" Out-of-pocket maximum\n").as_deref(),
            Some("Máximo de gastos")
        );
        assert_eq!(cache.hits(), 1);
        assert!(cache.get("maximum").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn usage_accumulates_and_first_model_sticks() {
        let cache = TranslationCache::new();
        let usage = ProviderUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(2),
            total_tokens: Some(12),
        };
        cache.record_usage(Some("gpt-4o-mini".to_string()), Some(usage.clone()));
        cache.record_usage(Some("other".to_string()), Some(usage));
        assert_eq!(cache.model().as_deref(), Some("gpt-4o-mini"));
        assert_eq!(cache.usage().total_tokens, Some(24));
    }
}
