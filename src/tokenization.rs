//! Token counting
//!
//! Counts tokens with a BPE encoding selected by model name. Models without
//! a known encoding fall back to a word-count estimate, and that fallback is
//! logged at most once per model.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use tiktoken_rs::{get_bpe_from_model, CoreBPE};
use tracing::warn;

/// Multiplier for the word-count fallback estimate
const FALLBACK_TOKENS_PER_WORD: f64 = 1.3;

/// Resolved per-model encodings (BPE construction is expensive)
static MODEL_ENCODINGS: LazyLock<RwLock<HashMap<String, Arc<CoreBPE>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Models for which the fallback warning was already emitted
static FALLBACK_WARNED: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Count tokens in `text` for the given model hint.
///
/// Empty input yields zero. When no BPE encoding is known for the model the
/// estimate degrades to `round(word_count * 1.3)`.
#[must_use]
pub fn count_tokens(text: &str, model: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    if let Some(bpe) = resolve_encoding(model) {
        return bpe.encode_with_special_tokens(text).len() as u32;
    }

    estimate_tokens_fallback(text)
}

/// Word-count token estimate used when no exact tokenizer is available.
#[must_use]
pub fn estimate_tokens_fallback(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    (words as f64 * FALLBACK_TOKENS_PER_WORD).round() as u32
}

/// Look up (or construct and cache) the BPE encoding for a model.
fn resolve_encoding(model: &str) -> Option<Arc<CoreBPE>> {
    {
        let cache = MODEL_ENCODINGS.read().unwrap_or_else(|e| e.into_inner());
        if let Some(bpe) = cache.get(model) {
            return Some(bpe.clone());
        }
    }

    match get_bpe_from_model(model) {
        Ok(bpe) => {
            let bpe = Arc::new(bpe);
            let mut cache = MODEL_ENCODINGS.write().unwrap_or_else(|e| e.into_inner());
            cache.entry(model.to_string()).or_insert_with(|| bpe.clone());
            Some(bpe)
        }
        Err(err) => {
            let mut warned = FALLBACK_WARNED.lock().unwrap_or_else(|e| e.into_inner());
            if warned.insert(model.to_string()) {
                warn!(
                    model,
                    error = %err,
                    "no tokenizer for model, falling back to word-count estimate"
                );
            }
            None
        }
    }
}
