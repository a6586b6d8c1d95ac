//! Pure helpers for classifying an agent's reasoning stream into a subject
//! and phase, plus the per-block caching rule the engine applies around them.

use std::collections::HashMap;

use crate::events::ThinkingPhase;

/// Splits leading `**bold**` markup out of a thinking chunk: the bold span
/// becomes the `subject`, the remaining text (with the bold span removed)
/// becomes `description`. Returns an empty subject if there is no bold span.
pub fn extract_bold_subject(text: &str) -> (String, String) {
    if let Some(start) = text.find("**") {
        if let Some(end_rel) = text[start + 2..].find("**") {
            let end = start + 2 + end_rel;
            let subject = text[start + 2..end].to_string();
            let description = format!("{}{}", &text[..start], &text[end + 2..]);
            return (subject, description.trim().to_string());
        }
    }
    (String::new(), text.to_string())
}

/// Keyword heuristic, checked in priority order: the first matching phase wins.
pub fn classify_thinking(text: &str) -> ThinkingPhase {
    let lower = text.to_lowercase();
    const RULES: &[(&[&str], ThinkingPhase)] = &[
        (&["analy", "examin", "read"], ThinkingPhase::Analyzing),
        (&["plan", "approach", "steps"], ThinkingPhase::Planning),
        (&["implement", "writ"], ThinkingPhase::Coding),
        (&["check", "verify", "test"], ThinkingPhase::Reviewing),
        (&["tool", "execute", "invok"], ThinkingPhase::ToolPlanning),
    ];
    for (keywords, phase) in RULES {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return *phase;
        }
    }
    ThinkingPhase::General
}

/// A cached classification for one thinking block, keyed by `block_id`.
///
/// A consecutive run of thinking chunks sharing a `block_id` is one logical
/// block; without this cache, a block growing chunk-by-chunk to several KiB
/// would be re-classified from scratch on every chunk (O(n) work for an
/// O(1)-meaningful result). The cache key is invalidated only when a new
/// `block_id` starts.
#[derive(Default)]
pub struct ThinkingBlockCache {
    blocks: HashMap<String, (String, ThinkingPhase)>,
}

impl ThinkingBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached `(subject, phase)` for `block_id`, computing and
    /// storing it from `full_text_so_far` on first use for that block.
    pub fn classify(&mut self, block_id: &str, full_text_so_far: &str) -> (String, ThinkingPhase) {
        if let Some(cached) = self.blocks.get(block_id) {
            return cached.clone();
        }
        let (subject, _) = extract_bold_subject(full_text_so_far);
        let phase = classify_thinking(full_text_so_far);
        self.blocks
            .insert(block_id.to_string(), (subject.clone(), phase));
        (subject, phase)
    }

    pub fn clear_block(&mut self, block_id: &str) {
        self.blocks.remove(block_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bold_subject() {
        let (subject, description) = extract_bold_subject("**Reading file** to check contents");
        assert_eq!(subject, "Reading file");
        assert_eq!(description, "to check contents");
    }

    #[test]
    fn no_bold_span_yields_empty_subject() {
        let (subject, description) = extract_bold_subject("plain thinking text");
        assert_eq!(subject, "");
        assert_eq!(description, "plain thinking text");
    }

    #[test]
    fn classifies_by_keyword_priority() {
        assert_eq!(classify_thinking("Let me analyze the file"), ThinkingPhase::Analyzing);
        assert_eq!(classify_thinking("I will plan the approach"), ThinkingPhase::Planning);
        assert_eq!(classify_thinking("Now implementing the fix"), ThinkingPhase::Coding);
        assert_eq!(classify_thinking("Let's verify this works"), ThinkingPhase::Reviewing);
        assert_eq!(classify_thinking("I should invoke the tool"), ThinkingPhase::ToolPlanning);
        assert_eq!(classify_thinking("hmm, interesting"), ThinkingPhase::General);
    }

    #[test]
    fn cache_classifies_a_block_at_most_once() {
        let mut cache = ThinkingBlockCache::new();
        let mut text = String::new();
        let mut first = None;
        for chunk in ["**Analyzing** the ", "code for ", "bugs"].iter() {
            text.push_str(chunk);
            let result = cache.classify("block-1", &text);
            if first.is_none() {
                first = Some(result.clone());
            }
        }
        // Cached result never changes even though `text` kept growing.
        let final_result = cache.classify("block-1", &text);
        assert_eq!(first, Some(final_result));
        assert_eq!(cache.blocks.len(), 1);
    }
}
