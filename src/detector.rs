//! Classifies an inbound completion request as an ordinary turn or a
//! client-issued compaction request.

/// Result of classifying one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Ordinary,
    Compact,
}

/// Minimum number of prior messages for a conversation to be considered
/// non-trivial (spec §4.3, guard (c)). A compaction prompt arriving before
/// any real conversation happened is almost certainly a false positive.
const MIN_HISTORY_MESSAGES: usize = 2;

/// Multi-signal compaction-request matcher: one required case-insensitive
/// phrase, plus a minimum count of case-sensitive structural section
/// markers. Both are `const` data so the signature can be revised without
/// touching the matching logic (DESIGN.md Open Question (a)).
pub struct CompactionDetector {
    summary_phrase: &'static str,
    structural_markers: &'static [&'static str],
    min_markers: usize,
}

impl Default for CompactionDetector {
    fn default() -> Self {
        Self {
            summary_phrase: "summary of the conversation",
            structural_markers: &[
                "Primary Request",
                "Pending Tasks",
                "Current Work",
                "<analysis>",
                "<summary>",
                "Key Technical Concepts",
            ],
            min_markers: 2,
        }
    }
}

impl CompactionDetector {
    /// Classify a request. `endpoint_path` is the inbound request path,
    /// `history_len` is the number of messages already observed for this
    /// conversation before this request, and `last_user_text` is the full
    /// (untruncated) text of the last user-authored message segment.
    ///
    /// Ambiguous cases default to `Ordinary`: a false negative merely loses
    /// the acceleration, a false positive would corrupt output.
    pub fn classify(&self, endpoint_path: &str, history_len: usize, last_user_text: &str) -> Classification {
        if !Self::targets_completion_endpoint(endpoint_path) {
            return Classification::Ordinary;
        }
        if history_len < MIN_HISTORY_MESSAGES {
            return Classification::Ordinary;
        }
        if self.matches_signature(last_user_text) {
            Classification::Compact
        } else {
            Classification::Ordinary
        }
    }

    fn targets_completion_endpoint(path: &str) -> bool {
        path.ends_with("/v1/messages") || path.ends_with("/v1/chat/completions")
    }

    fn matches_signature(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if !lower.contains(self.summary_phrase) {
            return false;
        }

        let marker_count = self
            .structural_markers
            .iter()
            .filter(|marker| text.contains(*marker))
            .count();

        marker_count >= self.min_markers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPACT_PROMPT: &str = "Please provide a detailed summary of the conversation so far.\n\
        ## Primary Request and Intent\n...\n## Pending Tasks\n...\n## Key Technical Concepts\n...";

    #[test]
    fn classifies_well_formed_compact_prompt() {
        let detector = CompactionDetector::default();
        assert_eq!(
            detector.classify("/v1/messages", 10, COMPACT_PROMPT),
            Classification::Compact
        );
    }

    #[test]
    fn rejects_wrong_endpoint() {
        let detector = CompactionDetector::default();
        assert_eq!(
            detector.classify("/v1/messages/count_tokens", 10, COMPACT_PROMPT),
            Classification::Ordinary
        );
    }

    #[test]
    fn rejects_trivial_history() {
        let detector = CompactionDetector::default();
        assert_eq!(
            detector.classify("/v1/messages", 1, COMPACT_PROMPT),
            Classification::Ordinary
        );
    }

    #[test]
    fn rejects_phrase_without_enough_structural_markers() {
        let detector = CompactionDetector::default();
        let weak = "Can you give me a summary of the conversation? Just the Primary Request part.";
        assert_eq!(
            detector.classify("/v1/messages", 10, weak),
            Classification::Ordinary
        );
    }

    #[test]
    fn rejects_unrelated_message() {
        let detector = CompactionDetector::default();
        assert_eq!(
            detector.classify("/v1/messages", 10, "please fix the bug in main.rs"),
            Classification::Ordinary
        );
    }

    #[test]
    fn is_case_insensitive_for_the_required_phrase() {
        let detector = CompactionDetector::default();
        let shouty = "SUMMARY OF THE CONVERSATION\n## Primary Request\n## Pending Tasks";
        assert_eq!(
            detector.classify("/v1/messages", 10, shouty),
            Classification::Compact
        );
    }
}
