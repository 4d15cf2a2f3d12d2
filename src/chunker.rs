//! Token-aware chunking.
//!
//! Splits extracted segments into chunks of at most `chunk_size` tokens,
//! where a token is whatever unit the embedding provider's counter
//! measures. Breaks are preferred at paragraph boundaries (segments),
//! then sentence boundaries, then word boundaries; a single word is never
//! split, so one oversized word becomes its own oversized chunk.
//!
//! With overlap enabled, the tail `overlap` tokens of each chunk are
//! re-emitted as the head of the next one. Overlap is carried at word
//! granularity; when a provider counts sub-word units the carried tail is
//! approximate, which is fine for its purpose of preserving context
//! across boundaries.
//!
//! Empty chunks are never emitted: a document that extracts to only
//! whitespace produces an empty draft list.

use crate::extract::Segment;
use crate::models::ChunkDraft;

/// Chunk a segment stream. `counter` must be the embedding provider's
/// token counter so budgets line up with what gets embedded.
pub fn chunk_segments<I, F>(
    segments: I,
    chunk_size: usize,
    overlap: usize,
    overlap_enabled: bool,
    counter: F,
) -> Vec<ChunkDraft>
where
    I: IntoIterator<Item = Segment>,
    F: Fn(&str) -> usize,
{
    let chunk_size = chunk_size.max(1);
    let overlap = if overlap_enabled {
        // An overlap at or above the chunk size would never make progress.
        overlap.min(chunk_size.saturating_sub(1))
    } else {
        0
    };

    let mut builder = Builder {
        chunk_size,
        overlap,
        counter,
        parts: Vec::new(),
        tokens: 0,
        seeded_tokens: 0,
        hints: (None, None),
        drafts: Vec::new(),
    };

    for segment in segments {
        builder.push_segment(&segment);
    }
    builder.flush();
    builder.drafts
}

struct Builder<F: Fn(&str) -> usize> {
    chunk_size: usize,
    overlap: usize,
    counter: F,
    /// Sentences (or word runs) accumulated for the current chunk.
    parts: Vec<String>,
    tokens: usize,
    /// Tokens in `parts` that came from the previous chunk's tail.
    seeded_tokens: usize,
    hints: (Option<i64>, Option<i64>),
    drafts: Vec<ChunkDraft>,
}

impl<F: Fn(&str) -> usize> Builder<F> {
    fn push_segment(&mut self, segment: &Segment) {
        let trimmed = segment.text.trim();
        if trimmed.is_empty() {
            return;
        }

        // Prefer to break at the paragraph boundary when the whole
        // segment would overflow the current chunk.
        let seg_tokens = (self.counter)(trimmed);
        if self.has_content() && self.tokens + seg_tokens > self.chunk_size {
            self.flush();
        }

        for sentence in split_sentences(trimmed) {
            self.push_sentence(&sentence, segment);
        }
    }

    fn push_sentence(&mut self, sentence: &str, origin: &Segment) {
        let tokens = (self.counter)(sentence);

        if tokens > self.chunk_size {
            self.flush();
            // Word-level fallback: pieces sized to leave room for the
            // overlap seed so pieces chain together at full budget.
            let piece_size = self.chunk_size.saturating_sub(self.overlap).max(1);
            for piece in split_words(sentence, piece_size) {
                let piece_tokens = (self.counter)(&piece);
                if self.tokens + piece_tokens > self.chunk_size && self.has_content() {
                    self.flush();
                }
                self.append(piece, piece_tokens, origin);
                if self.tokens >= self.chunk_size {
                    self.flush();
                }
            }
            return;
        }

        if self.tokens + tokens > self.chunk_size {
            if self.has_content() {
                self.flush();
            }
            // Only the carried tail is present; trim it from the front
            // until the sentence fits rather than emitting a seed-only
            // chunk.
            while self.tokens + tokens > self.chunk_size && !self.parts.is_empty() {
                self.trim_seed_front();
            }
        }

        self.append(sentence.to_string(), tokens, origin);
    }

    /// Whether the buffer holds anything beyond the carried overlap tail.
    fn has_content(&self) -> bool {
        self.tokens > self.seeded_tokens
    }

    fn append(&mut self, part: String, tokens: usize, origin: &Segment) {
        if !self.has_content() {
            self.hints = (origin.page, origin.paragraph);
        }
        self.parts.push(part);
        self.tokens += tokens;
    }

    fn trim_seed_front(&mut self) {
        if let Some(seed) = self.parts.first_mut() {
            let mut words: Vec<&str> = seed.split_whitespace().collect();
            if words.len() <= 1 {
                let removed = (self.counter)(seed);
                self.parts.remove(0);
                self.tokens = self.tokens.saturating_sub(removed);
                self.seeded_tokens = self.seeded_tokens.saturating_sub(removed);
                return;
            }
            words.remove(0);
            let new_seed = words.join(" ");
            let old_tokens = (self.counter)(seed);
            let new_tokens = (self.counter)(&new_seed);
            *seed = new_seed;
            self.tokens = self.tokens - old_tokens + new_tokens;
            self.seeded_tokens = self.seeded_tokens - old_tokens.min(self.seeded_tokens)
                + new_tokens.min(self.seeded_tokens);
        }
    }

    fn flush(&mut self) {
        if !self.has_content() {
            self.parts.clear();
            self.tokens = 0;
            self.seeded_tokens = 0;
            return;
        }

        let text = self.parts.join(" ");
        let token_count = (self.counter)(&text);
        let (page, paragraph) = self.hints;
        self.drafts.push(ChunkDraft {
            text: text.clone(),
            token_count,
            page,
            paragraph,
        });

        self.parts.clear();
        self.tokens = 0;
        self.seeded_tokens = 0;

        if self.overlap > 0 {
            let words: Vec<&str> = text.split_whitespace().collect();
            let take = self.overlap.min(words.len());
            if take > 0 && take < words.len() {
                let tail = words[words.len() - take..].join(" ");
                let tail_tokens = (self.counter)(&tail);
                self.parts.push(tail);
                self.tokens = tail_tokens;
                self.seeded_tokens = tail_tokens;
            }
        }
    }
}

/// Split on sentence-ending punctuation, keeping the delimiter attached.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let s = current.trim().to_string();
            if !s.is_empty() {
                out.push(s);
            }
            current.clear();
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Split into word runs of at most `max_words` words each.
fn split_words(text: &str, max_words: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(max_words.max(1))
        .map(|w| w.join(" "))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str) -> Segment {
        Segment {
            text: text.to_string(),
            page: None,
            paragraph: None,
        }
    }

    fn count(s: &str) -> usize {
        s.split_whitespace().count()
    }

    #[test]
    fn small_text_single_chunk() {
        let drafts = chunk_segments([seg("Hello world.")], 100, 0, false, count);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].text, "Hello world.");
        assert_eq!(drafts[0].token_count, 2);
    }

    #[test]
    fn empty_input_yields_nothing() {
        let drafts = chunk_segments(std::iter::empty::<Segment>(), 100, 0, false, count);
        assert!(drafts.is_empty());

        let drafts = chunk_segments([seg("   ")], 100, 0, false, count);
        assert!(drafts.is_empty());
    }

    #[test]
    fn breaks_at_sentence_boundaries() {
        let text = "One two three. Four five six. Seven eight nine.";
        let drafts = chunk_segments([seg(text)], 6, 0, false, count);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].text, "One two three. Four five six.");
        assert_eq!(drafts[1].text, "Seven eight nine.");
    }

    #[test]
    fn never_exceeds_budget_at_word_granularity() {
        let text = (0..40).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        let drafts = chunk_segments([seg(&text)], 10, 0, false, count);
        assert!(drafts.len() >= 4);
        for d in &drafts {
            assert!(d.token_count <= 10, "chunk over budget: {}", d.text);
        }
        // No word lost.
        let rejoined: Vec<String> = drafts
            .iter()
            .flat_map(|d| d.text.split_whitespace().map(|w| w.to_string()))
            .collect();
        assert_eq!(rejoined.len(), 40);
    }

    #[test]
    fn overlap_re_emits_tail_as_next_head() {
        let text = "a b c d e f g h i j k l";
        let drafts = chunk_segments([seg(text)], 6, 2, true, count);
        assert!(drafts.len() >= 2);
        for pair in drafts.windows(2) {
            let prev: Vec<&str> = pair[0].text.split_whitespace().collect();
            let next: Vec<&str> = pair[1].text.split_whitespace().collect();
            assert_eq!(&prev[prev.len() - 2..], &next[..2]);
        }
    }

    #[test]
    fn overlap_disabled_carries_nothing() {
        let text = "a b c d e f g h i j k l";
        let drafts = chunk_segments([seg(text)], 6, 2, false, count);
        let total: usize = drafts.iter().map(|d| d.token_count).sum();
        assert_eq!(total, 12);
    }

    #[test]
    fn paragraph_boundary_preferred() {
        let segments = vec![seg("First paragraph here now."), seg("Second paragraph here now.")];
        let drafts = chunk_segments(segments, 5, 0, false, count);
        assert_eq!(drafts.len(), 2);
        assert!(drafts[0].text.starts_with("First"));
        assert!(drafts[1].text.starts_with("Second"));
    }

    #[test]
    fn oversized_word_becomes_own_chunk() {
        let drafts = chunk_segments([seg("supercalifragilistic")], 1, 0, false, count);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].text, "supercalifragilistic");
    }

    #[test]
    fn hints_carried_from_origin_segment() {
        let segments = vec![
            Segment {
                text: "Page one text.".to_string(),
                page: Some(1),
                paragraph: Some(0),
            },
            Segment {
                text: "Page two text.".to_string(),
                page: Some(2),
                paragraph: Some(0),
            },
        ];
        let drafts = chunk_segments(segments, 3, 0, false, count);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].page, Some(1));
        assert_eq!(drafts[1].page, Some(2));
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta iota.";
        let a = chunk_segments([seg(text)], 5, 2, true, count);
        let b = chunk_segments([seg(text)], 5, 2, true, count);
        assert_eq!(a, b);
    }
}
