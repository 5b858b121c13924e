//! Text chunking for LocalRAG
//! Fixed-size overlapping windows over characters

use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;

/// A window over the source text, in character offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
}

/// Splits text into overlapping windows of at most `max_size` characters
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_size: usize,
    step: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(1000, 200)
    }
}

impl From<ChunkingConfig> for Chunker {
    fn from(config: ChunkingConfig) -> Self {
        Self::new(config.max_size, config.overlap)
    }
}

impl Chunker {
    /// An overlap that would stall the window falls back to
    /// non-overlapping windows.
    pub fn new(max_size: usize, overlap: usize) -> Self {
        let max_size = max_size.max(1);
        let step = if overlap >= max_size {
            tracing::warn!(
                "Chunk overlap {} >= max size {}, using non-overlapping windows",
                overlap,
                max_size
            );
            max_size
        } else {
            max_size - overlap
        };
        Self { max_size, step }
    }

    /// Distance between window starts
    pub fn step(&self) -> usize {
        self.step
    }

    /// Window positions for a text of `len` characters
    pub fn spans(&self, len: usize) -> Vec<ChunkSpan> {
        let mut spans = Vec::new();
        if len == 0 {
            return spans;
        }

        let step = self.step;
        let mut start = 0;
        loop {
            let end = (start + self.max_size).min(len);
            spans.push(ChunkSpan { start, end });
            if end >= len {
                break;
            }
            start += step;
        }
        spans
    }

    /// Chunk text, dropping windows that are blank after trimming
    pub fn chunk(&self, text: &str) -> Vec<String> {
        // Byte offset of every char boundary, plus the end
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        offsets.push(text.len());
        let len = offsets.len() - 1;

        self.spans(len)
            .into_iter()
            .filter_map(|span| {
                let piece = text[offsets[span.start]..offsets[span.end]].trim();
                (!piece.is_empty()).then(|| piece.to_string())
            })
            .collect()
    }
}

/// Chunk with explicit window parameters
pub fn chunk_text(text: &str, max_size: usize, overlap: usize) -> Vec<String> {
    Chunker::new(max_size, overlap).chunk(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 1000, 200).is_empty());
        assert!(chunk_text("   \n\t  ", 1000, 200).is_empty());
    }

    #[test]
    fn test_three_thousand_chars_gives_four_chunks() {
        let text: String = "abcdefghij".repeat(300);
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].chars().count(), 1000);
        assert_eq!(chunks[3].chars().count(), 600);
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("hello world", 1000, 200);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn test_spans_cover_text_without_gaps() {
        for (len, max, overlap) in [(3000, 1000, 200), (1, 5, 2), (999, 100, 99), (1234, 7, 3)] {
            let spans = Chunker::new(max, overlap).spans(len);
            assert_eq!(spans.first().unwrap().start, 0);
            assert_eq!(spans.last().unwrap().end, len);
            for pair in spans.windows(2) {
                assert!(pair[1].start <= pair[0].end, "gap between {:?}", pair);
                assert!(pair[1].start > pair[0].start);
            }
            for span in &spans {
                assert!(span.end - span.start <= max);
            }
        }
    }

    #[test]
    fn test_overlap_not_smaller_than_size_terminates() {
        let spans = Chunker::new(10, 10).spans(35);
        assert_eq!(spans.len(), 4);
        let spans = Chunker::new(10, 50).spans(35);
        assert_eq!(spans.len(), 4);
    }

    #[test]
    fn test_step_is_fixed_at_construction() {
        assert_eq!(Chunker::new(1000, 200).step(), 800);
        assert_eq!(Chunker::new(10, 10).step(), 10);
        assert_eq!(Chunker::new(10, 50).step(), 10);
        assert_eq!(Chunker::new(0, 0).step(), 1);
    }

    #[test]
    fn test_step_count_bound() {
        let spans = Chunker::new(100, 20).spans(10_000);
        // ceil((L - M) / (M - O)) + 1
        assert_eq!(spans.len(), 125);
    }

    #[test]
    fn test_multibyte_text_is_split_on_char_boundaries() {
        let text = "日本語のテキスト".repeat(50);
        let chunks = chunk_text(&text, 30, 5);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 30);
        }
    }

    #[test]
    fn test_blank_windows_are_dropped() {
        let text = format!("{}{}", "a".repeat(10), " ".repeat(30));
        let chunks = chunk_text(&text, 10, 0);
        assert_eq!(chunks, vec!["a".repeat(10)]);
    }

    #[test]
    fn test_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        assert_eq!(chunk_text(&text, 120, 30), chunk_text(&text, 120, 30));
    }
}
