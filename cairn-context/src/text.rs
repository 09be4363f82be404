//! Line-oriented text chunking for embedding and retrieval.
//!
//! Files are split into chunks that stay close to a maximum character count so each
//! one fits comfortably into an embedding model's input window. Chunks are built by
//! accumulating whole lines. When the next line would push the buffer past the limit,
//! the buffer is emitted and a fresh one is seeded with the tail of the emitted chunk,
//! so neighbouring chunks share a little context across the boundary.
//!
//! A few properties hold for every input:
//!
//! *   **Coverage**: every non-blank line of the input appears in at least one chunk.
//! *   **Overlap**: chunk `i + 1` begins with the last `overlap_size` characters of
//!     chunk `i` (minus any leading whitespace).
//! *   **No empties**: a chunk is never empty after trimming, and empty input yields
//!     no chunks at all.
//! *   **Whole lines**: a line is never split. A single line longer than the limit
//!     becomes its own oversized chunk.
//!
//! Sizes are measured in Unicode scalar values, not bytes.
//!
//! ```
//! use cairn_context::text::TextChunker;
//!
//! let chunker = TextChunker::new(40, 8);
//! let content = "fn main() {\n    println!(\"hello\");\n}\n\nfn other() {}\n";
//! let chunks = chunker.get_chunks(content);
//!
//! assert!(!chunks.is_empty());
//! assert_eq!(chunks[0].sequence, 0);
//! assert!(chunks.iter().all(|c| !c.text.trim().is_empty()));
//! ```

use serde::Serialize;

/// Default maximum chunk size in characters.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 512;

/// Default number of characters carried over between consecutive chunks.
pub const DEFAULT_OVERLAP_SIZE: usize = 50;

/// A single chunk produced by [`TextChunker::get_chunks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Zero-based position of this chunk within its source text.
    pub sequence: usize,
    /// Trimmed chunk text.
    pub text: String,
}

/// Splits text into overlapping, line-aligned chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    max_chunk_size: usize,
    overlap_size: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_SIZE, DEFAULT_OVERLAP_SIZE)
    }
}

impl TextChunker {
    /// Creates a chunker.
    ///
    /// `max_chunk_size` is raised to at least 1. `overlap_size` is clamped below
    /// `max_chunk_size` so the seeded tail alone can never fill a buffer.
    pub fn new(max_chunk_size: usize, overlap_size: usize) -> Self {
        let max_chunk_size = max_chunk_size.max(1);
        Self {
            max_chunk_size,
            overlap_size: overlap_size.min(max_chunk_size - 1),
        }
    }

    pub fn with_max_chunk_size(self, max_chunk_size: usize) -> Self {
        Self::new(max_chunk_size, self.overlap_size)
    }

    pub fn with_overlap_size(self, overlap_size: usize) -> Self {
        Self::new(self.max_chunk_size, overlap_size)
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    /// Splits `content` into numbered chunks.
    pub fn get_chunks(&self, content: &str) -> Vec<TextChunk> {
        self.split(content)
            .into_iter()
            .enumerate()
            .map(|(sequence, text)| TextChunk { sequence, text })
            .collect()
    }

    /// Splits `content` into chunk strings.
    pub fn split(&self, content: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut buffer = ChunkBuffer::default();

        for line in content.lines() {
            let line_len = line.chars().count() + 1;
            if buffer.has_fresh_content() && buffer.len + line_len > self.max_chunk_size {
                let emitted = buffer.take_trimmed();
                buffer.seed(tail_chars(&emitted, self.overlap_size));
                chunks.push(emitted);
            }
            buffer.push_line(line, line_len);
        }

        if buffer.has_fresh_content() {
            chunks.push(buffer.take_trimmed());
        }

        chunks
    }
}

/// Splits `text` into chunks of at most roughly `max_chunk_size` characters,
/// overlapping by `overlap_size` characters.
///
/// Shorthand for `TextChunker::new(max_chunk_size, overlap_size).split(text)`.
pub fn chunk_text(text: &str, max_chunk_size: usize, overlap_size: usize) -> Vec<String> {
    TextChunker::new(max_chunk_size, overlap_size).split(text)
}

/// Accumulates lines and tracks whether anything beyond the overlap seed was added.
#[derive(Default)]
struct ChunkBuffer {
    text: String,
    len: usize,
    fresh: bool,
}

impl ChunkBuffer {
    fn has_fresh_content(&self) -> bool {
        self.fresh
    }

    fn push_line(&mut self, line: &str, line_len: usize) {
        self.text.push_str(line);
        self.text.push('\n');
        self.len += line_len;
        if !line.trim().is_empty() {
            self.fresh = true;
        }
    }

    fn seed(&mut self, tail: &str) {
        if tail.is_empty() {
            return;
        }
        self.text.push_str(tail);
        self.text.push('\n');
        self.len += tail.chars().count() + 1;
    }

    fn take_trimmed(&mut self) -> String {
        let trimmed = self.text.trim().to_string();
        self.text.clear();
        self.len = 0;
        self.fresh = false;
        trimmed
    }
}

/// Returns the last `count` characters of `text`, respecting char boundaries.
fn tail_chars(text: &str, count: usize) -> &str {
    if count == 0 {
        return "";
    }
    match text.char_indices().rev().nth(count - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of(ch: char, len: usize) -> String {
        std::iter::repeat_n(ch, len).collect()
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(chunk_text("", 512, 50).is_empty());
        assert!(chunk_text("\n\n   \n", 512, 50).is_empty());
    }

    #[test]
    fn test_short_input_is_single_chunk() {
        let chunks = chunk_text("  hello\nworld  \n", 512, 50);
        assert_eq!(chunks, vec!["hello\nworld".to_string()]);
    }

    #[test]
    fn test_three_long_lines_make_three_chunks() {
        let content = format!(
            "{}\n{}\n{}\n",
            line_of('a', 499),
            line_of('b', 499),
            line_of('c', 499)
        );
        assert_eq!(content.chars().count(), 1500);

        let chunks = chunk_text(&content, 512, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], line_of('a', 499));
        assert!(chunks[1].starts_with(&line_of('a', 50)));
        assert!(chunks[1].ends_with(&line_of('b', 499)));
        assert!(chunks[2].starts_with(&line_of('b', 50)));
    }

    #[test]
    fn test_oversized_line_is_not_split() {
        let long = line_of('x', 2000);
        let content = format!("short\n{long}\ntail\n");
        let chunks = chunk_text(&content, 100, 10);

        assert!(chunks.iter().any(|c| c.contains(&long)));
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_overlap_respects_char_boundaries() {
        let content = format!("{}\n{}\n", line_of('é', 30), line_of('ü', 30));
        let chunks = chunk_text(&content, 40, 5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with(&line_of('é', 5)));
    }

    #[test]
    fn test_overlap_clamped_below_max() {
        let chunker = TextChunker::new(10, 50);
        assert_eq!(chunker.overlap_size(), 9);
        let chunker = TextChunker::new(0, 0);
        assert_eq!(chunker.max_chunk_size(), 1);
    }

    #[test]
    fn test_sequences_are_contiguous() {
        let content = (0..50)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = TextChunker::new(64, 8).get_chunks(&content);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
        }
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 5), "ab");
        assert_eq!(tail_chars("abc", 0), "");
    }

    mod proptest_chunker {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(500))]

            #[test]
            fn chunking_never_panics(
                content in "\\PC{0,3000}",
                max in 0usize..600,
                overlap in 0usize..200,
            ) {
                let _ = chunk_text(&content, max, overlap);
            }

            #[test]
            fn every_line_is_covered(
                content in "([a-z ]{0,80}\n){0,40}",
                max in 16usize..300,
                overlap in 0usize..40,
            ) {
                let chunks = chunk_text(&content, max, overlap);
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    prop_assert!(
                        chunks.iter().any(|c| c.contains(line)),
                        "line {:?} missing from chunks", line
                    );
                }
            }

            #[test]
            fn consecutive_chunks_overlap(
                content in "([a-z]{1,60}\n){1,40}",
                max in 16usize..300,
                overlap in 0usize..40,
            ) {
                let chunker = TextChunker::new(max, overlap);
                let chunks = chunker.split(&content);
                for pair in chunks.windows(2) {
                    let tail = tail_chars(&pair[0], chunker.overlap_size()).trim_start();
                    prop_assert!(pair[1].starts_with(tail));
                }
            }

            #[test]
            fn chunks_are_never_blank(content in "[a-z \n]{0,1000}", max in 1usize..200) {
                for chunk in chunk_text(&content, max, 10) {
                    prop_assert!(!chunk.trim().is_empty());
                    prop_assert_eq!(chunk.trim(), chunk.as_str());
                }
            }
        }
    }
}
