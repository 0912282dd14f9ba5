//! # Chunker
//!
//! Splits document bodies into overlapping, fixed-size character windows.
//!
//! Windows are measured in **characters** (Unicode scalar values), never bytes, so a
//! slice can never land inside a multi-byte sequence. Consecutive windows advance by
//! `size - overlap` characters, which means:
//!
//! - every produced chunk holds at most `size` characters,
//! - two neighbouring chunks share exactly `overlap` characters (before trimming),
//! - the loop always terminates because the stride is at least one character.
//!
//! Stepping a full `size` and pulling each window start back by `overlap` would
//! give the first chunk no leading overlap and later ones a shifted one. The
//! `size - overlap` stride is used instead so every neighbouring pair overlaps by
//! the same amount.
//!
//! Each slice is trimmed of surrounding whitespace and dropped if nothing is left.
//!
//! ```rust
//! use sigma_rag::chunker::Chunker;
//!
//! let chunker = Chunker::new(10, 3).unwrap();
//! let chunks = chunker.chunk("abcdefghijklmnop");
//! assert_eq!(chunks, vec!["abcdefghij", "hijklmnop"]);
//! ```

use thiserror::Error;
use tracing::debug;

/// Invalid window parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroSize,
    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

/// Sliding-window splitter with a validated `size > overlap` invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    /// Build a chunker, rejecting parameters that could never make progress.
    pub fn new(size: usize, overlap: usize) -> Result<Self, ChunkError> {
        if size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        if overlap >= size {
            return Err(ChunkError::OverlapTooLarge { size, overlap });
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into trimmed, non-empty windows.
    ///
    /// Empty or whitespace-only input yields an empty vector.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            debug!("Nothing to chunk: input is empty or whitespace");
            return Vec::new();
        }

        // Byte offset of every char boundary, plus the end of the string.
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = bounds.len() - 1;
        let stride = self.size - self.overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.size).min(char_count);
            let piece = text[bounds[start]..bounds[end]].trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }
            if end == char_count {
                break;
            }
            start += stride;
        }

        debug!(
            "Split {} chars into {} chunks (size {}, overlap {})",
            char_count,
            chunks.len(),
            self.size,
            self.overlap
        );
        chunks
    }
}

/// One-shot helper: validate the parameters and chunk `text`.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<String>, ChunkError> {
    Ok(Chunker::new(size, overlap)?.chunk(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alphabet(n: usize) -> String {
        (0..n).map(|i| (b'a' + (i % 26) as u8) as char).collect()
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert_eq!(Chunker::new(0, 0), Err(ChunkError::ZeroSize));
        assert_eq!(
            Chunker::new(10, 10),
            Err(ChunkError::OverlapTooLarge {
                size: 10,
                overlap: 10
            })
        );
        assert!(chunk("text", 5, 7).is_err());
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        let chunker = Chunker::new(100, 20).unwrap();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("   \n\t  ").is_empty());
    }

    #[test]
    fn test_short_input_is_single_chunk() {
        let chunks = chunk("  DMAIC is a cycle.  ", 1000, 200).unwrap();
        assert_eq!(chunks, vec!["DMAIC is a cycle."]);
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = "word ".repeat(1000);
        let chunks = chunk(&text, 1000, 200).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 1000);
        }
    }

    #[test]
    fn test_consecutive_chunks_share_overlap() {
        let text = alphabet(95);
        let chunks = chunk(&text, 20, 5).unwrap();
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].chars().collect();
            let next: Vec<char> = pair[1].chars().collect();
            assert_eq!(prev.len(), 20);
            assert_eq!(prev[prev.len() - 5..], next[..5]);
        }
    }

    #[test]
    fn test_chunks_reconstruct_original() {
        let text = alphabet(257);
        let overlap = 7;
        let chunks = chunk(&text, 32, overlap).unwrap();

        let mut rebuilt = chunks[0].clone();
        for c in &chunks[1..] {
            rebuilt.extend(c.chars().skip(overlap));
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_overlap_chunk() {
        // 10 chars, size 6, overlap 2: windows [0,6) and [4,10), nothing after.
        let chunks = chunk("abcdefghij", 6, 2).unwrap();
        assert_eq!(chunks, vec!["abcdef", "efghij"]);
    }

    #[test]
    fn test_multibyte_characters_are_not_split() {
        let text = "σίγμα λιν σίξ σίγμα ".repeat(20);
        let chunks = chunk(&text, 16, 4).unwrap();
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.chars().count() <= 16);
        }
    }
}
