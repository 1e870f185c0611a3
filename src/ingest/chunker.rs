use crate::error::{KbServeError, Result};
use crate::registry::ParagraphConfig;

/// A chunk of document text, the unit of embedding and retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub tokens: usize,
}

/// Split text into overlapping token windows per the knowledge base's
/// paragraph configuration.
///
/// Tokens are whitespace-delimited words. Each chunk holds at most
/// `chunk_size` tokens; the window advances by `chunk_size -
/// chunk_overlap` tokens, so consecutive chunks share exactly
/// `chunk_overlap` tokens and together the chunks cover every token of
/// the document. Chunk text is the original byte span from the first to
/// the last token of the window, so inner whitespace and punctuation
/// survive verbatim.
pub fn chunk_text(text: &str, config: &ParagraphConfig) -> Result<Vec<Chunk>> {
    config.validate().map_err(|_| {
        KbServeError::InvalidInput(format!(
            "Degenerate chunk configuration: size {}, overlap {}",
            config.chunk_size, config.chunk_overlap
        ))
    })?;

    let spans = token_spans(text);
    if spans.is_empty() {
        return Ok(Vec::new());
    }

    let size = config.chunk_size;
    let step = size - config.chunk_overlap;

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(spans.len());
        let span_start = spans[start].0;
        let span_end = spans[end - 1].1;
        chunks.push(Chunk {
            text: text[span_start..span_end].to_string(),
            tokens: end - start,
        });

        if end == spans.len() {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Byte ranges of whitespace-delimited tokens. Ranges always fall on
/// UTF-8 character boundaries because whitespace chars are boundaries.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut token_start: Option<usize> = None;

    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(start) = token_start.take() {
                spans.push((start, idx));
            }
        } else if token_start.is_none() {
            token_start = Some(idx);
        }
    }
    if let Some(start) = token_start {
        spans.push((start, text.len()));
    }

    spans
}

/// Token count used for document statistics.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize) -> ParagraphConfig {
        ParagraphConfig {
            chunk_size: size,
            chunk_overlap: overlap,
        }
    }

    fn words(chunk: &Chunk) -> Vec<&str> {
        chunk.text.split_whitespace().collect()
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("one two three", &config(10, 2)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "one two three");
        assert_eq!(chunks[0].tokens, 3);
    }

    #[test]
    fn test_exact_overlap_between_consecutive_chunks() {
        // 10 tokens, size 4, overlap 2 -> windows at 0, 2, 4, 6
        let text = "t0 t1 t2 t3 t4 t5 t6 t7 t8 t9";
        let chunks = chunk_text(text, &config(4, 2)).unwrap();

        for pair in chunks.windows(2) {
            let prev = words(&pair[0]);
            let next = words(&pair[1]);
            // Last `overlap` tokens of one chunk are the first of the next
            assert_eq!(&prev[prev.len() - 2..], &next[..2]);
        }
    }

    #[test]
    fn test_chunks_cover_whole_document() {
        let tokens: Vec<String> = (0..137).map(|i| format!("w{}", i)).collect();
        let text = tokens.join(" ");
        let chunks = chunk_text(&text, &config(20, 7)).unwrap();

        let mut seen = std::collections::HashSet::new();
        for chunk in &chunks {
            for w in words(chunk) {
                seen.insert(w.to_string());
            }
        }
        for token in &tokens {
            assert!(seen.contains(token), "token {} not covered", token);
        }

        // Every chunk respects the size cap
        for chunk in &chunks {
            assert!(chunk.tokens <= 20);
        }
    }

    #[test]
    fn test_zero_overlap_partitions_tokens() {
        let text = "a b c d e f g";
        let chunks = chunk_text(text, &config(3, 0)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "a b c");
        assert_eq!(chunks[1].text, "d e f");
        assert_eq!(chunks[2].text, "g");
    }

    #[test]
    fn test_preserves_inner_punctuation() {
        let text = "Hello, world!  Двойной   пробел.";
        let chunks = chunk_text(text, &config(10, 0)).unwrap();
        assert_eq!(chunks.len(), 1);
        // Original spacing between first and last token survives
        assert_eq!(chunks[0].text, "Hello, world!  Двойной   пробел.");
    }

    #[test]
    fn test_multibyte_boundaries() {
        let text = "καλημέρα κόσμε こんにちは 世界 привет мир";
        let chunks = chunk_text(text, &config(2, 1)).unwrap();
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(!chunk.text.is_empty());
        }
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_text("", &config(10, 2)).unwrap().is_empty());
        assert!(chunk_text("   \n\t ", &config(10, 2)).unwrap().is_empty());
    }

    #[test]
    fn test_degenerate_config_rejected() {
        assert!(chunk_text("a b c", &config(2, 2)).is_err());
        assert!(chunk_text("a b c", &config(0, 0)).is_err());
    }

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens("one two  three\nfour"), 4);
        assert_eq!(count_tokens(""), 0);
    }
}
