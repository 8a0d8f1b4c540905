//! Sliding-window text chunker with natural breakpoints.
//!
//! Splits document text into overlapping [`Chunk`]s of at most `max_size`
//! characters. A breakpoint search prefers paragraph boundaries (`\n\n`),
//! then sentence endings, then whitespace, so chunks stay readable instead
//! of cutting mid-word. Offsets and lengths are counted in characters, not
//! bytes, so multi-byte Vietnamese text never splits inside a code point.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::models::{Chunk, ChunkMetadata, LinkCategory, LinkRef};

/// How far back from the window end the breakpoint search may reach.
const BREAK_TOLERANCE: usize = 200;

/// Characters treated as sentence enders for breakpoint purposes.
const SENTENCE_ENDERS: [char; 4] = ['.', '!', '?', '\n'];

/// Split text into overlapping chunks with contiguous indices starting at 0.
/// Consecutive chunks share `overlap` characters so context survives the cut.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    if text.trim().is_empty() {
        return Err(PipelineError::InvalidInput(
            "Cannot chunk empty text".to_string(),
        ));
    }
    if max_size == 0 {
        return Err(PipelineError::InvalidInput(
            "max_size must be > 0".to_string(),
        ));
    }
    if overlap >= max_size {
        return Err(PipelineError::InvalidInput(format!(
            "overlap ({}) must be smaller than max_size ({})",
            overlap, max_size
        )));
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let window_end = (start + max_size).min(total);
        let end = if window_end == total {
            total
        } else {
            find_breakpoint(&chars, start, window_end, overlap)
        };

        let content: String = chars[start..end].iter().collect();
        chunks.push(make_chunk(document_id, index, &content, start));
        index += 1;

        if end == total {
            break;
        }
        // Overlap reaches back into the previous chunk but the breakpoint
        // search guarantees forward progress.
        start = end - overlap;
    }

    Ok(chunks)
}

/// Find the best split position in `[start, window_end)`. Searches backwards
/// within the tolerance window for a paragraph break, then a sentence end,
/// then whitespace. Falls back to a hard cut at the window end. The returned
/// position always exceeds `start + overlap` so the next window advances.
fn find_breakpoint(chars: &[char], start: usize, window_end: usize, overlap: usize) -> usize {
    let floor = (start + overlap + 1).max(window_end.saturating_sub(BREAK_TOLERANCE));
    if floor >= window_end {
        return window_end;
    }

    // Paragraph boundary: split before the blank line.
    for i in (floor..window_end.saturating_sub(1)).rev() {
        if chars[i] == '\n' && chars[i + 1] == '\n' {
            return i + 1;
        }
    }

    // Sentence ending: split just after it.
    for i in (floor..window_end).rev() {
        if SENTENCE_ENDERS.contains(&chars[i]) {
            return i + 1;
        }
    }

    // Whitespace: split after the space so words stay intact.
    for i in (floor..window_end).rev() {
        if chars[i] == ' ' {
            return i + 1;
        }
    }

    window_end
}

fn make_chunk(document_id: &str, index: i64, content: &str, char_offset: usize) -> Chunk {
    let links = extract_links(content);
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        content: content.to_string(),
        char_offset,
        char_length: content.chars().count(),
        metadata: ChunkMetadata {
            images: Vec::new(),
            links,
            section: None,
        },
    }
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).unwrap())
}

/// Pull every URL out of `text`, with surrounding context and a category
/// guess based on the host.
pub fn extract_links(text: &str) -> Vec<LinkRef> {
    let mut links = Vec::new();
    for m in url_regex().find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '\'', '"']);
        if url.is_empty() {
            continue;
        }
        let position = text[..m.start()].chars().count();
        let context = surrounding_context(text, m.start(), m.start() + url.len());
        links.push(LinkRef {
            url: url.to_string(),
            position,
            context,
            category: categorize_url(url),
        });
    }
    links
}

/// Up to 50 characters of context on each side of the URL.
fn surrounding_context(text: &str, byte_start: usize, byte_end: usize) -> String {
    let before: String = text[..byte_start]
        .chars()
        .rev()
        .take(50)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let after: String = text[byte_end..].chars().take(50).collect();
    format!("{}{}{}", before, &text[byte_start..byte_end], after)
        .trim()
        .to_string()
}

pub fn categorize_url(url: &str) -> LinkCategory {
    let lower = url.to_lowercase();
    if lower.contains("youtube.com") || lower.contains("youtu.be") {
        LinkCategory::Video
    } else if lower.contains("mediafire.com")
        || lower.contains("drive.google.com")
        || lower.contains("mega.nz")
        || lower.contains("download")
    {
        LinkCategory::Download
    } else if lower.contains("facebook.com")
        || lower.contains("discord.gg")
        || lower.contains("discord.com")
        || lower.contains("reddit.com")
        || lower.contains("zalo.me")
    {
        LinkCategory::Community
    } else if lower.contains("pokemmo.com") {
        LinkCategory::Official
    } else {
        LinkCategory::External
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Xin chào thế giới!", 1000, 200).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].char_offset, 0);
        assert_eq!(chunks[0].content, "Xin chào thế giới!");
    }

    #[test]
    fn empty_text_rejected() {
        assert!(chunk_text("doc1", "   \n ", 1000, 200).is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_max_size() {
        assert!(chunk_text("doc1", "hello", 100, 100).is_err());
        assert!(chunk_text("doc1", "hello", 100, 150).is_err());
    }

    #[test]
    fn long_text_chunks_respect_max_size() {
        let text = "Đây là một câu dài về PokeMMO. ".repeat(200);
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.char_length <= 1000, "chunk {} too long", c.chunk_index);
        }
    }

    #[test]
    fn chunk_indices_contiguous() {
        let text = "word ".repeat(2000);
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "word ".repeat(2000);
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        for pair in chunks.windows(2) {
            let prev_end = pair[0].char_offset + pair[0].char_length;
            assert_eq!(pair[1].char_offset, prev_end - 200);
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let para = "a".repeat(900);
        let text = format!("{}\n\n{}", para, "b".repeat(900));
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        assert!(chunks[0].content.ends_with('\n'));
        assert!(!chunks[0].content.contains('b'));
    }

    #[test]
    fn prefers_sentence_breaks_over_hard_cuts() {
        let sentence = "Một câu hoàn chỉnh về trò chơi. ";
        let text = sentence.repeat(100);
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        assert!(chunks.len() > 1);
        let trimmed = chunks[0].content.trim_end();
        assert!(trimmed.ends_with('.'));
    }

    #[test]
    fn unbreakable_text_hard_cuts() {
        let text = "x".repeat(2500);
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].char_length, 1000);
    }

    #[test]
    fn multibyte_text_counts_characters() {
        // 1200 Vietnamese characters, each multi-byte in UTF-8.
        let text = "ế".repeat(1200);
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        assert_eq!(chunks[0].char_length, 1000);
        assert_eq!(chunks[1].char_offset, 800);
    }

    #[test]
    fn full_coverage_no_gaps() {
        let text = "Hướng dẫn chơi PokeMMO. ".repeat(300);
        let total = text.chars().count();
        let chunks = chunk_text("doc1", &text, 1000, 200).unwrap();
        assert_eq!(chunks[0].char_offset, 0);
        let last = chunks.last().unwrap();
        assert_eq!(last.char_offset + last.char_length, total);
        for pair in chunks.windows(2) {
            assert!(pair[1].char_offset < pair[0].char_offset + pair[0].char_length);
        }
    }

    #[test]
    fn extracts_and_categorizes_links() {
        let text = "Tải game tại https://pokemmo.com/downloads rồi xem video \
                    https://youtube.com/watch?v=abc123. Tham gia nhóm \
                    https://facebook.com/groups/pokemmovn nhé!";
        let links = extract_links(text);
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].category, LinkCategory::Download);
        assert_eq!(links[1].category, LinkCategory::Video);
        assert_eq!(links[1].url, "https://youtube.com/watch?v=abc123");
        assert_eq!(links[2].category, LinkCategory::Community);
    }

    #[test]
    fn strips_trailing_punctuation_from_links() {
        let links = extract_links("Xem https://example.com/page.");
        assert_eq!(links[0].url, "https://example.com/page");
        assert_eq!(links[0].category, LinkCategory::External);
    }

    #[test]
    fn official_site_category() {
        assert_eq!(
            categorize_url("https://pokemmo.com/account"),
            LinkCategory::Official
        );
    }

    #[test]
    fn chunk_metadata_carries_links() {
        let text = "Hướng dẫn: https://youtu.be/xyz";
        let chunks = chunk_text("doc1", text, 1000, 200).unwrap();
        assert_eq!(chunks[0].metadata.links.len(), 1);
        assert_eq!(chunks[0].metadata.links[0].category, LinkCategory::Video);
    }
}
