//! Fixed-size overlapping text chunks

/// Split `text` into windows of `chunk_size` characters, each starting
/// `chunk_size - overlap` characters after the previous one.
///
/// Whitespace is collapsed first; chunks are trimmed and empty ones dropped.
/// Callers guarantee `overlap < chunk_size` (enforced by configuration).
pub fn split_into_chunks(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = normalized.chars().collect();

    if chars.is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + chunk_size).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end == chars.len() {
            break;
        }
        start += step;
    }

    chunks
}
