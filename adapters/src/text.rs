/// Split `text` into delivery-sized chunks, preferring to break on a
/// newline, then on a space, before cutting mid-word. Splits always land on
/// char boundaries.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let window = match floor_char_boundary(rest, limit) {
            // A limit smaller than the first char still has to make progress.
            0 => rest.chars().next().map_or(rest.len(), char::len_utf8),
            window => window,
        };
        let cut = rest[..window]
            .rfind('\n')
            .or_else(|| rest[..window].rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window);
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.trim_end().to_string());
        rest = tail.trim_start();
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn prefers_newline_breaks() {
        let text = "first paragraph\nsecond paragraph";
        let chunks = chunk_text(text, 20);
        assert_eq!(chunks, vec!["first paragraph", "second paragraph"]);
    }

    #[test]
    fn falls_back_to_spaces_then_hard_cuts() {
        let chunks = chunk_text("alpha beta gamma", 10);
        assert_eq!(chunks, vec!["alpha", "beta gamma"]);

        let chunks = chunk_text("abcdefghijklmno", 5);
        assert_eq!(chunks, vec!["abcde", "fghij", "klmno"]);
    }

    #[test]
    fn never_splits_inside_a_char() {
        let text = "héllo wörld ünïcode everywhere";
        for chunk in chunk_text(text, 7) {
            // Would panic on a broken boundary.
            let _ = chunk.chars().count();
            assert!(chunk.len() <= 7);
        }
    }
}
