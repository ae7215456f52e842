/// Title used when the first message carries no text.
pub const UNTITLED: &str = "New chat";

/// Derives a conversation title from the first message.
///
/// Whitespace runs collapse to single spaces; text longer than `max_chars`
/// characters is cut on a character boundary and suffixed with `...`.
#[must_use]
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return UNTITLED.to_string();
    }

    let mut chars = collapsed.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head.trim_end())
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Hello", 30, "Hello" ; "short text kept")]
    #[test_case("   ", 30, "New chat" ; "blank text")]
    #[test_case("", 30, "New chat" ; "empty text")]
    #[test_case("Plan  a\n\ttrip", 30, "Plan a trip" ; "whitespace collapsed")]
    #[test_case("abcdefghij", 10, "abcdefghij" ; "exactly at limit")]
    #[test_case("abcdefghijk", 10, "abcdefghij..." ; "truncated past limit")]
    #[test_case("héllo wörld", 5, "héllo..." ; "multibyte boundary")]
    #[test_case("hello world again", 6, "hello..." ; "trailing space trimmed")]
    fn derives_titles(input: &str, max: usize, expected: &str) {
        assert_eq!(derive_title(input, max), expected);
    }
}
