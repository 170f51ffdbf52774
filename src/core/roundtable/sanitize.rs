use regex::Regex;
use std::sync::LazyLock;

/// Longest line a speaker gets.
pub const MAX_DIALOGUE_CHARS: usize = 120;

static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").expect("url pattern"));
static EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*_]{1,3}([^*_]+)[*_]{1,3}").expect("emphasis pattern"));
static WRAPPING_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^["']|["']$"#).expect("quote pattern"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space pattern"));

/// Clean raw model output into one spoken line of at most `max_chars`
/// characters, plus an ellipsis when it was cut mid-thought.
pub fn sanitize_dialogue(raw: &str, max_chars: usize) -> String {
    let text = URL.replace_all(raw, "");
    let text = EMPHASIS.replace_all(&text, "$1");
    let text = WRAPPING_QUOTE.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    let cleaned = text.trim();

    if cleaned.chars().count() <= max_chars {
        return cleaned.to_string();
    }

    let mut cut: String = cleaned.chars().take(max_chars).collect();
    if let Some(space) = cut.rfind(' ') {
        // only back off to a word boundary when it keeps most of the line
        if cut[..space].chars().count() as f64 > max_chars as f64 * 0.7 {
            cut.truncate(space);
        }
    }
    if !cut.ends_with(['.', '!', '?']) {
        cut.push('…');
    }
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_urls_emphasis_and_wrapping_quotes() {
        let raw = "\"Read **this**   first: https://example.com/x and _then_ act\"";
        assert_eq!(sanitize_dialogue(raw, 120), "Read this first: and then act");
    }

    #[test]
    fn long_unpunctuated_line_breaks_at_a_word() {
        let raw = "This is a very long uninterrupted utterance that exceeds one hundred and \
                   twenty characters without any punctuation at all";
        let out = sanitize_dialogue(raw, MAX_DIALOGUE_CHARS);
        assert!(out.chars().count() <= MAX_DIALOGUE_CHARS + 1);
        assert!(out.ends_with('…'));
        let body = out.trim_end_matches('…');
        assert!(raw.starts_with(body));
        assert_eq!(raw.as_bytes()[body.len()], b' ');
    }

    #[test]
    fn short_lines_are_untouched() {
        assert_eq!(sanitize_dialogue("  Ship it.  ", 120), "Ship it.");
    }

    proptest! {
        #[test]
        fn output_never_exceeds_the_cap(raw in "\\PC{0,400}", max in 10usize..200) {
            let out = sanitize_dialogue(&raw, max);
            prop_assert!(out.chars().count() <= max + 1);
        }
    }
}
