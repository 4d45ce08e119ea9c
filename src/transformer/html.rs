//! HTML sanitization and the regex families used for mention/hashtag/emoji/spoiler handling on
//! both translation directions (§4.4).

use ammonia::Builder;
use regex::Regex;

/// Strips `<script>`/`<style>`, inline event handler attributes, and neutralizes `javascript:`
/// URLs, while keeping the small set of inline formatting tags chat/fed bodies actually use.
pub fn sanitize(html: &str) -> String {
    Builder::default()
        .add_tags(["span", "em", "strong", "del", "code", "pre", "a", "img", "br", "p", "ul", "ol", "li", "blockquote"])
        .add_tag_attributes("span", ["style", "data-mx-spoiler"])
        .add_tag_attributes("a", ["href", "rel"])
        .add_tag_attributes("img", ["src", "alt"])
        .link_rel(Some("noopener noreferrer"))
        .url_schemes(["http", "https", "mailto"].into_iter().collect())
        .clean(html)
        .to_string()
}

/// Matches a chat-side mention, e.g. `@alice:example.com`.
pub fn chat_mention_regex() -> Regex {
    Regex::new(r"@([\p{L}0-9_.=\-/]+):([A-Za-z0-9.\-]+\.[A-Za-z]{2,})").expect("valid regex")
}

/// Matches a fed-side mention, e.g. `@alice@example.com`.
pub fn fed_mention_regex() -> Regex {
    Regex::new(r"@([\p{L}0-9_.\-]+)@([A-Za-z0-9.\-]+\.[A-Za-z]{2,})").expect("valid regex")
}

/// Matches a hashtag, `#word` (§4.4: "hashtags are `#[A-Za-z0-9_]+`").
pub fn hashtag_regex() -> Regex {
    Regex::new(r"#([A-Za-z0-9_]+)").expect("valid regex")
}

/// Matches an emoji shortcode, `:shortcode:`.
pub fn shortcode_regex() -> Regex {
    Regex::new(r":([A-Za-z0-9_+\-]+):").expect("valid regex")
}

/// Matches the Matrix spoiler convention `<span data-mx-spoiler="label">...`, with an optional
/// label.
pub fn spoiler_regex() -> Regex {
    Regex::new(r#"data-mx-spoiler(?:="([^"]*)")?"#).expect("valid regex")
}

/// Returns `Some(label)` (possibly empty) if `html` contains a spoiler marker anywhere
/// (§4.4: "If a spoiler marker is present anywhere, set `sensitive=true`").
pub fn extract_spoiler_label(html: &str) -> Option<String> {
    spoiler_regex()
        .captures(html)
        .map(|c| c.get(1).map(|m| m.as_str()).unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_script_tags() {
        let out = sanitize(r#"<p>hi</p><script>alert(1)</script>"#);
        assert!(!out.contains("script"));
        assert!(out.contains("hi"));
    }

    #[test]
    fn sanitize_neutralizes_javascript_urls() {
        let out = sanitize(r#"<a href="javascript:alert(1)">click</a>"#);
        assert!(!out.contains("javascript:"));
    }

    #[test]
    fn chat_mention_matches_expected_shape() {
        let caps = chat_mention_regex().captures("hello @alice:example.com!").unwrap();
        assert_eq!(&caps[1], "alice");
        assert_eq!(&caps[2], "example.com");
    }

    #[test]
    fn fed_mention_matches_expected_shape() {
        let caps = fed_mention_regex().captures("hello @alice@example.com!").unwrap();
        assert_eq!(&caps[1], "alice");
        assert_eq!(&caps[2], "example.com");
    }

    #[test]
    fn extracts_spoiler_label() {
        let label = extract_spoiler_label(r#"<span data-mx-spoiler="ending">he dies</span>"#).unwrap();
        assert_eq!(label, "ending");
    }

    #[test]
    fn no_spoiler_marker_returns_none() {
        assert!(extract_spoiler_label("<p>plain</p>").is_none());
    }
}
