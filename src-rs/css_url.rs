//! Extraction of the first `url(...)` reference from a computed
//! `background-image` value.

use regex::Regex;
use std::sync::LazyLock;

static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"']*?))\s*\)"#).unwrap()
});

/// Returns the unquoted URL of the first `url(...)` in `value`.
///
/// `none`, the empty string and values without a `url(...)` function yield
/// `None`. Only one layer of single or double quotes is stripped; later layers
/// of a multi-image background are ignored.
pub fn extract_css_url(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }

    let caps = CSS_URL_RE.captures(trimmed)?;
    let inner = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())?;
    if inner.is_empty() {
        return None;
    }
    Some(inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_zero_or_one_quote_layer() {
        for raw in [
            "url(https://x/img.png)",
            "url('https://x/img.png')",
            "url(\"https://x/img.png\")",
        ] {
            assert_eq!(extract_css_url(raw).as_deref(), Some("https://x/img.png"), "{raw}");
        }
    }

    #[test]
    fn none_and_empty_do_not_match() {
        assert_eq!(extract_css_url("none"), None);
        assert_eq!(extract_css_url("NONE"), None);
        assert_eq!(extract_css_url(""), None);
        assert_eq!(extract_css_url("   "), None);
        assert_eq!(extract_css_url("linear-gradient(red, blue)"), None);
        assert_eq!(extract_css_url("url()"), None);
    }

    #[test]
    fn takes_first_layer_only() {
        let raw = "url(\"https://x/top.png\"), url(\"https://x/bottom.png\")";
        assert_eq!(extract_css_url(raw).as_deref(), Some("https://x/top.png"));

        let raw = "linear-gradient(rgba(0, 0, 0, 0.5), transparent), url(/bg.jpg)";
        assert_eq!(extract_css_url(raw).as_deref(), Some("/bg.jpg"));
    }

    #[test]
    fn keeps_data_and_protocol_relative_urls_verbatim() {
        assert_eq!(
            extract_css_url("url(\"data:image/png;base64,iVBORw0KGgo=\")").as_deref(),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
        assert_eq!(
            extract_css_url("url(//cdn.example.com/a%20b.webp)").as_deref(),
            Some("//cdn.example.com/a%20b.webp")
        );
    }
}
