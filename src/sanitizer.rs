//! Content cleaning applied to every textual input before rendering.
//!
//! Renderers resolve URLs against the local filesystem, so anything that
//! could point them at local files or attach foreign files is removed:
//! `etc/passwd` references, `ftp://`, `file://` and `sftp://` URLs, and
//! `<link rel="attachment">` tags.

use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    sensitive_path: Regex,
    local_urls: Regex,
    attachment_links: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        sensitive_path: Regex::new(r"(?i)etc/passwd").unwrap(),
        local_urls: Regex::new(
            r"(?i)\b(?:ftp|file|sftp)://[-A-Z0-9+&@#/%?=~_|$!:,.;]*[A-Z0-9+&@#/%=~_|$]",
        )
        .unwrap(),
        attachment_links: Regex::new(
            r#"(?i)<link\s(?:[^>]*rel\s?=\s?["']?attachment["']?)[^>]*>"#,
        )
        .unwrap(),
    })
}

/// Strips local-file references from `content`.
pub fn clean(content: &str) -> String {
    let patterns = patterns();
    let cleaned = patterns.sensitive_path.replace_all(content, "");
    let cleaned = patterns.local_urls.replace_all(&cleaned, "");
    patterns
        .attachment_links
        .replace_all(&cleaned, "")
        .into_owned()
}

/// The three textual inputs of a render request after cleaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanInputs {
    pub html: String,
    pub css: String,
    pub javascript: String,
}

pub fn clean_all(html: &str, css: &str, javascript: &str) -> CleanInputs {
    CleanInputs {
        html: clean(html),
        css: clean(css),
        javascript: clean(javascript),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removes_sensitive_path() {
        assert_eq!(clean("cat /ETC/passwd now"), "cat / now");
    }

    #[test]
    fn test_removes_local_protocol_urls() {
        let input = r#"<img src="file:///home/user/secret.png"> <a href="ftp://host/x.txt">x</a>"#;
        assert_eq!(clean(input), r#"<img src=""> <a href="">x</a>"#);
        assert_eq!(clean("see SFTP://box:22/data;"), "see ;");
    }

    #[test]
    fn test_keeps_http_urls() {
        let input = r#"<a href="https://example.com/file://">ok</a>"#;
        assert!(clean(input).contains("https://example.com/"));
        assert_eq!(clean("http://example.com"), "http://example.com");
    }

    #[test]
    fn test_removes_attachment_links() {
        let input = r#"<head><link rel="attachment" href="x.pdf"><link rel="stylesheet" href="a.css"></head>"#;
        assert_eq!(
            clean(input),
            r#"<head><link rel="stylesheet" href="a.css"></head>"#
        );
        assert_eq!(clean("<LINK href=a REL=attachment>"), "");
    }

    #[test]
    fn test_clean_all_applies_to_each_input() {
        let inputs = clean_all("a file://x b", "url(file://y.png)", "fetch('ftp://z')");
        assert_eq!(inputs.html, "a  b");
        assert_eq!(inputs.css, "url()");
        assert_eq!(inputs.javascript, "fetch('')");
    }
}
