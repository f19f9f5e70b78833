//! Merges the document body, stylesheet and script into one HTML document.
//!
//! This is a structural text merge, not an HTML parser: it only looks for
//! the `<html`, `</head>` and `</body>` markers.

const META_CHARSET: &str = r#"<meta charset="UTF-8">"#;

/// Builds the final document from sanitized inputs.
pub fn compose(html: &str, css: &str, javascript: &str) -> String {
    let with_css = combine_html_and_css(html, css);
    add_javascript(&with_css, javascript)
}

fn combine_html_and_css(html: &str, css: &str) -> String {
    let style = if css.trim().is_empty() {
        String::new()
    } else {
        format!("<style>{css}</style>")
    };

    if !html.contains("<html") {
        return format!(
            "<!DOCTYPE html>\n<html>\n<head>\n{META_CHARSET}\n{style}\n</head>\n<body>\n{html}\n</body>\n</html>"
        );
    }

    if html.contains("</head>") {
        return html.replacen("</head>", &format!("{style}{META_CHARSET}</head>"), 1);
    }

    format!("{style}{html}")
}

fn add_javascript(html: &str, javascript: &str) -> String {
    if javascript.trim().is_empty() {
        return html.to_string();
    }

    let script = format!(r#"<script type="text/javascript">{javascript}</script>"#);
    if html.contains("</body>") {
        html.replacen("</body>", &format!("{script}</body>"), 1)
    } else {
        format!("{html}{script}")
    }
}
