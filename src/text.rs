//! Plain text of the formats the built-in helpers understand.

use scraper::{Html, Node};

/// Formats whose text can be read without an external converter.
pub const TEXT_FORMATS: [&str; 5] = ["TXT", "HTML", "HTM", "XHTML", "XHTM"];

fn is_html(fmt: &str) -> bool {
    matches!(fmt, "HTML" | "HTM" | "XHTML" | "XHTM")
}

/// Text content of `data` read as the given upper-case format, or `None` if
/// the format is not one of [`TEXT_FORMATS`].
pub fn text_of(fmt: &str, data: &[u8]) -> Option<String> {
    let data = String::from_utf8_lossy(data);
    match fmt {
        "TXT" => Some(data.into_owned()),
        fmt if is_html(fmt) => Some(html_text(&data)),
        _ => None,
    }
}

/// Visible text of an HTML document, one line per block of text.
pub fn html_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in document.tree.nodes() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|parent| {
            parent
                .value()
                .as_element()
                .is_some_and(|element| matches!(element.name(), "script" | "style" | "head" | "template"))
        });
        let text = text.trim();
        if !hidden && !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_html_text_skips_hidden_elements() {
        let html = r#"<html><head><title>Title</title><style>p { color: red }</style></head>
            <body><h1>Chapter One</h1><script>var x = 1;</script><p>It was a <em>dark</em> night.</p></body></html>"#;
        assert_eq!(html_text(html), "Chapter One\nIt was a\ndark\nnight.");
    }

    #[rstest]
    #[case("TXT", b"plain".as_slice(), Some("plain"))]
    #[case("HTM", b"<p>para</p>".as_slice(), Some("para"))]
    #[case("TXT", b"caf\xe9".as_slice(), Some("caf\u{FFFD}"))]
    #[case("EPUB", b"PK".as_slice(), None)]
    fn test_text_of(#[case] fmt: &str, #[case] data: &[u8], #[case] expected: Option<&str>) {
        assert_eq!(text_of(fmt, data).as_deref(), expected);
    }
}
