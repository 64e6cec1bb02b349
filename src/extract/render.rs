use scraper::ElementRef;
use scraper::node::Node;

const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "object", "embed", "form", "button",
    "input", "select", "textarea", "link", "meta", "svg",
];

const BLOCKS: &[&str] = &[
    "p",
    "div",
    "section",
    "article",
    "blockquote",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "li",
    "ul",
    "ol",
    "tr",
    "table",
    "pre",
    "hr",
];

const VOID: &[&str] = &["br", "hr", "img", "wbr"];

const ALLOWED_ATTRIBUTES: &[&str] = &["href", "src", "alt", "title", "colspan", "rowspan"];

/// Plain text of `element`: one line per block, whitespace collapsed inside
/// lines, entity references decoded.
pub fn render_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    push_text(element, &mut raw);

    let lines = raw
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    decode_entities(&lines.join("\n"))
}

/// Inner HTML of `element` with scripts, embeds, comments, event handlers
/// and unsafe links removed.
pub fn render_html(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    push_html(element, &mut out);
    out.trim().to_owned()
}

fn push_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child.value().name();
        if SKIPPED.contains(&name) {
            continue;
        }
        if name == "br" {
            out.push('\n');
            continue;
        }
        let block = BLOCKS.contains(&name);
        if block {
            out.push('\n');
        }
        push_text(child, out);
        if block {
            out.push('\n');
        }
    }
}

fn push_html(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => escape_into(text, false, out),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let el = child.value();
                let name = el.name();
                if SKIPPED.contains(&name) {
                    continue;
                }

                out.push('<');
                out.push_str(name);
                for (attr, value) in el.attrs() {
                    if !ALLOWED_ATTRIBUTES.contains(&attr) || is_unsafe_link(value) {
                        continue;
                    }
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    escape_into(value, true, out);
                    out.push('"');
                }
                out.push('>');

                if VOID.contains(&name) {
                    continue;
                }
                push_html(child, out);
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            _ => {}
        }
    }
}

fn is_unsafe_link(value: &str) -> bool {
    let lowered = value.trim_start().to_ascii_lowercase();
    lowered.starts_with("javascript:") || lowered.starts_with("vbscript:")
}

fn escape_into(input: &str, attribute: bool, out: &mut String) {
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

/// Decodes numeric (`&#8220;`, `&#x201C;`) and common named references.
/// Unknown or malformed references are kept verbatim.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_owned();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        let decoded = rest
            .find(';')
            .filter(|&end| end <= 12)
            .and_then(|end| decode_reference(&rest[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_reference(name: &str) -> Option<char> {
    if let Some(numeric) = name.strip_prefix('#') {
        let code = match numeric.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }

    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "hellip" => '\u{2026}',
        "mdash" => '\u{2014}',
        "ndash" => '\u{2013}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        _ => return None,
    };
    Some(ch)
}

#[cfg(test)]
mod tests {
    use scraper::Html;

    use super::*;

    #[test]
    fn decodes_numeric_and_named_references() {
        assert_eq!(decode_entities("&#8220;Hi&#8221;"), "\u{201c}Hi\u{201d}");
        assert_eq!(decode_entities("&#x41;&#X42;"), "AB");
        assert_eq!(decode_entities("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(decode_entities("a & b"), "a & b");
        assert_eq!(decode_entities("&bogus; &#xZZ;"), "&bogus; &#xZZ;");
        assert_eq!(decode_entities("no refs"), "no refs");
    }

    #[test]
    fn text_rendering_splits_blocks_and_decodes_double_escapes() {
        let html = Html::parse_document(
            r#"<div id="c"><p>First   line</p><p>&amp;#8220;Quoted&amp;#8221;<br>next</p><script>x()</script></div>"#,
        );
        let text = render_text(html.root_element());
        assert_eq!(text, "First line\n\u{201c}Quoted\u{201d}\nnext");
    }

    #[test]
    fn html_rendering_strips_scripts_and_handlers() {
        let html = Html::parse_document(
            r#"<div><p onclick="evil()">Hi <a href="javascript:alert(1)">x</a> <a href="/ok" class="c">y</a></p><script>bad()</script><!-- note --><img src="a.png" onerror="x"></div>"#,
        );
        let body = html
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "div")
            .expect("div");
        assert_eq!(
            render_html(body),
            r#"<p>Hi <a>x</a> <a href="/ok">y</a></p><img src="a.png">"#
        );
    }
}
