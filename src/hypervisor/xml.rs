//! Just enough XML scanning for the libvirt documents bottle reads:
//! DHCP ranges and host pins from a network description, and the
//! MAC → tap-device mapping from a live domain description.
//!
//! Writes go the other way (typed structs rendered to XML), so a full
//! parser buys nothing here.

/// Return the raw text of every `<tag …>` element start in `xml`,
/// in document order. Self-closing and open tags both match; the
/// returned slice runs from `<tag` to the closing `>`.
pub fn element_starts<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    let needle = format!("<{tag}");
    let mut rest = xml;
    while let Some(pos) = rest.find(&needle) {
        let after = &rest[pos + needle.len()..];
        // Require a delimiter so "<interface" does not match "<interfaces".
        let delimited = matches!(after.chars().next(), Some(c) if c.is_whitespace() || c == '>' || c == '/');
        if delimited {
            if let Some(end) = after.find('>') {
                out.push(&rest[pos..pos + needle.len() + end + 1]);
                rest = &after[end + 1..];
                continue;
            }
        }
        rest = &rest[pos + needle.len()..];
    }
    out
}

/// Extract an attribute value from an element start (`attr='v'` or `attr="v"`).
pub fn attr(element: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let needle = format!("{name}={quote}");
        if let Some(pos) = element.find(&needle) {
            let rest = &element[pos + needle.len()..];
            if let Some(end) = rest.find(quote) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

/// Split `xml` into the body text of every `<tag>…</tag>` block.
/// Nested same-name blocks are not handled; libvirt does not nest the
/// elements bottle reads this way.
pub fn element_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut rest = xml;
    while let Some(pos) = rest.find(&open) {
        let after = &rest[pos..];
        let Some(body_start) = after.find('>') else { break };
        // Self-closing start tag has no body.
        if after[..body_start].ends_with('/') {
            rest = &after[body_start + 1..];
            continue;
        }
        let Some(end) = after.find(&close) else { break };
        out.push(&after[body_start + 1..end]);
        rest = &after[end + close.len()..];
    }
    out
}
