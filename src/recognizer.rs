//! Incremental tag recognizer.
//!
//! Classifies the head of the pending character buffer as literal text, an
//! open tag, a self-closing tag, a close tag, or "incomplete". The grammar
//! is deliberately loose: this is not an XML parser, it is a scanner that
//! has to coexist with arbitrary HTML and with tag fragments that straddle
//! chunk boundaries. Anything that cannot currently be classified as a tag
//! and can never become one resyncs to literal text.

use std::sync::LazyLock;

use regex::Regex;

/// One attribute as scanned from an open tag, entity-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub prefix: Option<String>,
    pub local: String,
    pub value: String,
}

/// A scanned open or self-closing tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTag {
    /// Tag name as written, including any prefix (`esi:include`).
    pub fullname: String,
    pub attributes: Vec<RawAttribute>,
}

/// Classification of the head of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognized {
    /// Literal character data.
    Text(String),
    ElementOpen(RawTag),
    ElementSelfClose(RawTag),
    ElementClose(String),
    /// The buffer may be the start of a tag; wait for more input.
    Incomplete,
}

const NAME: &str = "[A-Za-z][-A-Za-z0-9]*";

static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"^<({NAME}(?::{NAME})?)((?:\s+{NAME}(?::{NAME})?\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/)?>"#
    ))
    .expect("open tag pattern")
});

static CLOSE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^</({NAME}(?::{NAME})?)\s*>")).expect("close tag pattern"));

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"(?:({NAME}):)?({NAME})\s*=\s*(?:"([^"]*)"|'([^']*)')"#
    ))
    .expect("attribute pattern")
});

// Matches any string that is a proper prefix of a (loosely) valid tag.
// Every piece is optional so that a buffer cut off at any point inside a
// tag still matches; the anchors make sure the *entire* remaining buffer
// is tag-shaped.
static PARTIAL_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r#"^</?(?:{NAME}(?::(?:{NAME})?)?)?(?:\s+(?:{NAME}(?::(?:{NAME})?)?)?(?:\s*=\s*(?:"[^"]*"?|'[^']*'?)?)?)*\s*/?$"#
    ))
    .expect("partial tag pattern")
});

/// Classify the head of `buffer`. Returns the classification and the number
/// of bytes consumed (zero for [`Recognized::Incomplete`]).
///
/// With `ignore_default_tags` set, only prefixed tags are recognized;
/// complete unprefixed tags are passed through as literal text.
pub fn recognize(buffer: &str, ignore_default_tags: bool) -> (Recognized, usize) {
    if buffer.is_empty() {
        return (Recognized::Incomplete, 0);
    }

    if !buffer.starts_with('<') {
        // Emit the text leading up to the next possible tag start. Trailing
        // text with no `<` at all can never become a tag.
        return match buffer.find('<') {
            Some(i) => (Recognized::Text(buffer[..i].to_owned()), i),
            None => (Recognized::Text(buffer.to_owned()), buffer.len()),
        };
    }

    if let Some(caps) = CLOSE_TAG.captures(buffer) {
        let whole = caps.get(0).map_or(0, |m| m.end());
        let fullname = &caps[1];
        if ignore_default_tags && !fullname.contains(':') {
            return (Recognized::Text(buffer[..whole].to_owned()), whole);
        }
        return (Recognized::ElementClose(fullname.to_owned()), whole);
    }

    if let Some(caps) = OPEN_TAG.captures(buffer) {
        let whole = caps.get(0).map_or(0, |m| m.end());
        let fullname = &caps[1];
        if ignore_default_tags && !fullname.contains(':') {
            return (Recognized::Text(buffer[..whole].to_owned()), whole);
        }
        let tag = RawTag {
            fullname: fullname.to_owned(),
            attributes: scan_attributes(caps.get(2).map_or("", |m| m.as_str())),
        };
        let event = if caps.get(3).is_some() {
            Recognized::ElementSelfClose(tag)
        } else {
            Recognized::ElementOpen(tag)
        };
        return (event, whole);
    }

    if PARTIAL_TAG.is_match(buffer) {
        return (Recognized::Incomplete, 0);
    }

    // Not a tag and never will be; resync to the next `<`.
    match buffer[1..].find('<') {
        Some(i) => (Recognized::Text(buffer[..=i].to_owned()), i + 1),
        None => (Recognized::Text(buffer.to_owned()), buffer.len()),
    }
}

fn scan_attributes(raw: &str) -> Vec<RawAttribute> {
    ATTRIBUTE
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(3)
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());
            RawAttribute {
                prefix: caps.get(1).map(|m| m.as_str().to_owned()),
                local: caps[2].to_owned(),
                value: decode_entities(value),
            }
        })
        .collect()
}

/// Decode the five XML entities. Anything else (including numeric character
/// references) is passed through unchanged.
pub fn decode_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let mut replaced = false;
        for (entity, ch) in [
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
            ("&amp;", '&'),
        ] {
            if rest.starts_with(entity) {
                out.push(ch);
                rest = &rest[entity.len()..];
                replaced = true;
                break;
            }
        }
        if !replaced {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Encode the five XML entities for attribute serialization.
pub fn encode_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}
