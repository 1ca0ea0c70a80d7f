//! ESI variables and `$(NAME{SUB}|default)` substitution.
//!
//! Built-in variables are derived from the request URL and headers. A
//! variable is a small tagged union rather than a trait object per kind:
//! scalars, membership lists, dictionaries, and the user-agent
//! classification all answer the same two questions (whole value and
//! sub-keyed value) with quoted-string or boolean-literal encodings.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use http::HeaderMap;
use nom::branch::alt;
use nom::bytes::complete::{escaped, is_not, tag, take_till, take_while1};
use nom::character::complete::{anychar, char};
use nom::combinator::{map, opt, recognize};
use nom::sequence::{delimited, preceded, tuple};
use nom::IResult;
use regex::Regex;
use url::Url;

/// Pluggable variable resolver.
///
/// `get_value` returns the whole value as a quoted single-quoted string;
/// `get_sub_value` returns either a quoted string or the literal boolean
/// tokens `true`/`false`. Unknown variables return `None`.
pub trait Variables: Send + Sync {
    fn get_value(&self, name: &str) -> Option<String>;
    fn get_sub_value(&self, name: &str, key: &str) -> Option<String>;
}

/// One built-in variable.
#[derive(Debug, Clone)]
enum Variable {
    Scalar(String),
    List {
        raw: String,
        members: HashSet<String>,
    },
    Dict {
        raw: String,
        entries: HashMap<String, String>,
    },
    UserAgent {
        raw: String,
        browser: String,
        version: String,
        os: String,
    },
}

impl Variable {
    fn get_value(&self) -> String {
        match self {
            Self::Scalar(v) => quote(v),
            Self::List { raw, .. } | Self::Dict { raw, .. } | Self::UserAgent { raw, .. } => {
                quote(raw)
            }
        }
    }

    fn get_sub_value(&self, key: &str) -> Option<String> {
        match self {
            Self::Scalar(_) => None,
            Self::List { members, .. } => Some(if members.contains(key) {
                "true".to_owned()
            } else {
                "false".to_owned()
            }),
            Self::Dict { entries, .. } => {
                Some(quote(entries.get(key).map_or("", String::as_str)))
            }
            Self::UserAgent {
                browser,
                version,
                os,
                ..
            } => {
                let value = match key {
                    "browser" => browser,
                    "version" => version,
                    "os" => os,
                    _ => "",
                };
                Some(quote(value))
            }
        }
    }
}

/// The built-in variable set, populated from a request URL and headers.
pub struct RequestVariables {
    map: HashMap<String, Variable>,
}

impl RequestVariables {
    pub fn from_request(url: &Url, headers: &HeaderMap) -> Self {
        let mut map = HashMap::new();

        let accept_language = header_str(headers, "accept-language").unwrap_or_default();
        map.insert(
            "HTTP_ACCEPT_LANGUAGE".to_owned(),
            Variable::List {
                members: parse_accept_language(&accept_language),
                raw: accept_language,
            },
        );

        let cookie = header_str(headers, "cookie").unwrap_or_default();
        map.insert(
            "HTTP_COOKIE".to_owned(),
            Variable::Dict {
                entries: parse_cookies(&cookie),
                raw: cookie,
            },
        );

        if let Some(host) = header_str(headers, "host") {
            map.insert("HTTP_HOST".to_owned(), Variable::Scalar(host));
        }
        if let Some(referer) = header_str(headers, "referer") {
            map.insert("HTTP_REFERER".to_owned(), Variable::Scalar(referer));
        }
        if let Some(ua) = header_str(headers, "user-agent") {
            let (browser, version, os) = classify_user_agent(&ua);
            map.insert(
                "HTTP_USER_AGENT".to_owned(),
                Variable::UserAgent {
                    raw: ua,
                    browser,
                    version,
                    os,
                },
            );
        }

        let query = url.query().unwrap_or("").to_owned();
        map.insert(
            "QUERY_STRING".to_owned(),
            Variable::Dict {
                entries: url
                    .query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect(),
                raw: query,
            },
        );

        Self { map }
    }
}

impl Variables for RequestVariables {
    fn get_value(&self, name: &str) -> Option<String> {
        self.map.get(name).map(Variable::get_value)
    }

    fn get_sub_value(&self, name: &str, key: &str) -> Option<String> {
        self.map.get(name).and_then(|v| v.get_sub_value(key))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn parse_accept_language(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|part| part.split(';').next().unwrap_or("").trim())
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

static MSIE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"MSIE (\d+)\.(\d+)").expect("msie version pattern"));
static MOZILLA_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Mozilla/(\d+)\.(\d+)").expect("mozilla version pattern"));

fn classify_user_agent(ua: &str) -> (String, String, String) {
    let (browser, caps) = if ua.contains("MSIE") {
        ("MSIE", MSIE_VERSION.captures(ua))
    } else if ua.contains("Mozilla") {
        ("MOZILLA", MOZILLA_VERSION.captures(ua))
    } else {
        ("OTHER", None)
    };
    let version = caps.map_or_else(
        || "0.0".to_owned(),
        |c| format!("{}.{}", &c[1], &c[2]),
    );

    let os = if ua.contains("Win") {
        "WIN"
    } else if ua.contains("Mac") {
        "MAC"
    } else if ua.contains("X11") || ua.contains("Linux") || ua.contains("Unix") {
        "UNIX"
    } else {
        "OTHER"
    };

    (browser.to_owned(), version, os.to_owned())
}

/// Wrap a value in single quotes, backslash-escaping embedded quotes.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\\' || ch == '\'' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

/// Strip one layer of single quotes and unescape the contents. Values that
/// are not quoted are returned unchanged.
pub fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
    else {
        return value.to_owned();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn is_quoted(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'')
}

/// A parsed `$(NAME{SUB}|default)` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableReference<'a> {
    pub name: &'a str,
    pub sub: Option<&'a str>,
    /// Default text as written, possibly still quoted.
    pub default: Option<&'a str>,
}

fn var_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn var_sub(input: &str) -> IResult<&str, &str> {
    delimited(char('{'), take_till(|c| c == '}'), char('}'))(input)
}

fn quoted_default(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('\''),
        opt(escaped(is_not("\\'"), '\\', anychar)),
        char('\''),
    ))(input)
}

fn bare_default(input: &str) -> IResult<&str, &str> {
    take_till(|c| c == ')')(input)
}

fn var_default(input: &str) -> IResult<&str, &str> {
    preceded(char('|'), alt((quoted_default, bare_default)))(input)
}

/// Parse a `$(NAME{SUB}|default)` reference at the head of `input`.
pub fn variable_reference(input: &str) -> IResult<&str, VariableReference<'_>> {
    map(
        delimited(
            tag("$("),
            tuple((var_name, opt(var_sub), opt(var_default))),
            char(')'),
        ),
        |(name, sub, default)| VariableReference { name, sub, default },
    )(input)
}

/// Apply `$(NAME{SUB}|default)` substitution to `text`.
///
/// A reference resolves to its variable's value; absent, empty, and
/// `false` values fall back to the default (or the empty string). The
/// substituted value is unquoted, and boolean literals render as empty
/// strings. Anything that does not parse as a reference is left untouched.
pub fn substitute(text: &str, vars: &dyn Variables) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('$') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        match variable_reference(rest) {
            Ok((remaining, reference)) => {
                out.push_str(&resolve_reference(&reference, vars));
                rest = remaining;
            }
            Err(_) => {
                out.push('$');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_reference(reference: &VariableReference<'_>, vars: &dyn Variables) -> String {
    let raw = match reference.sub {
        Some(key) => vars.get_sub_value(reference.name, key),
        None => vars.get_value(reference.name),
    };

    let chosen = match raw {
        Some(v) if !is_absent_like(&v) => Some(v),
        _ => reference.default.map(str::to_owned),
    };

    match chosen {
        Some(v) => finalize_value(&v),
        None => String::new(),
    }
}

fn is_absent_like(value: &str) -> bool {
    value.is_empty() || value == "''" || value == "false"
}

/// Unquote a resolved value for emission into text; boolean literals
/// become empty strings.
pub fn finalize_value(value: &str) -> String {
    if value == "true" || value == "false" {
        return String::new();
    }
    if is_quoted(value) {
        unquote(value)
    } else {
        value.to_owned()
    }
}
