use thiserror::Error;

/// Errors that can occur during ESI processing.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// A closing tag arrived while no element was open.
    #[error("unexpected closing tag `</{0}>`: no element is open")]
    UnexpectedClosingTag(String),

    /// A closing tag did not match the innermost open element.
    #[error("closing tag `</{found}>` does not match open element `<{expected}>`")]
    MismatchedClosingTag { expected: String, found: String },

    /// A namespace prefix could not be resolved and the document does not
    /// allow unknown prefixes.
    #[error("unknown namespace prefix `{0}`")]
    UnknownNamespacePrefix(String),

    /// An ESI directive was structurally invalid (stray arm tags, unknown
    /// directive names, malformed choose blocks).
    #[error("invalid ESI structure in `<{tag}>`: {message}")]
    StructureError { tag: String, message: String },

    /// Every candidate source of an `esi:include` failed and no error
    /// handler produced a replacement.
    #[error("all candidates failed for include of `{src}`")]
    IncludeError { src: String },

    /// An expression could not be lexed, parsed, or evaluated. Inside a
    /// `when` test this is swallowed and treated as a false branch.
    #[error("expression error: {0}")]
    ExpressionError(String),

    /// The configured ESI prefix is not a valid XML identifier.
    #[error("invalid ESI prefix `{0}`")]
    InvalidPrefix(String),

    /// An include candidate did not resolve to a usable URL.
    #[error("invalid fragment URL `{0}`")]
    InvalidRequestUrl(String),

    /// A directive is missing an attribute it cannot work without.
    #[error("missing required parameter `{1}` in `<{0}>`")]
    MissingRequiredParameter(String, String),

    /// The host fetch implementation reported a failure.
    #[error("fragment request failed: {0}")]
    FetchError(String),

    /// The input byte stream is not valid UTF-8.
    #[error("invalid utf-8 in input stream")]
    InvalidUtf8,

    /// The downstream consumer closed its end of the stream.
    #[error("downstream consumer closed the stream")]
    StreamClosed,

    /// The element tree contains a parent/child cycle.
    #[error("cycle detected in element tree")]
    CyclicTree,

    /// `_root` and `_replace` are reserved for internal use.
    #[error("element name `{0}` is reserved")]
    ReservedElementName(String),
}

impl From<std::str::Utf8Error> for ExecutionError {
    fn from(_: std::str::Utf8Error) -> Self {
        Self::InvalidUtf8
    }
}

impl From<std::string::FromUtf8Error> for ExecutionError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
