//! Stream configuration.
//!
//! ## Usage Example
//! ```rust,no_run
//! let config = esi_stream::Configuration::default()
//!     .with_prefix("app")
//!     .with_escaped(false);
//! ```

use std::sync::Arc;

use crate::fetch::{FragmentDispatcher, IncludeErrorHandler, IncludeResponseProcessor};
use crate::variables::Variables;

/// How directive tags are namespaced.
#[derive(Debug, Clone, Default)]
pub enum EsiPrefix {
    /// Map the `esi` prefix to the ESI namespace.
    #[default]
    Default,
    /// Declare no implicit namespace; no tag matches the transformer.
    Disabled,
    /// Map a custom prefix (validated at stream construction).
    Named(String),
}

/// Configures optional behaviour of an ESI stream.
#[derive(Clone, Default)]
pub struct Configuration {
    /// Variable resolver; defaults to the built-ins derived from the
    /// stream's URL and headers.
    pub vars: Option<Arc<dyn Variables>>,
    /// Fetch implementation for `esi:include`. Without one, every include
    /// candidate fails.
    pub fetch: Option<Arc<FragmentDispatcher>>,
    /// Applied to successful include responses instead of the default
    /// recursive ESI processing.
    pub process_include_response: Option<Arc<IncludeResponseProcessor>>,
    /// Consulted after all include candidates failed; may supply a
    /// replacement string.
    pub handle_include_error: Option<Arc<IncludeErrorHandler>>,
    pub esi_prefix: EsiPrefix,
    /// For non-HTML ESI templates, e.g. JSON files, disables the
    /// entity-unescaping of include URLs.
    pub is_escaped_content: Option<bool>,
    /// Capacity of the bounded output channel.
    pub output_capacity: Option<usize>,
    /// Recursion depth of this stream; incremented for each nested
    /// include stream.
    pub depth: usize,
}

impl Configuration {
    pub fn with_vars(mut self, vars: Arc<dyn Variables>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn with_fetch(mut self, fetch: Arc<FragmentDispatcher>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn with_include_response_processor(
        mut self,
        processor: Arc<IncludeResponseProcessor>,
    ) -> Self {
        self.process_include_response = Some(processor);
        self
    }

    pub fn with_include_error_handler(mut self, handler: Arc<IncludeErrorHandler>) -> Self {
        self.handle_include_error = Some(handler);
        self
    }

    /// Sets an alternative ESI prefix, which is used to identify ESI
    /// instructions. For example, setting this to `test` makes the stream
    /// only match tags like `<test:include>`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.esi_prefix = EsiPrefix::Named(prefix.into());
        self
    }

    /// Declare no implicit namespace; directive tags pass through.
    pub fn without_prefix(mut self) -> Self {
        self.esi_prefix = EsiPrefix::Disabled;
        self
    }

    /// For working with non-HTML ESI templates, eg JSON files, allows to
    /// disable include-URL unescaping.
    pub fn with_escaped(mut self, is_escaped: bool) -> Self {
        self.is_escaped_content = Some(is_escaped);
        self
    }

    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = Some(capacity);
        self
    }

    pub(crate) fn is_escaped(&self) -> bool {
        self.is_escaped_content.unwrap_or(true)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.output_capacity.unwrap_or(16).max(1)
    }
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("vars", &self.vars.as_ref().map(|_| "…"))
            .field("fetch", &self.fetch.as_ref().map(|_| "…"))
            .field(
                "process_include_response",
                &self.process_include_response.as_ref().map(|_| "…"),
            )
            .field(
                "handle_include_error",
                &self.handle_include_error.as_ref().map(|_| "…"),
            )
            .field("esi_prefix", &self.esi_prefix)
            .field("is_escaped_content", &self.is_escaped_content)
            .field("output_capacity", &self.output_capacity)
            .field("depth", &self.depth)
            .finish()
    }
}
