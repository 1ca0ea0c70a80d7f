#![doc = include_str!("../README.md")]

mod config;
mod document;
mod error;
mod expression;
mod fetch;
mod framer;
mod parse;
mod preprocess;
mod recognizer;
mod transform;
mod variables;
mod walk;

use std::sync::Arc;
use std::sync::LazyLock;

use bytes::Bytes;
use http::HeaderMap;
use log::{debug, error};
use regex::Regex;
use tokio::sync::mpsc;
use url::Url;

use crate::framer::Utf8Framer;
use crate::preprocess::EsiCommentFilter;

pub use crate::config::{Configuration, EsiPrefix};
pub use crate::document::{
    Attribute, Document, Element, Node, NodeId, NodeKind, ESI_NAMESPACE,
};
pub use crate::error::{ExecutionError, Result};
pub use crate::expression::{evaluate, evaluate_value, Value};
pub use crate::fetch::{
    FetchFuture, FragmentDispatcher, FragmentRequest, FragmentResponse, IncludeErrorContext,
    IncludeErrorHandler, IncludeResponseContext, IncludeResponseProcessor,
};
pub use crate::parse::{BeforeProcess, ContextOptions, StreamingContext, Streamer};
pub use crate::recognizer::{RawAttribute, RawTag};
pub use crate::transform::EsiTransform;
pub use crate::variables::{substitute, RequestVariables, VariableReference, Variables};
pub use crate::walk::{
    apply_transform, transform_children, walk, Transform, TransformAction, WalkControl,
};

static PREFIX_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z][-A-Za-z0-9]*$").expect("prefix pattern"));

/// A streaming ESI transformer.
///
/// Constructed from the request URL, the request headers, and a
/// [`Configuration`]; produces the write half and the bounded output
/// channel. Bytes written in are parsed incrementally; each completed
/// top-level subtree is transformed and its serialization is sent to the
/// output channel in source order. `write` suspends when the output
/// channel is full, so a slow consumer backpressures the producer.
pub struct EsiStream {
    framer: Utf8Framer,
    context: StreamingContext,
    transform: EsiTransform,
    output: mpsc::Sender<Bytes>,
}

impl std::fmt::Debug for EsiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsiStream").finish_non_exhaustive()
    }
}

impl EsiStream {
    /// Build a stream for a request.
    ///
    /// # Errors
    ///
    /// Fails with [`ExecutionError::InvalidPrefix`] when the configured
    /// ESI prefix is not a valid XML identifier.
    pub fn new(
        url: Url,
        headers: HeaderMap,
        config: Configuration,
    ) -> Result<(Self, mpsc::Receiver<Bytes>)> {
        let prefixes: Vec<(String, String)> = match &config.esi_prefix {
            EsiPrefix::Default => vec![("esi".to_owned(), ESI_NAMESPACE.to_owned())],
            EsiPrefix::Disabled => Vec::new(),
            EsiPrefix::Named(prefix) => {
                if !PREFIX_IDENTIFIER.is_match(prefix) {
                    return Err(ExecutionError::InvalidPrefix(prefix.clone()));
                }
                vec![(prefix.clone(), ESI_NAMESPACE.to_owned())]
            }
        };
        debug!(
            "new ESI stream for `{url}` at depth {} (prefixes: {prefixes:?})",
            config.depth
        );

        let doc = Document::new(prefixes, true);
        let mut filter = EsiCommentFilter::new();
        let context = StreamingContext::new(
            doc,
            ContextOptions {
                ignore_default_tags: true,
                before_process: Some(Box::new(move |streamer: &mut Streamer| {
                    filter.pre_process(streamer);
                })),
            },
        );

        let vars: Arc<dyn Variables> = match &config.vars {
            Some(vars) => Arc::clone(vars),
            None => Arc::new(RequestVariables::from_request(&url, &headers)),
        };

        let (sender, receiver) = mpsc::channel(config.capacity());
        let transform = EsiTransform::new(url, headers, config, vars);

        Ok((
            Self {
                framer: Utf8Framer::new(),
                context,
                transform,
                output: sender,
            },
            receiver,
        ))
    }

    /// Feed a chunk of input bytes. Suspends while the downstream consumer
    /// is slow, and while include sub-requests resolve.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let text = self.framer.decode(chunk)?;
        self.context.append(&text)?;
        self.dispatch_completed().await
    }

    /// Flush remaining input and close the output channel. Partially built
    /// subtrees are emitted as-is.
    pub async fn finish(mut self) -> Result<()> {
        self.framer.finish()?;
        self.context.flush(true)?;
        self.dispatch_completed().await
        // Dropping self closes the channel.
    }

    async fn dispatch_completed(&mut self) -> Result<()> {
        for root in self.context.take_completed() {
            let nodes = match apply_transform(self.context.document_mut(), &mut self.transform, root)
                .await
            {
                Ok(nodes) => nodes,
                Err(e) => {
                    error!("error transforming subtree: {e}");
                    return Err(e);
                }
            };

            let mut out = String::new();
            for &node in &nodes {
                self.context.document().serialize(node, &mut out);
            }
            for node in nodes {
                self.context.document_mut().release_subtree(node);
            }

            if !out.is_empty() {
                self.output
                    .send(Bytes::from(out))
                    .await
                    .map_err(|_| ExecutionError::StreamClosed)?;
            }
        }
        Ok(())
    }
}

/// Run a whole template through an ESI stream and collect the output into
/// a string, driving the producer and consumer halves concurrently.
///
/// This is the default handling of fetched include fragments, and a
/// convenient entry point when the input is already buffered.
pub async fn transform_string(
    url: Url,
    headers: HeaderMap,
    config: Configuration,
    input: impl Into<Bytes>,
) -> Result<String> {
    let input = input.into();
    let (mut stream, mut receiver) = EsiStream::new(url, headers, config)?;

    let producer = async move {
        stream.write(&input).await?;
        stream.finish().await
    };
    let consumer = async move {
        let mut collected = Vec::new();
        while let Some(chunk) = receiver.recv().await {
            collected.extend_from_slice(&chunk);
        }
        collected
    };

    let (produced, collected) = futures::join!(producer, consumer);
    produced?;
    Ok(String::from_utf8(collected)?)
}
