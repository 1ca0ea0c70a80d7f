//! The ESI directive engine.
//!
//! Runs as a transform pass over completed top-level subtrees. Elements in
//! the ESI namespace are dispatched by local name; everything else passes
//! through, with `$(…)` substitution applied to text and attribute values
//! inside `apply_vars` subtrees (`esi:vars`, `esi:try`, `esi:choose`).

use std::sync::Arc;

use futures::future::BoxFuture;
use http::header::{self, HeaderValue};
use http::HeaderMap;
use log::{debug, warn};
use url::Url;

use crate::config::Configuration;
use crate::document::{Document, NodeId, NodeKind, ESI_NAMESPACE};
use crate::error::{ExecutionError, Result};
use crate::fetch::{FragmentRequest, IncludeErrorContext, IncludeResponseContext};
use crate::variables::{substitute, Variables};
use crate::walk::{transform_children, Transform, TransformAction};

pub struct EsiTransform {
    base_url: Url,
    base_headers: HeaderMap,
    config: Configuration,
    vars: Arc<dyn Variables>,
    apply_vars: bool,
}

impl EsiTransform {
    pub fn new(
        base_url: Url,
        base_headers: HeaderMap,
        config: Configuration,
        vars: Arc<dyn Variables>,
    ) -> Self {
        Self {
            base_url,
            base_headers,
            config,
            vars,
            apply_vars: false,
        }
    }

    fn structure_error(&self, tag: String, message: impl Into<String>) -> ExecutionError {
        ExecutionError::StructureError {
            tag,
            message: message.into(),
        }
    }

    async fn handle_element(
        &mut self,
        doc: &mut Document,
        node: NodeId,
    ) -> Result<TransformAction> {
        let (namespace, local, fullname) = {
            let el = match doc.element(node) {
                Some(el) => el,
                None => return Ok(TransformAction::Unchanged),
            };
            (el.namespace.clone(), el.local_name.clone(), el.fullname())
        };

        if namespace != ESI_NAMESPACE {
            if self.apply_vars {
                self.substitute_attributes(doc, node);
            }
            return Ok(TransformAction::Unchanged);
        }

        match local.as_str() {
            "comment" | "remove" => Ok(TransformAction::Remove),
            "include" => self.handle_include(doc, node).await,
            "vars" => self.handle_vars(doc, node).await,
            "try" => self.handle_try(doc, node).await,
            "choose" => self.handle_choose(doc, node).await,
            "attempt" | "except" => Err(self.structure_error(
                fullname,
                "must be a direct child of an esi:try block",
            )),
            "when" | "otherwise" => Err(self.structure_error(
                fullname,
                "must be a direct child of an esi:choose block",
            )),
            other => Err(self.structure_error(
                fullname.clone(),
                format!("Unknown esi tag esi:{other}"),
            )),
        }
    }

    fn substitute_attributes(&self, doc: &mut Document, node: NodeId) {
        let vars = self.vars.clone();
        if let Some(el) = doc.element_mut(node) {
            for attr in &mut el.attributes {
                if attr.value.contains('$') {
                    attr.value = substitute(&attr.value, vars.as_ref());
                }
            }
        }
    }

    async fn handle_include(
        &mut self,
        doc: &mut Document,
        node: NodeId,
    ) -> Result<TransformAction> {
        let element = match doc.element(node) {
            Some(el) => el.clone(),
            None => return Ok(TransformAction::Unchanged),
        };
        let Some(src) = element.attribute("", "src") else {
            return Err(ExecutionError::MissingRequiredParameter(
                element.fullname(),
                "src".to_owned(),
            ));
        };

        let src = substitute(src, self.vars.as_ref());
        let mut candidates = vec![src.clone()];
        if let Some(alt) = element.attribute("", "alt") {
            candidates.push(substitute(alt, self.vars.as_ref()));
        }

        let mut last_attempted = src.clone();
        for candidate in &candidates {
            let target = match self.resolve_candidate(candidate) {
                Ok(url) => url,
                Err(e) => {
                    warn!("include candidate `{candidate}` is not a usable URL: {e}");
                    continue;
                }
            };
            last_attempted = target.to_string();

            let mut headers = self.base_headers.clone();
            if target.host_str() != self.base_url.host_str() {
                if let Some(value) = host_header_value(&target) {
                    headers.insert(header::HOST, value);
                }
            }

            let Some(dispatcher) = self.config.fetch.clone() else {
                warn!("no fragment dispatcher configured, include of `{candidate}` fails");
                continue;
            };

            debug!("fetching include fragment `{target}`");
            let request = FragmentRequest::get(target.clone(), headers.clone());
            match dispatcher(request).await {
                Ok(response) if response.is_success() => {
                    let content = match self.config.process_include_response.clone() {
                        Some(processor) => {
                            processor(IncludeResponseContext {
                                url: target,
                                headers,
                                response,
                            })
                            .await?
                        }
                        None => self.recursive_fragment(target, headers, response).await?,
                    };
                    let replacement = doc.create_text(content);
                    return Ok(TransformAction::Replace(replacement));
                }
                Ok(response) => {
                    debug!(
                        "include candidate `{target}` returned status {}",
                        response.status
                    );
                }
                Err(e) => {
                    debug!("include candidate `{target}` failed: {e}");
                }
            }
        }

        if let Some(handler) = &self.config.handle_include_error {
            let context = IncludeErrorContext {
                url: &last_attempted,
                headers: &self.base_headers,
                element: &element,
            };
            if let Some(replacement) = handler(&context) {
                debug!("include error handler produced a replacement string");
                let replacement = doc.create_text(replacement);
                return Ok(TransformAction::Replace(replacement));
            }
        }

        let onerror = element
            .attribute("", "onerror")
            .map(|v| substitute(v, self.vars.as_ref()));
        if onerror.as_deref() == Some("continue") {
            debug!("include of `{src}` failed, continuing per onerror attribute");
            return Ok(TransformAction::Remove);
        }

        Err(ExecutionError::IncludeError { src })
    }

    fn resolve_candidate(&self, candidate: &str) -> Result<Url> {
        // HTML templates carry entity-escaped URLs; unescape unless the
        // stream is configured for non-HTML content.
        let candidate = if self.config.is_escaped() {
            html_escape::decode_html_entities(candidate).into_owned()
        } else {
            candidate.to_owned()
        };
        self.base_url
            .join(&candidate)
            .map_err(|_| ExecutionError::InvalidRequestUrl(candidate))
    }

    // Successful include bodies default to recursive ESI processing: the
    // fragment is piped through a fresh stream with the same options at
    // depth + 1, so nested directives resolve inner-first.
    async fn recursive_fragment(
        &self,
        url: Url,
        headers: HeaderMap,
        response: crate::fetch::FragmentResponse,
    ) -> Result<String> {
        let mut config = self.config.clone();
        config.depth += 1;
        debug!(
            "processing include fragment `{url}` as ESI at depth {}",
            config.depth
        );
        crate::transform_string(url, headers, config, response.into_body()).await
    }

    async fn handle_vars(&mut self, doc: &mut Document, node: NodeId) -> Result<TransformAction> {
        let saved = self.apply_vars;
        self.apply_vars = true;
        let result = transform_children(doc, self, node).await;
        self.apply_vars = saved;
        result?;
        Ok(TransformAction::Splice(doc.children(node).to_vec()))
    }

    async fn handle_try(&mut self, doc: &mut Document, node: NodeId) -> Result<TransformAction> {
        let fullname = doc.element(node).map(|el| el.fullname()).unwrap_or_default();

        let mut attempt = None;
        let mut except = None;
        let mut stray = Vec::new();
        for &child in doc.children(node) {
            match doc.element(child) {
                Some(el) if el.namespace == ESI_NAMESPACE && el.local_name == "attempt" => {
                    if attempt.replace(child).is_some() {
                        return Err(
                            self.structure_error(fullname.clone(), "more than one attempt branch")
                        );
                    }
                }
                Some(el) if el.namespace == ESI_NAMESPACE && el.local_name == "except" => {
                    if except.replace(child).is_some() {
                        return Err(
                            self.structure_error(fullname.clone(), "more than one except branch")
                        );
                    }
                }
                _ => stray.push(child),
            }
        }
        let (Some(attempt), Some(except)) = (attempt, except) else {
            return Err(self.structure_error(
                fullname,
                "must contain exactly one attempt and one except branch",
            ));
        };

        // Content between the branches is dropped.
        for child in stray {
            doc.release_subtree(child);
        }

        let saved = self.apply_vars;
        self.apply_vars = true;
        let attempted = transform_children(doc, self, attempt).await;
        let action = match attempted {
            Ok(()) => {
                doc.release_subtree(except);
                let children = doc.children(attempt).to_vec();
                doc.release_node(attempt);
                Ok(TransformAction::Splice(children))
            }
            Err(ExecutionError::IncludeError { src }) => {
                debug!("attempt branch failed including `{src}`, taking except branch");
                match transform_children(doc, self, except).await {
                    Ok(()) => {
                        doc.release_subtree(attempt);
                        let children = doc.children(except).to_vec();
                        doc.release_node(except);
                        Ok(TransformAction::Splice(children))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        self.apply_vars = saved;
        action
    }

    async fn handle_choose(
        &mut self,
        doc: &mut Document,
        node: NodeId,
    ) -> Result<TransformAction> {
        let fullname = doc.element(node).map(|el| el.fullname()).unwrap_or_default();

        let mut whens = Vec::new();
        let mut otherwise = None;
        let mut stray = Vec::new();
        for &child in doc.children(node) {
            match doc.element(child) {
                Some(el) if el.namespace == ESI_NAMESPACE && el.local_name == "when" => {
                    whens.push(child);
                }
                Some(el) if el.namespace == ESI_NAMESPACE && el.local_name == "otherwise" => {
                    if otherwise.replace(child).is_some() {
                        return Err(
                            self.structure_error(fullname.clone(), "more than one otherwise branch")
                        );
                    }
                }
                _ => stray.push(child),
            }
        }
        if whens.is_empty() {
            return Err(self.structure_error(fullname, "requires at least one when branch"));
        }

        let mut tests = Vec::with_capacity(whens.len());
        for &when in &whens {
            let el = doc.element(when);
            let test = el.and_then(|el| el.attribute("", "test"));
            match test {
                Some(test) => tests.push(test.to_owned()),
                None => {
                    let name = el.map(|el| el.fullname()).unwrap_or_default();
                    return Err(ExecutionError::MissingRequiredParameter(
                        name,
                        "test".to_owned(),
                    ));
                }
            }
        }

        for child in stray {
            doc.release_subtree(child);
        }

        let selected = whens
            .iter()
            .zip(&tests)
            .find(|(_, test)| crate::expression::evaluate(test, self.vars.as_ref()))
            .map(|(&when, _)| when);

        let Some(branch) = selected.or(otherwise) else {
            // No winning branch and no otherwise: the walker reclaims the
            // whole subtree.
            return Ok(TransformAction::Remove);
        };

        let saved = self.apply_vars;
        self.apply_vars = true;
        let transformed = transform_children(doc, self, branch).await;
        self.apply_vars = saved;

        match transformed {
            Ok(()) => {
                for &when in &whens {
                    if when != branch {
                        doc.release_subtree(when);
                    }
                }
                if let Some(other) = otherwise {
                    if other != branch {
                        doc.release_subtree(other);
                    }
                }
                let children = doc.children(branch).to_vec();
                doc.release_node(branch);
                Ok(TransformAction::Splice(children))
            }
            Err(e) => Err(e),
        }
    }
}

impl Transform for EsiTransform {
    fn transform<'a>(
        &'a mut self,
        doc: &'a mut Document,
        node: NodeId,
    ) -> BoxFuture<'a, Result<TransformAction>> {
        Box::pin(async move {
            if let NodeKind::Text(text) = &doc.node(node).kind {
                if self.apply_vars && text.contains('$') {
                    let replaced = substitute(text, self.vars.as_ref());
                    if replaced != *text {
                        let replacement = doc.create_text(replaced);
                        return Ok(TransformAction::Replace(replacement));
                    }
                }
                return Ok(TransformAction::Unchanged);
            }
            self.handle_element(doc, node).await
        })
    }
}

fn host_header_value(url: &Url) -> Option<HeaderValue> {
    let host = url.host_str()?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    HeaderValue::from_str(&value).ok()
}
