//! Streaming parse context.
//!
//! Owns the pending character buffer and the open-element stack, drives
//! the recognizer over appended chunks, and builds top-level subtrees in
//! the document. A subtree is complete once its top-level element closes;
//! completed subtrees are drained with [`StreamingContext::take_completed`]
//! and handed to the transformer while the rest of the input is still
//! arriving.

use log::debug;

use crate::document::{Document, NodeId, NodeKind};
use crate::error::{ExecutionError, Result};
use crate::recognizer::{recognize, Recognized};

/// Buffer state carried between appends.
///
/// `postponed_text` is a tail carved off the buffer because it could be
/// the start of a marker the scanner cannot classify yet; it is re-applied
/// ahead of the next appended chunk.
#[derive(Debug, Default)]
pub struct Streamer {
    pub buffered_text: String,
    pub postponed_text: String,
}

/// Hook invoked on the streamer state before each recognizer step. Used to
/// strip `<!--esi` / `-->` markers out of the buffer.
pub type BeforeProcess = dyn FnMut(&mut Streamer) + Send;

pub struct ContextOptions {
    /// Treat unprefixed tags as plain text.
    pub ignore_default_tags: bool,
    pub before_process: Option<Box<BeforeProcess>>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            ignore_default_tags: true,
            before_process: None,
        }
    }
}

pub struct StreamingContext {
    doc: Document,
    options: ContextOptions,
    children: Vec<NodeId>,
    open_elements: Vec<NodeId>,
    streamer: Streamer,
}

impl StreamingContext {
    pub fn new(doc: Document, options: ContextOptions) -> Self {
        Self {
            doc,
            options,
            children: Vec::new(),
            open_elements: Vec::new(),
            streamer: Streamer::default(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    /// Append a chunk of text and process as much of the buffer as can be
    /// classified. Postponed text is re-applied first.
    pub fn append(&mut self, text: &str) -> Result<()> {
        let postponed = std::mem::take(&mut self.streamer.postponed_text);
        self.streamer.buffered_text.push_str(&postponed);
        self.streamer.buffered_text.push_str(text);
        self.process()
    }

    fn process(&mut self) -> Result<()> {
        loop {
            if let Some(hook) = self.options.before_process.as_mut() {
                hook(&mut self.streamer);
            }
            let (event, consumed) = recognize(
                &self.streamer.buffered_text,
                self.options.ignore_default_tags,
            );
            if consumed > 0 {
                self.streamer.buffered_text.drain(..consumed);
            }
            match event {
                Recognized::Incomplete => break,
                Recognized::Text(content) => self.push_text(content),
                Recognized::ElementOpen(tag) => {
                    let id = self.doc.create_element(tag)?;
                    self.attach(id);
                    self.open_elements.push(id);
                }
                Recognized::ElementSelfClose(tag) => {
                    let id = self.doc.create_element(tag)?;
                    self.attach(id);
                }
                Recognized::ElementClose(fullname) => self.close_element(fullname)?,
            }
        }

        let roots: Vec<NodeId> = self.children.clone();
        for id in roots {
            self.doc.resolve_namespaces(id)?;
        }
        Ok(())
    }

    fn push_text(&mut self, content: String) {
        if content.is_empty() {
            return;
        }
        // Merge with a preceding text node at the insertion point.
        let siblings = match self.open_elements.last() {
            Some(&top) => self.doc.children(top),
            None => &self.children,
        };
        if let Some(&last) = siblings.last() {
            if let NodeKind::Text(existing) = &mut self.doc.node_mut(last).kind {
                existing.push_str(&content);
                return;
            }
        }
        let id = self.doc.create_text(content);
        self.attach(id);
    }

    fn attach(&mut self, id: NodeId) {
        match self.open_elements.last() {
            Some(&top) => self.doc.append_child(top, id),
            None => {
                self.doc.set_parent(id, None);
                self.children.push(id);
            }
        }
    }

    fn close_element(&mut self, fullname: String) -> Result<()> {
        let Some(&top) = self.open_elements.last() else {
            return Err(ExecutionError::UnexpectedClosingTag(fullname));
        };
        let expected = self
            .doc
            .element(top)
            .map(|el| el.fullname())
            .unwrap_or_default();
        if expected != fullname {
            return Err(ExecutionError::MismatchedClosingTag {
                expected,
                found: fullname,
            });
        }
        self.open_elements.pop();
        Ok(())
    }

    /// Turn any remaining buffered text into a trailing text node. With
    /// `force`, partially built subtrees are closed as-is.
    pub fn flush(&mut self, force: bool) -> Result<()> {
        let mut leftover = std::mem::take(&mut self.streamer.buffered_text);
        leftover.push_str(&std::mem::take(&mut self.streamer.postponed_text));
        if !leftover.is_empty() {
            debug!("flushing {} unclassified characters as text", leftover.len());
            self.push_text(leftover);
        }
        if force {
            self.open_elements.clear();
        }
        let roots: Vec<NodeId> = self.children.clone();
        for id in roots {
            self.doc.resolve_namespaces(id)?;
        }
        Ok(())
    }

    /// Drain the top-level children whose subtrees are fully closed.
    pub fn take_completed(&mut self) -> Vec<NodeId> {
        // While an element is open, the last top-level child is its
        // (still growing) subtree root.
        let keep = usize::from(!self.open_elements.is_empty());
        let complete = self.children.len().saturating_sub(keep);
        self.children.drain(..complete).collect()
    }

    #[cfg(test)]
    pub(crate) fn open_depth(&self) -> usize {
        self.open_elements.len()
    }
}
