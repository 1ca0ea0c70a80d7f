//! Tree traversal and the transform pass.
//!
//! [`walk`] is the generic depth-first traversal used for read-only passes.
//! [`apply_transform`] drives a mutating, asynchronous pass: the transform
//! callback can suspend (fragment fetches happen mid-tree) and replace any
//! node with nothing, one node, or many.

use std::collections::HashSet;

use futures::future::BoxFuture;

use crate::document::{Document, NodeId};
use crate::error::{ExecutionError, Result};

/// Pre-order control flow for [`walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Halt the entire traversal.
    Stop,
    /// Skip this node's subtree but continue with its siblings.
    StopRecursion,
}

/// Depth-first traversal with pre- and post-order callbacks.
///
/// `before` runs pre-order and steers the traversal. `after` runs
/// post-order and may yield a per-node result; the results of a node's
/// children are passed to its own `after` call. Cycles in the tree are
/// detected and rejected.
pub fn walk<B, A, R>(
    doc: &Document,
    root: NodeId,
    before: &mut B,
    after: &mut A,
) -> Result<Option<R>>
where
    B: FnMut(&Document, NodeId) -> Result<WalkControl>,
    A: FnMut(&Document, NodeId, Vec<R>) -> Result<Option<R>>,
{
    let mut visited = HashSet::new();
    walk_inner(doc, root, before, after, &mut visited).map(|(_, result)| result)
}

fn walk_inner<B, A, R>(
    doc: &Document,
    id: NodeId,
    before: &mut B,
    after: &mut A,
    visited: &mut HashSet<NodeId>,
) -> Result<(bool, Option<R>)>
where
    B: FnMut(&Document, NodeId) -> Result<WalkControl>,
    A: FnMut(&Document, NodeId, Vec<R>) -> Result<Option<R>>,
{
    if !visited.insert(id) {
        return Err(ExecutionError::CyclicTree);
    }

    let control = before(doc, id)?;
    if control == WalkControl::Stop {
        return Ok((true, None));
    }

    let mut results = Vec::new();
    if control == WalkControl::Continue {
        for child in doc.children(id).to_vec() {
            let (stopped, result) = walk_inner(doc, child, before, after, visited)?;
            if let Some(r) = result {
                results.push(r);
            }
            if stopped {
                return Ok((true, None));
            }
        }
    }

    Ok((false, after(doc, id, results)?))
}

/// What a transform callback wants done with the node it was handed.
#[derive(Debug)]
pub enum TransformAction {
    /// Leave the node alone and descend into its children.
    Unchanged,
    /// Drop the node and its subtree.
    Remove,
    /// Replace the node with the given node. The replacement must not
    /// come from within the replaced subtree; use
    /// [`TransformAction::Splice`] for that.
    Replace(NodeId),
    /// Replace the node with a list of nodes, spliced into the parent at
    /// the node's position. The nodes may come from the replaced node's
    /// own subtree.
    Splice(Vec<NodeId>),
}

/// A mutating, suspendable tree pass.
///
/// Returning anything other than [`TransformAction::Unchanged`] prevents
/// descent into the node's children; replacement nodes are emitted as-is.
pub trait Transform: Send {
    fn transform<'a>(
        &'a mut self,
        doc: &'a mut Document,
        node: NodeId,
    ) -> BoxFuture<'a, Result<TransformAction>>;
}

/// Transform the subtree rooted at `root` and return the list of nodes
/// that replaces it at its position.
pub async fn apply_transform<T: Transform>(
    doc: &mut Document,
    transform: &mut T,
    root: NodeId,
) -> Result<Vec<NodeId>> {
    let mut visited = HashSet::new();
    visited.insert(root);

    match transform.transform(doc, root).await? {
        TransformAction::Unchanged => {
            if doc.element(root).is_some() {
                descend(doc, transform, root, &mut visited).await?;
            }
            Ok(vec![root])
        }
        TransformAction::Remove => {
            doc.release_subtree(root);
            Ok(Vec::new())
        }
        TransformAction::Replace(node) => {
            doc.release_subtree(root);
            doc.set_parent(node, None);
            Ok(vec![node])
        }
        TransformAction::Splice(nodes) => {
            for &node in &nodes {
                doc.set_parent(node, None);
            }
            doc.release_node(root);
            Ok(nodes)
        }
    }
}

/// Transform the children of `parent` in place. Used by directive handlers
/// that need their subtree processed before splicing it into the output.
pub fn transform_children<'a, T: Transform>(
    doc: &'a mut Document,
    transform: &'a mut T,
    parent: NodeId,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut visited = HashSet::new();
        visited.insert(parent);
        descend(doc, transform, parent, &mut visited).await
    })
}

fn descend<'a, T: Transform>(
    doc: &'a mut Document,
    transform: &'a mut T,
    parent: NodeId,
    visited: &'a mut HashSet<NodeId>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut index = 0;
        loop {
            let child = match doc.element(parent) {
                Some(el) if index < el.children.len() => el.children[index],
                _ => break,
            };
            if !visited.insert(child) {
                return Err(ExecutionError::CyclicTree);
            }

            match transform.transform(doc, child).await? {
                TransformAction::Unchanged => {
                    if doc.element(child).is_some() {
                        descend(doc, transform, child, visited).await?;
                    }
                    index += 1;
                }
                TransformAction::Remove => {
                    if let Some(el) = doc.element_mut(parent) {
                        el.children.remove(index);
                    }
                    doc.release_subtree(child);
                }
                TransformAction::Replace(node) => {
                    if let Some(el) = doc.element_mut(parent) {
                        el.children[index] = node;
                    }
                    doc.set_parent(node, Some(parent));
                    doc.release_subtree(child);
                    index += 1;
                }
                TransformAction::Splice(nodes) => {
                    for &node in &nodes {
                        doc.set_parent(node, Some(parent));
                    }
                    let count = nodes.len();
                    if let Some(el) = doc.element_mut(parent) {
                        el.children.splice(index..=index, nodes);
                    }
                    doc.release_node(child);
                    index += count;
                }
            }
        }
        Ok(())
    })
}
