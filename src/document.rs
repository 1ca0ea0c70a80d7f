//! In-memory element tree.
//!
//! All nodes live in an arena owned by the [`Document`]; parent links are
//! plain back-references, never owning, so the tree cannot leak through
//! reference cycles. Consumed subtrees return their slots to a free list,
//! which keeps a long-running stream from growing memory with document
//! length.

use std::collections::HashMap;

use crate::error::{ExecutionError, Result};
use crate::recognizer::{encode_entities, RawTag};

/// The ESI namespace URI that directive elements must resolve to.
pub const ESI_NAMESPACE: &str = "http://www.edge-delivery.org/esi/1.0";

/// Local names reserved for the transform machinery.
const RESERVED_NAMES: [&str; 2] = ["_root", "_replace"];

/// A typed index into the document's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// An attribute with its namespace resolved after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub local_prefix: Option<String>,
    pub local_name: String,
    /// Resolved namespace URI; empty for unprefixed attributes.
    pub namespace: String,
    pub value: String,
}

impl Attribute {
    pub fn fullname(&self) -> String {
        match &self.local_prefix {
            Some(p) => format!("{p}:{}", self.local_name),
            None => self.local_name.clone(),
        }
    }
}

/// An element node. Children are ids into the owning document's arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub local_name: String,
    pub local_prefix: Option<String>,
    /// Resolved namespace URI; empty for default-namespace tags.
    pub namespace: String,
    pub attributes: Vec<Attribute>,
    /// Namespace declarations made on this element (`xmlns`, `xmlns:p`).
    /// The default declaration uses the empty string as its prefix.
    pub namespace_defs: Vec<(String, String)>,
    pub children: Vec<NodeId>,
}

impl Element {
    pub fn fullname(&self) -> String {
        match &self.local_prefix {
            Some(p) => format!("{p}:{}", self.local_name),
            None => self.local_name.clone(),
        }
    }

    /// Look up an attribute value by resolved namespace and local name.
    pub fn attribute(&self, namespace: &str, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace == namespace && a.local_name == local)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
}

/// Owner of the node arena and the prefix table.
///
/// The prefix table and `allow_unknown_prefixes` are fixed at construction;
/// only the arena changes as the stream parses and transforms.
#[derive(Debug)]
pub struct Document {
    prefixes: HashMap<String, String>,
    allow_unknown_prefixes: bool,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Document {
    pub fn new<I, S>(prefixes: I, allow_unknown_prefixes: bool) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|(p, ns)| (p.into(), ns.into()))
                .collect(),
            allow_unknown_prefixes,
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id.index()] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    /// Create an element from a scanned tag. Namespace declarations are
    /// split out of the attribute list; namespaces stay unresolved until
    /// [`Document::resolve_namespaces`] runs.
    pub fn create_element(&mut self, tag: RawTag) -> Result<NodeId> {
        let (local_prefix, local_name) = match tag.fullname.split_once(':') {
            Some((p, n)) => (Some(p.to_owned()), n.to_owned()),
            None => (None, tag.fullname.clone()),
        };
        if RESERVED_NAMES.contains(&local_name.as_str()) {
            return Err(ExecutionError::ReservedElementName(local_name));
        }

        let mut attributes = Vec::new();
        let mut namespace_defs = Vec::new();
        for attr in tag.attributes {
            match (&attr.prefix, attr.local.as_str()) {
                (Some(p), local) if p == "xmlns" => {
                    namespace_defs.push((local.to_owned(), attr.value));
                }
                (None, "xmlns") => {
                    namespace_defs.push((String::new(), attr.value));
                }
                _ => attributes.push(Attribute {
                    local_prefix: attr.prefix,
                    local_name: attr.local,
                    namespace: String::new(),
                    value: attr.value,
                }),
            }
        }

        Ok(self.alloc(Node {
            kind: NodeKind::Element(Element {
                local_name,
                local_prefix,
                namespace: String::new(),
                attributes,
                namespace_defs,
                children: Vec::new(),
            }),
            parent: None,
        }))
    }

    pub fn create_text(&mut self, content: impl Into<String>) -> NodeId {
        self.alloc(Node {
            kind: NodeKind::Text(content.into()),
            parent: None,
        })
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.index()].as_ref().expect("live node id")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.index()].as_mut().expect("live node id")
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.node(id).kind {
            NodeKind::Element(el) => Some(el),
            NodeKind::Text(_) => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.node_mut(id).kind {
            NodeKind::Element(el) => Some(el),
            NodeKind::Text(_) => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Text(t) => Some(t),
            NodeKind::Element(_) => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        self.node_mut(id).parent = parent;
    }

    /// Children of `id`; empty for text nodes.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).kind {
            NodeKind::Element(el) => &el.children,
            NodeKind::Text(_) => &[],
        }
    }

    /// Append `child` to `parent`, maintaining the back-reference.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.set_parent(child, Some(parent));
        if let Some(el) = self.element_mut(parent) {
            el.children.push(child);
        }
    }

    /// Resolve namespaces for the subtree rooted at `id`.
    ///
    /// Resolution walks element, then ancestors, then the document prefix
    /// table. An unknown prefix is an error unless the document allows
    /// unknown prefixes, in which case the namespace stays empty.
    pub fn resolve_namespaces(&mut self, id: NodeId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.element(current).is_none() {
                continue;
            }
            let prefix = self.element(current).and_then(|el| el.local_prefix.clone());
            let namespace = self.lookup_namespace(current, prefix.as_deref())?;

            let attr_prefixes: Vec<Option<String>> = self
                .element(current)
                .map(|el| el.attributes.iter().map(|a| a.local_prefix.clone()).collect())
                .unwrap_or_default();
            let mut attr_namespaces = Vec::with_capacity(attr_prefixes.len());
            for p in &attr_prefixes {
                // Unprefixed attributes never take the default namespace.
                let ns = match p {
                    Some(p) => self.lookup_namespace(current, Some(p))?,
                    None => String::new(),
                };
                attr_namespaces.push(ns);
            }

            if let Some(el) = self.element_mut(current) {
                el.namespace = namespace;
                for (attr, ns) in el.attributes.iter_mut().zip(attr_namespaces) {
                    attr.namespace = ns;
                }
                stack.extend(el.children.iter().copied());
            }
        }
        Ok(())
    }

    fn lookup_namespace(&self, from: NodeId, prefix: Option<&str>) -> Result<String> {
        let key = prefix.unwrap_or("");
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if let Some(el) = self.element(id) {
                if let Some((_, ns)) = el.namespace_defs.iter().find(|(p, _)| p == key) {
                    return Ok(ns.clone());
                }
            }
            cursor = self.parent(id);
        }
        if let Some(ns) = self.prefixes.get(key) {
            return Ok(ns.clone());
        }
        match prefix {
            // Default-namespace tags with no declaration in scope resolve
            // to the empty namespace.
            None => Ok(String::new()),
            Some(p) if self.allow_unknown_prefixes => {
                log::debug!("unknown namespace prefix `{p}`, resolving to empty namespace");
                Ok(String::new())
            }
            Some(p) => Err(ExecutionError::UnknownNamespacePrefix(p.to_owned())),
        }
    }

    /// Serialize the subtree rooted at `id`, appending to `out`.
    ///
    /// Text nodes are emitted verbatim; attribute values are entity-encoded.
    pub fn serialize(&self, id: NodeId, out: &mut String) {
        match &self.node(id).kind {
            NodeKind::Text(t) => out.push_str(t),
            NodeKind::Element(el) => {
                out.push('<');
                out.push_str(&el.fullname());
                for attr in &el.attributes {
                    out.push(' ');
                    out.push_str(&attr.fullname());
                    out.push_str("=\"");
                    out.push_str(&encode_entities(&attr.value));
                    out.push('"');
                }
                for (prefix, ns) in &el.namespace_defs {
                    if prefix.is_empty() {
                        out.push_str(" xmlns=\"");
                    } else {
                        out.push_str(" xmlns:");
                        out.push_str(prefix);
                        out.push_str("=\"");
                    }
                    out.push_str(&encode_entities(ns));
                    out.push('"');
                }
                if el.children.is_empty() {
                    out.push_str(" />");
                } else {
                    out.push('>');
                    for child in &el.children {
                        self.serialize(*child, out);
                    }
                    out.push_str("</");
                    out.push_str(&el.fullname());
                    out.push('>');
                }
            }
        }
    }

    /// Return the slot of `id` to the free list, without touching children.
    pub fn release_node(&mut self, id: NodeId) {
        if self.nodes[id.index()].take().is_some() {
            self.free.push(id);
        }
    }

    /// Return the slots of the whole subtree rooted at `id`.
    pub fn release_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes[current.index()].take() {
                if let NodeKind::Element(el) = node.kind {
                    stack.extend(el.children);
                }
                self.free.push(current);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}
