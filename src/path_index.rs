use std::collections::HashMap;

use thiserror::Error;

/// Lookup failures; callers translate both variants to HTTP 404.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("no match for {0}")]
    NoMatch(String),

    #[error("no {method} {path} in index")]
    MethodNotFound { method: String, path: String },
}

/// Maps HTTP method/path pairs to the OAuth2 scopes required to access them.
///
/// The index is a tree keyed by path segments. It is built once from an
/// OpenAPI document and never mutated afterwards; a new document produces a
/// whole new index.
#[derive(Debug, Default)]
pub struct PathIndex {
    root: Node,
}

#[derive(Debug, Default)]
struct Node {
    /// Segment name; for example path /api has a node named "api".
    name: String,
    /// Whether this node represents a path parameter (`{name}` segments).
    param: bool,
    /// Child nodes in insertion order.
    children: Vec<Node>,
    /// HTTP methods available at this path with their required scopes.
    methods: HashMap<String, Vec<String>>,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method/path with its required scopes.
    pub fn add_method_path_scopes(&mut self, method: &str, path: &str, scopes: Vec<String>) {
        let node = self.add_path(path);
        node.methods.insert(method.to_string(), scopes);
    }

    fn add_path(&mut self, path: &str) -> &mut Node {
        let mut node = &mut self.root;
        for segment in split(path) {
            let param = segment.starts_with('{');
            // A parameter child is reused regardless of its placeholder name,
            // so at most one exists per level.
            let pos = node
                .children
                .iter()
                .position(|c| (c.param && param) || c.name == segment);
            let pos = match pos {
                Some(pos) => pos,
                None => {
                    node.children.push(Node {
                        name: segment.to_string(),
                        param,
                        ..Node::default()
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[pos];
        }
        node
    }

    /// Return the scopes required for a method/path.
    pub fn find_scopes(&self, method: &str, path: &str) -> Result<&[String], IndexError> {
        let node = self.find(path)?;
        node.methods
            .get(method)
            .map(Vec::as_slice)
            .ok_or_else(|| IndexError::MethodNotFound {
                method: method.to_string(),
                path: path.to_string(),
            })
    }

    /// Return the HTTP methods available for a path.
    pub fn find_methods(&self, path: &str) -> Result<Vec<String>, IndexError> {
        let node = self.find(path)?;
        Ok(node.methods.keys().cloned().collect())
    }

    fn find(&self, path: &str) -> Result<&Node, IndexError> {
        let mut node = &self.root;
        for segment in split(path) {
            node = match_child(&node.children, segment)
                .ok_or_else(|| IndexError::NoMatch(segment.to_string()))?;
        }
        Ok(node)
    }
}

/// Find the child with a matching name, or else a parameter child.
fn match_child<'a>(children: &'a [Node], segment: &str) -> Option<&'a Node> {
    let mut param = None;
    for child in children {
        if child.name == segment {
            return Some(child);
        }
        if child.param {
            param = Some(child);
        }
    }
    param
}

/// Split an HTTP path on `/`, dropping one optional leading empty segment.
/// Splitting is purely textual: no percent-decoding, no `//` collapsing, and
/// a trailing `/` yields an empty terminal segment.
fn split(path: &str) -> std::str::Split<'_, char> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}
