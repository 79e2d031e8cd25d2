use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::path_index::PathIndex;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("parsing OpenAPI document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("openapi definition doesn't contain paths")]
    NoPaths,
}

/// The subset of a Swagger 2.0 document the gateway consumes: paths, their
/// operations, and each operation's security requirements. Everything else is
/// ignored.
#[derive(Debug, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub swagger: String,
    #[serde(default)]
    pub paths: Option<HashMap<String, PathItem>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathItem {
    pub get: Option<Operation>,
    pub put: Option<Operation>,
    pub post: Option<Operation>,
    pub delete: Option<Operation>,
    pub options: Option<Operation>,
    pub head: Option<Operation>,
    pub patch: Option<Operation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Operation {
    /// Security requirements; the first entry's `oauth2` key carries the
    /// scope list.
    pub security: Vec<HashMap<String, Vec<String>>>,
}

impl Operation {
    fn oauth2_scopes(&self) -> &[String] {
        self.security
            .first()
            .and_then(|requirement| requirement.get("oauth2"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Visit every operation in the document, yielding (path, method, scopes).
pub fn for_each_oauth2_scope<F>(doc: &Document, mut f: F)
where
    F: FnMut(&str, &str, &[String]),
{
    let Some(paths) = &doc.paths else { return };
    for (path, item) in paths {
        let operations = [
            ("GET", &item.get),
            ("PUT", &item.put),
            ("POST", &item.post),
            ("DELETE", &item.delete),
            ("OPTIONS", &item.options),
            ("HEAD", &item.head),
            ("PATCH", &item.patch),
        ];
        for (method, operation) in operations {
            if let Some(operation) = operation {
                f(path, method, operation.oauth2_scopes());
            }
        }
    }
}

/// Parse a raw Swagger 2.0 document and build a [`PathIndex`] from it.
/// A document without paths is rejected.
pub fn build_index(raw: &[u8]) -> Result<PathIndex, SpecError> {
    let doc: Document = serde_json::from_slice(raw)?;
    match &doc.paths {
        Some(paths) if !paths.is_empty() => {}
        _ => return Err(SpecError::NoPaths),
    }

    let mut index = PathIndex::new();
    for_each_oauth2_scope(&doc, |path, method, scopes| {
        // Swagger documents may carry empty scope strings, remove them.
        let scopes = scopes
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        index.add_method_path_scopes(method, path, scopes);
    });
    Ok(index)
}
