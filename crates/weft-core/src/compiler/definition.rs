//! Definition tree with structural path addressing.
//!
//! The compiler never re-parses text. It walks a `serde_json::Value` tree in
//! which every object is stamped with a stable `__uuid`. Dependencies carry
//! that uuid next to their path, so a path invalidated by a definition
//! rewrite can always be re-derived with [`DefinitionTree::find_uuid`].

use std::fmt;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::CompilationError;

/// Field holding the setup id stamped on every definition object.
pub const UUID_FIELD: &str = "__uuid";

// ---------------------------------------------------------------------------
// DefinitionPath
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Structural address of a value inside the definition tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DefinitionPath(Vec<PathSegment>);

impl DefinitionPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.into()));
        Self(segments)
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// The closest key segment: the field name the addressed value sits
    /// under (`stages[0].stage` -> `stage`).
    pub fn field_name(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|s| match s {
            PathSegment::Key(k) => Some(k.as_str()),
            PathSegment::Index(_) => None,
        })
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DefinitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("$");
        }
        let mut first = true;
        for segment in &self.0 {
            match segment {
                PathSegment::Key(k) => {
                    if !first {
                        f.write_str(".")?;
                    }
                    f.write_str(k)?;
                }
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DefinitionTree
// ---------------------------------------------------------------------------

/// The uuid-stamped definition being compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionTree {
    root: Value,
}

impl DefinitionTree {
    /// Wrap `definition`, stamping a `__uuid` on every object lacking one.
    pub fn new(mut definition: Value) -> Self {
        stamp_uuids(&mut definition);
        Self { root: definition }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn resolve(&self, path: &DefinitionPath) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.segments() {
            current = match segment {
                PathSegment::Key(k) => current.get(k)?,
                PathSegment::Index(i) => current.get(*i)?,
            };
        }
        Some(current)
    }

    /// Replace the value at `path`. The parent must exist; a missing final
    /// key is inserted. New objects are stamped.
    pub fn set(&mut self, path: &DefinitionPath, mut value: Value) -> Result<(), CompilationError> {
        let Some((last, parents)) = path.segments().split_last() else {
            stamp_uuids(&mut value);
            self.root = value;
            return Ok(());
        };

        let mut current = &mut self.root;
        for segment in parents {
            current = match segment {
                PathSegment::Key(k) => current.get_mut(k.as_str()),
                PathSegment::Index(i) => current.get_mut(*i),
            }
            .ok_or_else(|| CompilationError::InvalidDefinition(format!("no value at {path}")))?;
        }

        stamp_uuids(&mut value);
        match (last, current) {
            (PathSegment::Key(k), Value::Object(map)) => {
                map.insert(k.clone(), value);
                Ok(())
            }
            (PathSegment::Index(i), Value::Array(items)) if *i < items.len() => {
                items[*i] = value;
                Ok(())
            }
            _ => Err(CompilationError::InvalidDefinition(format!(
                "cannot set {path}: parent has the wrong shape"
            ))),
        }
    }

    /// Path of the object stamped with `uuid`.
    pub fn find_uuid(&self, uuid: &str) -> Option<DefinitionPath> {
        find_in(&self.root, uuid, DefinitionPath::root())
    }
}

fn stamp_uuids(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if !map.get(UUID_FIELD).is_some_and(Value::is_string) {
                map.insert(UUID_FIELD.to_string(), Value::String(Uuid::now_v7().to_string()));
            }
            for (key, child) in map.iter_mut() {
                if key != UUID_FIELD {
                    stamp_uuids(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(stamp_uuids),
        _ => {}
    }
}

fn find_in(value: &Value, uuid: &str, path: DefinitionPath) -> Option<DefinitionPath> {
    match value {
        Value::Object(map) => {
            if map.get(UUID_FIELD).and_then(Value::as_str) == Some(uuid) {
                return Some(path);
            }
            map.iter()
                .filter(|(k, _)| k.as_str() != UUID_FIELD)
                .find_map(|(k, child)| find_in(child, uuid, path.key(k.as_str())))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, child)| find_in(child, uuid, path.index(i))),
        _ => None,
    }
}

/// The `__uuid` of a definition object.
pub fn uuid_of(value: &Value) -> Option<&str> {
    value.get(UUID_FIELD).and_then(Value::as_str)
}

/// Object fields without the stamp.
pub fn without_uuid(map: &Map<String, Value>) -> impl Iterator<Item = (&String, &Value)> {
    map.iter().filter(|(k, _)| k.as_str() != UUID_FIELD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> DefinitionTree {
        DefinitionTree::new(json!({
            "pipeline": {
                "identifier": "p",
                "stages": [
                    { "stage": { "identifier": "build" } },
                    { "stage": { "identifier": "deploy", "__uuid": "fixed" } }
                ]
            }
        }))
    }

    #[test]
    fn stamps_every_object_once() {
        let tree = tree();
        let pipeline = tree.resolve(&DefinitionPath::root().key("pipeline")).unwrap();
        assert!(uuid_of(pipeline).is_some());
        let deploy = DefinitionPath::root()
            .key("pipeline")
            .key("stages")
            .index(1)
            .key("stage");
        assert_eq!(uuid_of(tree.resolve(&deploy).unwrap()), Some("fixed"));

        let again = DefinitionTree::new(tree.root().clone());
        assert_eq!(again.root(), tree.root());
    }

    #[test]
    fn path_display_and_field_name() {
        let path = DefinitionPath::root().key("pipeline").key("stages").index(0).key("stage");
        assert_eq!(path.to_string(), "pipeline.stages[0].stage");
        assert_eq!(path.field_name(), Some("stage"));
        assert_eq!(DefinitionPath::root().index(2).field_name(), None);
    }

    #[test]
    fn find_uuid_survives_structural_rewrite() {
        let mut tree = tree();
        let stages = DefinitionPath::root().key("pipeline").key("stages");
        let mut items = tree.resolve(&stages).unwrap().as_array().unwrap().clone();
        items.insert(0, json!({ "stage": { "identifier": "lint" } }));
        tree.set(&stages, Value::Array(items)).unwrap();

        let moved = tree.find_uuid("fixed").unwrap();
        assert_eq!(moved.to_string(), "pipeline.stages[2].stage");
    }

    #[test]
    fn set_inserts_missing_key() {
        let mut tree = tree();
        let name = DefinitionPath::root().key("pipeline").key("name");
        tree.set(&name, json!("Pipeline")).unwrap();
        assert_eq!(tree.resolve(&name), Some(&json!("Pipeline")));
        assert!(tree
            .set(&DefinitionPath::root().key("missing").key("x"), json!(1))
            .is_err());
    }
}
