//! Schema-free object representation.
//!
//! A [`DynamicObject`] wraps an arbitrary JSON field tree, the way the API
//! server hands objects back for kinds the engine has no compiled-in schema
//! for. Accessors navigate the tree; nothing is validated beyond the identity
//! fields required to form an [`ObjectId`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{registry, Gvk, ObjectId};

/// Errors constructing or mutating a [`DynamicObject`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// A required identity field is missing or not a string.
    #[error("object is missing required field {field}")]
    MissingField {
        /// Path of the missing field.
        field: &'static str,
    },

    /// The value is not a JSON object at the top level.
    #[error("object root must be a JSON object")]
    NotAnObject,

    /// A field path segment traversed a non-object value.
    #[error("field path {path} traverses a non-object value")]
    PathThroughScalar {
        /// The offending dot path.
        path: String,
    },
}

/// A schema-unvalidated API object: a JSON field tree with typed accessors.
///
/// Cloning is a deep copy; the underlying tree is never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicObject {
    value: Value,
}

impl DynamicObject {
    /// Builds an object from a JSON value, validating the identity fields
    /// `apiVersion`, `kind`, and `metadata.name`.
    pub fn from_value(value: Value) -> Result<Self, ObjectError> {
        if !value.is_object() {
            return Err(ObjectError::NotAnObject);
        }
        let obj = Self { value };
        if obj.str_at(&["apiVersion"]).is_none() {
            return Err(ObjectError::MissingField { field: "apiVersion" });
        }
        if obj.str_at(&["kind"]).is_none() {
            return Err(ObjectError::MissingField { field: "kind" });
        }
        if obj.str_at(&["metadata", "name"]).is_none() {
            return Err(ObjectError::MissingField {
                field: "metadata.name",
            });
        }
        Ok(obj)
    }

    /// Builds a minimal object of the given kind and identity.
    #[must_use]
    pub fn named(gvk: &Gvk, namespace: &str, name: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("name".to_string(), Value::String(name.to_string()));
        if !namespace.is_empty() {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
        let mut root = Map::new();
        root.insert("apiVersion".to_string(), Value::String(gvk.api_version()));
        root.insert("kind".to_string(), Value::String(gvk.kind.clone()));
        root.insert("metadata".to_string(), Value::Object(metadata));
        Self {
            value: Value::Object(root),
        }
    }

    /// Borrows the underlying JSON tree.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the object, returning the JSON tree.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// The group/version/kind of the object.
    #[must_use]
    pub fn gvk(&self) -> Gvk {
        let api_version = self.str_at(&["apiVersion"]).unwrap_or_default();
        let (group, version) = Gvk::split_api_version(api_version);
        Gvk {
            group,
            version,
            kind: self.str_at(&["kind"]).unwrap_or_default().to_string(),
        }
    }

    /// The identity of the object.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        let gvk = self.gvk();
        ObjectId {
            group: gvk.group,
            kind: gvk.kind,
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }

    /// The object name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"]).unwrap_or_default()
    }

    /// The object namespace; empty for cluster-scoped objects.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.str_at(&["metadata", "namespace"]).unwrap_or_default()
    }

    /// Sets the object namespace.
    pub fn set_namespace(&mut self, namespace: &str) {
        self.ensure_map(&["metadata"])
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    /// Reads an annotation value.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.str_at(&["metadata", "annotations", key])
    }

    /// Writes an annotation.
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.ensure_map(&["metadata", "annotations"])
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    /// Removes an annotation, if present.
    pub fn remove_annotation(&mut self, key: &str) {
        if let Some(Value::Object(map)) = Self::value_at_mut(&mut self.value, &["metadata", "annotations"]) {
            map.remove(key);
        }
    }

    /// Reads a label value.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.str_at(&["metadata", "labels", key])
    }

    /// Writes a label.
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.ensure_map(&["metadata", "labels"])
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    /// Removes a label, if present.
    pub fn remove_label(&mut self, key: &str) {
        if let Some(Value::Object(map)) = Self::value_at_mut(&mut self.value, &["metadata", "labels"]) {
            map.remove(key);
        }
    }

    /// Reads the value at a dot-separated field path, e.g. `data.mode`.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// Writes the value at a dot-separated field path, creating intermediate
    /// objects as needed.
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), ObjectError> {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(ObjectError::PathThroughScalar {
                path: path.to_string(),
            });
        };
        let mut cur = &mut self.value;
        for seg in parents {
            let map = cur.as_object_mut().ok_or_else(|| ObjectError::PathThroughScalar {
                path: path.to_string(),
            })?;
            cur = map
                .entry((*seg).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let map = cur.as_object_mut().ok_or_else(|| ObjectError::PathThroughScalar {
            path: path.to_string(),
        })?;
        map.insert((*last).to_string(), value);
        Ok(())
    }

    /// Returns a deep copy. Mutating the copy never affects the original.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Whether the object is a Namespace.
    #[must_use]
    pub fn is_namespace(&self) -> bool {
        registry::capabilities(&self.gvk().group_kind()).is_namespace
    }

    /// Drops fields the API server owns, so declared and live trees compare
    /// on declared content only.
    pub fn strip_server_fields(&mut self) {
        if let Some(map) = self.value.as_object_mut() {
            map.remove("status");
        }
        if let Some(Value::Object(meta)) = Self::value_at_mut(&mut self.value, &["metadata"]) {
            for field in [
                "uid",
                "resourceVersion",
                "creationTimestamp",
                "generation",
                "managedFields",
            ] {
                meta.remove(field);
            }
        }
    }

    /// Whether a live object has drifted from this declared form.
    ///
    /// Compares declared content only: every field this object declares must
    /// be present and equal on the live object; server-set fields and extra
    /// live content are ignored. Arrays compare exactly.
    #[must_use]
    pub fn drifts_from(&self, live: &DynamicObject) -> bool {
        let mut declared = self.deep_copy();
        declared.strip_server_fields();
        !is_subtree(declared.value(), live.value())
    }

    /// Top-level field names other than identity fields, recorded for the
    /// admission webhook as the declared field set.
    #[must_use]
    pub fn top_level_fields(&self) -> Vec<String> {
        let Some(map) = self.value.as_object() else {
            return Vec::new();
        };
        map.keys()
            .filter(|k| !matches!(k.as_str(), "apiVersion" | "kind" | "metadata" | "status"))
            .cloned()
            .collect()
    }

    fn str_at(&self, keys: &[&str]) -> Option<&str> {
        let mut cur = &self.value;
        for key in keys {
            cur = cur.as_object()?.get(*key)?;
        }
        cur.as_str()
    }

    fn value_at_mut<'a>(value: &'a mut Value, keys: &[&str]) -> Option<&'a mut Value> {
        let mut cur = value;
        for key in keys {
            cur = cur.as_object_mut()?.get_mut(*key)?;
        }
        Some(cur)
    }

    fn ensure_map(&mut self, keys: &[&str]) -> &mut Map<String, Value> {
        let mut cur = &mut self.value;
        for key in keys {
            let map = cur
                .as_object_mut()
                .expect("object root is always a JSON object");
            cur = map
                .entry((*key).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        cur.as_object_mut().expect("just ensured an object")
    }
}

/// Whether `declared` is a recursive subtree of `live`: object fields the
/// declared side specifies must be present and equal; scalars and arrays
/// compare exactly.
fn is_subtree(declared: &Value, live: &Value) -> bool {
    match (declared, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(key, value)| have.get(key).is_some_and(|l| is_subtree(value, l))),
        _ => declared == live,
    }
}
