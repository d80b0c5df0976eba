//! Management metadata written onto every applied object.
//!
//! The admission webhook and the remediator both key off this vocabulary: the
//! managed marker, the resource-ID fingerprint, the inventory-ID annotation,
//! and the manager label together establish which sync owns a live object.

use serde::{Deserialize, Serialize};

use crate::object::{DynamicObject, ObjectId};

/// Annotation marking an object as managed by a sync.
pub const MANAGED_ANNOTATION: &str = "rudder.dev/managed";
/// Value of [`MANAGED_ANNOTATION`] on managed objects.
pub const MANAGED_ENABLED: &str = "enabled";
/// Annotation carrying the ID fingerprint of the object it is stamped on.
pub const RESOURCE_ID_ANNOTATION: &str = "rudder.dev/resource-id";
/// Annotation carrying the owning inventory ID.
pub const INVENTORY_ID_ANNOTATION: &str = "rudder.dev/inventory-id";
/// Label naming the sync that owns a live object.
pub const MANAGER_LABEL: &str = "rudder.dev/manager";
/// Annotation listing the declared top-level fields, consumed by the
/// admission webhook to reject drifting mutations.
pub const DECLARED_FIELDS_ANNOTATION: &str = "rudder.dev/declared-fields";
/// Label carrying the source revision an object was declared at.
pub const DECLARED_VERSION_LABEL: &str = "rudder.dev/declared-version";

/// Lifecycle annotation opting an object out of deletion.
pub const LIFECYCLE_DELETION_ANNOTATION: &str = "client.lifecycle.config.k8s.io/deletion";
/// Value of [`LIFECYCLE_DELETION_ANNOTATION`] that prevents pruning.
pub const LIFECYCLE_DETACH: &str = "detach";

/// Annotation declaring prerequisite objects, as a comma-separated list of
/// `group/kind/namespace/name` references.
pub const DEPENDS_ON_ANNOTATION: &str = "config.kubernetes.io/depends-on";
/// Annotation carrying apply-time field substitutions as a JSON list of
/// [`MutationSpec`] entries.
pub const APPLY_TIME_MUTATION_ANNOTATION: &str = "config.kubernetes.io/apply-time-mutation";

/// Errors reading management metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// A depends-on reference did not have four `/`-separated segments.
    #[error("malformed depends-on reference {reference:?}: expected group/kind/namespace/name")]
    MalformedDependency {
        /// The offending reference text.
        reference: String,
    },

    /// The apply-time mutation annotation was not valid JSON.
    #[error("malformed apply-time-mutation annotation: {message}")]
    MalformedMutation {
        /// Parse failure description.
        message: String,
    },
}

/// One apply-time substitution: read `source_path` from the source object and
/// write it into `target_path` of the annotated object. When `token` is
/// non-empty the target must be a string and the token substring is replaced
/// with the source value instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationSpec {
    /// ID of the object supplying the value.
    pub source: ObjectId,
    /// Dot path of the field to read from the source object.
    #[serde(rename = "sourcePath")]
    pub source_path: String,
    /// Dot path of the field to write on the annotated object.
    #[serde(rename = "targetPath")]
    pub target_path: String,
    /// Optional token to replace within a string target.
    #[serde(default)]
    pub token: String,
}

/// Stamps the full management metadata set onto an object before apply.
pub fn stamp_management_metadata(
    obj: &mut DynamicObject,
    manager: &str,
    inventory_id: &str,
    revision: &str,
) {
    let id = obj.id();
    obj.set_annotation(MANAGED_ANNOTATION, MANAGED_ENABLED);
    obj.set_annotation(RESOURCE_ID_ANNOTATION, &resource_id_of(&id));
    obj.set_annotation(INVENTORY_ID_ANNOTATION, inventory_id);
    obj.set_label(MANAGER_LABEL, manager);
    obj.set_label(DECLARED_VERSION_LABEL, revision);
    let fields = obj.top_level_fields().join(",");
    obj.set_annotation(DECLARED_FIELDS_ANNOTATION, &fields);
}

/// Removes the management metadata set, detaching an object from its sync.
pub fn strip_management_metadata(obj: &mut DynamicObject) {
    obj.remove_annotation(MANAGED_ANNOTATION);
    obj.remove_annotation(RESOURCE_ID_ANNOTATION);
    obj.remove_annotation(INVENTORY_ID_ANNOTATION);
    obj.remove_annotation(DECLARED_FIELDS_ANNOTATION);
    obj.remove_label(MANAGER_LABEL);
    obj.remove_label(DECLARED_VERSION_LABEL);
}

/// The resource-ID fingerprint text for an object ID.
#[must_use]
pub fn resource_id_of(id: &ObjectId) -> String {
    format!("{}_{}_{}_{}", id.group, id.kind, id.namespace, id.name)
}

/// Whether the object carries the managed marker.
#[must_use]
pub fn is_managed(obj: &DynamicObject) -> bool {
    obj.annotation(MANAGED_ANNOTATION) == Some(MANAGED_ENABLED)
}

/// The manager label on the object, if any.
#[must_use]
pub fn manager_of(obj: &DynamicObject) -> Option<&str> {
    obj.label(MANAGER_LABEL)
}

/// The inventory-ID annotation on the object, if any.
#[must_use]
pub fn inventory_id_of(obj: &DynamicObject) -> Option<&str> {
    obj.annotation(INVENTORY_ID_ANNOTATION)
}

/// Whether the resource-ID fingerprint matches the object's actual identity.
/// A mismatch means the object was copied or renamed out from under its sync.
#[must_use]
pub fn resource_id_matches(obj: &DynamicObject) -> bool {
    match obj.annotation(RESOURCE_ID_ANNOTATION) {
        Some(stamped) => stamped == resource_id_of(&obj.id()),
        None => false,
    }
}

/// Whether the lifecycle annotation opts the object out of deletion.
#[must_use]
pub fn prevents_deletion(obj: &DynamicObject) -> bool {
    obj.annotation(LIFECYCLE_DELETION_ANNOTATION) == Some(LIFECYCLE_DETACH)
}

/// Parses the depends-on annotation into prerequisite IDs. Returns an empty
/// list when the annotation is absent.
pub fn depends_on(obj: &DynamicObject) -> Result<Vec<ObjectId>, MetadataError> {
    let Some(raw) = obj.annotation(DEPENDS_ON_ANNOTATION) else {
        return Ok(Vec::new());
    };
    let mut ids = Vec::new();
    for reference in raw.split(',') {
        let reference = reference.trim();
        if reference.is_empty() {
            continue;
        }
        let parts: Vec<&str> = reference.split('/').collect();
        if parts.len() != 4 || parts[1].is_empty() || parts[3].is_empty() {
            return Err(MetadataError::MalformedDependency {
                reference: reference.to_string(),
            });
        }
        ids.push(ObjectId::new(parts[0], parts[1], parts[2], parts[3]));
    }
    Ok(ids)
}

/// Parses the apply-time mutation annotation. Returns an empty list when the
/// annotation is absent.
pub fn apply_time_mutations(obj: &DynamicObject) -> Result<Vec<MutationSpec>, MetadataError> {
    let Some(raw) = obj.annotation(APPLY_TIME_MUTATION_ANNOTATION) else {
        return Ok(Vec::new());
    };
    serde_json::from_str(raw).map_err(|err| MetadataError::MalformedMutation {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::object::Gvk;

    fn sample() -> DynamicObject {
        DynamicObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "ns" },
            "data": { "k": "v" },
        }))
        .unwrap()
    }

    #[test]
    fn test_stamp_and_read_back() {
        let mut obj = sample();
        stamp_management_metadata(&mut obj, ":root_root-sync", "inv-1", "abc123");

        assert!(is_managed(&obj));
        assert_eq!(manager_of(&obj), Some(":root_root-sync"));
        assert_eq!(inventory_id_of(&obj), Some("inv-1"));
        assert!(resource_id_matches(&obj));
        assert_eq!(obj.label(DECLARED_VERSION_LABEL), Some("abc123"));
        assert_eq!(obj.annotation(DECLARED_FIELDS_ANNOTATION), Some("data"));
    }

    #[test]
    fn test_strip_management_metadata() {
        let mut obj = sample();
        stamp_management_metadata(&mut obj, ":root_root-sync", "inv-1", "abc123");
        strip_management_metadata(&mut obj);

        assert!(!is_managed(&obj));
        assert_eq!(manager_of(&obj), None);
        assert_eq!(inventory_id_of(&obj), None);
    }

    #[test]
    fn test_resource_id_mismatch_detected() {
        let mut obj = sample();
        obj.set_annotation(RESOURCE_ID_ANNOTATION, "_ConfigMap_other_cm");
        assert!(!resource_id_matches(&obj));
    }

    #[test]
    fn test_prevents_deletion() {
        let mut obj = sample();
        assert!(!prevents_deletion(&obj));
        obj.set_annotation(LIFECYCLE_DELETION_ANNOTATION, LIFECYCLE_DETACH);
        assert!(prevents_deletion(&obj));
    }

    #[test]
    fn test_depends_on_parse() {
        let mut obj = sample();
        obj.set_annotation(
            DEPENDS_ON_ANNOTATION,
            "/ConfigMap/ns/first, rbac.authorization.k8s.io/ClusterRole//admin",
        );
        let deps = depends_on(&obj).unwrap();
        assert_eq!(
            deps,
            vec![
                ObjectId::new("", "ConfigMap", "ns", "first"),
                ObjectId::new("rbac.authorization.k8s.io", "ClusterRole", "", "admin"),
            ]
        );
    }

    #[test]
    fn test_depends_on_malformed() {
        let mut obj = sample();
        obj.set_annotation(DEPENDS_ON_ANNOTATION, "not-a-reference");
        let err = depends_on(&obj).unwrap_err();
        assert!(matches!(err, MetadataError::MalformedDependency { .. }));
    }

    #[test]
    fn test_apply_time_mutation_parse() {
        let mut obj = sample();
        let specs = vec![MutationSpec {
            source: ObjectId::new("", "Service", "ns", "db"),
            source_path: "spec.clusterIP".to_string(),
            target_path: "data.host".to_string(),
            token: "${db-ip}".to_string(),
        }];
        obj.set_annotation(
            APPLY_TIME_MUTATION_ANNOTATION,
            &serde_json::to_string(&specs).unwrap(),
        );
        assert_eq!(apply_time_mutations(&obj).unwrap(), specs);

        let gvk = Gvk::core("v1", "ConfigMap");
        let plain = DynamicObject::named(&gvk, "ns", "plain");
        assert!(apply_time_mutations(&plain).unwrap().is_empty());
    }
}
