//! Apply-time mutation.
//!
//! Resolves declared cross-object field references at apply time: a value
//! from another applied object is substituted into a field of the object
//! being applied, per the apply-time-mutation annotation.

use std::sync::Arc;

use rudder_core::cluster::DynamicClient;
use rudder_core::{metadata, DynamicObject, SyncError};

use super::task::TaskContext;

/// Substitutes cross-object field references before apply.
pub struct ApplyTimeMutator {
    cluster: Arc<dyn DynamicClient>,
}

impl ApplyTimeMutator {
    /// Creates a mutator resolving sources through the given cluster client.
    #[must_use]
    pub fn new(cluster: Arc<dyn DynamicClient>) -> Self {
        Self { cluster }
    }

    /// Applies every mutation spec on `obj` in place. Sources are resolved
    /// from objects applied earlier in this run, falling back to the live
    /// cluster. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// `SyncError::Apply` when a spec is malformed, a source object is
    /// missing, or a source field is absent.
    pub async fn mutate(&self, obj: &mut DynamicObject, ctx: &TaskContext) -> Result<bool, SyncError> {
        let id = obj.id();
        let apply_err = |message: String| SyncError::Apply {
            id: id.clone(),
            message,
        };

        let specs = metadata::apply_time_mutations(obj).map_err(|err| apply_err(err.to_string()))?;
        if specs.is_empty() {
            return Ok(false);
        }

        for spec in &specs {
            let source = match ctx.applied(&spec.source) {
                Some(source) => source,
                None => self
                    .cluster
                    .get(&spec.source)
                    .await
                    .map_err(|err| apply_err(format!("resolving mutation source: {err}")))?
                    .ok_or_else(|| {
                        apply_err(format!("mutation source {} does not exist", spec.source))
                    })?,
            };
            let value = source
                .field(&spec.source_path)
                .ok_or_else(|| {
                    apply_err(format!(
                        "mutation source {} has no field {}",
                        spec.source, spec.source_path
                    ))
                })?
                .clone();

            if spec.token.is_empty() {
                obj.set_field(&spec.target_path, value)
                    .map_err(|err| apply_err(err.to_string()))?;
            } else {
                let target = obj
                    .field(&spec.target_path)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        apply_err(format!(
                            "mutation target {} is not a string field",
                            spec.target_path
                        ))
                    })?;
                let replacement = match &value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let substituted = target.replace(&spec.token, &replacement);
                obj.set_field(&spec.target_path, serde_json::Value::String(substituted))
                    .map_err(|err| apply_err(err.to_string()))?;
            }
        }
        Ok(true)
    }
}
