//! Arcane core types: stream phases, resource coordinates, error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod error;

pub use error::{DiscoveryError, MutationError, StreamError, WaitError};

/// Namespace used when the caller does not override it.
pub const DEFAULT_NAMESPACE: &str = "arcane";

/// Annotation on the managed stream resource carrying the state directive.
pub const STATE_ANNOTATION: &str = "arcane/state";
pub const STATE_SUSPENDED: &str = "suspended";
pub const STATE_RELOAD_REQUESTED: &str = "reload-requested";

/// Annotations on the run (Job) resource carrying the API coordinates.
pub const RUN_ANNOTATION_GROUP: &str = "stream.arcane.sneaksanddata.com/api-group";
pub const RUN_ANNOTATION_VERSION: &str = "stream.arcane.sneaksanddata.com/api-version";
pub const RUN_ANNOTATION_PLURAL: &str = "stream.arcane.sneaksanddata.com/api-plural-name";

/// Externally reported lifecycle state of a stream.
///
/// The canonical names are the strings the stream resource reports in
/// `status.phase`; comparisons against observed text are case-insensitive.
/// Note that the backfill phase is reported as `Reloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Running,
    Suspended,
    Backfill,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Running => "Running",
            Phase::Suspended => "Suspended",
            Phase::Backfill => "Reloading",
            Phase::Failed => "Failed",
        }
    }

    /// Whether an observed `status.phase` value denotes this phase.
    pub fn matches(self, observed: &str) -> bool {
        observed.eq_ignore_ascii_case(self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (group, version, plural) triple addressing a dynamic resource type.
///
/// Produced only at the discovery parsing boundary below; all three fields
/// are non-empty strings once a value exists. Recomputed per orchestrated
/// operation, never cached across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCoordinates {
    api_group: String,
    api_version: String,
    plural: String,
}

impl ResourceCoordinates {
    /// Build coordinates from already-validated parts.
    pub fn new(
        api_group: impl Into<String>,
        api_version: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        let coords = Self {
            api_group: api_group.into(),
            api_version: api_version.into(),
            plural: plural.into(),
        };
        debug_assert!(
            !coords.api_group.is_empty()
                && !coords.api_version.is_empty()
                && !coords.plural.is_empty()
        );
        coords
    }

    pub fn api_group(&self) -> &str {
        &self.api_group
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn plural(&self) -> &str {
        &self.plural
    }

    /// Parse coordinates from a run (Job) object's metadata annotations.
    ///
    /// `object` is the raw JSON of the resource. A missing, non-string or
    /// empty annotation fails with `SchemaMismatch` naming that key.
    pub fn from_run_annotations(object: &Value) -> Result<Self, DiscoveryError> {
        let annotations = object
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .ok_or_else(|| DiscoveryError::SchemaMismatch("metadata.annotations".to_string()))?;
        Ok(Self {
            api_group: string_field(annotations, RUN_ANNOTATION_GROUP)?,
            api_version: string_field(annotations, RUN_ANNOTATION_VERSION)?,
            plural: string_field(annotations, RUN_ANNOTATION_PLURAL)?,
        })
    }

    /// Parse coordinates from a stream-class object's `spec` section.
    pub fn from_class_spec(object: &Value) -> Result<Self, DiscoveryError> {
        let spec = object
            .get("spec")
            .and_then(Value::as_object)
            .ok_or_else(|| DiscoveryError::SchemaMismatch("spec".to_string()))?;
        Ok(Self {
            api_group: string_field(spec, "apiGroupRef")?,
            api_version: string_field(spec, "apiVersion")?,
            plural: string_field(spec, "pluralName")?,
        })
    }
}

impl fmt::Display for ResourceCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.api_group, self.api_version, self.plural)
    }
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Result<String, DiscoveryError> {
    match map.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(DiscoveryError::SchemaMismatch(key.to_string())),
    }
}
