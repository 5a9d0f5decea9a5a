//! FHIR reference parsing utilities.
//!
//! Literal references appear in search parameter values and resource fields
//! as `Type/id` relative references. Absolute URLs and contained (`#id`) or
//! URN references cannot be resolved against the local database and are
//! rejected here; callers that accept them handle the raw string directly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A successfully parsed relative FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceReference {
    /// The resource type (e.g., "Patient", "Organization")
    pub resource_type: String,
    /// The resource ID
    pub id: String,
}

impl ResourceReference {
    /// Creates a new ResourceReference.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// Parse a relative `Type/id` reference string.
///
/// Returns an error for contained references (`#...`), URNs, absolute URLs
/// and anything else that is not exactly two non-empty slash-separated
/// segments starting with an uppercase resource type name.
pub fn parse_reference(value: &str) -> Result<ResourceReference, CoreError> {
    if value.is_empty() || value.starts_with('#') || value.starts_with("urn:") {
        return Err(CoreError::invalid_reference(value));
    }
    if value.contains("://") {
        return Err(CoreError::invalid_reference(value));
    }

    let mut segments = value.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(resource_type), Some(id), None)
            if !resource_type.is_empty()
                && !id.is_empty()
                && resource_type.starts_with(|c: char| c.is_ascii_uppercase()) =>
        {
            Ok(ResourceReference::new(resource_type, id))
        }
        _ => Err(CoreError::invalid_reference(value)),
    }
}
