//! Resource abstraction consumed by the search subsystem.
//!
//! The search layer never inspects resource internals itself; it only needs
//! to know the resource type name a value belongs to. Concrete resource
//! models (parsed FHIR R4 structures, JSONB-backed envelopes) implement this
//! trait at their definition site.

/// A parsed FHIR resource of a known type.
pub trait Resource {
    /// The FHIR resource type name this Rust type represents (e.g. "Task").
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// The resource type name of this instance.
    ///
    /// For statically typed models this equals `Self::type_name()`; dynamic
    /// models (e.g. JSON envelopes) report the `resourceType` field.
    fn resource_type(&self) -> &str;
}
