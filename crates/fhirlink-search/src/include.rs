//! `_include` and `_revinclude` value handling.
//!
//! Values follow the three-part grammar `SourceType:searchParam[:TargetType]`.
//! The target segment is a refinement filter: an include value without it
//! matches any declared target type, and bundle self-links reproduce exactly
//! the segments that were supplied.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// Parsed parts of an `_include`/`_revinclude` value.
///
/// A blank value parses into the all-`None` neutral instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeParts {
    source_resource_type_name: Option<String>,
    search_parameter_name: Option<String>,
    target_resource_type_name: Option<String>,
}

impl IncludeParts {
    pub fn new(
        source_resource_type_name: Option<String>,
        search_parameter_name: Option<String>,
        target_resource_type_name: Option<String>,
    ) -> Self {
        Self {
            source_resource_type_name,
            search_parameter_name,
            target_resource_type_name,
        }
    }

    pub fn source_resource_type_name(&self) -> Option<&str> {
        self.source_resource_type_name.as_deref()
    }

    pub fn search_parameter_name(&self) -> Option<&str> {
        self.search_parameter_name.as_deref()
    }

    pub fn target_resource_type_name(&self) -> Option<&str> {
        self.target_resource_type_name.as_deref()
    }

    /// True iff source and parameter match exactly and the target segment,
    /// when present, matches as well.
    pub fn matches(
        &self,
        source_resource_type_name: &str,
        search_parameter_name: &str,
        target_resource_type_name: &str,
    ) -> bool {
        self.source_resource_type_name.as_deref() == Some(source_resource_type_name)
            && self.search_parameter_name.as_deref() == Some(search_parameter_name)
            && (self.target_resource_type_name.is_none()
                || self.target_resource_type_name.as_deref() == Some(target_resource_type_name))
    }

    /// Canonical value for bundle self-link reconstruction, reproducing the
    /// target segment only when it was supplied.
    pub fn to_bundle_uri_query_parameter_value(&self) -> String {
        self.to_string()
    }
}

impl FromStr for IncludeParts {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut segments = value.split(':');
        Ok(Self {
            source_resource_type_name: segments.next().map(str::to_string),
            search_parameter_name: segments.next().map(str::to_string),
            target_resource_type_name: segments.next().map(str::to_string),
        })
    }
}

impl fmt::Display for IncludeParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source_resource_type_name {
            f.write_str(source)?;
        }
        if let Some(parameter) = &self.search_parameter_name {
            write!(f, ":{parameter}")?;
        }
        if let Some(target) = &self.target_resource_type_name {
            write!(f, ":{target}")?;
        }
        Ok(())
    }
}

/// Post-fetch hook applied to each resource read from an include column.
pub type IncludeResourceModifier = Box<dyn Fn(&mut Value) + Send + Sync>;

/// A configured, ready-to-use include or revinclude clause.
///
/// Holds the extra `SELECT` column fragment, the parsed value it came from,
/// and an optional hook to fix up fetched resources (e.g. stripping payload
/// elements the caller must not see).
pub struct SearchQueryIncludeParameterConfiguration {
    sql: String,
    include_parts: IncludeParts,
    modifier: Option<IncludeResourceModifier>,
}

impl SearchQueryIncludeParameterConfiguration {
    pub fn new(sql: impl Into<String>, include_parts: IncludeParts) -> Self {
        Self {
            sql: sql.into(),
            include_parts,
            modifier: None,
        }
    }

    #[must_use]
    pub fn with_modifier(mut self, modifier: IncludeResourceModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// The column fragment appended to the main `SELECT` list.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn include_parts(&self) -> &IncludeParts {
        &self.include_parts
    }

    pub fn bundle_uri_query_parameter_value(&self) -> String {
        self.include_parts.to_bundle_uri_query_parameter_value()
    }

    /// Apply the post-fetch hook, if any, to a resource read from this
    /// configuration's column.
    pub fn modify_include_resource(&self, resource: &mut Value) {
        if let Some(modifier) = &self.modifier {
            modifier(resource);
        }
    }
}

impl fmt::Debug for SearchQueryIncludeParameterConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchQueryIncludeParameterConfiguration")
            .field("sql", &self.sql)
            .field("include_parts", &self.include_parts)
            .field("modifier", &self.modifier.as_ref().map(|_| "..."))
            .finish()
    }
}
