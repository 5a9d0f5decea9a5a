//! Search parameter trait and registration factories.
//!
//! Each supported search parameter of a resource type is registered through
//! one [`SearchQueryParameterFactory`]. Parameter instances are stateful:
//! the factory hands out a fresh, unconfigured instance per raw query value,
//! which is then `configure`d once and contributes one filter fragment.

use fhirlink_core::Resource;

use crate::error::{SearchQueryParameterError, StorageError};
use crate::include::{IncludeParts, SearchQueryIncludeParameterConfiguration};
use crate::query::DaoProvider;
use crate::sql::SqlValue;

/// Sort order of one `_sort` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Direction derived from an optional leading `+`/`-` on a sort token;
    /// returns the direction and the bare parameter name.
    pub fn from_sort_value(value: &str) -> (Self, &str) {
        if let Some(name) = value.strip_prefix('-') {
            (Self::Descending, name)
        } else if let Some(name) = value.strip_prefix('+') {
            (Self::Ascending, name)
        } else {
            (Self::Ascending, value)
        }
    }

    /// Suffix appended to the sort column expression.
    pub fn sql_suffix(&self) -> &'static str {
        match self {
            Self::Ascending => "",
            Self::Descending => " DESC",
        }
    }
}

/// One filter criterion of a search request.
///
/// Fragments returned by [`filter_query`](Self::filter_query) use `?`
/// placeholders; [`bind_value`](Self::bind_value) supplies the matching
/// values in placeholder order.
pub trait SearchQueryParameter<R: Resource>: Send + Sync {
    /// Parse one raw query value. Parse problems are recorded in `errors`
    /// and leave the parameter undefined; they never abort the request.
    fn configure(
        &mut self,
        errors: &mut Vec<SearchQueryParameterError>,
        query_parameter_name: &str,
        query_parameter_value: &str,
    );

    /// True once a usable value has been configured; only defined parameters
    /// contribute to SQL and bundle URIs.
    fn is_defined(&self) -> bool;

    /// Boolean SQL fragment with `?` placeholders.
    fn filter_query(&self) -> String;

    /// Number of `?` placeholders in [`filter_query`](Self::filter_query).
    fn sql_parameter_count(&self) -> usize;

    /// Value for one placeholder. `parameter_index` is the 1-based position
    /// in the whole statement, `subquery_parameter_index` the 1-based
    /// position within this parameter's own fragment.
    fn bind_value(&self, parameter_index: usize, subquery_parameter_index: usize) -> SqlValue;

    /// Query parameter name for bundle self-link reconstruction, including
    /// any name modifier the request used.
    fn bundle_uri_query_parameter_name(&self) -> String;

    /// Canonical value for bundle self-link reconstruction.
    fn bundle_uri_query_parameter_value(&self) -> String;

    /// Column expression used in `ORDER BY`, without direction.
    fn sort_sql(&self) -> String;

    /// Include-column configuration for the given `_include` value, if this
    /// parameter supports being included and the parts match.
    fn include_sql(
        &self,
        include_parts: &IncludeParts,
    ) -> Option<SearchQueryIncludeParameterConfiguration> {
        let _ = include_parts;
        None
    }

    /// Materialize referenced resources needed for in-memory matching.
    /// A reference that does not resolve is not an error; only database
    /// failures are.
    fn resolve_references_for_matching(
        &mut self,
        resource: &R,
        dao_provider: &dyn DaoProvider,
    ) -> Result<(), StorageError> {
        let _ = (resource, dao_provider);
        Ok(())
    }

    /// In-memory equivalent of the filter fragment, used to match push
    /// notifications without a database round trip.
    fn matches(&self, resource: &R) -> bool;
}

/// A configured sort clause: ordering fragment, direction and the parameter
/// name it came from, used both for SQL and bundle-URI reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuerySortParameterConfiguration {
    sql: String,
    direction: SortDirection,
    parameter_name: String,
}

impl SearchQuerySortParameterConfiguration {
    pub fn new(sql: impl Into<String>, direction: SortDirection, parameter_name: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            direction,
            parameter_name: parameter_name.into(),
        }
    }

    /// Ordering fragment including direction.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    /// Part of the reconstructed `_sort` value: `name` or `-name`.
    pub fn bundle_uri_query_parameter_value_part(&self) -> String {
        match self.direction {
            SortDirection::Ascending => self.parameter_name.clone(),
            SortDirection::Descending => format!("-{}", self.parameter_name),
        }
    }
}

type ParameterSupplier<R> = Box<dyn Fn() -> Box<dyn SearchQueryParameter<R>> + Send + Sync>;

/// Registry entry binding a parameter name to a supplier of fresh parameter
/// instances, plus the derived sort and include registrations.
///
/// Exactly one factory may exist per name, sort name and include value
/// within a single query; violating that is a registration-list bug and
/// fails fast at construction time.
pub struct SearchQueryParameterFactory<R: Resource> {
    name: &'static str,
    name_modifiers: Vec<&'static str>,
    supplier: ParameterSupplier<R>,
    include_parameter_values: Vec<String>,
}

impl<R: Resource> SearchQueryParameterFactory<R> {
    pub fn new(
        name: &'static str,
        supplier: impl Fn() -> Box<dyn SearchQueryParameter<R>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            name_modifiers: Vec::new(),
            supplier: Box::new(supplier),
            include_parameter_values: Vec::new(),
        }
    }

    /// Register alternate matchable names via modifier suffixes
    /// (e.g. `":not"` makes `status:not` dispatch to this factory).
    #[must_use]
    pub fn with_name_modifiers(mut self, name_modifiers: Vec<&'static str>) -> Self {
        self.name_modifiers = name_modifiers;
        self
    }

    /// Mark this parameter usable inside `_include` for the given values.
    #[must_use]
    pub fn with_include_parameter_values(mut self, values: Vec<String>) -> Self {
        self.include_parameter_values = values;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Canonical name plus all modifier-suffixed names.
    pub fn name_and_modified_names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.name.to_string())
            .chain(self.name_modifiers.iter().map(|m| format!("{}{m}", self.name)))
    }

    /// Sort-token variants: `name`, `+name`, `-name`.
    pub fn sort_names(&self) -> [String; 3] {
        [
            self.name.to_string(),
            format!("+{}", self.name),
            format!("-{}", self.name),
        ]
    }

    pub fn is_include_parameter(&self) -> bool {
        !self.include_parameter_values.is_empty()
    }

    pub fn include_parameter_values(&self) -> &[String] {
        &self.include_parameter_values
    }

    /// A fresh, unconfigured parameter instance. Called once per raw query
    /// value; instances are never reused across values.
    pub fn create_query_parameter(&self) -> Box<dyn SearchQueryParameter<R>> {
        (self.supplier)()
    }

    /// Sort configuration for one `_sort` token that dispatched to this
    /// factory.
    pub fn create_query_sort_parameter(
        &self,
        sort_value: &str,
    ) -> SearchQuerySortParameterConfiguration {
        let (direction, _) = SortDirection::from_sort_value(sort_value);
        let sql = format!(
            "{}{}",
            self.create_query_parameter().sort_sql(),
            direction.sql_suffix()
        );
        SearchQuerySortParameterConfiguration::new(sql, direction, self.name)
    }

    /// Include configuration for one accepted `_include` value.
    pub fn create_query_include_parameter(
        &self,
        include_value: &str,
    ) -> Option<SearchQueryIncludeParameterConfiguration> {
        let include_parts: IncludeParts = include_value.parse().ok()?;
        self.create_query_parameter().include_sql(&include_parts)
    }
}

impl<R: Resource> std::fmt::Debug for SearchQueryParameterFactory<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchQueryParameterFactory")
            .field("name", &self.name)
            .field("name_modifiers", &self.name_modifiers)
            .field("include_parameter_values", &self.include_parameter_values)
            .finish()
    }
}

type RevIncludeSupplier =
    Box<dyn Fn(&IncludeParts) -> SearchQueryIncludeParameterConfiguration + Send + Sync>;

/// Registry entry for a `_revinclude` value: resources of another type that
/// reference the primary resource type are fetched as an extra column.
pub struct SearchQueryRevIncludeParameterFactory {
    revinclude_parameter_values: Vec<String>,
    supplier: RevIncludeSupplier,
}

impl SearchQueryRevIncludeParameterFactory {
    pub fn new(
        revinclude_parameter_values: Vec<String>,
        supplier: impl Fn(&IncludeParts) -> SearchQueryIncludeParameterConfiguration
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            revinclude_parameter_values,
            supplier: Box::new(supplier),
        }
    }

    pub fn revinclude_parameter_values(&self) -> &[String] {
        &self.revinclude_parameter_values
    }

    /// Configuration for one accepted `_revinclude` value.
    pub fn create_query_revinclude_parameter(
        &self,
        revinclude_value: &str,
    ) -> SearchQueryIncludeParameterConfiguration {
        let include_parts: IncludeParts = revinclude_value
            .parse()
            .unwrap_or_default();
        (self.supplier)(&include_parts)
    }
}

impl std::fmt::Debug for SearchQueryRevIncludeParameterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchQueryRevIncludeParameterFactory")
            .field("revinclude_parameter_values", &self.revinclude_parameter_values)
            .finish()
    }
}
