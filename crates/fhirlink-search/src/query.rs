//! Search query orchestration.
//!
//! One [`SearchQuery`] is built per resource type and request via
//! [`SearchQueryBuilder`], then configured exactly once with the raw query
//! parameters of that request. Configuration dispatches every parameter to
//! its registered factory (or records an error), assembles the `WHERE`,
//! `ORDER BY`, include-column and paging SQL, and fixes the bind-value order
//! to the order the fragments entered the statement text.
//!
//! Parameter problems degrade gracefully: the query executes against the
//! parameters that could be validated and the accumulated errors are
//! reported alongside the result. Duplicate factory registrations, by
//! contrast, are programmer bugs and panic at construction time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use fhirlink_core::Resource;
use serde_json::Value;
use url::Url;

use crate::error::{
    ReferenceResolutionError, SearchQueryParameterError, SearchQueryParameterErrorType,
    StorageError,
};
use crate::identity::SearchQueryIdentityFilter;
use crate::include::SearchQueryIncludeParameterConfiguration;
use crate::page::PageAndCount;
use crate::parameters::{
    SearchQueryParameter, SearchQueryParameterFactory, SearchQueryRevIncludeParameterFactory,
    SearchQuerySortParameterConfiguration,
};
use crate::sql::{SqlValue, number_placeholders};

pub const PARAMETER_INCLUDE: &str = "_include";
pub const PARAMETER_REVINCLUDE: &str = "_revinclude";

pub const PARAMETER_SORT: &str = "_sort";
pub const PARAMETER_PAGE: &str = "_page";
pub const PARAMETER_COUNT: &str = "_count";
pub const PARAMETER_FORMAT: &str = "_format";
pub const PARAMETER_PRETTY: &str = "_pretty";
pub const PARAMETER_SUMMARY: &str = "_summary";

/// Query parameters handled by the subsystem itself rather than dispatched
/// to search parameter factories.
pub const STANDARD_PARAMETERS: [&str; 8] = [
    PARAMETER_SORT,
    PARAMETER_INCLUDE,
    PARAMETER_REVINCLUDE,
    PARAMETER_PAGE,
    PARAMETER_COUNT,
    PARAMETER_FORMAT,
    PARAMETER_PRETTY,
    PARAMETER_SUMMARY,
];

const SINGLE_VALUE_PARAMETERS: [&str; 6] = [
    PARAMETER_SORT,
    PARAMETER_PAGE,
    PARAMETER_COUNT,
    PARAMETER_FORMAT,
    PARAMETER_PRETTY,
    PARAMETER_SUMMARY,
];

/// Raw, URL-decoded query parameters of one search request.
pub type QueryParameters = BTreeMap<String, Vec<String>>;

/// Read access to stored resources, used to materialize referenced
/// resources for in-memory matching.
pub trait DaoProvider {
    /// Read the current version of a resource. `Ok(None)` means missing or
    /// deleted, which is not an error for matching purposes.
    fn read_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<Value>, StorageError>;
}

type IdentityFilter = Box<dyn SearchQueryIdentityFilter + Send + Sync>;

/// Builder collecting the immutable per-resource-type registrations.
pub struct SearchQueryBuilder<R: Resource> {
    resource_table: String,
    resource_column: String,
    page_and_count: PageAndCount,
    identity_filter: Option<IdentityFilter>,
    search_parameters: Vec<SearchQueryParameterFactory<R>>,
    revinclude_parameters: Vec<SearchQueryRevIncludeParameterFactory>,
}

impl<R: Resource> SearchQueryBuilder<R> {
    pub fn create(
        resource_table: impl Into<String>,
        resource_column: impl Into<String>,
        page_and_count: PageAndCount,
    ) -> Self {
        Self {
            resource_table: resource_table.into(),
            resource_column: resource_column.into(),
            page_and_count,
            identity_filter: None,
            search_parameters: Vec::new(),
            revinclude_parameters: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_identity_filter(
        mut self,
        identity_filter: impl SearchQueryIdentityFilter + Send + Sync + 'static,
    ) -> Self {
        self.identity_filter = Some(Box::new(identity_filter));
        self
    }

    #[must_use]
    pub fn with(mut self, search_parameter: SearchQueryParameterFactory<R>) -> Self {
        self.search_parameters.push(search_parameter);
        self
    }

    #[must_use]
    pub fn with_all(mut self, search_parameters: Vec<SearchQueryParameterFactory<R>>) -> Self {
        self.search_parameters.extend(search_parameters);
        self
    }

    #[must_use]
    pub fn with_revinclude(
        mut self,
        revinclude_parameter: SearchQueryRevIncludeParameterFactory,
    ) -> Self {
        self.revinclude_parameters.push(revinclude_parameter);
        self
    }

    #[must_use]
    pub fn with_revincludes(
        mut self,
        revinclude_parameters: Vec<SearchQueryRevIncludeParameterFactory>,
    ) -> Self {
        self.revinclude_parameters.extend(revinclude_parameters);
        self
    }

    /// Build the unconfigured query.
    ///
    /// # Panics
    ///
    /// Panics if two factories register the same parameter name, sort name
    /// or include/revinclude value — a registration-list bug that must
    /// surface during system initialization, not at request time.
    pub fn build(self) -> SearchQuery<R> {
        SearchQuery::new(
            self.resource_table,
            self.resource_column,
            self.identity_filter,
            self.page_and_count,
            self.search_parameters,
            self.revinclude_parameters,
        )
    }
}

/// Unconfigured, request-scoped search query for resource type `R`.
pub struct SearchQuery<R: Resource> {
    resource_table: String,
    resource_column: String,
    identity_filter: Option<IdentityFilter>,
    page_and_count: PageAndCount,

    search_parameter_factories_by_parameter_name:
        HashMap<String, Arc<SearchQueryParameterFactory<R>>>,
    search_parameter_factories_by_sort_parameter_name:
        HashMap<String, Arc<SearchQueryParameterFactory<R>>>,
    include_parameter_factories_by_value: HashMap<String, Arc<SearchQueryParameterFactory<R>>>,
    revinclude_parameter_factories_by_value:
        HashMap<String, Arc<SearchQueryRevIncludeParameterFactory>>,
}

impl<R: Resource> SearchQuery<R> {
    fn new(
        resource_table: String,
        resource_column: String,
        identity_filter: Option<IdentityFilter>,
        page_and_count: PageAndCount,
        search_parameter_factories: Vec<SearchQueryParameterFactory<R>>,
        revinclude_parameter_factories: Vec<SearchQueryRevIncludeParameterFactory>,
    ) -> Self {
        let mut by_parameter_name = HashMap::new();
        let mut by_sort_parameter_name = HashMap::new();
        let mut include_by_value = HashMap::new();
        let mut revinclude_by_value = HashMap::new();

        for factory in search_parameter_factories {
            let factory = Arc::new(factory);

            for name in factory.name_and_modified_names() {
                if by_parameter_name.insert(name.clone(), factory.clone()).is_some() {
                    panic!("More than one search parameter configured for parameter name {name}");
                }
            }

            for name in factory.sort_names() {
                if by_sort_parameter_name.insert(name.clone(), factory.clone()).is_some() {
                    panic!(
                        "More than one search parameter configured for sort parameter name {name}"
                    );
                }
            }

            if factory.is_include_parameter() {
                for value in factory.include_parameter_values() {
                    if include_by_value.insert(value.clone(), factory.clone()).is_some() {
                        panic!(
                            "More than one search parameter configured for include parameter value {value}"
                        );
                    }
                }
            }
        }

        for factory in revinclude_parameter_factories {
            let factory = Arc::new(factory);
            for value in factory.revinclude_parameter_values() {
                if revinclude_by_value.insert(value.to_string(), factory.clone()).is_some() {
                    panic!(
                        "More than one revinclude parameter configured for revinclude parameter value {value}"
                    );
                }
            }
        }

        tracing::debug!(
            resource_type = R::type_name(),
            parameter_names = by_parameter_name.len(),
            include_values = include_by_value.len(),
            revinclude_values = revinclude_by_value.len(),
            "Search query registrations built"
        );

        Self {
            resource_table,
            resource_column,
            identity_filter,
            page_and_count,
            search_parameter_factories_by_parameter_name: by_parameter_name,
            search_parameter_factories_by_sort_parameter_name: by_sort_parameter_name,
            include_parameter_factories_by_value: include_by_value,
            revinclude_parameter_factories_by_value: revinclude_by_value,
        }
    }

    pub fn resource_type_name(&self) -> &'static str {
        R::type_name()
    }

    /// Dispatch the raw query parameters of one request and assemble the
    /// SQL. Single-shot: consumes the unconfigured query.
    pub fn configure_parameters(self, query_parameters: &QueryParameters) -> ConfiguredSearchQuery<R> {
        let mut errors = Vec::new();

        self.check_single_value_parameters(query_parameters, &mut errors);

        let search_parameters = self.create_search_parameters(query_parameters, &mut errors);

        let include_parameters = self.create_include_parameters(
            query_parameters.get(PARAMETER_INCLUDE).map_or(&[][..], Vec::as_slice),
            &mut errors,
        );
        let revinclude_parameters = self.create_revinclude_parameters(
            query_parameters.get(PARAMETER_REVINCLUDE).map_or(&[][..], Vec::as_slice),
            &mut errors,
        );

        let sort_parameters = self.create_sort_parameters(
            query_parameters.get(PARAMETER_SORT).map_or(&[][..], Vec::as_slice),
            &mut errors,
        );

        // Assemble the statement text once; placeholder numbering follows
        // the assembly order, identity filter first.
        let mut next_placeholder = 1;
        let mut conjuncts = Vec::new();

        if let Some(identity_filter) = &self.identity_filter {
            let fragment = identity_filter.filter_query();
            if !fragment.is_empty() {
                conjuncts.push(number_placeholders(&fragment, &mut next_placeholder));
            }
        }

        for parameter in search_parameters.iter().filter(|p| p.is_defined()) {
            conjuncts.push(number_placeholders(&parameter.filter_query(), &mut next_placeholder));
        }

        let filter_query = conjuncts.join(" AND ");

        let sort_sql = if sort_parameters.is_empty() {
            String::new()
        } else {
            let fragments: Vec<&str> = sort_parameters.iter().map(|s| s.sql()).collect();
            format!(" ORDER BY {}", fragments.join(", "))
        };

        let include_sql = Self::include_column_sql(&include_parameters);
        let revinclude_sql = Self::include_column_sql(&revinclude_parameters);

        ConfiguredSearchQuery {
            resource_table: self.resource_table,
            resource_column: self.resource_column,
            identity_filter: self.identity_filter,
            page_and_count: self.page_and_count,
            search_parameters,
            sort_parameters,
            include_parameters,
            revinclude_parameters,
            errors,
            filter_query,
            sort_sql,
            include_sql,
            revinclude_sql,
        }
    }

    fn check_single_value_parameters(
        &self,
        query_parameters: &QueryParameters,
        errors: &mut Vec<SearchQueryParameterError>,
    ) {
        for parameter in SINGLE_VALUE_PARAMETERS {
            if query_parameters.get(parameter).is_some_and(|values| values.len() > 1) {
                errors.push(SearchQueryParameterError::new(
                    SearchQueryParameterErrorType::UnsupportedNumberOfValues,
                    parameter,
                    format!("More than one query parameter `{parameter}`"),
                ));
            }
        }
    }

    fn create_search_parameters(
        &self,
        query_parameters: &QueryParameters,
        errors: &mut Vec<SearchQueryParameterError>,
    ) -> Vec<Box<dyn SearchQueryParameter<R>>> {
        let mut search_parameters = Vec::new();

        for (name, values) in query_parameters
            .iter()
            .filter(|(name, _)| !STANDARD_PARAMETERS.contains(&name.as_str()))
        {
            match self.search_parameter_factories_by_parameter_name.get(name) {
                Some(factory) => {
                    for value in values.iter().filter(|v| !v.trim().is_empty()) {
                        let mut parameter = factory.create_query_parameter();
                        parameter.configure(errors, name, value);
                        search_parameters.push(parameter);
                    }
                }
                None => errors.push(SearchQueryParameterError::new(
                    SearchQueryParameterErrorType::UnsupportedParameter,
                    name.clone(),
                    format!("Query parameter `{name}` not supported"),
                )),
            }
        }

        search_parameters
    }

    fn create_sort_parameters(
        &self,
        sort_parameter_values: &[String],
        errors: &mut Vec<SearchQueryParameterError>,
    ) -> Vec<SearchQuerySortParameterConfiguration> {
        let mut sort_parameters = Vec::new();

        // only the first _sort value is used; surplus values were already
        // reported by the single-value check
        let Some(sort_parameter_value) = sort_parameter_values.first() else {
            return sort_parameters;
        };
        if sort_parameter_value.trim().is_empty() {
            return sort_parameters;
        }

        let mut seen_parameter_names = HashSet::new();
        for value in sort_parameter_value.split(',').filter(|v| !v.trim().is_empty()) {
            match self.search_parameter_factories_by_sort_parameter_name.get(value) {
                Some(factory) => {
                    if seen_parameter_names.insert(factory.name()) {
                        sort_parameters.push(factory.create_query_sort_parameter(value));
                    } else {
                        errors.push(
                            SearchQueryParameterError::new(
                                SearchQueryParameterErrorType::UnsupportedNumberOfValues,
                                PARAMETER_SORT,
                                format!(
                                    "More than one {PARAMETER_SORT} query parameter value `{value}`"
                                ),
                            )
                            .with_value(value),
                        );
                    }
                }
                None => errors.push(
                    SearchQueryParameterError::new(
                        SearchQueryParameterErrorType::UnparsableValue,
                        PARAMETER_SORT,
                        format!("{PARAMETER_SORT} query parameter value `{value}` not supported"),
                    )
                    .with_value(value),
                ),
            }
        }

        sort_parameters
    }

    fn create_include_parameters(
        &self,
        include_parameter_values: &[String],
        errors: &mut Vec<SearchQueryParameterError>,
    ) -> Vec<SearchQueryIncludeParameterConfiguration> {
        let mut include_parameters = Vec::new();
        let mut seen_values = HashSet::new();

        for value in include_parameter_values.iter().filter(|v| !v.trim().is_empty()) {
            match self.include_parameter_factories_by_value.get(value.as_str()) {
                Some(factory) => {
                    if seen_values.insert(value.as_str()) {
                        if let Some(configuration) = factory.create_query_include_parameter(value) {
                            include_parameters.push(configuration);
                        }
                    } else {
                        errors.push(
                            SearchQueryParameterError::new(
                                SearchQueryParameterErrorType::UnsupportedNumberOfValues,
                                PARAMETER_INCLUDE,
                                format!(
                                    "More than one {PARAMETER_INCLUDE} query parameter value `{value}`"
                                ),
                            )
                            .with_value(value.clone()),
                        );
                    }
                }
                None => errors.push(
                    SearchQueryParameterError::new(
                        SearchQueryParameterErrorType::UnparsableValue,
                        PARAMETER_INCLUDE,
                        format!(
                            "{PARAMETER_INCLUDE} query parameter value `{value}` not supported"
                        ),
                    )
                    .with_value(value.clone()),
                ),
            }
        }

        include_parameters
    }

    fn create_revinclude_parameters(
        &self,
        revinclude_parameter_values: &[String],
        errors: &mut Vec<SearchQueryParameterError>,
    ) -> Vec<SearchQueryIncludeParameterConfiguration> {
        let mut revinclude_parameters = Vec::new();
        let mut seen_values = HashSet::new();

        for value in revinclude_parameter_values.iter().filter(|v| !v.trim().is_empty()) {
            match self.revinclude_parameter_factories_by_value.get(value.as_str()) {
                Some(factory) => {
                    if seen_values.insert(value.as_str()) {
                        revinclude_parameters.push(factory.create_query_revinclude_parameter(value));
                    } else {
                        errors.push(
                            SearchQueryParameterError::new(
                                SearchQueryParameterErrorType::UnsupportedNumberOfValues,
                                PARAMETER_REVINCLUDE,
                                format!(
                                    "More than one {PARAMETER_REVINCLUDE} query parameter value `{value}`"
                                ),
                            )
                            .with_value(value.clone()),
                        );
                    }
                }
                None => errors.push(
                    SearchQueryParameterError::new(
                        SearchQueryParameterErrorType::UnparsableValue,
                        PARAMETER_REVINCLUDE,
                        format!(
                            "{PARAMETER_REVINCLUDE} query parameter value `{value}` not supported"
                        ),
                    )
                    .with_value(value.clone()),
                ),
            }
        }

        revinclude_parameters
    }

    fn include_column_sql(parameters: &[SearchQueryIncludeParameterConfiguration]) -> String {
        if parameters.is_empty() {
            String::new()
        } else {
            let fragments: Vec<&str> = parameters.iter().map(|p| p.sql()).collect();
            format!(", {}", fragments.join(", "))
        }
    }
}

/// Configured search query: immutable derived SQL plus the accepted
/// parameter configurations of one request.
pub struct ConfiguredSearchQuery<R: Resource> {
    resource_table: String,
    resource_column: String,
    identity_filter: Option<IdentityFilter>,
    page_and_count: PageAndCount,

    search_parameters: Vec<Box<dyn SearchQueryParameter<R>>>,
    sort_parameters: Vec<SearchQuerySortParameterConfiguration>,
    include_parameters: Vec<SearchQueryIncludeParameterConfiguration>,
    revinclude_parameters: Vec<SearchQueryIncludeParameterConfiguration>,
    errors: Vec<SearchQueryParameterError>,

    filter_query: String,
    sort_sql: String,
    include_sql: String,
    revinclude_sql: String,
}

impl<R: Resource> ConfiguredSearchQuery<R> {
    /// Count statement: no sorting, no paging, no include columns.
    pub fn count_sql(&self) -> String {
        let main = format!("SELECT count(*) FROM current_{}", self.resource_table);
        if self.filter_query.is_empty() {
            main
        } else {
            format!("{main} WHERE {}", self.filter_query)
        }
    }

    /// Row statement: column 1 is the primary resource, followed by one
    /// column per accepted include, then per accepted revinclude.
    pub fn search_sql(&self) -> String {
        let main = format!(
            "SELECT {}{}{} FROM current_{}",
            self.resource_column, self.include_sql, self.revinclude_sql, self.resource_table
        );
        let filtered = if self.filter_query.is_empty() {
            main
        } else {
            format!("{main} WHERE {}", self.filter_query)
        };
        format!("{filtered}{}{}", self.sort_sql, self.page_and_count.sql())
    }

    /// Bind values for the `$n` placeholders of both statements, in
    /// placeholder order: identity filter first, then each defined search
    /// parameter in dispatch order.
    pub fn bind_values(&self) -> Vec<SqlValue> {
        let mut values = Vec::new();
        let mut index = 0;

        if let Some(identity_filter) = &self.identity_filter {
            for subquery_index in 1..=identity_filter.sql_parameter_count() {
                index += 1;
                values.push(identity_filter.bind_parameter(index, subquery_index));
            }
        }

        for parameter in self.search_parameters.iter().filter(|p| p.is_defined()) {
            for subquery_index in 1..=parameter.sql_parameter_count() {
                index += 1;
                values.push(parameter.bind_value(index, subquery_index));
            }
        }

        values
    }

    pub fn page_and_count(&self) -> PageAndCount {
        self.page_and_count
    }

    /// Accumulated request-level parameter errors, for rendering as
    /// OperationOutcome issues. Never empty-checked internally: an erroneous
    /// request still produces executable SQL.
    pub fn unsupported_query_parameters(&self) -> &[SearchQueryParameterError] {
        &self.errors
    }

    /// Rewrite the managed query parameters of `bundle_uri` to the canonical
    /// form of the *accepted* parameter set: parameter names sorted, then
    /// `_sort`, `_include` and `_revinclude` reconstructed from their
    /// configurations. Idempotent, so repeated pagination requests produce
    /// identical self links modulo page number.
    pub fn configure_bundle_uri(&self, bundle_uri: &mut Url) {
        let mut values_by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for parameter in self.search_parameters.iter().filter(|p| p.is_defined()) {
            values_by_name
                .entry(parameter.bundle_uri_query_parameter_name())
                .or_default()
                .push(parameter.bundle_uri_query_parameter_value());
        }

        let managed: HashSet<&str> = values_by_name
            .keys()
            .map(String::as_str)
            .chain([PARAMETER_SORT, PARAMETER_INCLUDE, PARAMETER_REVINCLUDE])
            .collect();

        let retained: Vec<(String, String)> = bundle_uri
            .query_pairs()
            .filter(|(name, _)| !managed.contains(name.as_ref()))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        {
            let mut pairs = bundle_uri.query_pairs_mut();
            pairs.clear();

            for (name, value) in &retained {
                pairs.append_pair(name, value);
            }

            for (name, values) in &values_by_name {
                for value in values {
                    pairs.append_pair(name, value);
                }
            }

            if !self.sort_parameters.is_empty() {
                let value: Vec<String> = self
                    .sort_parameters
                    .iter()
                    .map(SearchQuerySortParameterConfiguration::bundle_uri_query_parameter_value_part)
                    .collect();
                pairs.append_pair(PARAMETER_SORT, &value.join(","));
            }
            for configuration in &self.include_parameters {
                pairs.append_pair(
                    PARAMETER_INCLUDE,
                    &configuration.bundle_uri_query_parameter_value(),
                );
            }
            for configuration in &self.revinclude_parameters {
                pairs.append_pair(
                    PARAMETER_REVINCLUDE,
                    &configuration.bundle_uri_query_parameter_value(),
                );
            }
        }

        if bundle_uri.query() == Some("") {
            bundle_uri.set_query(None);
        }
    }

    /// Materialize referenced resources needed by reference-valued
    /// parameters for in-memory matching. All failures are collected, not
    /// short-circuited, and surfaced as one aggregate error.
    pub fn resolve_references_for_matching(
        &mut self,
        resource: &R,
        dao_provider: &dyn DaoProvider,
    ) -> Result<(), ReferenceResolutionError> {
        let mut sources = Vec::new();

        for parameter in self.search_parameters.iter_mut().filter(|p| p.is_defined()) {
            if let Err(error) = parameter.resolve_references_for_matching(resource, dao_provider) {
                sources.push(error);
            }
        }

        if sources.is_empty() {
            Ok(())
        } else {
            Err(ReferenceResolutionError { sources })
        }
    }

    /// In-memory match of a resource against the configured criteria:
    /// true iff every defined parameter matches (vacuously true with none).
    pub fn matches(&self, resource: &R) -> bool {
        self.search_parameters
            .iter()
            .filter(|p| p.is_defined())
            .all(|p| p.matches(resource))
    }

    /// Route a fetched include-column resource to the configuration that
    /// produced the column. Column 1 is the primary resource; columns
    /// `2..=1+n` are includes in configuration order, followed by
    /// revincludes.
    ///
    /// # Panics
    ///
    /// Panics if `column_index` falls outside both ranges — the caller is
    /// iterating columns that this query did not produce.
    pub fn modify_include_resource(&self, column_index: usize, resource: &mut Value) {
        let include_count = self.include_parameters.len();
        let revinclude_count = self.revinclude_parameters.len();

        if column_index >= 2 {
            let include_index = column_index - 2;
            if include_index < include_count {
                self.include_parameters[include_index].modify_include_resource(resource);
                return;
            }

            let revinclude_index = include_index - include_count;
            if revinclude_index < revinclude_count {
                self.revinclude_parameters[revinclude_index].modify_include_resource(resource);
                return;
            }
        }

        tracing::warn!(
            column_index,
            include_count,
            revinclude_count,
            "Unexpected include column index"
        );
        panic!(
            "Unexpected column index {column_index}, expected 2..={} (include: {include_count}, revinclude: {revinclude_count})",
            1 + include_count + revinclude_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use serde_json::json;

    use crate::identity::testing::OrganizationIdentityFilter;
    use crate::include::SearchQueryIncludeParameterConfiguration;
    use crate::types::{ReferenceParameter, ReferenceTarget, TokenParameter};

    struct Task(Value);

    impl Resource for Task {
        fn type_name() -> &'static str {
            "Task"
        }

        fn resource_type(&self) -> &str {
            "Task"
        }
    }

    fn status_factory() -> SearchQueryParameterFactory<Task> {
        SearchQueryParameterFactory::new("status", || {
            Box::new(
                TokenParameter::new("status", "task->>'status'", |task: &Task| {
                    task.0["status"].as_str().map(str::to_string)
                })
                .with_allowed_codes(vec!["draft", "requested", "completed", "failed"]),
            )
        })
        .with_name_modifiers(vec![":not"])
    }

    fn requester_factory() -> SearchQueryParameterFactory<Task> {
        SearchQueryParameterFactory::new("requester", || {
            Box::new(ReferenceParameter::new(
                "requester",
                "Task",
                "task->'requester'->>'reference'",
                vec![
                    ReferenceTarget {
                        resource_type_name: "Organization",
                        resource_table: "organizations",
                        resource_column: "organization",
                    },
                    ReferenceTarget {
                        resource_type_name: "Practitioner",
                        resource_table: "practitioners",
                        resource_column: "practitioner",
                    },
                ],
                |task: &Task| task.0["requester"]["reference"].as_str().map(str::to_string),
            ))
        })
        .with_include_parameter_values(vec![
            "Task:requester".to_string(),
            "Task:requester:Organization".to_string(),
            "Task:requester:Practitioner".to_string(),
        ])
    }

    fn provenance_revinclude_factory() -> SearchQueryRevIncludeParameterFactory {
        SearchQueryRevIncludeParameterFactory::new(
            vec!["Provenance:target".to_string(), "Provenance:target:Task".to_string()],
            |parts| {
                SearchQueryIncludeParameterConfiguration::new(
                    "(SELECT jsonb_build_array(provenance) FROM current_provenances \
                     WHERE provenance->'target'->>'reference' = concat('Task/', task->>'id')) \
                     AS provenances",
                    parts.clone(),
                )
                .with_modifier(Box::new(|resource| {
                    resource["meta"]["source"] = json!("revinclude");
                }))
            },
        )
    }

    fn task_query(page_and_count: PageAndCount) -> SearchQuery<Task> {
        SearchQueryBuilder::create("tasks", "task", page_and_count)
            .with(status_factory())
            .with(requester_factory())
            .with_revinclude(provenance_revinclude_factory())
            .build()
    }

    fn parameters(entries: &[(&str, &[&str])]) -> QueryParameters {
        entries
            .iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn empty_request_produces_unfiltered_statements() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[]));

        assert!(configured.unsupported_query_parameters().is_empty());
        assert_eq!(configured.count_sql(), "SELECT count(*) FROM current_tasks");
        assert_eq!(
            configured.search_sql(),
            "SELECT task FROM current_tasks LIMIT 20"
        );
        assert!(configured.bind_values().is_empty());
    }

    #[test]
    fn unknown_parameter_is_reported_but_does_not_abort() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[("foo", &["bar"])]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnsupportedParameter
        );
        assert_eq!(errors[0].parameter_name(), "foo");
        assert_eq!(configured.count_sql(), "SELECT count(*) FROM current_tasks");
    }

    #[test]
    fn unknown_parameter_leaves_known_parameters_intact() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[
            ("foo", &["bar"]),
            ("status", &["completed"]),
        ]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnsupportedParameter
        );
        assert_eq!(errors[0].parameter_name(), "foo");

        // only the known parameter's fragment ends up in the filter
        assert_eq!(
            configured.count_sql(),
            "SELECT count(*) FROM current_tasks WHERE task->>'status' = $1"
        );
        assert_eq!(
            configured.bind_values(),
            vec![SqlValue::Text("completed".into())]
        );
    }

    #[test]
    fn repeated_single_value_parameter_is_reported() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured =
            query.configure_parameters(&parameters(&[("_sort", &["status", "-status"])]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnsupportedNumberOfValues
        );
        assert_eq!(errors[0].parameter_name(), "_sort");
        // only the first value is used
        assert!(configured.search_sql().contains("ORDER BY task->>'status' LIMIT"));
    }

    #[test]
    fn identity_filter_is_first_conjunct_and_first_bind_value() {
        let query = SearchQueryBuilder::create("tasks", "task", PageAndCount::from(1, 20))
            .with_identity_filter(OrganizationIdentityFilter {
                column: "task",
                organization: "Organization/org-1".to_string(),
            })
            .with(status_factory())
            .build();

        let configured = query.configure_parameters(&parameters(&[("status", &["completed"])]));

        assert!(configured.unsupported_query_parameters().is_empty());
        assert_eq!(
            configured.count_sql(),
            "SELECT count(*) FROM current_tasks \
             WHERE task->'requester'->>'reference' = $1 AND task->>'status' = $2"
        );
        assert_eq!(
            configured.bind_values(),
            vec![
                SqlValue::Text("Organization/org-1".into()),
                SqlValue::Text("completed".into()),
            ]
        );
    }

    #[test]
    fn empty_identity_filter_fragment_is_skipped() {
        use crate::identity::testing::UnrestrictedIdentityFilter;

        let query = SearchQueryBuilder::create("tasks", "task", PageAndCount::from(1, 20))
            .with_identity_filter(UnrestrictedIdentityFilter)
            .with(status_factory())
            .build();

        let configured = query.configure_parameters(&parameters(&[("status", &["completed"])]));
        assert_eq!(
            configured.count_sql(),
            "SELECT count(*) FROM current_tasks WHERE task->>'status' = $1"
        );
        assert_eq!(
            configured.bind_values(),
            vec![SqlValue::Text("completed".into())]
        );
    }

    #[test]
    fn repeated_filter_values_each_contribute_a_conjunct() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured =
            query.configure_parameters(&parameters(&[("status", &["completed", "failed"])]));

        assert_eq!(
            configured.count_sql(),
            "SELECT count(*) FROM current_tasks \
             WHERE task->>'status' = $1 AND task->>'status' = $2"
        );
        assert_eq!(
            configured.bind_values(),
            vec![
                SqlValue::Text("completed".into()),
                SqlValue::Text("failed".into()),
            ]
        );
    }

    #[test]
    fn unparsable_value_leaves_parameter_out_of_sql() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[("status", &["nope"])]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnparsableValue
        );
        assert_eq!(configured.count_sql(), "SELECT count(*) FROM current_tasks");
        assert!(configured.bind_values().is_empty());
    }

    #[test]
    fn sort_tokens_dedup_by_parameter() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured =
            query.configure_parameters(&parameters(&[("_sort", &["status,-status"])]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnsupportedNumberOfValues
        );
        assert_eq!(errors[0].parameter_value(), Some("-status"));
        assert!(configured.search_sql().contains(" ORDER BY task->>'status' LIMIT"));
    }

    #[test]
    fn unknown_sort_token_is_unparsable() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[("_sort", &["unknown"])]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnparsableValue
        );
        assert_eq!(errors[0].parameter_name(), "_sort");
        assert!(!configured.search_sql().contains("ORDER BY"));
    }

    #[test]
    fn duplicate_include_value_is_reported_once() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[(
            "_include",
            &["Task:requester:Organization", "Task:requester:Organization"],
        )]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnsupportedNumberOfValues
        );
        // the first occurrence still produces its column
        assert!(configured.search_sql().contains("AS organizations"));
    }

    #[test]
    fn unknown_include_value_is_unparsable() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured =
            query.configure_parameters(&parameters(&[("_include", &["Task:owner"])]));

        let errors = configured.unsupported_query_parameters();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].error_type(),
            SearchQueryParameterErrorType::UnparsableValue
        );
        assert_eq!(errors[0].parameter_name(), "_include");
    }

    #[test]
    fn full_request_assembles_statement_in_order() {
        let raw = parameters(&[
            ("status", &["completed"]),
            ("_include", &["Task:requester:Organization"]),
            ("_revinclude", &["Provenance:target"]),
            ("_sort", &["-status"]),
            ("_page", &["2"]),
            ("_count", &["5"]),
        ]);
        let page_and_count = PageAndCount::from_query_parameters(&raw, 20);
        let query = task_query(page_and_count);
        let configured = query.configure_parameters(&raw);

        assert!(configured.unsupported_query_parameters().is_empty());
        assert_eq!(
            configured.count_sql(),
            "SELECT count(*) FROM current_tasks WHERE task->>'status' = $1"
        );
        assert_eq!(
            configured.search_sql(),
            "SELECT task, \
             (SELECT jsonb_build_array(organization) FROM current_organizations \
             WHERE concat('Organization/', organization->>'id') = task->'requester'->>'reference') \
             AS organizations, \
             (SELECT jsonb_build_array(provenance) FROM current_provenances \
             WHERE provenance->'target'->>'reference' = concat('Task/', task->>'id')) \
             AS provenances \
             FROM current_tasks \
             WHERE task->>'status' = $1 \
             ORDER BY task->>'status' DESC \
             LIMIT 5 OFFSET 5"
        );
        assert_eq!(
            configured.bind_values(),
            vec![SqlValue::Text("completed".into())]
        );
    }

    #[test]
    fn bundle_uri_is_rewritten_to_canonical_form() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[
            ("status", &["completed"]),
            ("requester", &["Organization/abc"]),
            ("_include", &["Task:requester:Organization"]),
            ("_sort", &["-status"]),
        ]));

        let mut bundle_uri =
            Url::parse("https://fhir.example.org/fhir/Task?status=old&foo=bar&_include=stale")
                .unwrap();
        configured.configure_bundle_uri(&mut bundle_uri);

        let pairs: Vec<(String, String)> = bundle_uri
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("foo".to_string(), "bar".to_string()),
                ("requester".to_string(), "Organization/abc".to_string()),
                ("status".to_string(), "completed".to_string()),
                ("_sort".to_string(), "-status".to_string()),
                ("_include".to_string(), "Task:requester:Organization".to_string()),
            ]
        );

        // idempotent
        let before = bundle_uri.clone();
        configured.configure_bundle_uri(&mut bundle_uri);
        assert_eq!(bundle_uri, before);
    }

    #[test]
    fn bundle_uri_without_parameters_loses_its_query() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[]));

        // _sort is always managed, so a stale value is removed even when
        // nothing replaces it
        let mut bundle_uri = Url::parse("https://fhir.example.org/fhir/Task?_sort=stale").unwrap();
        configured.configure_bundle_uri(&mut bundle_uri);
        assert_eq!(bundle_uri.as_str(), "https://fhir.example.org/fhir/Task");
    }

    #[test]
    fn matches_requires_all_defined_parameters() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[
            ("status", &["completed"]),
            ("requester", &["Organization/abc"]),
        ]));

        assert!(configured.matches(&Task(json!({
            "status": "completed",
            "requester": {"reference": "Organization/abc"}
        }))));
        assert!(!configured.matches(&Task(json!({
            "status": "draft",
            "requester": {"reference": "Organization/abc"}
        }))));
        assert!(!configured.matches(&Task(json!({
            "status": "completed",
            "requester": {"reference": "Organization/other"}
        }))));
    }

    #[test]
    fn matches_is_vacuously_true_without_parameters() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[]));
        assert!(configured.matches(&Task(json!({}))));
    }

    struct FailingDaoProvider;

    impl DaoProvider for FailingDaoProvider {
        fn read_resource(&self, _: &str, _: &str) -> Result<Option<Value>, StorageError> {
            Err(StorageError::Connection("down".into()))
        }
    }

    #[test]
    fn reference_resolution_collects_all_failures() {
        let query = task_query(PageAndCount::from(1, 20));
        let mut configured =
            query.configure_parameters(&parameters(&[("requester", &["abc", "def"])]));

        let task = Task(json!({}));
        let error = configured
            .resolve_references_for_matching(&task, &FailingDaoProvider)
            .unwrap_err();
        assert_eq!(error.sources.len(), 2);
    }

    struct NoopDaoProvider;

    impl DaoProvider for NoopDaoProvider {
        fn read_resource(&self, _: &str, _: &str) -> Result<Option<Value>, StorageError> {
            Ok(None)
        }
    }

    #[test]
    fn reference_resolution_without_failures_succeeds() {
        let query = task_query(PageAndCount::from(1, 20));
        let mut configured =
            query.configure_parameters(&parameters(&[("requester", &["abc"])]));

        let task = Task(json!({}));
        assert!(
            configured
                .resolve_references_for_matching(&task, &NoopDaoProvider)
                .is_ok()
        );
    }

    fn configured_with_includes() -> ConfiguredSearchQuery<Task> {
        task_query(PageAndCount::from(1, 20)).configure_parameters(&parameters(&[
            (
                "_include",
                &["Task:requester:Organization", "Task:requester:Practitioner"],
            ),
            ("_revinclude", &["Provenance:target"]),
        ]))
    }

    #[test]
    fn include_columns_route_by_position() {
        let configured = configured_with_includes();
        let mut resource = json!({"resourceType": "Organization"});

        // include columns apply no modifier
        configured.modify_include_resource(2, &mut resource);
        configured.modify_include_resource(3, &mut resource);
        assert_eq!(resource, json!({"resourceType": "Organization"}));

        // the revinclude column applies its modifier
        configured.modify_include_resource(4, &mut resource);
        assert_eq!(resource["meta"]["source"], json!("revinclude"));
    }

    #[test]
    #[should_panic(expected = "Unexpected column index 1")]
    fn primary_resource_column_is_not_an_include_column() {
        let mut resource = json!({});
        configured_with_includes().modify_include_resource(1, &mut resource);
    }

    #[test]
    #[should_panic(expected = "Unexpected column index 5")]
    fn column_index_past_last_revinclude_panics() {
        let mut resource = json!({});
        configured_with_includes().modify_include_resource(5, &mut resource);
    }

    #[test]
    #[should_panic(expected = "More than one search parameter configured for parameter name status")]
    fn duplicate_parameter_name_registration_panics() {
        let _ = SearchQueryBuilder::create("tasks", "task", PageAndCount::from(1, 20))
            .with(status_factory())
            .with(status_factory())
            .build();
    }

    #[test]
    #[should_panic(expected = "More than one revinclude parameter configured")]
    fn duplicate_revinclude_value_registration_panics() {
        let _: SearchQuery<Task> =
            SearchQueryBuilder::create("tasks", "task", PageAndCount::from(1, 20))
                .with_revinclude(provenance_revinclude_factory())
                .with_revinclude(provenance_revinclude_factory())
                .build();
    }

    #[test]
    fn blank_values_are_ignored() {
        let query = task_query(PageAndCount::from(1, 20));
        let configured = query.configure_parameters(&parameters(&[
            ("status", &[" "]),
            ("_include", &[""]),
            ("_sort", &[" "]),
        ]));

        assert!(configured.unsupported_query_parameters().is_empty());
        assert_eq!(
            configured.search_sql(),
            "SELECT task FROM current_tasks LIMIT 20"
        );
    }

    struct MapDaoProvider(HashMap<(String, String), Value>);

    impl DaoProvider for MapDaoProvider {
        fn read_resource(
            &self,
            resource_type: &str,
            id: &str,
        ) -> Result<Option<Value>, StorageError> {
            Ok(self
                .0
                .get(&(resource_type.to_string(), id.to_string()))
                .cloned())
        }
    }

    #[test]
    fn resolution_refines_subsequent_matching() {
        let query = task_query(PageAndCount::from(1, 20));
        let mut configured =
            query.configure_parameters(&parameters(&[("requester", &["abc"])]));

        let dao = MapDaoProvider(HashMap::from([(
            ("Practitioner".to_string(), "abc".to_string()),
            json!({"resourceType": "Practitioner", "id": "abc"}),
        )]));

        let matching = Task(json!({"requester": {"reference": "Practitioner/abc"}}));
        let other = Task(json!({"requester": {"reference": "Organization/abc"}}));

        configured
            .resolve_references_for_matching(&matching, &dao)
            .unwrap();
        assert!(configured.matches(&matching));
        assert!(!configured.matches(&other));
    }
}
