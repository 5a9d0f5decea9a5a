//! Reference search parameter: matches a reference element, supports
//! `_include` column generation and reference resolution for in-memory
//! matching.

use fhirlink_core::{Resource, parse_reference};

use crate::error::{SearchQueryParameterError, SearchQueryParameterErrorType, StorageError};
use crate::include::{IncludeParts, SearchQueryIncludeParameterConfiguration};
use crate::parameters::SearchQueryParameter;
use crate::query::DaoProvider;
use crate::sql::SqlValue;

/// One resource type a reference parameter may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceTarget {
    pub resource_type_name: &'static str,
    /// Table name without the `current_` prefix, e.g. `organizations`.
    pub resource_table: &'static str,
    /// JSONB column of that table, e.g. `organization`.
    pub resource_column: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReferenceValue {
    /// `Type/id` with a declared target type.
    TypeAndId { resource_type: String, id: String },
    /// Bare logical id; any declared target type may match.
    Id(String),
    /// Absolute URL.
    Url(String),
}

type ReferenceAccessor<R> = Box<dyn Fn(&R) -> Option<String> + Send + Sync>;

/// Matches a reference element (`requester`, `organization`, ...) against a
/// `Type/id` value, a bare id or an absolute URL.
///
/// A bare id expands to one disjunct per declared target type, each with its
/// own bind value, so the parameter matches whichever target type the
/// reference actually uses.
pub struct ReferenceParameter<R: Resource> {
    name: &'static str,
    source_resource_type_name: &'static str,
    /// SQL expression yielding the reference text, e.g.
    /// `endpoint->'managingOrganization'->>'reference'`.
    reference_column: &'static str,
    targets: Vec<ReferenceTarget>,
    accessor: ReferenceAccessor<R>,

    raw_value: Option<String>,
    value: Option<ReferenceValue>,
    /// Target type confirmed via lookup for a bare-id value.
    resolved_type: Option<&'static str>,
}

impl<R: Resource> ReferenceParameter<R> {
    pub fn new(
        name: &'static str,
        source_resource_type_name: &'static str,
        reference_column: &'static str,
        targets: Vec<ReferenceTarget>,
        accessor: impl Fn(&R) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            source_resource_type_name,
            reference_column,
            targets,
            accessor: Box::new(accessor),
            raw_value: None,
            value: None,
            resolved_type: None,
        }
    }

    fn target_for(&self, resource_type: &str) -> Option<&ReferenceTarget> {
        self.targets
            .iter()
            .find(|t| t.resource_type_name == resource_type)
    }
}

impl<R: Resource> SearchQueryParameter<R> for ReferenceParameter<R> {
    fn configure(
        &mut self,
        errors: &mut Vec<SearchQueryParameterError>,
        query_parameter_name: &str,
        query_parameter_value: &str,
    ) {
        let value = if query_parameter_value.contains("://") {
            ReferenceValue::Url(query_parameter_value.to_string())
        } else if query_parameter_value.contains('/') {
            let reference = match parse_reference(query_parameter_value) {
                Ok(reference) => reference,
                Err(error) => {
                    errors.push(SearchQueryParameterError::unparsable(
                        query_parameter_name,
                        query_parameter_value,
                        error,
                    ));
                    return;
                }
            };
            if self.target_for(&reference.resource_type).is_none() {
                errors.push(
                    SearchQueryParameterError::new(
                        SearchQueryParameterErrorType::UnparsableValue,
                        query_parameter_name,
                        format!(
                            "Resource type `{}` is not a valid target",
                            reference.resource_type
                        ),
                    )
                    .with_value(query_parameter_value),
                );
                return;
            }
            ReferenceValue::TypeAndId {
                resource_type: reference.resource_type,
                id: reference.id,
            }
        } else {
            ReferenceValue::Id(query_parameter_value.to_string())
        };

        self.raw_value = Some(query_parameter_value.to_string());
        self.value = Some(value);
    }

    fn is_defined(&self) -> bool {
        self.value.is_some()
    }

    fn filter_query(&self) -> String {
        match &self.value {
            Some(ReferenceValue::Id(_)) if self.targets.len() > 1 => {
                let disjuncts: Vec<String> = self
                    .targets
                    .iter()
                    .map(|_| format!("{} = ?", self.reference_column))
                    .collect();
                format!("({})", disjuncts.join(" OR "))
            }
            _ => format!("{} = ?", self.reference_column),
        }
    }

    fn sql_parameter_count(&self) -> usize {
        match &self.value {
            Some(ReferenceValue::Id(_)) => self.targets.len(),
            _ => 1,
        }
    }

    fn bind_value(&self, _parameter_index: usize, subquery_parameter_index: usize) -> SqlValue {
        match &self.value {
            Some(ReferenceValue::TypeAndId { resource_type, id }) => {
                SqlValue::Text(format!("{resource_type}/{id}"))
            }
            Some(ReferenceValue::Id(id)) => {
                let target = self.targets[subquery_parameter_index - 1];
                SqlValue::Text(format!("{}/{id}", target.resource_type_name))
            }
            Some(ReferenceValue::Url(url)) => SqlValue::Text(url.clone()),
            None => SqlValue::Null,
        }
    }

    fn bundle_uri_query_parameter_name(&self) -> String {
        self.name.to_string()
    }

    fn bundle_uri_query_parameter_value(&self) -> String {
        self.raw_value.clone().unwrap_or_default()
    }

    fn sort_sql(&self) -> String {
        self.reference_column.to_string()
    }

    fn include_sql(
        &self,
        include_parts: &IncludeParts,
    ) -> Option<SearchQueryIncludeParameterConfiguration> {
        self.targets
            .iter()
            .find(|target| {
                include_parts.matches(
                    self.source_resource_type_name,
                    self.name,
                    target.resource_type_name,
                )
            })
            .map(|target| {
                let sql = format!(
                    "(SELECT jsonb_build_array({column}) FROM current_{table} WHERE concat('{resource_type}/', {column}->>'id') = {reference}) AS {table}",
                    column = target.resource_column,
                    table = target.resource_table,
                    resource_type = target.resource_type_name,
                    reference = self.reference_column,
                );
                SearchQueryIncludeParameterConfiguration::new(sql, include_parts.clone())
            })
    }

    fn resolve_references_for_matching(
        &mut self,
        _resource: &R,
        dao_provider: &dyn DaoProvider,
    ) -> Result<(), StorageError> {
        // a bare id leaves the target type open; a lookup pins it down so
        // matching compares against the type the reference actually uses
        let Some(ReferenceValue::Id(id)) = &self.value else {
            return Ok(());
        };

        for target in &self.targets {
            if dao_provider
                .read_resource(target.resource_type_name, id)?
                .is_some()
            {
                self.resolved_type = Some(target.resource_type_name);
                return Ok(());
            }
        }

        // referencing a resource that does not exist is a non-match, not an
        // error
        Ok(())
    }

    fn matches(&self, resource: &R) -> bool {
        let Some(value) = &self.value else {
            return false;
        };
        let Some(reference) = (self.accessor)(resource) else {
            return false;
        };

        match value {
            ReferenceValue::TypeAndId { resource_type, id } => {
                reference == format!("{resource_type}/{id}")
            }
            ReferenceValue::Id(id) => match self.resolved_type {
                Some(resolved_type) => reference == format!("{resolved_type}/{id}"),
                None => self
                    .targets
                    .iter()
                    .any(|t| reference == format!("{}/{id}", t.resource_type_name)),
            },
            ReferenceValue::Url(url) => reference == *url,
        }
    }
}
