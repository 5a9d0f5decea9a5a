//! Token search parameter: equality against a coded element.

use fhirlink_core::Resource;

use crate::error::{SearchQueryParameterError, SearchQueryParameterErrorType};
use crate::parameters::SearchQueryParameter;
use crate::sql::SqlValue;

const NOT_MODIFIER: &str = ":not";

type CodeAccessor<R> = Box<dyn Fn(&R) -> Option<String> + Send + Sync>;

/// Matches a coded element (status, code, category) against one token value.
///
/// Supports the `:not` name modifier for negation. An optional allowed-code
/// list turns unknown codes into unparsable-value errors instead of queries
/// that can never match.
pub struct TokenParameter<R: Resource> {
    name: &'static str,
    column: &'static str,
    allowed_codes: Option<Vec<&'static str>>,
    accessor: CodeAccessor<R>,

    value: Option<String>,
    negated: bool,
}

impl<R: Resource> TokenParameter<R> {
    /// `column` is the SQL expression yielding the code text, e.g.
    /// `task->>'status'`; `accessor` reads the same element from an
    /// in-memory resource.
    pub fn new(
        name: &'static str,
        column: &'static str,
        accessor: impl Fn(&R) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            column,
            allowed_codes: None,
            accessor: Box::new(accessor),
            value: None,
            negated: false,
        }
    }

    /// Restrict accepted values to a closed code system.
    #[must_use]
    pub fn with_allowed_codes(mut self, allowed_codes: Vec<&'static str>) -> Self {
        self.allowed_codes = Some(allowed_codes);
        self
    }
}

impl<R: Resource> SearchQueryParameter<R> for TokenParameter<R> {
    fn configure(
        &mut self,
        errors: &mut Vec<SearchQueryParameterError>,
        query_parameter_name: &str,
        query_parameter_value: &str,
    ) {
        self.negated = query_parameter_name.ends_with(NOT_MODIFIER);

        if let Some(allowed_codes) = &self.allowed_codes
            && !allowed_codes.contains(&query_parameter_value)
        {
            errors.push(
                SearchQueryParameterError::new(
                    SearchQueryParameterErrorType::UnparsableValue,
                    query_parameter_name,
                    format!("Value `{query_parameter_value}` is not a known code"),
                )
                .with_value(query_parameter_value),
            );
            return;
        }

        self.value = Some(query_parameter_value.to_string());
    }

    fn is_defined(&self) -> bool {
        self.value.is_some()
    }

    fn filter_query(&self) -> String {
        if self.negated {
            format!("{} <> ?", self.column)
        } else {
            format!("{} = ?", self.column)
        }
    }

    fn sql_parameter_count(&self) -> usize {
        1
    }

    fn bind_value(&self, _parameter_index: usize, _subquery_parameter_index: usize) -> SqlValue {
        match &self.value {
            Some(value) => SqlValue::Text(value.clone()),
            None => SqlValue::Null,
        }
    }

    fn bundle_uri_query_parameter_name(&self) -> String {
        if self.negated {
            format!("{}{NOT_MODIFIER}", self.name)
        } else {
            self.name.to_string()
        }
    }

    fn bundle_uri_query_parameter_value(&self) -> String {
        self.value.clone().unwrap_or_default()
    }

    fn sort_sql(&self) -> String {
        self.column.to_string()
    }

    fn matches(&self, resource: &R) -> bool {
        let Some(value) = &self.value else {
            return false;
        };

        let equal = (self.accessor)(resource).as_deref() == Some(value.as_str());
        equal != self.negated
    }
}
