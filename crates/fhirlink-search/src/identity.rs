//! Row-level access-control predicate supplied by the authorization layer.

use crate::sql::SqlValue;

/// Opaque identity-based row filter.
///
/// The authorization subsystem implements this per resource type and caller
/// identity; the search subsystem only places the fragment as the first
/// conjunct of the `WHERE` clause and binds its parameters before any
/// search-parameter values. The fragment uses `?` placeholders like search
/// parameters do.
pub trait SearchQueryIdentityFilter {
    /// Boolean SQL expression restricting visible rows; an empty string
    /// means no restriction.
    fn filter_query(&self) -> String;

    /// Number of `?` placeholders in the filter fragment.
    fn sql_parameter_count(&self) -> usize;

    /// Value for one placeholder; called once per declared parameter with
    /// `parameter_index` ascending from 1. `subquery_parameter_index` is the
    /// 1-based position within this filter's own fragment.
    fn bind_parameter(&self, parameter_index: usize, subquery_parameter_index: usize) -> SqlValue;
}
