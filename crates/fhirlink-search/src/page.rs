//! Pagination window derived from `_page` and `_count` query parameters.
//!
//! `_page` is 1-based; page 0 means "count only, fetch no rows". Raw values
//! are normalized here rather than rejected: a malformed or hostile
//! `_page`/`_count` pair must never abort the request or overflow the
//! `LIMIT`/`OFFSET` arithmetic.

use std::collections::BTreeMap;

/// The `_page` query parameter name.
pub const PARAMETER_PAGE: &str = "_page";
/// The `_count` query parameter name.
pub const PARAMETER_COUNT: &str = "_count";

/// Normalized, overflow-checked pagination window.
///
/// Immutable; constructed once per request. `page * count` is guaranteed to
/// fit a signed 32-bit integer, so the derived `OFFSET` does too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAndCount {
    page: i32,
    count: i32,
}

impl PageAndCount {
    /// Create a window from already-parsed values. Negative inputs clamp to 0.
    pub fn from(page: i32, count: i32) -> Self {
        Self {
            page: page.max(0),
            count: count.max(0),
        }
    }

    /// Canonical 0-row window for existence checks (`LIMIT 0`).
    pub fn exists() -> Self {
        Self::from(0, 0)
    }

    /// Canonical 1-row window for single-resource reads (`LIMIT 1`).
    pub fn single() -> Self {
        Self::from(1, 1)
    }

    /// Parse the first `_page` and `_count` values from raw query parameters.
    ///
    /// Absent or unparsable values fall back to page 1 and
    /// `default_page_count`; negative parsed values clamp to 0. If
    /// `page * count` would exceed `i32::MAX`, both reset to
    /// `(1, default_page_count)`.
    pub fn from_query_parameters(
        query_parameters: &BTreeMap<String, Vec<String>>,
        default_page_count: i32,
    ) -> Self {
        let page = Self::first_value_or(query_parameters, PARAMETER_PAGE, 1);
        let count = Self::first_value_or(query_parameters, PARAMETER_COUNT, default_page_count);

        if page as i64 * count as i64 > i32::MAX as i64 {
            Self::from(1, default_page_count)
        } else {
            Self::from(page, count)
        }
    }

    fn first_value_or(
        query_parameters: &BTreeMap<String, Vec<String>>,
        parameter: &str,
        default: i32,
    ) -> i32 {
        query_parameters
            .get(parameter)
            .and_then(|values| values.first())
            .and_then(|value| value.parse::<i32>().ok())
            .unwrap_or(default)
    }

    pub fn page(&self) -> i32 {
        self.page
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    /// `LIMIT`/`OFFSET` fragment with a leading space; `OFFSET` is omitted
    /// for the first page.
    pub fn sql(&self) -> String {
        if self.page > 1 {
            // widen so windows built directly from large values cannot
            // overflow the offset
            let offset = (self.page as i64 - 1) * self.count as i64;
            format!(" LIMIT {} OFFSET {offset}", self.count)
        } else {
            format!(" LIMIT {}", self.count)
        }
    }

    /// Number of the last non-empty page for the given total; 0 if the page
    /// size is 0.
    pub fn last_page(&self, total: i32) -> i32 {
        if self.count < 1 {
            0
        } else {
            // widen so total near i32::MAX cannot overflow the ceil division
            ((total as i64 + self.count as i64 - 1) / self.count as i64) as i32
        }
    }

    pub fn is_last_page(&self, total: i32) -> bool {
        self.page >= self.last_page(total)
    }

    /// True when the requested window yields no rows: the caller should
    /// execute only the count query and return an empty page with the total.
    pub fn is_count_only(&self, total: i32) -> bool {
        self.page < 1 || self.count < 1 || self.page > self.last_page(total)
    }
}
