//! Error types of the search subsystem.
//!
//! Request-level parameter problems are data, not exceptions: they are
//! accumulated as [`SearchQueryParameterError`] records and reported to the
//! caller alongside the (partial) search result, typically rendered as
//! OperationOutcome issues. Only database failures during reference
//! resolution surface as `Err` values.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Classification of an invalid or unsupported query parameter occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchQueryParameterErrorType {
    UnsupportedParameter,
    UnsupportedNumberOfValues,
    UnparsableValue,
}

/// Immutable record of one invalid or unsupported query parameter.
///
/// Never returned as an `Err`; the query executes against the parameters
/// that could be validated and the errors accompany the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQueryParameterError {
    error_type: SearchQueryParameterErrorType,
    parameter_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameter_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl SearchQueryParameterError {
    pub fn new(
        error_type: SearchQueryParameterErrorType,
        parameter_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            parameter_name: parameter_name.into(),
            parameter_value: None,
            message: Some(message.into()),
        }
    }

    /// Record the offending raw value alongside the error.
    #[must_use]
    pub fn with_value(mut self, parameter_value: impl Into<String>) -> Self {
        self.parameter_value = Some(parameter_value.into());
        self
    }

    /// Record an underlying parse failure as part of the message.
    pub fn unparsable(
        parameter_name: impl Into<String>,
        parameter_value: impl Into<String>,
        cause: impl fmt::Display,
    ) -> Self {
        let parameter_value = parameter_value.into();
        Self {
            error_type: SearchQueryParameterErrorType::UnparsableValue,
            parameter_name: parameter_name.into(),
            parameter_value: Some(parameter_value),
            message: Some(cause.to_string()),
        }
    }

    pub fn error_type(&self) -> SearchQueryParameterErrorType {
        self.error_type
    }

    pub fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    pub fn parameter_value(&self) -> Option<&str> {
        self.parameter_value.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for SearchQueryParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_type {
            SearchQueryParameterErrorType::UnsupportedParameter => {
                write!(f, "Query parameter `{}` not supported", self.parameter_name)?;
            }
            SearchQueryParameterErrorType::UnsupportedNumberOfValues => {
                write!(
                    f,
                    "Unsupported number of values for query parameter `{}`",
                    self.parameter_name
                )?;
            }
            SearchQueryParameterErrorType::UnparsableValue => {
                write!(
                    f,
                    "Unparsable value for query parameter `{}`",
                    self.parameter_name
                )?;
            }
        }

        if let Some(value) = &self.parameter_value {
            write!(f, ", value `{value}`")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }

        Ok(())
    }
}

/// Opaque database failure reported by the [`DaoProvider`] collaborator.
///
/// [`DaoProvider`]: crate::query::DaoProvider
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Aggregate of all per-parameter storage failures collected while
/// resolving references for in-memory matching.
///
/// Resolution is not short-circuited: every defined parameter is attempted
/// and every failure is preserved, so the caller sees the full diagnostic
/// picture in one error.
#[derive(Debug, Error)]
#[error("error while resolving references ({} failed)", sources.len())]
pub struct ReferenceResolutionError {
    pub sources: Vec<StorageError>,
}
