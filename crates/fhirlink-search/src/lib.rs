pub mod error;
pub mod identity;
pub mod include;
pub mod page;
pub mod parameters;
pub mod query;
pub mod sql;
pub mod types;

pub use error::{
    ReferenceResolutionError, SearchQueryParameterError, SearchQueryParameterErrorType,
    StorageError,
};
pub use identity::SearchQueryIdentityFilter;
pub use include::{IncludeParts, SearchQueryIncludeParameterConfiguration};
pub use page::PageAndCount;
pub use parameters::{
    SearchQueryParameter, SearchQueryParameterFactory, SearchQueryRevIncludeParameterFactory,
    SearchQuerySortParameterConfiguration, SortDirection,
};
pub use query::{ConfiguredSearchQuery, DaoProvider, SearchQuery, SearchQueryBuilder};
pub use sql::SqlValue;
pub use types::{ReferenceParameter, ReferenceTarget, TokenParameter};
