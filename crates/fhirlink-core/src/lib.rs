pub mod error;
pub mod reference;
pub mod resource;

pub use error::CoreError;
pub use reference::{ResourceReference, parse_reference};
pub use resource::Resource;
