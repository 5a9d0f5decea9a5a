//! Concrete search parameter implementations.

pub mod reference;
pub mod token;

pub use reference::{ReferenceParameter, ReferenceTarget};
pub use token::TokenParameter;
