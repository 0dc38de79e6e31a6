// Domain types, wire DTOs and the error taxonomy shared by every crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::CoreError;
