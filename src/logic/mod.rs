pub mod access;
pub mod change_requests;
pub mod data_entry;
pub mod export;
pub mod ordering;
pub mod outcome_registry;
pub mod projects;
pub mod schema_ops;
pub mod template;

#[cfg(test)]
pub(crate) mod test_support;

pub use access::*;
pub use change_requests::*;
pub use data_entry::*;
pub use export::*;
pub use ordering::*;
pub use outcome_registry::*;
pub use projects::*;
pub use schema_ops::*;
pub use template::*;
