pub mod change_request;
pub mod common;
pub mod field;
pub mod outcome;
pub mod project;
pub mod user;
pub mod user_context;
pub mod value;

pub use change_request::*;
pub use common::*;
pub use field::*;
pub use outcome::*;
pub use project::*;
pub use user::*;
pub use user_context::*;
pub use value::*;
