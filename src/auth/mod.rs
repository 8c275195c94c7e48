//! Access-token handling shared by every collection.

mod source;
mod token_manager;

pub use source::{HttpTokenSource, StaticTokenSource, TokenResponse, TokenSource};
pub use token_manager::{Pausable, RefreshEvent, ShapeRegistration, TokenManager};
