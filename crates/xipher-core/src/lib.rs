pub mod config;
pub mod error;
pub mod types;

pub use error::{XipherError, XipherResult};
pub use types::{Mode, TokenKind};
