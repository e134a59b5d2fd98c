pub mod config;
pub mod error;
pub mod paths;
pub mod project;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use paths::Paths;
pub use project::{extract_project_id, is_valid_project_id, ProjectUrlMatcher};
pub use types::Cookie;
