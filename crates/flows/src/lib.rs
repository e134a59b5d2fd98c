//! The two browser-driven workflows: logging in to capture a session, and
//! remixing a project under the safety controller.

pub mod auth;
pub mod remix;
pub mod token;

pub use auth::{AuthFlow, AuthOutcome, AuthSource, AuthState, LoginError, LoginStage};
pub use remix::{
    AlwaysConfirm, Confirmer, RemixErrorKind, RemixFlow, RemixRequest, RemixResult, RemixStage,
};
pub use token::{extract_bearer, is_well_formed_token};
