pub mod audit;
pub mod json_file;
pub mod session;

pub use audit::{AuditEvent, AuditLogger};
pub use json_file::LockedJsonFile;
pub use session::{SessionRecord, SessionStore};
