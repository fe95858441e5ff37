//! Session tracking: the provider's session lifecycle as a readable snapshot.

pub mod manager;
pub mod snapshot;

pub use manager::AuthSessionManager;
pub use snapshot::{ProfileStatus, Session, SessionSnapshot};
