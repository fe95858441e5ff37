//! Profile persistence seam.

pub mod memory;
pub mod model;
pub mod traits;

pub use memory::InMemoryProfileStore;
pub use model::{ProfileFields, ProfileUpdate, UserProfile};
pub use traits::ProfileStore;
