#![forbid(unsafe_code)]

mod entry;
mod refresh;
mod store;

pub use entry::Cached;
pub use refresh::{CachePolicy, RefreshCache};
pub use store::{Store, Sweeper};
