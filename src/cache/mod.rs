//! Value and resource caches and the machinery they share.
//!
//! | Cache            | Hit returns               | Use for                        |
//! |------------------|---------------------------|--------------------------------|
//! | [`ValueCache`]    | an independent deep copy  | data: query results, frames    |
//! | [`ResourceCache`] | the same shared `Arc`     | live objects: pools, models    |
//!
//! Both run misses through a [`LazyScope`], so concurrent first calls for a
//! key execute the wrapped function once.

pub(crate) mod engine;
mod invalidate;
pub mod lazy;
pub mod resource;
pub mod value;

pub use engine::{ProgressEvent, ProgressHook};
pub use lazy::LazyScope;
pub use resource::ResourceCache;
pub use value::{DeepCopy, Uncopyable, ValueCache};
