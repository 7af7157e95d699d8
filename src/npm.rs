//! npm registry HTTP layer
//!
//! Routes npm client requests (install, publish, dist-tag, unpublish) to
//! either the hosted registry or the caching proxy.

mod handlers;
mod response;
mod types;

pub use handlers::{Backend, NpmService};
pub use response::status_for;
pub use types::{CacheStatus, NpmTarget, RequestContext};
