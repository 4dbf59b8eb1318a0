//! Shared leaf crate for recast.
//!
//! Holds the pieces every other layer depends on: the error taxonomy with its
//! stable wire codes, typed ID newtypes, the service-reference codec, and the
//! relative-path sanitizer used by the recording browser.

pub mod error;
pub mod ids;
pub mod relpath;
pub mod sref;

pub use error::{Error, Result};
pub use ids::{CorrelationId, RequestId, SessionId, TimerId};
pub use relpath::sanitize_rel_path;
pub use sref::{RecordingId, ServiceRef};
