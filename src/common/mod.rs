//! Common utilities and types

pub mod error;
pub mod metadata;
pub mod net;

pub use error::{Error, Result};
pub use metadata::Target;

use uuid::Uuid;

/// Short id tying together the log lines of one request
pub fn request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
