//! Fetch status codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status reported by a fetch collaborator.
///
/// HTTP-style codes are used for remote and file fetches; negative codes are
/// reserved for failures that never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub i32);

impl StatusCode {
    /// The fetch succeeded
    pub const OK: StatusCode = StatusCode(200);

    /// The resource does not exist
    pub const NOT_FOUND: StatusCode = StatusCode(404);

    /// The transport failed before any response was received
    pub const NETWORK_ERROR: StatusCode = StatusCode(-101);

    /// The payload was received but could not be turned into an image
    pub const TRANSFORM_ERROR: StatusCode = StatusCode(-102);

    /// Whether this status makes a result eligible for positive caching
    pub fn is_success(self) -> bool {
        self == Self::OK
    }

    /// The raw numeric code
    pub fn code(self) -> i32 {
        self.0
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::OK
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}
