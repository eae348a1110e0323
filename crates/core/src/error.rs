//! Error types delivered to requesters

use pixcache_cache::StatusCode;

/// Failure reported by a decode collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not a decodable image
    #[error("malformed image data: {0}")]
    Malformed(String),

    /// The decode would exceed the memory available to it
    #[error("out of memory while decoding")]
    OutOfMemory,

    /// The image format or a feature of it is not supported
    #[error("unsupported image: {0}")]
    Unsupported(String),

    /// The source could not be read
    #[error("I/O error: {0}")]
    Io(String),
}

impl DecodeError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DecodeError::OutOfMemory)
    }
}

/// Typed failure returned alongside the request key.
///
/// Cloneable because a single outcome is fanned out to every coalesced
/// requester.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// The request named no resource
    #[error("no resource identifier given")]
    MissingResource,

    /// The fetch collaborator reported a non-success status
    #[error("fetch failed with status {status}")]
    Fetch { status: StatusCode },

    /// A negative sentinel is cached for this key
    #[error("resource previously failed with status {status}")]
    KnownBad { status: StatusCode },

    /// The fetched payload could not be decoded
    #[error("decode failed (status {status}): {error}")]
    Decode {
        status: StatusCode,
        #[source]
        error: DecodeError,
    },

    /// Decoding ran out of memory; every cache tier was cleared
    #[error("out of memory while decoding; memory cache cleared")]
    OutOfMemory,

    /// The fetch owner went away without completing
    #[error("fetch was abandoned before completion")]
    Abandoned,

    /// No result arrived within the join timeout
    #[error("timed out waiting for a coalesced fetch")]
    Timeout,
}

impl ImageError {
    /// Status code reported alongside this failure.
    ///
    /// Failures that carry an observed fetch status report it. Decode-side
    /// failures without one report `TRANSFORM_ERROR`, delivery failures
    /// report `NETWORK_ERROR` and a missing resource reports `NOT_FOUND`.
    pub fn status(&self) -> StatusCode {
        match self {
            ImageError::Fetch { status }
            | ImageError::KnownBad { status }
            | ImageError::Decode { status, .. } => *status,
            ImageError::OutOfMemory => StatusCode::TRANSFORM_ERROR,
            ImageError::Abandoned | ImageError::Timeout => StatusCode::NETWORK_ERROR,
            ImageError::MissingResource => StatusCode::NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_failure_has_a_status() {
        let cases = [
            (
                ImageError::Fetch {
                    status: StatusCode::NOT_FOUND,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                ImageError::KnownBad {
                    status: StatusCode(500),
                },
                StatusCode(500),
            ),
            (
                ImageError::Decode {
                    status: StatusCode::TRANSFORM_ERROR,
                    error: DecodeError::Malformed("truncated".into()),
                },
                StatusCode::TRANSFORM_ERROR,
            ),
            (ImageError::OutOfMemory, StatusCode::TRANSFORM_ERROR),
            (ImageError::Abandoned, StatusCode::NETWORK_ERROR),
            (ImageError::Timeout, StatusCode::NETWORK_ERROR),
            (ImageError::MissingResource, StatusCode::NOT_FOUND),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status(), expected, "{error}");
            assert!(!error.status().is_success());
        }
    }
}
