//! Cache addressing

use std::fmt;
use std::sync::Arc;

/// Identifies one decoded rendition of a resource.
///
/// Keys are the unit of cache addressing and of request coalescing. Two keys
/// are equal iff both the resource identifier and the target width match.
/// A target width of `0` means "decoded without downsampling".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    resource: Arc<str>,
    target_width: u32,
}

impl CacheKey {
    /// Create a key for `resource` decoded towards `target_width`
    pub fn new(resource: impl Into<Arc<str>>, target_width: u32) -> Self {
        Self {
            resource: resource.into(),
            target_width,
        }
    }

    /// Create a key for the full-resolution rendition of `resource`
    pub fn full(resource: impl Into<Arc<str>>) -> Self {
        Self::new(resource, 0)
    }

    /// The resource identifier (URL, path or bundled resource name)
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The requested decode width, `0` for no downsampling
    pub fn target_width(&self) -> u32 {
        self.target_width
    }

    /// Whether this key addresses a downsampled rendition
    pub fn is_downsampled(&self) -> bool {
        self.target_width > 0
    }

    /// Flat string identity of the key.
    ///
    /// This is the bare resource identifier for full-resolution keys and
    /// `resource#width` otherwise.
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.target_width == 0 {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}#{}", self.resource, self.target_width)
        }
    }
}
