//! Version stamping for datastore compatibility checks.
//!
//! The version is persisted at create time as a single integer so a later
//! release can tell which layout produced a datastore.

/// Encode a semantic version triple into the persisted integer form.
#[inline]
pub const fn encode(major: u32, minor: u32, patch: u32) -> u32 {
    major * 100_000 + minor * 1_000 + patch
}

/// Split a persisted version integer back into `(major, minor, patch)`.
#[inline]
pub const fn decode(version: u32) -> (u32, u32, u32) {
    (
        version / 100_000,
        (version % 100_000) / 1_000,
        version % 1_000,
    )
}

/// Version of this crate in persisted integer form.
pub fn crate_version() -> u32 {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    encode(major, minor, patch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode(0, 3, 1), 3_001);
        assert_eq!(decode(3_001), (0, 3, 1));
        assert_eq!(decode(encode(2, 14, 999)), (2, 14, 999));
    }

    #[test]
    fn test_crate_version_nonzero() {
        assert_ne!(crate_version(), 0);
    }
}
