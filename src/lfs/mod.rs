//! LFS object addressing and multipart planning.
//!
//! The key layout `lfs/{oid[0:2]}/{oid[2:4]}/{oid}` is an external contract:
//! existing content is addressed by it, so it must never change.

/// S3 parts per upload are hard-capped by the service.
pub const MAX_MULTIPART_PARTS: i64 = 10_000;

const MIB: i64 = 1024 * 1024;

/// Content-addressed blob key for an LFS oid.
#[must_use]
pub fn lfs_key(oid: &str) -> String {
    format!("lfs/{}/{}/{}", &oid[0..2], &oid[2..4], oid)
}

/// `s3://bucket/key` address the versioned store links against.
#[must_use]
pub fn physical_address(bucket: &str, oid: &str) -> String {
    format!("s3://{}/{}", bucket, lfs_key(oid))
}

fn validate_oid(oid: &str) -> bool {
    oid.len() == 64
        && oid
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
}

#[must_use]
pub fn is_valid_oid(oid: &str) -> bool {
    validate_oid(oid)
}

/// Part plan for a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartPlan {
    pub chunk_size: i64,
    pub part_count: i64,
}

/// Split `size` into parts of `chunk_size`, growing the chunk (rounded up to
/// whole MiB) when the count would exceed the service's part cap.
fn div_ceil_i64(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

#[must_use]
pub fn plan_multipart(size: i64, chunk_size: i64) -> MultipartPlan {
    let mut chunk_size = chunk_size.max(1);
    let mut part_count = div_ceil_i64(size, chunk_size);

    if part_count > MAX_MULTIPART_PARTS {
        chunk_size = div_ceil_i64(size, MAX_MULTIPART_PARTS);
        chunk_size = div_ceil_i64(chunk_size, MIB) * MIB;
        part_count = div_ceil_i64(size, chunk_size);
    }

    MultipartPlan {
        chunk_size,
        part_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(
            lfs_key(OID),
            format!("lfs/a6/65/{OID}"),
        );
        assert_eq!(
            physical_address("hub", OID),
            format!("s3://hub/lfs/a6/65/{OID}"),
        );
    }

    #[test]
    fn oid_validation() {
        assert!(is_valid_oid(OID));
        assert!(!is_valid_oid("short"));
        assert!(!is_valid_oid(&OID.to_uppercase()));
        assert!(!is_valid_oid(&format!("g{}", &OID[1..])));
    }

    #[test]
    fn multipart_plan_respects_part_cap() {
        let plan = plan_multipart(100 * MIB, 10 * MIB);
        assert_eq!(plan.part_count, 10);
        assert_eq!(plan.chunk_size, 10 * MIB);

        // 20 TiB at a 1 MiB chunk would need far more than 10k parts.
        let size = 20 * 1024 * 1024 * MIB;
        let plan = plan_multipart(size, MIB);
        assert!(plan.part_count <= MAX_MULTIPART_PARTS);
        assert_eq!(plan.chunk_size % MIB, 0);
        assert!(plan.chunk_size * plan.part_count >= size);
    }

    #[test]
    fn multipart_plan_single_part() {
        let plan = plan_multipart(5, 10 * MIB);
        assert_eq!(plan.part_count, 1);
    }
}
