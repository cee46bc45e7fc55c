//! Kernel mount table queries
//!
//! The kernel's view of what is mounted is the ground truth both for
//! FUSE helper readiness and for unmount idempotence. Paths in
//! `/proc/self/mounts` have spaces, tabs, newlines, and backslashes
//! encoded as octal escapes.

use std::io;
use std::path::Path;

/// Whether `path` is currently a mount point according to the kernel.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let table = std::fs::read_to_string("/proc/self/mounts")?;
    Ok(table_contains(&table, path))
}

/// Whether the given mount table text lists `path` as a mount point.
pub(crate) fn table_contains(table: &str, path: &Path) -> bool {
    let needle = path.to_string_lossy();
    table.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        match fields.next() {
            Some(mount_point) => unescape(mount_point) == needle,
            None => false,
        }
    })
}

/// Decode the octal escapes used in /proc mount entries.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &s[i + 1..i + 4];
            if let Ok(code) = u8::from_str_radix(octal, 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev,size=1624344k,mode=755 0 0
filer-1:/exports/backups /m/A nfs4 rw,relatime,vers=4.1 0 0
s3fusehelper /mnt/with\\040space fuse.s3fusehelper rw,nosuid,nodev 0 0
";

    #[test]
    fn finds_listed_mount_points() {
        assert!(table_contains(SAMPLE, Path::new("/proc")));
        assert!(table_contains(SAMPLE, Path::new("/m/A")));
        assert!(!table_contains(SAMPLE, Path::new("/m/B")));
        // Prefixes of a mount point are not mount points.
        assert!(!table_contains(SAMPLE, Path::new("/m")));
    }

    #[test]
    fn decodes_escaped_spaces() {
        assert!(table_contains(SAMPLE, Path::new("/mnt/with space")));
    }

    #[test]
    fn proc_is_a_mount_point_on_linux() {
        assert!(is_mount_point(Path::new("/proc")).unwrap());
    }

    #[test]
    fn fresh_tempdir_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()).unwrap());
    }
}
