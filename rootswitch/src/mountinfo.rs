// ABOUTME: Snapshot of the current mount table from /proc/self/mountinfo.
// ABOUTME: Only mount points are kept; they are what gets moved into the new root.

use std::path::PathBuf;

/// Decode the octal escapes (`\040` for space etc.) the kernel uses in mountinfo.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let digits = &field[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points listed in mountinfo `content`, in table order.
pub fn parse_mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 0:20 / / rw,relatime - rootfs rootfs rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:2 - proc proc rw
24 22 0:5 / /dev rw,nosuid shared:3 - devtmpfs devtmpfs rw,size=10240k
25 24 0:22 / /dev/pts rw,relatime shared:4 - devpts devpts rw,gid=5
26 22 0:23 / /mnt/with\\040space rw - tmpfs tmpfs rw
";

    #[test]
    fn parses_mount_points_in_order() {
        let points = parse_mount_points(SAMPLE);
        assert_eq!(
            points,
            [
                PathBuf::from("/"),
                PathBuf::from("/proc"),
                PathBuf::from("/dev"),
                PathBuf::from("/dev/pts"),
                PathBuf::from("/mnt/with space"),
            ]
        );
    }

    #[test]
    fn skips_truncated_lines() {
        assert!(parse_mount_points("1 2 3\n\n").is_empty());
    }

    #[test]
    fn unescape_leaves_plain_backslashes() {
        assert_eq!(unescape("a\\b"), "a\\b");
        assert_eq!(unescape("tab\\011end"), "tab\tend");
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
    }
}
