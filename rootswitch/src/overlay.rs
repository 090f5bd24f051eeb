// ABOUTME: Composes host extension layers into one overlay mount on top of the host app root.
// ABOUTME: Keeps the encoded mount options below the kernel's one-page limit by dropping layers.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::container::ContainerRecord;
use crate::error::{Error, Result};

/// The only storage driver whose layers can be stacked into a composed overlay.
pub const OVERLAY_DRIVER: &str = "overlay2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub base: PathBuf,
    /// Extension mount paths, top-most first.
    pub layers: Vec<PathBuf>,
    /// Names of the containers backing `layers`.
    pub included: Vec<String>,
    /// Set when layers were left out to respect the option size limit.
    pub capped: bool,
    options: String,
}

impl OverlaySpec {
    /// Encoded `mount(2)` data for the overlay filesystem.
    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

fn encode(layers: &[PathBuf], base: &Path) -> String {
    let mut options = String::from("lowerdir=");
    for layer in layers {
        options.push_str(&layer.to_string_lossy());
        options.push(':');
    }
    options.push_str(&base.to_string_lossy());
    options
}

/// Fail with `UnsupportedDriver` on the first record not stored by the overlay driver.
pub fn check_drivers<'r>(records: impl IntoIterator<Item = &'r ContainerRecord>) -> Result<()> {
    match records.into_iter().find(|c| c.driver() != OVERLAY_DRIVER) {
        Some(bad) => Err(Error::UnsupportedDriver {
            name: bad.name().to_string(),
            driver: bad.driver().to_string(),
        }),
        None => Ok(()),
    }
}

/// Stack the mounted `extensions` above `base`, in resolution order.
///
/// The option string must stay strictly below `page_size - 1` bytes. The first
/// layer that would break this, and every layer after it, is left out; the
/// result is marked `capped` but is not an error.
pub fn compose(base: &Path, extensions: &[ContainerRecord], page_size: usize) -> Result<OverlaySpec> {
    check_drivers(extensions)?;

    let limit = page_size.saturating_sub(1);
    let mut layers: Vec<PathBuf> = Vec::new();
    let mut included = Vec::new();
    let mut options = encode(&layers, base);
    let mut capped = false;

    for (index, ext) in extensions.iter().enumerate() {
        let Some(path) = ext.mount_path() else {
            warn!(name = ext.name(), "host extension is not mounted, leaving it out");
            continue;
        };

        layers.push(path.to_path_buf());
        let candidate = encode(&layers, base);
        if candidate.len() >= limit {
            layers.pop();
            let dropped: Vec<&str> = extensions[index..].iter().map(ContainerRecord::name).collect();
            warn!(
                length = candidate.len(),
                limit,
                dropped = ?dropped,
                "overlay options would exceed one page, remaining host extensions not overlaid"
            );
            capped = true;
            break;
        }
        options = candidate;
        included.push(ext.name().to_string());
    }

    info!(layers = layers.len(), capped, "composed host extension overlay");
    Ok(OverlaySpec {
        base: base.to_path_buf(),
        layers,
        included,
        capped,
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted(name: &str, driver: &str, path: &str) -> ContainerRecord {
        let json = format!(r#"{{"ID":"{name}","Name":"{name}","Image":"img","Driver":"{driver}"}}"#);
        let mut record = ContainerRecord::decode(json.as_bytes()).unwrap();
        record.set_mount_path(PathBuf::from(path));
        record
    }

    #[test]
    fn compose_all_layers_when_they_fit() {
        let exts = [
            mounted("first", "overlay2", "/mnt/ext/first"),
            mounted("second", "overlay2", "/mnt/ext/second"),
        ];

        let spec = compose(Path::new("/mnt/root"), &exts, 4096).unwrap();
        assert_eq!(spec.options(), "lowerdir=/mnt/ext/first:/mnt/ext/second:/mnt/root");
        assert_eq!(spec.layers, [PathBuf::from("/mnt/ext/first"), PathBuf::from("/mnt/ext/second")]);
        assert_eq!(spec.included, ["first", "second"]);
        assert!(!spec.capped);
    }

    #[test]
    fn compose_without_extensions_is_empty() {
        let spec = compose(Path::new("/mnt/root"), &[], 4096).unwrap();
        assert!(spec.is_empty());
        assert_eq!(spec.options(), "lowerdir=/mnt/root");
    }

    #[test]
    fn compose_caps_at_page_boundary() {
        // "lowerdir=" + "/b" is 11 bytes; each layer adds 4 ("/lN" plus ':')
        let exts = [
            mounted("l0", "overlay2", "/l0"),
            mounted("l1", "overlay2", "/l1"),
            mounted("l2", "overlay2", "/l2"),
            mounted("l3", "overlay2", "/l3"),
        ];

        // Four layers make 27 bytes, just under page_size - 1
        let spec = compose(Path::new("/b"), &exts, 29).unwrap();
        assert_eq!(spec.options(), "lowerdir=/l0:/l1:/l2:/l3:/b");
        assert_eq!(spec.included, ["l0", "l1", "l2", "l3"]);
        assert!(!spec.capped);

        // 27 bytes is exactly page_size - 1: the fourth layer is rejected
        let spec = compose(Path::new("/b"), &exts, 28).unwrap();
        assert_eq!(spec.options(), "lowerdir=/l0:/l1:/l2:/b");
        assert_eq!(spec.included, ["l0", "l1", "l2"]);
        assert_eq!(spec.layers.len(), 3);
        assert!(spec.capped);

        // Layers past the first rejected one are never reconsidered
        let spec = compose(Path::new("/b"), &exts, 20).unwrap();
        assert_eq!(spec.options(), "lowerdir=/l0:/b");
        assert_eq!(spec.included, ["l0"]);
        assert!(spec.capped);
    }

    #[test]
    fn compose_caps_at_first_layer() {
        let exts = [mounted("big", "overlay2", "/a/very/long/extension/path")];
        let spec = compose(Path::new("/b"), &exts, 16).unwrap();
        assert!(spec.is_empty());
        assert!(spec.capped);
        assert_eq!(spec.options(), "lowerdir=/b");
    }

    #[test]
    fn compose_rejects_legacy_driver() {
        let exts = [
            mounted("good", "overlay2", "/mnt/good"),
            mounted("legacy", "aufs", "/mnt/legacy"),
        ];

        let err = compose(Path::new("/mnt/root"), &exts, 4096).unwrap_err();
        match err {
            Error::UnsupportedDriver { name, driver } => {
                assert_eq!(name, "legacy");
                assert_eq!(driver, "aufs");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
