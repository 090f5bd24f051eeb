// ABOUTME: Container resolution: picks containers by exact ID or by label and mounts them.
// ABOUTME: The layer store that produces the mounts is injected through the LayerMounter trait.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::container::{self, ContainerRecord};
use crate::error::{Error, Result};

/// Label value marking a container as an overlay root to be mounted.
pub const OVERLAY_LABEL_VALUE: &str = "overlay";

/// Produces a writable mount of one container's filesystem.
pub trait LayerMounter {
    fn mount_layer(&self, store_root: &Path, container_id: &str, driver: &str) -> Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Exactly one container, by ID. Mount failures are fatal.
    Id(String),
    /// Every container carrying the label with the overlay value. Mount failures are skipped.
    Label(String),
}

impl Matcher {
    /// An ID matcher if `target` is the ID of a scanned container, a label matcher otherwise.
    pub fn for_target(records: &[ContainerRecord], target: &str) -> Self {
        if records.iter().any(|r| r.id() == target) {
            Matcher::Id(target.to_string())
        } else {
            Matcher::Label(target.to_string())
        }
    }

    pub fn matches(&self, record: &ContainerRecord) -> bool {
        match self {
            Matcher::Id(id) => record.id() == id,
            Matcher::Label(key) => record
                .labels()
                .get(key)
                .is_some_and(|value| value == OVERLAY_LABEL_VALUE),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Matcher::Id(s) | Matcher::Label(s) => s,
        }
    }
}

/// Mounted containers that matched a resolution pass, in scan order.
pub type ResolvedSet = Vec<ContainerRecord>;

/// Mount every record selected by `matcher`.
pub fn resolve(
    records: Vec<ContainerRecord>,
    matcher: &Matcher,
    mounter: &dyn LayerMounter,
    store_root: &Path,
) -> Result<ResolvedSet> {
    debug!(target = matcher.target(), store = %store_root.display(), "resolving containers");
    let mut resolved = Vec::new();

    for mut record in records.into_iter().filter(|r| matcher.matches(r)) {
        match mounter.mount_layer(store_root, record.id(), record.driver()) {
            Ok(path) => {
                info!(
                    id = record.id(),
                    name = record.name(),
                    image = record.image(),
                    path = %path.display(),
                    "mounted container"
                );
                record.set_mount_path(path);
                resolved.push(record);
            }
            Err(e) => match matcher {
                Matcher::Id(_) => return Err(e),
                Matcher::Label(_) => {
                    warn!(id = record.id(), name = record.name(), error = %e, "skipping container");
                }
            },
        }
    }

    Ok(resolved)
}

/// Scan `store_root` and resolve `target`, treating it as an ID when a container has it.
pub fn mount_by_target(
    store_root: &Path,
    target: &str,
    mounter: &dyn LayerMounter,
) -> Result<ResolvedSet> {
    let records = container::scan(store_root)?;
    let matcher = Matcher::for_target(&records, target);
    resolve(records, &matcher, mounter, store_root)
}

/// Resolve `target` and require exactly one mounted host application.
pub fn mount_host_app(
    store_root: &Path,
    target: &str,
    mounter: &dyn LayerMounter,
) -> Result<ContainerRecord> {
    let mut resolved = mount_by_target(store_root, target, mounter)?;
    if resolved.len() != 1 {
        return Err(Error::AmbiguousHostApp {
            target: target.to_string(),
            found: resolved.len(),
        });
    }
    Ok(resolved.remove(0))
}
