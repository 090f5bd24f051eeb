// ABOUTME: Mounts a container's read-write layer straight from an overlay2 layer store.
// ABOUTME: Reads the layerdb mount-id and lower chain, then mounts the merged overlay view.

use rustix::io::Errno;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::overlay::OVERLAY_DRIVER;
use crate::resolver::LayerMounter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerPlan {
    /// A layer without parents: its diff directory is used as is.
    Base(PathBuf),
    Overlay {
        target: PathBuf,
        options: String,
        /// Directory relative lower paths resolve from, when absolute ones don't fit a page.
        relative_to: Option<PathBuf>,
    },
}

pub struct Overlay2Store<'k> {
    kernel: &'k dyn Kernel,
}

impl<'k> Overlay2Store<'k> {
    pub fn new(kernel: &'k dyn Kernel) -> Self {
        Self { kernel }
    }

    pub fn plan(&self, store_root: &Path, container_id: &str, driver: &str) -> Result<LayerPlan> {
        let fail = |reason: String| Error::MountProvider {
            id: container_id.to_string(),
            reason,
        };
        if driver != OVERLAY_DRIVER {
            return Err(fail(format!("unsupported storage driver {driver}")));
        }

        let mount_id_path = store_root
            .join("image")
            .join(driver)
            .join("layerdb/mounts")
            .join(container_id)
            .join("mount-id");
        let mount_id = std::fs::read_to_string(&mount_id_path)
            .map_err(|e| fail(format!("reading {}: {e}", mount_id_path.display())))?;
        let mount_id = mount_id.trim();
        if mount_id.is_empty() || mount_id.contains('/') {
            return Err(fail(format!("invalid mount id in {}", mount_id_path.display())));
        }

        let driver_dir = store_root.join(driver);
        let layer_dir = driver_dir.join(mount_id);
        let lower = match std::fs::read_to_string(layer_dir.join("lower")) {
            Ok(lower) => lower,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(LayerPlan::Base(layer_dir.join("diff")));
            }
            Err(e) => return Err(fail(format!("reading lower chain: {e}"))),
        };
        let lowers: Vec<&str> = lower.trim().split(':').filter(|l| !l.is_empty()).collect();

        let absolute = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers
                .iter()
                .map(|l| driver_dir.join(l).to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(":"),
            layer_dir.join("diff").display(),
            layer_dir.join("work").display(),
        );
        let target = layer_dir.join("merged");
        if absolute.len() < self.kernel.page_size().saturating_sub(1) {
            return Ok(LayerPlan::Overlay {
                target,
                options: absolute,
                relative_to: None,
            });
        }

        let relative = format!(
            "lowerdir={},upperdir={mount_id}/diff,workdir={mount_id}/work",
            lowers.join(":"),
        );
        debug!(length = absolute.len(), "layer options too long, using relative paths");
        Ok(LayerPlan::Overlay {
            target,
            options: relative,
            relative_to: Some(driver_dir),
        })
    }

    fn mount_from(&self, dir: &Path, target: &Path, options: &str) -> rustix::io::Result<()> {
        let cwd = self
            .kernel
            .current_dir()
            .map_err(|e| Errno::from_io_error(&e).unwrap_or(Errno::IO))?;
        self.kernel.chdir(dir)?;
        let mounted = self.kernel.mount("overlay", target, "overlay", Some(options));
        if let Err(e) = self.kernel.chdir(&cwd) {
            warn!(dir = %cwd.display(), error = %e, "could not restore working directory");
        }
        mounted
    }
}

impl LayerMounter for Overlay2Store<'_> {
    fn mount_layer(&self, store_root: &Path, container_id: &str, driver: &str) -> Result<PathBuf> {
        let fail = |reason: String| Error::MountProvider {
            id: container_id.to_string(),
            reason,
        };

        let (target, options, relative_to) = match self.plan(store_root, container_id, driver)? {
            LayerPlan::Base(diff) => return Ok(diff),
            LayerPlan::Overlay {
                target,
                options,
                relative_to,
            } => (target, options, relative_to),
        };

        self.kernel
            .create_dir_all(&target)
            .map_err(|e| fail(format!("creating {}: {e}", target.display())))?;
        let mounted = match &relative_to {
            Some(dir) => self.mount_from(dir, &target, &options),
            None => self.kernel.mount("overlay", &target, "overlay", Some(&options)),
        };
        mounted.map_err(|e| fail(format!("mounting container fs: {e}")))?;

        self.kernel
            .remount(&target, false)
            .map_err(|e| fail(format!("remounting container read-write: {e}")))?;
        debug!(id = container_id, path = %target.display(), "mounted container layer");
        Ok(target)
    }
}

/// Write the layerdb entry and layer directory for `container_id`, as the
/// container engine lays them out under `store`.
#[cfg(test)]
pub(crate) fn write_layer(store: &Path, container_id: &str, mount_id: &str, lower: Option<&str>) {
    let mounts = store.join("image/overlay2/layerdb/mounts").join(container_id);
    std::fs::create_dir_all(&mounts).unwrap();
    std::fs::write(mounts.join("mount-id"), mount_id).unwrap();
    let dir = store.join("overlay2").join(mount_id);
    std::fs::create_dir_all(dir.join("diff")).unwrap();
    if let Some(lower) = lower {
        std::fs::write(dir.join("lower"), lower).unwrap();
    }
}
