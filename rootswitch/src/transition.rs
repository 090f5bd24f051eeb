// ABOUTME: The boot-time root transition: mount the host app, overlay extensions, pivot, exec init.
// ABOUTME: Steps run strictly in order; only the host extension and mount migration steps may fail softly.

use std::convert::Infallible;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::cmdline;
use crate::config::Config;
use crate::container::{self, ContainerRecord};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::overlay;
use crate::resolver::{self, LayerMounter, Matcher};

/// Name of the legacy link pointing at the host application's container directory.
const CURRENT_LINK: &str = "current";

/// Data partition filesystem when none is configured and detection fails.
const DEFAULT_DATA_FSTYPE: &str = "ext4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SnapshotMounts,
    RemountRootWritable,
    PrepareScratch,
    ResolveHostApplication,
    MarkPivotTarget,
    ResolveHostExtensions,
    MigrateMounts,
    PivotRoot,
    HandOff,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::SnapshotMounts => "snapshot-mounts",
            Step::RemountRootWritable => "remount-root-writable",
            Step::PrepareScratch => "prepare-scratch",
            Step::ResolveHostApplication => "resolve-host-application",
            Step::MarkPivotTarget => "mark-pivot-target",
            Step::ResolveHostExtensions => "resolve-host-extensions",
            Step::MigrateMounts => "migrate-mounts",
            Step::PivotRoot => "pivot-root",
            Step::HandOff => "hand-off",
        };
        f.write_str(name)
    }
}

fn enter(step: Step) {
    info!(step = %step, "entering step");
}

/// `path` interpreted relative to `root`, even when it is absolute.
pub fn rooted(root: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Unmounts the scratch tmpfs when the prepare phase ends, however it ends.
struct ScratchMount<'a> {
    kernel: &'a dyn Kernel,
    path: PathBuf,
}

impl Drop for ScratchMount<'_> {
    fn drop(&mut self) {
        match self.kernel.unmount_detached(&self.path) {
            Ok(()) => debug!(target = %self.path.display(), "unmounted scratch"),
            Err(e) => warn!(target = %self.path.display(), error = %e, "scratch unmount failed"),
        }
    }
}

/// Leaves the host application root read-only once it has been prepared.
struct ReadOnlyOnExit<'a> {
    kernel: &'a dyn Kernel,
    path: PathBuf,
}

impl Drop for ReadOnlyOnExit<'_> {
    fn drop(&mut self) {
        match self.kernel.remount(&self.path, true) {
            Ok(()) => info!(target = %self.path.display(), "host application root is read-only"),
            Err(e) => error!(target = %self.path.display(), error = %e, "read-only remount failed"),
        }
    }
}

pub struct Transition<'a> {
    kernel: &'a dyn Kernel,
    mounter: &'a dyn LayerMounter,
    config: &'a Config,
    /// The initramfs root holding the host application store.
    root: PathBuf,
    args: Vec<OsString>,
}

impl<'a> Transition<'a> {
    pub fn new(
        kernel: &'a dyn Kernel,
        mounter: &'a dyn LayerMounter,
        config: &'a Config,
        args: Vec<OsString>,
    ) -> Self {
        Self {
            kernel,
            mounter,
            config,
            root: PathBuf::from("/"),
            args,
        }
    }

    #[cfg(test)]
    fn with_root(mut self, root: &Path) -> Self {
        self.root = root.to_path_buf();
        self
    }

    /// Mount the host application found under `sysroot`.
    ///
    /// A legacy `current` link names the container by ID; otherwise the host
    /// application is found by label. Exactly one container must match.
    pub fn mount_host_app(&self, sysroot: &Path) -> Result<ContainerRecord> {
        let store = sysroot.join(&self.config.hostapp_layer_root);
        let target = match self.kernel.read_link(&sysroot.join(CURRENT_LINK)) {
            Ok(current) => current
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Err(_) => self.config.hostapp_label.clone(),
        };
        info!(target = %target, store = %store.display(), "looking up host application");
        resolver::mount_host_app(&store, &target, self.mounter)
    }

    /// Run the whole transition. Only returns if a fatal step failed.
    pub fn run(&self) -> Result<Infallible> {
        enter(Step::SnapshotMounts);
        let mounts = self.kernel.mount_points().map_err(|source| Error::Io {
            path: PathBuf::from("/proc/self/mountinfo"),
            source,
        })?;
        let extensions = self.extensions_enabled();

        enter(Step::RemountRootWritable);
        self.kernel
            .remount(Path::new("/"), false)
            .map_err(|source| Error::Remount {
                target: PathBuf::from("/"),
                source,
            })?;

        let new_root = self.prepare(extensions)?;

        enter(Step::MigrateMounts);
        self.migrate_mounts(&mounts, &new_root);

        enter(Step::PivotRoot);
        let put_old = rooted(&new_root, &self.config.pivot_path);
        self.kernel
            .pivot_root(&new_root, &put_old)
            .map_err(|source| Error::Pivot {
                new_root: new_root.clone(),
                source,
            })?;

        enter(Step::HandOff);
        let init = &self.config.init;
        self.kernel
            .chdir(Path::new("/"))
            .map_err(|e| Error::Handoff {
                program: init.clone(),
                reason: format!("chdir to new root: {e}"),
            })?;
        info!(init = %init.display(), "handing off");
        let err = self.kernel.exec(init, &self.args);
        Err(Error::Handoff {
            program: init.clone(),
            reason: err.to_string(),
        })
    }

    fn extensions_enabled(&self) -> bool {
        if !self.config.host_extensions {
            info!("host extensions disabled by configuration");
            return false;
        }
        match self.kernel.cmdline() {
            Ok(cmdline) if cmdline::host_extensions_disabled(&cmdline, &self.config.nohostext_marker) => {
                info!("host extensions disabled on the kernel command line");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "could not read kernel command line");
                true
            }
        }
    }

    /// Steps that need the scratch mount. Returns the new root.
    fn prepare(&self, extensions: bool) -> Result<PathBuf> {
        enter(Step::PrepareScratch);
        let scratch = &self.config.scratch_path;
        let scratch_err = |reason: String| Error::Scratch {
            target: scratch.clone(),
            reason,
        };
        self.kernel
            .create_dir_all(scratch)
            .map_err(|e| scratch_err(e.to_string()))?;
        self.kernel
            .mount("shm", scratch, "tmpfs", None)
            .map_err(|e| scratch_err(e.to_string()))?;
        let _scratch = ScratchMount {
            kernel: self.kernel,
            path: scratch.clone(),
        };

        enter(Step::ResolveHostApplication);
        let host = self.mount_host_app(&self.root)?;
        let new_root = host
            .mount_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::MountProvider {
                id: host.id().to_string(),
                reason: "host application has no mount path".into(),
            })?;
        info!(name = host.name(), root = %new_root.display(), "host application mounted");
        let _read_only = ReadOnlyOnExit {
            kernel: self.kernel,
            path: new_root.clone(),
        };

        enter(Step::MarkPivotTarget);
        let pivot_target = rooted(&new_root, &self.config.pivot_path);
        self.kernel
            .create_dir_all(&pivot_target)
            .map_err(|source| Error::PivotTarget {
                path: pivot_target.clone(),
                source,
            })?;

        if extensions {
            enter(Step::ResolveHostExtensions);
            if let Err(e) = self.mount_host_extensions(&new_root) {
                warn!(error = %e, "host extensions not mounted");
            }
        }

        Ok(new_root)
    }

    fn mount_host_extensions(&self, new_root: &Path) -> Result<()> {
        let link = self
            .kernel
            .read_link(&self.config.data_partition_link)
            .map_err(|e| Error::DataPartition {
                reason: format!("{}: {e}", self.config.data_partition_link.display()),
            })?;
        let name = link.file_name().ok_or_else(|| Error::DataPartition {
            reason: format!("link target {} has no device name", link.display()),
        })?;
        // The initramfs /dev is the one the link lives in; it has not moved yet.
        let device = Path::new("/dev").join(name);
        let data_dir = rooted(new_root, &self.config.data_dir);
        let fstype = match &self.config.data_fstype {
            Some(fstype) => fstype.clone(),
            None => self.detect_fstype(new_root, &device),
        };
        self.kernel
            .mount(&device.to_string_lossy(), &data_dir, &fstype, None)
            .map_err(|e| Error::DataPartition {
                reason: format!("mounting {} ({fstype}) on {}: {e}", device.display(), data_dir.display()),
            })?;
        info!(device = %device.display(), fstype = %fstype, "data partition mounted");

        let store = data_dir.join(&self.config.data_layer_root);
        let records = container::scan(&store)?;
        let matcher = Matcher::for_target(&records, &self.config.hostext_label);
        // A legacy driver anywhere rules out the whole stack, so check before mounting any of it.
        overlay::check_drivers(records.iter().filter(|r| matcher.matches(r)))?;
        let extensions = resolver::resolve(records, &matcher, self.mounter, &store)?;
        if extensions.is_empty() {
            info!("no host extensions found");
            return Ok(());
        }

        let spec = overlay::compose(new_root, &extensions, self.kernel.page_size())?;
        if spec.is_empty() {
            return Ok(());
        }
        self.kernel
            .mount("overlay", &spec.base, "overlay", Some(spec.options()))
            .map_err(|source| Error::Overlay {
                target: spec.base.clone(),
                source,
            })?;
        for name in &spec.included {
            info!(name = %name, "host extension overlaid");
        }
        Ok(())
    }

    /// Ask the new root's `lsblk` for the filesystem on `device`, falling back to ext4.
    fn detect_fstype(&self, new_root: &Path, device: &Path) -> String {
        match self.kernel.probe_fstype(new_root, device) {
            Ok(fstype) if !fstype.trim().is_empty() => fstype.trim().to_string(),
            Ok(_) => {
                warn!(device = %device.display(), "no filesystem type reported, using {DEFAULT_DATA_FSTYPE}");
                DEFAULT_DATA_FSTYPE.to_string()
            }
            Err(e) => {
                warn!(device = %device.display(), error = %e, "cannot detect filesystem type, using {DEFAULT_DATA_FSTYPE}");
                DEFAULT_DATA_FSTYPE.to_string()
            }
        }
    }

    /// Move every initramfs mount under the new root. Failures are logged and skipped.
    fn migrate_mounts(&self, mounts: &[PathBuf], new_root: &Path) {
        for mount_point in mounts.iter().filter(|m| m.as_path() != Path::new("/")) {
            let target = rooted(new_root, mount_point);
            match self.kernel.move_mount(mount_point, &target) {
                Ok(()) => debug!(from = %mount_point.display(), to = %target.display(), "moved mount"),
                Err(source) => {
                    let e = Error::MountMigration {
                        mount_point: mount_point.clone(),
                        source,
                    };
                    warn!(error = %e, "skipping mount");
                }
            }
        }
    }
}
