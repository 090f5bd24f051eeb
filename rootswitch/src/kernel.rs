// ABOUTME: The system calls the root transition needs, behind a trait.
// ABOUTME: HostKernel issues them through rustix; tests substitute a recording fake.

use rustix::io::Errno;
use rustix::mount::{MountFlags, UnmountFlags, mount, mount_move, mount_remount, unmount};
use std::ffi::{CString, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::mountinfo;

const MOUNTINFO: &str = "/proc/self/mountinfo";
const CMDLINE: &str = "/proc/cmdline";
const LSBLK: &str = "usr/bin/lsblk";

pub trait Kernel {
    /// Remount `target` in place, read-write or read-only.
    fn remount(&self, target: &Path, read_only: bool) -> rustix::io::Result<()>;
    fn mount(&self, source: &str, target: &Path, fstype: &str, data: Option<&str>) -> rustix::io::Result<()>;
    fn move_mount(&self, from: &Path, to: &Path) -> rustix::io::Result<()>;
    fn unmount_detached(&self, target: &Path) -> rustix::io::Result<()>;
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> rustix::io::Result<()>;
    fn chdir(&self, path: &Path) -> rustix::io::Result<()>;
    fn current_dir(&self) -> std::io::Result<PathBuf>;
    fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;
    fn read_link(&self, path: &Path) -> std::io::Result<PathBuf>;
    /// Replace the process image. Only returns on failure.
    fn exec(&self, program: &Path, args: &[OsString]) -> std::io::Error;
    fn page_size(&self) -> usize;
    fn mount_points(&self) -> std::io::Result<Vec<PathBuf>>;
    fn cmdline(&self) -> std::io::Result<String>;
    /// Filesystem type of `device` as reported by the `lsblk` shipped in `root`.
    fn probe_fstype(&self, root: &Path, device: &Path) -> std::io::Result<String>;
}

pub struct HostKernel;

impl Kernel for HostKernel {
    fn remount(&self, target: &Path, read_only: bool) -> rustix::io::Result<()> {
        let flags = if read_only {
            MountFlags::RDONLY
        } else {
            MountFlags::empty()
        };
        mount_remount(target, flags, "")
    }

    fn mount(&self, source: &str, target: &Path, fstype: &str, data: Option<&str>) -> rustix::io::Result<()> {
        let data = data
            .map(CString::new)
            .transpose()
            .map_err(|_| Errno::INVAL)?;
        mount(source, target, fstype, MountFlags::empty(), data.as_deref())
    }

    fn move_mount(&self, from: &Path, to: &Path) -> rustix::io::Result<()> {
        mount_move(from, to)
    }

    fn unmount_detached(&self, target: &Path) -> rustix::io::Result<()> {
        unmount(target, UnmountFlags::DETACH)
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> rustix::io::Result<()> {
        rustix::process::pivot_root(new_root, put_old)
    }

    fn chdir(&self, path: &Path) -> rustix::io::Result<()> {
        rustix::process::chdir(path)
    }

    fn current_dir(&self) -> std::io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn read_link(&self, path: &Path) -> std::io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn exec(&self, program: &Path, args: &[OsString]) -> std::io::Error {
        let mut cmd = Command::new(program);
        if let Some((arg0, rest)) = args.split_first() {
            cmd.arg0(arg0).args(rest);
        }
        cmd.exec()
    }

    fn page_size(&self) -> usize {
        rustix::param::page_size()
    }

    fn mount_points(&self) -> std::io::Result<Vec<PathBuf>> {
        let content = std::fs::read_to_string(MOUNTINFO)?;
        Ok(mountinfo::parse_mount_points(&content))
    }

    fn cmdline(&self) -> std::io::Result<String> {
        std::fs::read_to_string(CMDLINE)
    }

    fn probe_fstype(&self, root: &Path, device: &Path) -> std::io::Result<String> {
        let output = Command::new(root.join(LSBLK))
            .args(["-no", "FSTYPE"])
            .arg(device)
            .output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!("lsblk exited with {}", output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
