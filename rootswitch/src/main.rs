// ABOUTME: Early-boot root switcher (PID 1 out of the initramfs).
// ABOUTME: Mounts a sysroot's host application, or pivots into it and hands off to init.

mod cmdline;
mod config;
mod container;
mod error;
mod kernel;
mod layer_store;
mod logging;
mod mountinfo;
mod overlay;
mod resolver;
mod transition;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use rustix::process::getpid;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::kernel::HostKernel;
use crate::layer_store::Overlay2Store;
use crate::transition::Transition;

#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[arg(
        long,
        help = "Root of a partition, e.g. /mnt/sysroot/inactive. Mounts its host application and prints the mount path"
    )]
    sysroot: Option<PathBuf>,

    #[arg(long, help = "Data partition filesystem type [default: detected, else ext4]")]
    data_fstype: Option<String>,

    #[arg(long, default_value = DEFAULT_CONFIG_PATH, help = "Config path")]
    config: PathBuf,

    #[arg(short, long, action = ArgAction::Count, help = "More logging (repeatable)")]
    verbose: u8,

    // The kernel hands init any boot parameter it doesn't recognise.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    init_args: Vec<OsString>,
}

impl Args {
    fn boot_defaults() -> Self {
        Self {
            sysroot: None,
            data_fstype: None,
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            verbose: 0,
            init_args: Vec::new(),
        }
    }
}

/// Bad arguments must not stop a boot, so fall back to defaults unless help was asked for.
fn parse_args() -> Args {
    match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("rootswitch: ignoring arguments: {e}");
            Args::boot_defaults()
        }
    }
}

fn mount_sysroot(config: &Config, sysroot: &Path, verbosity: u8) -> ExitCode {
    logging::init_stderr(&config.log, verbosity);

    let kernel = HostKernel;
    let layers = Overlay2Store::new(&kernel);
    let transition = Transition::new(&kernel, &layers, config, Vec::new());
    match transition.mount_host_app(sysroot) {
        Ok(host) => match host.mount_path() {
            Some(path) => {
                print!("{}", path.display());
                ExitCode::SUCCESS
            }
            None => {
                error!(id = host.id(), "host application has no mount path");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            error!(sysroot = %sysroot.display(), error = %e, "error mounting sysroot");
            ExitCode::FAILURE
        }
    }
}

fn boot(args: &Args, config: &Config, config_error: Option<anyhow::Error>) -> ExitCode {
    logging::init(&config.log, args.verbose);

    let pid = getpid();
    info!(pid = pid.as_raw_nonzero().get(), "rootswitch starting");
    if let Some(e) = config_error {
        warn!(error = %format!("{e:#}"), "using default configuration");
    }
    if !args.init_args.is_empty() {
        debug!(args = ?args.init_args, "passing boot parameters through to init");
    }

    let kernel = HostKernel;
    let layers = Overlay2Store::new(&kernel);
    let transition = Transition::new(&kernel, &layers, config, std::env::args_os().collect());
    let Err(e) = transition.run();
    error!(error = %e, "root transition failed");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    let args = parse_args();

    let (mut config, config_error) = match config::load(&args.config) {
        Ok(config) => (config, None),
        Err(e) if args.sysroot.is_some() => {
            eprintln!("rootswitch: {e:#}");
            return ExitCode::FAILURE;
        }
        Err(e) => (Config::default(), Some(e)),
    };
    if let Some(fstype) = &args.data_fstype {
        config.data_fstype = Some(fstype.clone());
    }

    match &args.sysroot {
        Some(sysroot) => mount_sysroot(&config, sysroot, args.verbose),
        None => boot(&args, &config, config_error),
    }
}
