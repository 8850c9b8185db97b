//! Daemon entry point: CLI argument parsing and mounting a [`RepeatFs`]
//! over a root/mount pair, in the `clap`/`env_logger` style already used
//! by `fuser-tests/src/main.rs`.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use fuser::MountOption;
use log::{error, info};
use repeatfs::fs::RepeatFs;
use repeatfs::Service;

/// Mount a repeatfs overlay: a real backing directory exposed through a
/// mount point, with action-rule-configured virtual derived files and
/// process provenance capture.
#[derive(Parser, Debug)]
#[command(name = "repeatfsd", version, about)]
struct Args {
    /// Real backing directory to overlay.
    root: PathBuf,
    /// Where to mount the overlay.
    mount: PathBuf,
    /// Directory holding `repeatfs.conf` (and, once opened, `provenance.db`
    /// and the disk-overflow cache). Defaults to `mount`.
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Run in the foreground instead of daemonizing.
    #[arg(long, default_value_t = true)]
    foreground: bool,
    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if !args.foreground {
        error!("daemonization is handled by the external wrapper; run with --foreground");
        exit(1);
    }

    let config_dir = args.config_dir.clone().unwrap_or_else(|| args.mount.clone());

    let service = match Service::new(args.root.clone(), args.mount.clone(), &config_dir) {
        Ok(service) => service,
        Err(err) => {
            error!("failed to initialize repeatfs service: {err}");
            exit(1);
        }
    };

    let fs = RepeatFs::new(service);

    let mut options = vec![MountOption::FSName("repeatfs".to_string()), MountOption::AutoUnmount];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!("mounting {:?} over {:?}", args.root, args.mount);
    if let Err(err) = fuser::mount2(fs, &args.mount, &options) {
        error!("mount failed: {err}");
        exit(1);
    }
}
