use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::resolve::TraversalPolicy;

#[derive(Parser, Debug)]
#[command(name = "loopfs", about = "Loopback FUSE filesystem over a backing directory")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mirror a backing directory at a mount point
    Mount(MountArgs),
    /// Unmount a loopfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct MountArgs {
    /// Directory whose contents the mount mirrors
    pub backing: PathBuf,

    /// Where to mount (created if missing)
    pub mountpoint: PathBuf,

    /// Log file path
    #[arg(long, default_value = "/tmp/loopfs.log")]
    pub log_file: PathBuf,

    /// Reject virtual paths whose `..` segments climb above the backing root
    #[arg(long)]
    pub confine: bool,

    /// Mount read-only
    #[arg(long)]
    pub read_only: bool,

    /// Let other users access the mount (needs user_allow_other)
    #[arg(long)]
    pub allow_other: bool,

    /// Extra mount options passed through to the kernel
    #[arg(short = 'o', value_name = "OPTION")]
    pub options: Vec<String>,
}

/// Everything a mount needs, fixed before the filesystem is constructed.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub backing: PathBuf,
    pub mountpoint: PathBuf,
    pub log_file: PathBuf,
    pub policy: TraversalPolicy,
    pub read_only: bool,
    pub allow_other: bool,
    pub options: Vec<String>,
}

impl LoopbackConfig {
    /// Build from parsed arguments. `backing` and `mountpoint` are the
    /// canonical forms of the paths in `args`.
    pub fn from_args(args: MountArgs, backing: PathBuf, mountpoint: PathBuf) -> Self {
        let policy = if args.confine {
            TraversalPolicy::Confined
        } else {
            TraversalPolicy::Trusted
        };
        Self {
            backing,
            mountpoint,
            log_file: args.log_file,
            policy,
            read_only: args.read_only,
            allow_other: args.allow_other,
            options: args.options,
        }
    }

    /// Mount options for the kernel, in the order they were requested.
    pub fn mount_options(&self) -> Vec<fuser::MountOption> {
        let mut opts = vec![
            fuser::MountOption::FSName("loopfs".to_string()),
            fuser::MountOption::AutoUnmount,
        ];
        if self.read_only {
            opts.push(fuser::MountOption::RO);
        }
        opts.extend(
            self.options
                .iter()
                .flat_map(|o| o.split(','))
                .filter(|o| !o.is_empty())
                .map(|o| fuser::MountOption::CUSTOM(o.to_string())),
        );
        opts
    }

    pub fn session_acl(&self) -> fuser::SessionACL {
        if self.allow_other {
            fuser::SessionACL::All
        } else {
            fuser::SessionACL::Owner
        }
    }
}
