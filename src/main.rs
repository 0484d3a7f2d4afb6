use std::ffi::OsStr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::{Command as Process, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use loopfs::config::{Cli, Command, LoopbackConfig, MountArgs};
use loopfs::fs::handles::HandleTable;
use loopfs::LoopbackFs;

/// Write end of the pipe the signal handler pokes, or -1.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_sig: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// SIGINT and SIGTERM, delivered as readable bytes on a pipe.
struct SignalPipe {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalPipe {
    fn install() -> std::io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        SIGNAL_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        unsafe {
            use nix::sys::signal::{signal, SigHandler, Signal};
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                signal(sig, SigHandler::Handler(on_signal)).ok();
            }
        }
        Ok(Self {
            read,
            _write: write,
        })
    }

    /// Wait up to `timeout` for a signal. Returns true if one arrived.
    fn wait(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if ready <= 0 {
            return false;
        }
        let mut byte = 0u8;
        unsafe {
            libc::read(self.read.as_raw_fd(), &mut byte as *mut u8 as *mut libc::c_void, 1);
        }
        true
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        SIGNAL_FD.store(-1, Ordering::Relaxed);
    }
}

/// Non-forcing unmount commands, in the order they are tried.
fn unmount_commands(mountpoint: &Path) -> [Process; 2] {
    let mut fusermount = Process::new("fusermount");
    fusermount.arg("-u").arg(mountpoint);
    let mut umount = Process::new("umount");
    umount.arg(mountpoint);
    [fusermount, umount]
}

fn succeeds_quietly(mut cmd: Process) -> bool {
    cmd.stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Plain unmount. Fails while any process still uses the mount.
fn try_unmount(mountpoint: &Path) -> bool {
    unmount_commands(mountpoint).into_iter().any(succeeds_quietly)
}

fn force_unmount(mountpoint: &Path) -> bool {
    let mut cmd = Process::new("umount");
    cmd.arg("-f").arg(mountpoint);
    succeeds_quietly(cmd)
}

const BUSY_LIST_CAP: usize = 10;

fn report_busy(file_handles: &HandleTable) {
    let open = file_handles.list_open();
    if open.is_empty() {
        eprintln!("loopfs: mount is busy, a process is using the mountpoint");
    } else {
        eprintln!("loopfs: mount is busy, {} open file(s):", open.len());
        for info in open.iter().take(BUSY_LIST_CAP) {
            eprintln!("  {}  (fh {})", info.path.display(), info.fh);
        }
        if open.len() > BUSY_LIST_CAP {
            eprintln!("  ... and {} more", open.len() - BUSY_LIST_CAP);
        }
    }
    eprintln!("loopfs: close them to finish unmounting, or signal again to force.");
}

enum Shutdown {
    /// Signalled twice: tear the session down regardless.
    Force,
    /// The mount is already gone; only the session thread is left to join.
    Detached,
}

/// Block until the mount should end. A first signal unmounts if the mount
/// is idle, otherwise reports what holds it and keeps retrying. A second
/// signal forces. An unmount from outside ends the wait too.
fn supervise(
    session_thread: &JoinHandle<std::io::Result<()>>,
    file_handles: &HandleTable,
    mountpoint: &Path,
) -> Shutdown {
    let signals = match SignalPipe::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!("cannot watch for signals: {}", e);
            return Shutdown::Force;
        }
    };

    let mut draining = false;
    let mut ticks: u32 = 0;
    loop {
        let signalled = signals.wait(Duration::from_millis(200));

        if signalled && draining {
            eprintln!("loopfs: forcing unmount");
            return Shutdown::Force;
        }
        if session_thread.is_finished() {
            return Shutdown::Detached;
        }
        if signalled {
            if try_unmount(mountpoint) {
                eprintln!("loopfs: signal received, unmounting");
                return Shutdown::Detached;
            }
            draining = true;
            report_busy(file_handles);
            continue;
        }
        if draining {
            ticks += 1;
            // Retry about once a second.
            if ticks % 5 == 0 && try_unmount(mountpoint) {
                eprintln!("loopfs: mount released, unmounting");
                return Shutdown::Detached;
            }
        }
    }
}

fn init_logging(log_file: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let dir = log_file
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = log_file
        .file_name()
        .unwrap_or_else(|| OsStr::new("loopfs.log"));
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
    {
        fail(format!("failed to set up logging: {}", e));
    }
    guard
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("loopfs: {}", message);
    std::process::exit(1);
}

/// Canonical backing directory and mount point. The mount point is created
/// if it does not exist yet.
fn prepare_paths(args: &MountArgs) -> Result<(PathBuf, PathBuf), String> {
    let backing = std::fs::canonicalize(&args.backing)
        .map_err(|e| format!("backing directory {}: {}", args.backing.display(), e))?;
    if !backing.is_dir() {
        return Err(format!("backing path {} is not a directory", backing.display()));
    }

    if !args.mountpoint.exists() {
        std::fs::create_dir_all(&args.mountpoint).map_err(|e| {
            format!("cannot create mountpoint {}: {}", args.mountpoint.display(), e)
        })?;
    }
    let mountpoint = std::fs::canonicalize(&args.mountpoint)
        .map_err(|e| format!("mountpoint {}: {}", args.mountpoint.display(), e))?;

    Ok((backing, mountpoint))
}

fn allow_other_refused(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EPERM) || e.to_string().contains("allow_other")
}

/// Start the FUSE session in the background. An `allow_other` mount the
/// system refuses is retried for the owner only.
fn spawn_session(
    config: &LoopbackConfig,
) -> std::io::Result<(fuser::BackgroundSession, Arc<HandleTable>)> {
    let mut fuse_config = fuser::Config::default();
    fuse_config.mount_options = config.mount_options();
    fuse_config.acl = config.session_acl();

    let fs = LoopbackFs::new(config);
    let handles = Arc::clone(&fs.file_handles);
    match fuser::spawn_mount2(fs, &config.mountpoint, &fuse_config) {
        Ok(session) => Ok((session, handles)),
        Err(e) if config.allow_other && allow_other_refused(&e) => {
            warn!("allow_other refused ({}), mounting for the owner only", e);
            fuse_config.acl = fuser::SessionACL::Owner;
            let fs = LoopbackFs::new(config);
            let handles = Arc::clone(&fs.file_handles);
            fuser::spawn_mount2(fs, &config.mountpoint, &fuse_config).map(|s| (s, handles))
        }
        Err(e) => Err(e),
    }
}

fn mount(args: MountArgs) {
    let _log_guard = init_logging(&args.log_file);
    info!("loopfs args: {:?}", std::env::args().collect::<Vec<_>>());

    let (backing, mountpoint) = prepare_paths(&args).unwrap_or_else(|e| fail(e));
    if mountpoint.starts_with(&backing) {
        warn!(
            "mountpoint {} is inside the backing directory; lookups through it will recurse",
            mountpoint.display()
        );
    }

    let config = LoopbackConfig::from_args(args, backing, mountpoint);
    info!(
        "mounting {} at {} (policy {:?})",
        config.backing.display(),
        config.mountpoint.display(),
        config.policy
    );

    let (session, file_handles) = spawn_session(&config).unwrap_or_else(|e| {
        error!("mount failed: {}", e);
        std::process::exit(1);
    });
    info!("loopfs mounted at {}", config.mountpoint.display());

    match supervise(&session.guard, &file_handles, &config.mountpoint) {
        Shutdown::Force => {
            if let Err(e) = session.umount_and_join() {
                error!("unmount failed ({}), forcing", e);
                force_unmount(&config.mountpoint);
            }
        }
        Shutdown::Detached => {
            if let Err(e) = session.join() {
                error!("FUSE session ended with an error: {}", e);
            }
        }
    }

    eprintln!("loopfs: unmounted {}", config.mountpoint.display());
}

fn unmount(mountpoint: &Path) {
    let mountpoint = std::fs::canonicalize(mountpoint)
        .unwrap_or_else(|e| fail(format!("mountpoint {}: {}", mountpoint.display(), e)));
    eprintln!("Unmounting {}...", mountpoint.display());

    for mut cmd in unmount_commands(&mountpoint) {
        let Ok(output) = cmd.output() else {
            continue;
        };
        if output.status.success() {
            eprintln!("Successfully unmounted {}", mountpoint.display());
            return;
        }
        if String::from_utf8_lossy(&output.stderr).contains("busy") {
            fail(format!(
                "{} is busy; leave any shells or processes using it and try again",
                mountpoint.display()
            ));
        }
    }

    if force_unmount(&mountpoint) {
        eprintln!("Successfully unmounted {} (forced)", mountpoint.display());
        return;
    }
    fail(format!(
        "could not unmount {}; try: sudo umount -f {}",
        mountpoint.display(),
        mountpoint.display()
    ));
}

fn main() {
    match Cli::parse().command {
        Command::Mount(args) => mount(args),
        Command::Unmount { mountpoint } => unmount(&mountpoint),
    }
}
