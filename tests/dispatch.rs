//! Operation tests against a temporary backing root. These exercise the
//! dispatcher directly and need no FUSE installation.
//!
//! Using a handle after `release` is a caller obligation: `release` takes the
//! handle by value, so such code does not compile and is not tested here.

use std::collections::HashSet;
use std::ffi::OsString;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use fuser::{FileType, TimeOrNow};
use loopfs::{BackingRoot, DirEntry, Loopback, LoopbackError, Operations, TraversalPolicy};
use tempfile::TempDir;

fn setup() -> (TempDir, Loopback) {
    let dir = tempfile::tempdir().expect("create backing tmpdir");
    let fs = Loopback::new(BackingRoot::new(dir.path(), TraversalPolicy::Trusted));
    (dir, fs)
}

fn p(s: &str) -> &Path {
    Path::new(s)
}

fn names(fs: &Loopback, dir: &str) -> HashSet<OsString> {
    let mut seen = HashSet::new();
    fs.readdir(p(dir), &mut |e: DirEntry| {
        seen.insert(e.name);
        false
    })
    .unwrap();
    seen
}

fn errno<T: std::fmt::Debug>(r: loopfs::Result<T>) -> i32 {
    r.unwrap_err().errno()
}

#[test]
fn resolve_is_plain_concatenation() {
    let (dir, fs) = setup();
    for v in ["/a.txt", "/x/y/z", "/", "/a//b", "/./c"] {
        let mut expected = dir.path().as_os_str().to_os_string();
        expected.push(v);
        assert_eq!(fs.root().resolve(p(v)).unwrap(), PathBuf::from(expected));
    }
}

#[test]
fn concrete_create_write_read_unlink_scenario() {
    let (dir, fs) = setup();

    let h = fs.create(p("/a.txt"), 0o644).unwrap();
    let meta = std::fs::metadata(dir.path().join("a.txt")).unwrap();
    assert!(meta.is_file());
    // The process umask can only clear bits.
    assert_eq!(meta.permissions().mode() & 0o777 & !0o644, 0);

    assert_eq!(fs.write(&h, b"hello", 0).unwrap(), 5);
    let mut buf = [0u8; 5];
    assert_eq!(fs.read(&h, &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    fs.release(h).unwrap();

    fs.unlink(p("/a.txt")).unwrap();
    assert!(!dir.path().join("a.txt").exists());
    assert_eq!(errno(fs.getattr(p("/a.txt"))), libc::ENOENT);
}

#[test]
fn write_then_read_at_offsets() {
    let (_dir, fs) = setup();
    let h = fs.create(p("/data"), 0o600).unwrap();
    for (offset, payload) in [(0u64, &b"abc"[..]), (10, &b"0123456789"[..]), (4096, &b"tail"[..])] {
        assert_eq!(fs.write(&h, payload, offset).unwrap(), payload.len());
        let mut buf = vec![0u8; payload.len()];
        assert_eq!(fs.read(&h, &mut buf, offset).unwrap(), payload.len());
        assert_eq!(buf, payload);
    }
    fs.release(h).unwrap();
}

#[test]
fn read_returns_short_count_at_eof() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("short"), b"xyz").unwrap();
    let h = fs.open(p("/short")).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(fs.read(&h, &mut buf, 0).unwrap(), 3);
    assert_eq!(&buf[..3], b"xyz");
    assert_eq!(fs.read(&h, &mut buf, 3).unwrap(), 0);
    assert_eq!(fs.read(&h, &mut buf, 100).unwrap(), 0);
    fs.release(h).unwrap();
}

#[test]
fn open_appends_regardless_of_offset() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("log"), b"first").unwrap();
    let h = fs.open(p("/log")).unwrap();
    assert_eq!(fs.write(&h, b"-second", 0).unwrap(), 7);
    fs.release(h).unwrap();
    assert_eq!(std::fs::read(dir.path().join("log")).unwrap(), b"first-second");
}

#[test]
fn open_missing_file_fails_with_enoent() {
    let (_dir, fs) = setup();
    assert_eq!(errno(fs.open(p("/missing"))), libc::ENOENT);
}

#[test]
fn open_directory_fails_with_eisdir() {
    let (_dir, fs) = setup();
    fs.mkdir(p("/d"), 0o755).unwrap();
    assert_eq!(errno(fs.open(p("/d"))), libc::EISDIR);
}

#[test]
fn create_in_missing_directory_fails() {
    let (_dir, fs) = setup();
    let err = fs.create(p("/no/such/file"), 0o644).unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    assert_eq!(err.status(), -libc::ENOENT);
}

#[test]
fn create_truncates_existing_file() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"old contents").unwrap();
    let h = fs.create(p("/f"), 0o644).unwrap();
    assert_eq!(fs.fgetattr(&h).unwrap().size, 0);
    fs.release(h).unwrap();
}

#[test]
fn mkdir_getattr_rmdir() {
    let (_dir, fs) = setup();
    fs.mkdir(p("/d"), 0o755).unwrap();
    assert_eq!(fs.getattr(p("/d")).unwrap().kind, FileType::Directory);
    assert_eq!(errno(fs.mkdir(p("/d"), 0o755)), libc::EEXIST);
    fs.rmdir(p("/d")).unwrap();
    assert_eq!(errno(fs.getattr(p("/d"))), libc::ENOENT);
}

#[test]
fn rmdir_non_empty_fails() {
    let (_dir, fs) = setup();
    fs.mkdir(p("/d"), 0o755).unwrap();
    let h = fs.create(p("/d/f"), 0o644).unwrap();
    fs.release(h).unwrap();
    let code = errno(fs.rmdir(p("/d")));
    assert!(code == libc::ENOTEMPTY || code == libc::EEXIST, "got {}", code);
}

#[test]
fn rmdir_on_file_is_enotdir() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    assert_eq!(errno(fs.rmdir(p("/f"))), libc::ENOTDIR);
}

#[test]
fn readdir_yields_every_backing_name() {
    let (dir, fs) = setup();
    for n in ["a", "b", "c"] {
        std::fs::write(dir.path().join(n), b"").unwrap();
    }
    let seen = names(&fs, "/");
    for n in ["a", "b", "c"] {
        assert!(seen.contains(&OsString::from(n)), "missing {}", n);
    }
    let extra: Vec<_> = seen
        .iter()
        .filter(|n| !["a", "b", "c", ".", ".."].contains(&n.to_str().unwrap()))
        .collect();
    assert!(extra.is_empty(), "unexpected entries: {:?}", extra);
}

#[test]
fn readdir_reports_entry_kinds() {
    let (dir, fs) = setup();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("file"), b"").unwrap();
    let mut kinds = Vec::new();
    fs.readdir(p("/"), &mut |e: DirEntry| {
        kinds.push((e.name, e.kind));
        false
    })
    .unwrap();
    assert!(kinds.contains(&(OsString::from("sub"), FileType::Directory)));
    assert!(kinds.contains(&(OsString::from("file"), FileType::RegularFile)));
}

#[test]
fn readdir_stops_when_sink_is_full() {
    let (dir, fs) = setup();
    for n in 0..20 {
        std::fs::write(dir.path().join(format!("f{}", n)), b"").unwrap();
    }
    let mut count = 0;
    fs.readdir(p("/"), &mut |_e: DirEntry| {
        count += 1;
        count == 3
    })
    .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn readdir_on_missing_directory_fails() {
    let (_dir, fs) = setup();
    let mut called = false;
    let err = fs
        .readdir(p("/nope"), &mut |_e: DirEntry| {
            called = true;
            false
        })
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
    assert!(!called);
}

#[test]
fn readdir_releases_directory_streams() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("x"), b"").unwrap();
    // Far more iterations than a default descriptor limit allows if streams leaked.
    for _ in 0..5000 {
        fs.readdir(p("/"), &mut |_e: DirEntry| true).unwrap();
    }
}

#[test]
fn rename_moves_file() {
    let (_dir, fs) = setup();
    let h = fs.create(p("/old"), 0o644).unwrap();
    fs.release(h).unwrap();
    fs.rename(p("/old"), p("/new")).unwrap();
    assert_eq!(errno(fs.getattr(p("/old"))), libc::ENOENT);
    assert_eq!(fs.getattr(p("/new")).unwrap().kind, FileType::RegularFile);
}

#[test]
fn rename_missing_source_fails() {
    let (_dir, fs) = setup();
    let err = fs.rename(p("/ghost"), p("/other")).unwrap_err();
    assert_eq!(err.status(), -libc::ENOENT);
}

#[test]
fn truncate_to_zero() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("t"), b"some data here").unwrap();
    fs.truncate(p("/t"), 0).unwrap();
    assert_eq!(fs.getattr(p("/t")).unwrap().size, 0);
    assert_eq!(errno(fs.truncate(p("/missing"), 0)), libc::ENOENT);
}

#[test]
fn ftruncate_and_fgetattr_follow_the_open_instance() {
    let (dir, fs) = setup();
    let h = fs.create(p("/f"), 0o644).unwrap();
    fs.write(&h, b"0123456789", 0).unwrap();
    fs.ftruncate(&h, 4).unwrap();
    assert_eq!(fs.fgetattr(&h).unwrap().size, 4);

    fs.rename(p("/f"), p("/g")).unwrap();
    fs.unlink(p("/g")).unwrap();
    assert!(!dir.path().join("g").exists());
    let attr = fs.fgetattr(&h).unwrap();
    assert_eq!(attr.size, 4);
    assert_eq!(attr.nlink, 0);
    fs.release(h).unwrap();
}

#[test]
fn flush_and_fsync_succeed_on_open_file() {
    let (_dir, fs) = setup();
    let h = fs.create(p("/s"), 0o644).unwrap();
    fs.write(&h, b"x", 0).unwrap();
    fs.flush(&h).unwrap();
    fs.fsync(&h, true).unwrap();
    fs.fsync(&h, false).unwrap();
    fs.release(h).unwrap();
}

#[test]
fn chmod_changes_mode() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("m"), b"").unwrap();
    fs.chmod(p("/m"), 0o600).unwrap();
    assert_eq!(fs.getattr(p("/m")).unwrap().perm, 0o600);
    assert_eq!(
        std::fs::metadata(dir.path().join("m")).unwrap().permissions().mode() & 0o777,
        0o600
    );
}

#[test]
fn chown_to_current_owner_is_allowed() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("o"), b"").unwrap();
    let meta = std::fs::metadata(dir.path().join("o")).unwrap();
    fs.chown(p("/o"), Some(meta.uid()), Some(meta.gid())).unwrap();
    fs.chown(p("/o"), None, None).unwrap();
    assert_eq!(errno(fs.chown(p("/missing"), None, None)), libc::ENOENT);
}

#[test]
fn utime_sets_and_preserves_timestamps() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("u"), b"").unwrap();
    let at = UNIX_EPOCH + Duration::from_secs(1_000_000);
    let mt = UNIX_EPOCH + Duration::from_secs(2_000_000);
    fs.utime(p("/u"), Some(TimeOrNow::SpecificTime(at)), Some(TimeOrNow::SpecificTime(mt)))
        .unwrap();
    let attr = fs.getattr(p("/u")).unwrap();
    assert_eq!(attr.atime, at);
    assert_eq!(attr.mtime, mt);

    fs.utime(p("/u"), Some(TimeOrNow::Now), None).unwrap();
    let attr = fs.getattr(p("/u")).unwrap();
    assert_eq!(attr.mtime, mt);
    assert!(attr.atime > at);
}

#[test]
fn access_checks_existence_and_permission() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("r"), b"").unwrap();
    fs.access(p("/r"), libc::F_OK).unwrap();
    fs.access(p("/r"), libc::R_OK).unwrap();
    assert_eq!(errno(fs.access(p("/missing"), libc::F_OK)), libc::ENOENT);
}

#[test]
fn hard_link_shares_inode() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("src"), b"shared").unwrap();
    fs.link(p("/src"), p("/dst")).unwrap();
    let a = fs.getattr(p("/src")).unwrap();
    let b = fs.getattr(p("/dst")).unwrap();
    assert_eq!(a.ino, b.ino);
    assert_eq!(a.nlink, 2);
    assert_eq!(errno(fs.link(p("/src"), p("/dst"))), libc::EEXIST);
}

#[test]
fn symlink_and_readlink() {
    let (dir, fs) = setup();
    std::fs::write(dir.path().join("target"), b"t").unwrap();

    fs.symlink(p("target"), p("/rel")).unwrap();
    assert_eq!(fs.readlink(p("/rel")).unwrap(), PathBuf::from("target"));
    assert_eq!(fs.getattr(p("/rel")).unwrap().kind, FileType::Symlink);

    fs.symlink(p("/target"), p("/abs")).unwrap();
    assert_eq!(fs.readlink(p("/abs")).unwrap(), dir.path().join("target"));
    assert_eq!(std::fs::read(dir.path().join("abs")).unwrap(), b"t");

    assert_eq!(errno(fs.readlink(p("/target"))), libc::EINVAL);
}

#[test]
fn mknod_creates_fifo() {
    let (_dir, fs) = setup();
    fs.mknod(p("/pipe"), libc::S_IFIFO as u32 | 0o644, 0).unwrap();
    assert_eq!(fs.getattr(p("/pipe")).unwrap().kind, FileType::NamedPipe);
}

#[test]
fn statfs_reports_backing_filesystem() {
    let (_dir, fs) = setup();
    let st = fs.statfs(p("/")).unwrap();
    assert!(st.bsize > 0);
    assert!(st.blocks >= st.bfree);
    assert!(st.namelen > 0);
    assert_eq!(errno(fs.statfs(p("/missing"))), libc::ENOENT);
}

#[test]
fn overlong_path_fails_with_enametoolong() {
    let (_dir, fs) = setup();
    let long = format!("/{}", "n".repeat(libc::PATH_MAX as usize));
    let err = fs.getattr(p(&long)).unwrap_err();
    assert!(matches!(err, LoopbackError::PathTooLong { .. }));
    assert_eq!(err.status(), -libc::ENAMETOOLONG);
}

#[test]
fn confined_root_blocks_traversal() {
    let outer = tempfile::tempdir().unwrap();
    let backing = outer.path().join("backing");
    std::fs::create_dir(&backing).unwrap();
    std::fs::write(outer.path().join("secret"), b"s").unwrap();

    let trusted = Loopback::new(BackingRoot::new(&backing, TraversalPolicy::Trusted));
    assert!(trusted.getattr(p("/../secret")).is_ok());

    let confined = Loopback::new(BackingRoot::new(&backing, TraversalPolicy::Confined));
    assert_eq!(errno(confined.getattr(p("/../secret"))), libc::EACCES);
    assert_eq!(errno(confined.open(p("/a/../../secret"))), libc::EACCES);
}

#[test]
fn independent_roots_do_not_interfere() {
    let (dir_a, a) = setup();
    let (dir_b, b) = setup();
    let h = a.create(p("/only-a"), 0o644).unwrap();
    a.release(h).unwrap();
    assert!(dir_a.path().join("only-a").exists());
    assert!(!dir_b.path().join("only-a").exists());
    assert_eq!(errno(b.getattr(p("/only-a"))), libc::ENOENT);
}
