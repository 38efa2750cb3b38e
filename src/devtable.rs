//! Device table (spec §4.B): a human-readable file mapping device-file
//! names to small integer indices, in order of first use. Index *i* is
//! permanently bound to line *i*; administrators may only reorder entries
//! while the daemon is stopped and no client holds a handle (spec: "Re-reads
//! never reorder existing indices").
//!
//! Grounded in the original server's `devtab.c`, which this module follows
//! closely: a `link(2)`-based sidecar lock, a device-number search under
//! `/dev`, and a `devnum-0xHEX` placeholder line when no matching device
//! node can be found.

use std::fs;
use std::io::{self, BufRead, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const MAX_DEV_SEARCH_DEPTH: u32 = 4;
const LOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const LOCK_MAX_BACKOFF: Duration = Duration::from_secs(600);

/// One line of the device table: either a resolved device-file path, or a
/// placeholder recording the raw device number when no `/dev` entry could
/// be found for it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Path(PathBuf),
    Placeholder(u64),
}

impl Entry {
    fn format(&self) -> String {
        match self {
            Entry::Path(p) => p.display().to_string(),
            Entry::Placeholder(dev) => format!("devnum-{:#x}", dev),
        }
    }

    fn parse(line: &str) -> Entry {
        if let Some(hex) = line.strip_prefix("devnum-0x").or_else(|| line.strip_prefix("devnum-0X")) {
            if let Ok(dev) = u64::from_str_radix(hex, 16) {
                return Entry::Placeholder(dev);
            }
        }
        Entry::Path(PathBuf::from(line))
    }

    /// Resolves this entry to its device number, if possible. A `Path`
    /// entry whose device file has disappeared resolves to `None`.
    fn resolve(&self) -> Option<u64> {
        match self {
            Entry::Placeholder(dev) => Some(*dev),
            Entry::Path(path) => fs::metadata(path).ok().map(|m| m.rdev()),
        }
    }
}

/// In-memory view of the on-disk device table, refreshed lazily.
pub struct DeviceTable {
    path: PathBuf,
    entries: Vec<Entry>,
    /// `dev -> index`, populated by resolving `entries` on load/reload.
    by_dev: std::collections::HashMap<u64, u32>,
    mtime: Option<std::time::SystemTime>,
}

impl DeviceTable {
    /// Opens (creating if absent) the device table at `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut table = DeviceTable { path, entries: Vec::new(), by_dev: Default::default(), mtime: None };
        table.reload_if_changed()?;
        Ok(table)
    }

    /// Returns the index bound to `dev`, assigning and persisting a new one
    /// if `dev` has never been seen.
    ///
    /// Device-table write failures are fatal (spec §7: "integrity is
    /// essential to handle stability"); callers at the top of the
    /// dispatcher are expected to log and exit on `Err`, not retry per
    /// request.
    pub fn index_of(&mut self, dev: u64) -> io::Result<u32> {
        if let Some(&index) = self.by_dev.get(&dev) {
            return Ok(index);
        }
        self.reload_if_changed()?;
        if let Some(&index) = self.by_dev.get(&dev) {
            return Ok(index);
        }

        let lock_path = self.lock_path();
        let _guard = FileLock::acquire(&lock_path)?;

        // Re-read under the lock: another process may have just added it.
        self.reload_if_changed()?;
        if let Some(&index) = self.by_dev.get(&dev) {
            return Ok(index);
        }

        let entry = find_device_node(dev, Path::new("/dev"), MAX_DEV_SEARCH_DEPTH)
            .map(Entry::Path)
            .unwrap_or(Entry::Placeholder(dev));

        self.append(entry.clone())?;
        let index = (self.entries.len() - 1) as u32;
        self.by_dev.insert(dev, index);
        Ok(index)
    }

    fn lock_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }

    fn reload_if_changed(&mut self) -> io::Result<()> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::File::create(&self.path)?;
                fs::metadata(&self.path)?
            }
            Err(err) => return Err(err),
        };
        let mtime = meta.modified()?;
        if self.mtime == Some(mtime) {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let mut entries = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(Entry::parse(line.trim()));
        }

        let mut by_dev = std::collections::HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if let Some(dev) = entry.resolve() {
                by_dev.insert(dev, i as u32);
            }
        }

        self.entries = entries;
        self.by_dev = by_dev;
        self.mtime = Some(mtime);
        Ok(())
    }

    fn append(&mut self, entry: Entry) -> io::Result<()> {
        let mut file = fs::OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", entry.format())?;
        file.sync_data()?;
        self.entries.push(entry);
        self.mtime = Some(fs::metadata(&self.path)?.modified()?);
        Ok(())
    }
}

/// Recursively searches `dir` (depth-limited) for a block device file whose
/// `st_rdev` equals `dev`.
fn find_device_node(dev: u64, dir: &Path, depth_left: u32) -> Option<PathBuf> {
    if depth_left == 0 {
        return None;
    }
    let read_dir = fs::read_dir(dir).ok()?;
    for entry in read_dir.flatten() {
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else { continue };
        if meta.file_type().is_dir() {
            if let Some(found) = find_device_node(dev, &path, depth_left - 1) {
                return Some(found);
            }
        } else if is_block_device(&meta) && meta.rdev() == dev {
            return Some(path);
        }
    }
    None
}

fn is_block_device(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_block_device()
}

/// A `link(2)`-based exclusive lock on a sidecar file, with stale-lock
/// detection and exponential backoff (spec §4.B step 1). Reused by the
/// remote-mount log (4.J), the only other piece of cross-process shared
/// state (spec §5).
pub(crate) struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub(crate) fn acquire(lock_path: &Path) -> io::Result<FileLock> {
        let pid = std::process::id();
        let tmp_path = lock_path.with_extension(format!("tmp.{pid}"));
        fs::write(&tmp_path, pid.to_string())?;

        let started = Instant::now();
        let mut backoff = LOCK_INITIAL_BACKOFF;
        loop {
            match nix::unistd::linkat(
                None,
                &tmp_path,
                None,
                lock_path,
                nix::unistd::LinkatFlags::NoSymlinkFollow,
            ) {
                Ok(()) => {
                    let _ = fs::remove_file(&tmp_path);
                    return Ok(FileLock { path: lock_path.to_path_buf() });
                }
                Err(nix::errno::Errno::EEXIST) => {
                    if owning_pid_is_dead(lock_path) {
                        let _ = fs::remove_file(lock_path);
                        continue;
                    }
                    if started.elapsed() > LOCK_MAX_BACKOFF * 20 {
                        let _ = fs::remove_file(&tmp_path);
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "device table lock contended"));
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(LOCK_MAX_BACKOFF);
                }
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path);
                    return Err(err.into());
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn owning_pid_is_dead(lock_path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(lock_path) else { return true };
    let Ok(pid) = contents.trim().parse::<i32>() else { return true };
    // kill(pid, 0) checks liveness without sending a signal.
    unsafe { libc::kill(pid, 0) != 0 && *libc::__errno_location() == libc::ESRCH }
}
