//! Single-writer discipline for engine compilation.
//!
//! Two layers: an in-process mutex per target path (threads of this
//! process) and an advisory `flock` on a lock file (other processes). Lock
//! files live under `<temp_root>/locks/` and are named by the xxh64 of the
//! target path, so read-only engine directories never need a lock file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(unix)]
use std::os::fd::AsRawFd;

use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use mlrt_core::error::{EngineError, Result};

#[derive(Debug)]
pub struct CompileLock {
    dir: PathBuf,
    in_process: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CompileLock {
    pub fn new(temp_root: &Path) -> Self {
        Self {
            dir: temp_root.join("locks"),
            in_process: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_path(&self, target: &Path) -> PathBuf {
        let digest = xxh64(target.as_os_str().as_encoded_bytes(), 0);
        self.dir.join(format!("{digest:016x}.lock"))
    }

    /// Run `f` while holding both lock layers for `target`.
    ///
    /// The per-target mutex is dropped from the table once no other thread
    /// holds or waits on it.
    pub fn with_lock<T>(&self, target: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let slot = {
            let mut table = self.table();
            Arc::clone(table.entry(target.to_path_buf()).or_default())
        };
        let result = {
            let _thread_guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            self.with_file_lock(target, f)
        };
        self.release(target, slot);
        result
    }

    fn with_file_lock<T>(&self, target: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        std::fs::create_dir_all(&self.dir).map_err(|err| EngineError::io(&self.dir, err))?;
        let lock_path = self.lock_path(target);
        let _file_guard = lock_file(&lock_path)?;
        debug!(target = %target.display(), lock = %lock_path.display(), "Compile lock held");

        f()
    }

    fn release(&self, target: &Path, slot: Arc<Mutex<()>>) {
        let mut table = self.table();
        // Slots are only cloned or dropped under the table lock, so a count
        // of two (table plus `slot`) means nobody else can reach this entry.
        let unused = Arc::strong_count(&slot) == 2
            && table.get(target).is_some_and(|entry| Arc::ptr_eq(entry, &slot));
        drop(slot);
        if unused {
            table.remove(target);
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<Mutex<()>>>> {
        self.in_process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.table().len()
    }
}

/// The returned file holds the lock until dropped.
fn lock_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .truncate(false)
        .create(true)
        .open(path)
        .map_err(|err| EngineError::io(path, err))?;
    #[cfg(unix)]
    {
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(EngineError::io(path, std::io::Error::last_os_error()));
        }
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mlrt_trt_{label}_{}_{}",
            std::process::id(),
            nanos
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn lock_paths_are_stable_per_target() {
        let lock = CompileLock::new(Path::new("/tmp/mlrt"));
        let a = lock.lock_path(Path::new("/models/a.engine"));
        assert_eq!(a, lock.lock_path(Path::new("/models/a.engine")));
        assert_ne!(a, lock.lock_path(Path::new("/models/b.engine")));
        assert!(a.starts_with("/tmp/mlrt/locks"));
    }

    #[test]
    fn same_target_is_serialized() {
        let dir = unique_temp_dir("lock");
        let lock = Arc::new(CompileLock::new(&dir));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    lock.with_lock(Path::new("/models/x.engine"), || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(lock.tracked(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn released_targets_are_pruned() {
        let dir = unique_temp_dir("prune");
        let lock = CompileLock::new(&dir);
        for i in 0..16 {
            let target = PathBuf::from(format!("/models/{i}.engine"));
            lock.with_lock(&target, || {
                assert_eq!(lock.tracked(), 1);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(lock.tracked(), 0);

        let err = lock
            .with_lock(Path::new("/models/x.engine"), || -> Result<()> {
                Err(EngineError::CompileFailed { message: "boom".into(), log: None })
            })
            .expect_err("closure error is returned");
        assert_eq!(err.error_code(), 301);
        assert_eq!(lock.tracked(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }
}
