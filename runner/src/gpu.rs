//! Mutual exclusion over the GPUs visible to this host.
//!
//! Every device id has a lock file `gpu_<id>.lock` in a shared lock directory. Ownership is an
//! exclusive `flock(2)` on that file, so the kernel drops it together with the holder's file
//! descriptor: a killed holder never leaves a device blocked.

use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::unix::{fs::MetadataExt, io::AsRawFd},
    path::{Path, PathBuf},
    process,
    thread::sleep,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("There are no visible GPUs, set {VISIBLE_DEVICES_VAR} to the pool of devices")]
    NoDevices,
    #[error("Failed to access lock file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to lock {path:?}")]
    Flock {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

#[derive(Debug, Clone)]
pub struct GpuLockManager {
    lock_dir: PathBuf,
    devices: Vec<String>,
    poll_interval: Duration,
}

/// Exclusive ownership of a single device, released on drop
#[derive(Debug)]
pub struct GpuLock {
    device: String,
    path: PathBuf,
    file: Option<File>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl GpuLockManager {
    pub fn new(lock_dir: impl Into<PathBuf>, devices: Vec<String>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            devices,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// use the devices listed in `CUDA_VISIBLE_DEVICES` as pool
    pub fn from_env(lock_dir: impl Into<PathBuf>) -> Self {
        let devices = env::var(VISIBLE_DEVICES_VAR)
            .map(|value| parse_devices(&value))
            .unwrap_or_default();

        Self::new(lock_dir, devices)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub(crate) fn lock_path(&self, device: &str) -> PathBuf {
        self.lock_dir.join(format!("gpu_{device}.lock"))
    }

    /// Block until any device of the pool could be locked
    pub fn acquire_one(&self) -> Result<GpuLock, LockError> {
        if self.devices.is_empty() {
            return Err(LockError::NoDevices);
        }

        fs::create_dir_all(&self.lock_dir).map_err(io_error(&self.lock_dir))?;

        loop {
            for device in self.devices.iter() {
                if let Some(lock) = self.try_acquire(device)? {
                    info!(device = %device, "Acquired GPU");

                    return Ok(lock);
                }
            }

            debug!(devices = ?self.devices, "Waiting for a GPU...");
            sleep(self.poll_interval);
        }
    }

    /// Single non-blocking attempt to lock `device`
    pub fn try_acquire(&self, device: &str) -> Result<Option<GpuLock>, LockError> {
        let path = self.lock_path(device);

        // a release unlinks the file, if we locked an unlinked inode the lock is worthless and
        // the next attempt will see the fresh file
        for _ in 0..3 {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(io_error(&path))?;

            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {}
                Err(errno) if errno == Errno::EWOULDBLOCK => return Ok(None),
                Err(source) => return Err(LockError::Flock { path, source }),
            }

            let held = file.metadata().map_err(io_error(&path))?;
            match fs::metadata(&path) {
                Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {
                    file.set_len(0).map_err(io_error(&path))?;
                    write!(file, "{}", process::id()).map_err(io_error(&path))?;

                    return Ok(Some(GpuLock {
                        device: device.to_owned(),
                        path,
                        file: Some(file),
                    }));
                }
                _ => debug!(path = ?path, "Lock file was replaced while locking, retrying"),
            }
        }

        Ok(None)
    }

    /// Number of devices nobody holds right now
    ///
    /// Only a diagnostic: the probe itself takes the lock for an instant and the answer may be
    /// outdated by the time it is returned.
    pub fn num_free(&self) -> usize {
        self.devices
            .iter()
            .filter(|device| {
                let path = self.lock_path(device);

                match File::open(&path) {
                    Ok(file) => match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                        Ok(()) => {
                            let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
                            true
                        }
                        Err(_) => false,
                    },
                    Err(error) if error.kind() == io::ErrorKind::NotFound => true,
                    Err(error) => {
                        warn!(path = ?path, error = ?error, "Failed to probe lock file");
                        false
                    }
                }
            })
            .count()
    }
}

impl GpuLock {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Unlock and remove the lock file, releasing twice is a no-op
    pub fn release(&mut self) -> Result<(), LockError> {
        if let Some(file) = self.file.take() {
            // unlink before unlocking so a waiter never locks a file that is about to vanish
            let removed = match fs::remove_file(&self.path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
                _ => Ok(()),
            };
            drop(file);
            info!(device = %self.device, "Released GPU");

            removed.map_err(io_error(&self.path))?;
        }

        Ok(())
    }
}

impl Drop for GpuLock {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            warn!(error = ?error, device = %self.device, "Failed to release GPU lock");
        }
    }
}

pub fn parse_devices(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|device| !device.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        thread,
    };

    fn manager(dir: &Path, devices: &[&str]) -> GpuLockManager {
        GpuLockManager::new(dir, devices.iter().map(|d| d.to_string()).collect())
            .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn empty_pool_fails_fast() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            manager(dir.path(), &[]).acquire_one(),
            Err(LockError::NoDevices)
        ));
        assert!(parse_devices(" , ").is_empty());
        assert_eq!(parse_devices("0, 1,"), vec!["0", "1"]);
    }

    #[test]
    fn distinct_devices_for_concurrent_holders() {
        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), &["0", "1"]);

        let first = pool.acquire_one().unwrap();
        let second = pool.acquire_one().unwrap();

        assert_ne!(first.device(), second.device());
        assert_eq!(pool.num_free(), 0);
        assert!(pool.try_acquire("0").unwrap().is_none());

        drop(first);
        assert_eq!(pool.num_free(), 1);
    }

    #[test]
    fn at_most_pool_size_holders_at_any_instant() {
        let dir = tempfile::tempdir().unwrap();
        let holding = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                // every acquirer opens its own descriptors, like separate processes would
                let pool = manager(dir.path(), &["0", "1"]);
                let (holding, peak, seen) = (holding.clone(), peak.clone(), seen.clone());

                thread::spawn(move || {
                    let mut lock = pool.acquire_one().unwrap();
                    let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    seen.lock().unwrap().insert(lock.device().to_owned());

                    thread::sleep(Duration::from_millis(150));
                    holding.fetch_sub(1, Ordering::SeqCst);
                    lock.release().unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(
            *seen.lock().unwrap(),
            HashSet::from(["0".to_owned(), "1".to_owned()])
        );
    }

    #[test]
    fn release_is_idempotent_and_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), &["3"]);
        let mut lock = pool.acquire_one().unwrap();
        let path = pool.lock_path("3");

        assert_eq!(fs::read_to_string(&path).unwrap(), process::id().to_string());
        lock.release().unwrap();
        lock.release().unwrap();

        assert!(!lock.is_held());
        assert!(!path.exists());
        assert_eq!(pool.num_free(), 1);
    }

    #[test]
    fn killed_holder_frees_its_device() {
        use nix::{
            sys::{
                signal::{kill, Signal},
                wait::waitpid,
            },
            unistd::{fork, ForkResult},
        };

        let dir = tempfile::tempdir().unwrap();
        let pool = manager(dir.path(), &["0"]);
        let path = pool.lock_path("0");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .unwrap();
        flock(file.as_raw_fd(), FlockArg::LockExclusive).unwrap();

        // the child inherits the locked descriptor and keeps holding it until it dies
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { nix::libc::pause() };
            },
            ForkResult::Parent { child } => child,
        };
        drop(file);

        assert!(pool.try_acquire("0").unwrap().is_none());

        kill(child, Signal::SIGKILL).unwrap();
        waitpid(child, None).unwrap();

        let lock = pool.acquire_one().unwrap();
        assert_eq!(lock.device(), "0");
    }
}
