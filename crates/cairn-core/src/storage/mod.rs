pub mod local;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cairn_types::error::{CairnError, Result};

use crate::config::Settings;

/// Object size at which a name is classed "large" for tier placement.
pub const SMALL_THRESHOLD: u64 = 1 << 20;

/// Placement hint passed with every write so tiered backends can route
/// by object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassHint {
    IdxSmall,
    IdxLarge,
    MetaSmall,
    MetaLarge,
    DataSmall,
    DataLarge,
}

impl ClassHint {
    pub fn idx(size: u64) -> Self {
        if size < SMALL_THRESHOLD {
            ClassHint::IdxSmall
        } else {
            ClassHint::IdxLarge
        }
    }

    pub fn meta(size: u64) -> Self {
        if size < SMALL_THRESHOLD {
            ClassHint::MetaSmall
        } else {
            ClassHint::MetaLarge
        }
    }

    pub fn data(size: u64) -> Self {
        if size < SMALL_THRESHOLD {
            ClassHint::DataSmall
        } else {
            ClassHint::DataLarge
        }
    }

    pub fn is_data(self) -> bool {
        matches!(self, ClassHint::DataSmall | ClassHint::DataLarge)
    }
}

/// Capability set the core needs from durable storage. Names are
/// `/`-separated paths (e.g. `objects/pack/pack-ab01....pack`).
pub trait StorageDriver: Send + Sync {
    /// List all names starting with `prefix`.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read a whole object, or `range = (offset, length)` of it.
    /// Returns `None` if the name does not exist. A ranged read returns
    /// exactly `length` bytes; a short read is an error.
    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<Option<Vec<u8>>>;

    /// Write an object. Finalized names are content-addressed, so the
    /// semantics are put-if-absent: writing an existing name is a no-op.
    fn write(&self, name: &str, data: &[u8], class: ClassHint) -> Result<()>;

    /// Atomic compare-and-set on a single logical file. `expected` is
    /// the previously observed raw content (`None` = must not exist).
    /// Returns `false` when the current content no longer matches.
    fn cas_ref(&self, name: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool>;

    fn delete(&self, name: &str) -> Result<()>;
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Bounded exponential backoff for transient storage errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Wraps any driver with transient-error retries. Exhausted retries
/// surface as `StorageFatal`; non-transient errors pass through
/// immediately.
pub struct RetryingDriver<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: StorageDriver> RetryingDriver<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        RetryingDriver { inner, policy }
    }

    fn run<T>(&self, op: &str, name: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay_ms = self.policy.delay_ms;
        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(self.policy.max_delay_ms);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(CairnError::Io(e)) if is_transient_io(&e) => {
                    if attempt == self.policy.max_retries {
                        return Err(CairnError::StorageFatal(format!(
                            "{op} '{name}' failed after {} retries: {e}",
                            self.policy.max_retries
                        )));
                    }
                    tracing::warn!(
                        "{op} '{name}': transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        self.policy.max_retries,
                    );
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns");
    }
}

impl<D: StorageDriver> StorageDriver for RetryingDriver<D> {
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.run("list", prefix, || self.inner.list_prefix(prefix))
    }

    fn read(&self, name: &str, range: Option<(u64, u64)>) -> Result<Option<Vec<u8>>> {
        self.run("read", name, || self.inner.read(name, range))
    }

    fn write(&self, name: &str, data: &[u8], class: ClassHint) -> Result<()> {
        self.run("write", name, || self.inner.write(name, data, class))
    }

    fn cas_ref(&self, name: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool> {
        // CAS is not blindly retryable: a lost race must surface as
        // `false`, not be replayed. Only the I/O beneath it is retried
        // by the local driver itself.
        self.inner.cas_ref(name, expected, new)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.run("delete", name, || self.inner.delete(name))
    }
}

/// Build the configured storage driver rooted at `path`.
pub fn driver_from_settings(settings: &Settings, path: &Path) -> Result<Arc<dyn StorageDriver>> {
    match settings.storage.as_deref() {
        None | Some("file") => Ok(Arc::new(RetryingDriver::new(
            local::LocalDriver::new(path)?,
            RetryPolicy::default(),
        ))),
        Some(other) => Err(CairnError::UnsupportedDriver(other.to_string())),
    }
}
