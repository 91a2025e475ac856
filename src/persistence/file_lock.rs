use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use fs4::FileExt;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, LockKind, Result};
use crate::persistence::fs_escape;

struct LockState {
    owner: ThreadId,
    depth: usize,
    file: std::fs::File,
}

/// Advisory lock registry backing a persistence adapter.
///
/// Cross-process exclusion comes from `fs4` file locks; `flock` cannot
/// arbitrate threads of one process holding separate descriptors for the
/// same path in a re-entrant way, so threads are arbitrated in-process:
/// the owning thread may re-acquire (depth counted), other threads either
/// wait on the condvar (`suspend=true`) or fail immediately.
pub struct LockRegistry {
    directory: PathBuf,
    states: Mutex<HashMap<String, LockState>>,
    released: Condvar,
}

impl LockRegistry {
    pub fn new(directory: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            states: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        })
    }

    /// Acquires the named lock, returning a guard that releases on drop.
    ///
    /// Re-entrant within the owning thread. With `suspend=false` an
    /// unavailable lock yields `Error::Lock` instead of blocking.
    pub fn acquire(self: &Arc<Self>, kind: LockKind, name: &str, suspend: bool) -> Result<LockGuard> {
        let me = thread::current().id();

        {
            let mut states = self.states.lock();
            loop {
                match states.get_mut(name) {
                    Some(state) if state.owner == me => {
                        state.depth += 1;
                        tracing::trace!(%kind, name, depth = state.depth, "lock re-entered");
                        return Ok(self.guard(kind, name));
                    }
                    Some(_) if suspend => {
                        self.released.wait(&mut states);
                    }
                    Some(_) => {
                        return Err(Error::Lock {
                            kind,
                            name: name.to_string(),
                        })
                    }
                    None => break,
                }
            }
        }

        // No thread of this process holds the lock; arbitrate with the
        // file system. The states mutex is not held across the blocking
        // file lock call.
        let path = self.directory.join(format!("{}.lock", fs_escape(name)));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if suspend {
            file.lock_exclusive()?;
        } else if let Err(cause) = file.try_lock_exclusive() {
            tracing::debug!(%kind, name, %cause, "non-suspending lock unavailable");
            return Err(Error::Lock {
                kind,
                name: name.to_string(),
            });
        }

        let mut states = self.states.lock();
        states.insert(
            name.to_string(),
            LockState {
                owner: me,
                depth: 1,
                file,
            },
        );
        tracing::trace!(%kind, name, "lock acquired");
        Ok(self.guard(kind, name))
    }

    fn guard(self: &Arc<Self>, kind: LockKind, name: &str) -> LockGuard {
        LockGuard {
            registry: self.clone(),
            kind,
            name: name.to_string(),
        }
    }

    fn release(&self, name: &str) {
        let file = {
            let mut states = self.states.lock();
            match states.get_mut(name) {
                Some(state) => {
                    state.depth -= 1;
                    if state.depth > 0 {
                        return;
                    }
                    states.remove(name).map(|state| state.file)
                }
                None => return,
            }
        };
        // Closing the descriptor releases the file lock; the map entry is
        // already gone, so a racing acquirer observes a consistent state.
        drop(file);
        self.released.notify_all();
        tracing::trace!(name, "lock released");
    }
}

/// Scoped lock handle. Dropping the guard releases the lock on every exit
/// path, including panics.
pub struct LockGuard {
    registry: Arc<LockRegistry>,
    kind: LockKind,
    name: String,
}

impl LockGuard {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}
