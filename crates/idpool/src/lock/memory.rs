use super::LockService;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashSet;

/// In-process [`LockService`]: a set of held lock names.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    held: Mutex<HashSet<String>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.held.lock().contains(name)
    }
}

impl LockService for MemoryLockService {
    async fn try_lock(&self, name: &str) -> Result<bool> {
        Ok(self.held.lock().insert(name.to_owned()))
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        self.held.lock().remove(name);
        Ok(())
    }
}
