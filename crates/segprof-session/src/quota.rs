use parking_lot::Mutex;
use std::collections::HashMap;

/// Per-user accounting of concurrently leased backends.
///
/// This is the only state shared between sessions of the same user, so
/// `try_acquire` must check and increment in one step.
pub trait QuotaAccounting: Send + Sync {
    fn limit(&self, user: &str) -> usize;
    fn in_use(&self, user: &str) -> usize;
    /// Reserves `count` slots if they fit under the limit.
    fn try_acquire(&self, user: &str, count: usize) -> bool;
    fn release(&self, user: &str, count: usize);
}

#[derive(Debug)]
pub struct InMemoryQuota {
    limit: usize,
    used: Mutex<HashMap<String, usize>>,
}

impl InMemoryQuota {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Mutex::new(HashMap::new()),
        }
    }
}

impl QuotaAccounting for InMemoryQuota {
    fn limit(&self, _user: &str) -> usize {
        self.limit
    }

    fn in_use(&self, user: &str) -> usize {
        self.used.lock().get(user).copied().unwrap_or(0)
    }

    fn try_acquire(&self, user: &str, count: usize) -> bool {
        let mut used = self.used.lock();
        let current = used.entry(user.to_string()).or_insert(0);
        if *current + count > self.limit {
            return false;
        }
        *current += count;
        true
    }

    fn release(&self, user: &str, count: usize) {
        let mut used = self.used.lock();
        if let Some(current) = used.get_mut(user) {
            *current = current.saturating_sub(count);
            if *current == 0 {
                used.remove(user);
            }
        }
    }
}
