//! Per-package serialization.
//!
//! Deploy and cleanup for one package must never interleave. Different
//! packages touch disjoint sandboxes and may proceed in parallel (the
//! command channel still runs one command at a time).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use myinjector_core::types::PackageName;

#[derive(Debug, Default)]
pub struct PackageLocks {
    inner: Mutex<HashMap<PackageName, Arc<Mutex<()>>>>,
}

impl PackageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `package`, created on first use.
    pub fn handle(&self, package: &PackageName) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(package.clone()).or_default().clone()
    }

    /// Run `f` while holding the lock for `package`.
    pub fn with<R>(&self, package: &PackageName, f: impl FnOnce() -> R) -> R {
        let handle = self.handle(package);
        let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_package_is_serialized() {
        let locks = Arc::new(PackageLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let pkg = PackageName::from("com.example");

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (locks, inside, max_seen, pkg) =
                    (locks.clone(), inside.clone(), max_seen.clone(), pkg.clone());
                thread::spawn(move || {
                    locks.with(&pkg, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_packages_get_different_locks() {
        let locks = PackageLocks::new();
        let a = locks.handle(&PackageName::from("com.a"));
        let b = locks.handle(&PackageName::from("com.b"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &locks.handle(&PackageName::from("com.a"))));
    }
}
