//! Ownership of release actions.
//!
//! A component hands out one [`ShutdownHandle`] covering everything it owns
//! exclusively. Handles compose: a parent adopts its children's handles, and
//! shutting the parent down releases the children too, newest first.

use std::fmt;

type Action = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ShutdownHandle {
    actions: Vec<Action>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that runs a single action.
    pub fn from_fn(action: impl FnOnce() + Send + 'static) -> Self {
        let mut handle = Self::new();
        handle.push(action);
        handle
    }

    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Take over another handle's actions.
    pub fn adopt(&mut self, mut other: ShutdownHandle) {
        let actions = std::mem::take(&mut other.actions);
        self.actions.push(Box::new(move || {
            for action in actions.into_iter().rev() {
                action();
            }
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in reverse registration order. Idempotent.
    pub fn shutdown(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl FnOnce() + Send {
        let log = log.clone();
        move || log.lock().unwrap().push(name)
    }

    #[test]
    fn test_runs_in_reverse_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut handle = ShutdownHandle::new();
        handle.push(recorder(&log, "first"));
        handle.push(recorder(&log, "second"));

        handle.shutdown();
        handle.shutdown();
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn test_adopted_handles_release_with_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut child = ShutdownHandle::new();
        child.push(recorder(&log, "child-a"));
        child.push(recorder(&log, "child-b"));

        let mut parent = ShutdownHandle::from_fn(recorder(&log, "parent"));
        parent.adopt(child);
        drop(parent);

        assert_eq!(*log.lock().unwrap(), vec!["child-b", "child-a", "parent"]);
    }
}
