// SPDX-License-Identifier: PMPL-1.0-or-later
//! Disposable handles for subscriptions, retains and staged updates.

use std::fmt;

/// Releases a resource when disposed. Disposing twice is a no-op.
#[derive(Default)]
pub struct Disposable {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposable {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn dispose(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.action.is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
