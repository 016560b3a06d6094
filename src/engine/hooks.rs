//! Hook Interceptor
//!
//! Extension points that may observe or rewrite a work list (a package list,
//! usually) right before a batch run starts. Hooks run in registration order;
//! a hook that returns `None` or an empty replacement leaves the list alone.
//!
//! Hook errors are not retried. They fail the enclosing step.

use anyhow::Context;
use std::sync::{OnceLock, RwLock};
use tracing::debug;

/// Global registry for package-list hooks
static PACKAGE_HOOKS: OnceLock<RwLock<HookRegistry<String>>> = OnceLock::new();

/// A list transformer.
pub trait Hook<T>: Send + Sync {
    /// Name used in logs and error context
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Return `Some(list)` to replace the work list, `None` to pass it through.
    fn transform(&self, items: &[T]) -> anyhow::Result<Option<Vec<T>>>;
}

/// Hook built from a closure, see [`from_fn`].
pub struct FnHook<F> {
    name: &'static str,
    f: F,
}

/// Wrap a closure as a named hook.
pub fn from_fn<T, F>(name: &'static str, f: F) -> FnHook<F>
where
    F: Fn(&[T]) -> anyhow::Result<Option<Vec<T>>> + Send + Sync,
{
    FnHook { name, f }
}

impl<T, F> Hook<T> for FnHook<F>
where
    F: Fn(&[T]) -> anyhow::Result<Option<Vec<T>>> + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn transform(&self, items: &[T]) -> anyhow::Result<Option<Vec<T>>> {
        (self.f)(items)
    }
}

/// Ordered, append-only collection of hooks.
pub struct HookRegistry<T> {
    hooks: Vec<Box<dyn Hook<T>>>,
}

impl<T> Default for HookRegistry<T> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<T: Clone> HookRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl Hook<T> + 'static) {
        debug!("Registered hook '{}'", hook.name());
        self.hooks.push(Box::new(hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Fold every hook over `items`.
    ///
    /// # Errors
    ///
    /// The first hook error, with the hook's name as context.
    pub fn apply(&self, items: Vec<T>) -> anyhow::Result<Vec<T>> {
        let mut current = items;
        for hook in &self.hooks {
            let replacement = hook
                .transform(&current)
                .with_context(|| format!("hook '{}' failed", hook.name()))?;

            match replacement {
                Some(list) if !list.is_empty() => {
                    debug!("Hook '{}' replaced the work list", hook.name());
                    current = list;
                }
                _ => {}
            }
        }
        Ok(current)
    }
}

impl HookRegistry<String> {
    /// Process-wide registry for package lists.
    pub fn global() -> &'static RwLock<HookRegistry<String>> {
        PACKAGE_HOOKS.get_or_init(|| RwLock::new(HookRegistry::new()))
    }
}

/// Add a package-list hook to the global registry.
pub fn register(hook: impl Hook<String> + 'static) {
    let mut registry = HookRegistry::global()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.register(hook);
}

/// Run the global package-list hooks over `packages`.
pub fn apply(packages: Vec<String>) -> anyhow::Result<Vec<String>> {
    let registry = HookRegistry::global()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry.apply(packages)
}
