//! Memoized API endpoint accessor
//!
//! Lives in a per-operation context, so a value fetched during one
//! operation is never trusted by the next one.

use std::future::Future;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoizedEndpoint {
    value: Option<String>,
}

impl MemoizedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value, or the result of `fetch` which is then cached
    ///
    /// A failed fetch caches nothing.
    pub async fn get_or_fetch<F, Fut, E>(&mut self, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(value) = &self.value {
            return Ok(value.clone());
        }
        let value = fetch().await?;
        self.value = Some(value.clone());
        Ok(value)
    }

    /// Seed the memo with a value produced by a step
    pub fn store(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }

    pub fn get(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Drop the cached value; the next access fetches again
    pub fn invalidate(&mut self) {
        self.value = None;
    }
}
