//! Data-transfer port: one backend per locator scheme.
//!
//! The engine stages inputs, lists map sources, and publishes final outputs
//! exclusively through [`DataManager`], which dispatches each operation to
//! the backend registered for the locator's scheme. Backends live in
//! geneflow-infra.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::locator::{Locator, Scheme};

/// A failed data-transfer operation. Fatal to the step (or job) that
/// requested it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    #[error("no data backend registered for scheme '{0}'")]
    UnsupportedScheme(Scheme),

    #[error("'{0}' does not exist")]
    NotFound(String),

    #[error("{operation} failed for '{location}': {reason}")]
    Transfer {
        operation: &'static str,
        location: String,
        reason: String,
    },
}

impl StagingError {
    pub fn transfer(
        operation: &'static str,
        location: &Locator,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Transfer {
            operation,
            location: location.serialize(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Storage operations for a single locator scheme.
///
/// Uses RPITIT; wrap in [`BoxDataBackend`] for registration with a
/// [`DataManager`].
pub trait DataBackend: Send + Sync {
    /// The scheme this backend serves.
    fn scheme(&self) -> Scheme;

    /// Names of the entries directly under `dir`, sorted by name.
    fn list(
        &self,
        dir: &Locator,
    ) -> impl Future<Output = Result<Vec<String>, StagingError>> + Send;

    fn exists(&self, location: &Locator) -> impl Future<Output = Result<bool, StagingError>> + Send;

    /// Create `dir` and any missing parents. Succeeds if it already exists.
    fn mkdir(&self, dir: &Locator) -> impl Future<Output = Result<(), StagingError>> + Send;

    /// Copy a file or directory tree from `src` to `dst`.
    fn copy(
        &self,
        src: &Locator,
        dst: &Locator,
    ) -> impl Future<Output = Result<(), StagingError>> + Send;

    /// Remove a file or directory tree. Missing targets are not an error.
    fn delete(&self, location: &Locator) -> impl Future<Output = Result<(), StagingError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StagingError>> + Send + 'a>>;

/// Object-safe version of [`DataBackend`] with boxed futures.
pub trait DataBackendDyn: Send + Sync {
    fn scheme_dyn(&self) -> Scheme;
    fn list_boxed<'a>(&'a self, dir: &'a Locator) -> BoxFuture<'a, Vec<String>>;
    fn exists_boxed<'a>(&'a self, location: &'a Locator) -> BoxFuture<'a, bool>;
    fn mkdir_boxed<'a>(&'a self, dir: &'a Locator) -> BoxFuture<'a, ()>;
    fn copy_boxed<'a>(&'a self, src: &'a Locator, dst: &'a Locator) -> BoxFuture<'a, ()>;
    fn delete_boxed<'a>(&'a self, location: &'a Locator) -> BoxFuture<'a, ()>;
}

impl<T: DataBackend> DataBackendDyn for T {
    fn scheme_dyn(&self) -> Scheme {
        self.scheme()
    }

    fn list_boxed<'a>(&'a self, dir: &'a Locator) -> BoxFuture<'a, Vec<String>> {
        Box::pin(self.list(dir))
    }

    fn exists_boxed<'a>(&'a self, location: &'a Locator) -> BoxFuture<'a, bool> {
        Box::pin(self.exists(location))
    }

    fn mkdir_boxed<'a>(&'a self, dir: &'a Locator) -> BoxFuture<'a, ()> {
        Box::pin(self.mkdir(dir))
    }

    fn copy_boxed<'a>(&'a self, src: &'a Locator, dst: &'a Locator) -> BoxFuture<'a, ()> {
        Box::pin(self.copy(src, dst))
    }

    fn delete_boxed<'a>(&'a self, location: &'a Locator) -> BoxFuture<'a, ()> {
        Box::pin(self.delete(location))
    }
}

/// Type-erased data backend.
pub struct BoxDataBackend {
    inner: Box<dyn DataBackendDyn + Send + Sync>,
}

impl BoxDataBackend {
    pub fn new<T: DataBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.inner.scheme_dyn()
    }
}

// ---------------------------------------------------------------------------
// DataManager
// ---------------------------------------------------------------------------

/// Scheme-dispatching facade over the registered backends.
#[derive(Default)]
pub struct DataManager {
    backends: HashMap<Scheme, BoxDataBackend>,
}

impl DataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any existing one for the same scheme.
    pub fn with_backend<T: DataBackend + 'static>(mut self, backend: T) -> Self {
        self.register(BoxDataBackend::new(backend));
        self
    }

    pub fn register(&mut self, backend: BoxDataBackend) {
        self.backends.insert(backend.scheme(), backend);
    }

    pub fn supports(&self, scheme: Scheme) -> bool {
        self.backends.contains_key(&scheme)
    }

    fn backend(&self, scheme: Scheme) -> Result<&BoxDataBackend, StagingError> {
        self.backends
            .get(&scheme)
            .ok_or(StagingError::UnsupportedScheme(scheme))
    }

    pub async fn list(&self, dir: &Locator) -> Result<Vec<String>, StagingError> {
        let mut entries = self.backend(dir.scheme())?.inner.list_boxed(dir).await?;
        entries.sort();
        Ok(entries)
    }

    pub async fn exists(&self, location: &Locator) -> Result<bool, StagingError> {
        self.backend(location.scheme())?
            .inner
            .exists_boxed(location)
            .await
    }

    pub async fn mkdir(&self, dir: &Locator) -> Result<(), StagingError> {
        self.backend(dir.scheme())?.inner.mkdir_boxed(dir).await
    }

    pub async fn delete(&self, location: &Locator) -> Result<(), StagingError> {
        self.backend(location.scheme())?
            .inner
            .delete_boxed(location)
            .await
    }

    /// Copy between locations. Same-scheme copies go to that scheme's
    /// backend; cross-scheme copies go to the non-local side, which owns
    /// uploads and downloads.
    pub async fn copy(&self, src: &Locator, dst: &Locator) -> Result<(), StagingError> {
        let scheme = if src.scheme() == dst.scheme() || dst.scheme() != Scheme::Local {
            dst.scheme()
        } else {
            src.scheme()
        };
        tracing::debug!(src = %src, dst = %dst, %scheme, "copying data");
        self.backend(scheme)?.inner.copy_boxed(src, dst).await
    }
}
