//! The storage environment: one engine plus the registry of its tables.
//!
//! Most applications use the process-wide environment set up by
//! [`Environment::initialize`] and torn down by
//! [`Environment::shutdown_global`]. Tests and embedders can hold their own
//! through [`Environment::open`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use simplestore_core::{Config, StoreEngine, StoreError, Transaction};

use crate::error::{ResourceError, ResourceResult};
use crate::registry::TableRegistry;

static GLOBAL: Mutex<Option<Arc<Environment>>> = parking_lot::const_mutex(None);

pub struct Environment {
    engine: Arc<StoreEngine>,
    registry: TableRegistry,
    path: PathBuf,
    shut_down: AtomicBool,
}

impl Environment {
    /// Open (creating if absent) an environment rooted at `path`.
    ///
    /// An unusable directory, or one already held by another open
    /// environment, fails with `Environment`.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> ResourceResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        if path.exists() && !path.is_dir() {
            return Err(ResourceError::Environment(format!(
                "{} exists and is not a directory",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path).map_err(|e| {
            ResourceError::Environment(format!("cannot create {}: {}", path.display(), e))
        })?;

        let engine = StoreEngine::open(&path, config).map_err(|e| match e {
            StoreError::Io { .. } | StoreError::AlreadyOpen(_) => {
                ResourceError::Environment(format!("cannot open {}: {}", path.display(), e))
            }
            other => ResourceError::Store(other),
        })?;
        let engine = Arc::new(engine);
        info!(path = %path.display(), "environment opened");
        Ok(Arc::new(Self {
            registry: TableRegistry::new(Arc::clone(&engine)),
            engine,
            path,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Open the process-wide environment, or return it when already open.
    pub fn initialize<P: AsRef<Path>>(path: P) -> ResourceResult<Arc<Self>> {
        Self::initialize_with(path, Config::default())
    }

    /// Like [`Environment::initialize`] with explicit engine settings.
    /// Settings and path of later calls are ignored.
    pub fn initialize_with<P: AsRef<Path>>(path: P, config: Config) -> ResourceResult<Arc<Self>> {
        let mut global = GLOBAL.lock();
        if let Some(env) = global.as_ref() {
            debug!(
                requested = %path.as_ref().display(),
                open = %env.path.display(),
                "environment already initialized"
            );
            return Ok(Arc::clone(env));
        }
        let env = Self::open(path, config)?;
        *global = Some(Arc::clone(&env));
        Ok(env)
    }

    /// The process-wide environment.
    pub fn global() -> ResourceResult<Arc<Self>> {
        GLOBAL
            .lock()
            .clone()
            .ok_or_else(|| ResourceError::Environment("environment is not initialized".into()))
    }

    /// Shut down the process-wide environment and forget it. No-op when none
    /// is open.
    pub fn shutdown_global() {
        let env = GLOBAL.lock().take();
        if let Some(env) = env {
            env.shutdown();
        }
    }

    pub fn begin_transaction(&self) -> ResourceResult<Transaction> {
        Ok(self.engine.begin()?)
    }

    /// Compact the write-ahead log.
    pub fn checkpoint(&self) -> ResourceResult<()> {
        Ok(self.engine.checkpoint()?)
    }

    /// Close every table, then the engine. Only the first call acts; every
    /// failure is logged and the rest of the shutdown still runs.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let tables = self.registry.len();
        for (table, e) in self.registry.close_all() {
            warn!(table, error = %e, "failed to close table");
        }
        if let Err(e) = self.engine.close() {
            warn!(error = %e, "failed to close engine");
        }
        info!(path = %self.path.display(), tables, "environment shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> &Arc<StoreEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("registry", &self.registry)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
