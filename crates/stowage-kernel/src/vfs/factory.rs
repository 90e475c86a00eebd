//! Driver constructors by name.
//!
//! Mount records name their driver and carry its settings as a JSON string
//! (`addition`). The factory turns that pair into a live, uninitialized
//! driver instance.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::backends::{LocalBackend, MemoryBackend};
use super::error::{VfsError, VfsResult};
use super::ops::StorageDriver;

/// Builds a driver from its `addition` JSON.
pub type DriverConstructor =
    Arc<dyn Fn(&str) -> VfsResult<Arc<dyn StorageDriver>> + Send + Sync>;

/// Name -> constructor table.
#[derive(Clone)]
pub struct DriverFactory {
    constructors: HashMap<String, DriverConstructor>,
}

impl std::fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("DriverFactory").field("drivers", &names).finish()
    }
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[derive(Debug, Deserialize)]
struct LocalAddition {
    root: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryAddition {
    #[serde(default = "default_true")]
    native_ops: bool,
    #[serde(default)]
    no_upload: bool,
}

fn default_true() -> bool {
    true
}

fn parse_addition<T: serde::de::DeserializeOwned>(driver: &str, addition: &str) -> VfsResult<T> {
    let raw = if addition.trim().is_empty() { "{}" } else { addition };
    serde_json::from_str(raw)
        .map_err(|e| VfsError::other(format!("invalid {} settings: {}", driver, e)))
}

impl DriverFactory {
    /// Empty table.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Table with the `local` and `memory` drivers.
    pub fn with_builtins() -> Self {
        let mut factory = Self::empty();
        factory.register("local", |addition| {
            let settings: LocalAddition = parse_addition("local", addition)?;
            let backend = if settings.read_only {
                LocalBackend::read_only(settings.root)
            } else {
                LocalBackend::new(settings.root)
            };
            Ok(Arc::new(backend) as Arc<dyn StorageDriver>)
        });
        factory.register("memory", |addition| {
            let settings: MemoryAddition = parse_addition("memory", addition)?;
            let backend = MemoryBackend::new()
                .with_native_ops(settings.native_ops)
                .with_no_upload(settings.no_upload);
            Ok(Arc::new(backend) as Arc<dyn StorageDriver>)
        });
        factory
    }

    /// Register (or replace) a driver.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&str) -> VfsResult<Arc<dyn StorageDriver>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    /// Instantiate `driver` with the given settings.
    pub fn create(&self, driver: &str, addition: &str) -> VfsResult<Arc<dyn StorageDriver>> {
        let constructor = self
            .constructors
            .get(driver)
            .ok_or_else(|| VfsError::DriverNotFound(driver.to_string()))?;
        constructor(addition)
    }

    pub fn contains(&self, driver: &str) -> bool {
        self.constructors.contains_key(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let factory = DriverFactory::with_builtins();
        let mem = factory.create("memory", "").unwrap();
        assert_eq!(mem.config().name, "memory");
        assert!(mem.config().capabilities.copy);

        let plain = factory.create("memory", r#"{"native_ops": false}"#).unwrap();
        assert!(!plain.config().capabilities.copy);

        let local = factory.create("local", r#"{"root": "/tmp", "read_only": true}"#).unwrap();
        assert!(local.config().no_upload);
    }

    #[test]
    fn test_unknown_driver_and_bad_settings() {
        let factory = DriverFactory::with_builtins();
        assert!(matches!(
            factory.create("ftp", "{}"),
            Err(VfsError::DriverNotFound(_))
        ));
        assert!(factory.create("local", "{}").is_err());
    }
}
