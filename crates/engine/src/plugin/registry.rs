//! Name-to-capability registry.
//!
//! Plugins register once at process start through [`RegistryBuilder`]; the
//! builder seals into an immutable [`PluginRegistry`] before any workflow
//! may start, which admits lock-free reads for the lifetime of the process.

use anyhow::{Result, bail};
use std::collections::HashMap;
use std::sync::Arc;

use super::{DelayPlugin, HttpPlugin, Plugin};

/// Mutable registration surface, alive only during process startup.
#[derive(Default)]
pub struct RegistryBuilder {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder pre-populated with the built-in capabilities.
    pub fn with_builtins() -> Result<Self> {
        let mut builder = Self::new();
        builder.register(Arc::new(HttpPlugin::new()))?;
        builder.register(Arc::new(DelayPlugin))?;
        Ok(builder)
    }

    /// Register one plugin under its declared name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<&mut Self> {
        let name = plugin.name().to_string();
        if name.is_empty() {
            bail!("plugin registered with an empty name");
        }
        if self.plugins.contains_key(&name) {
            bail!("duplicate plugin registration: '{name}'");
        }
        self.plugins.insert(name, plugin);
        Ok(self)
    }

    /// Freeze the registry. No further registration is possible.
    pub fn seal(self) -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry {
            plugins: self.plugins,
        })
    }
}

/// Immutable name-to-plugin map shared across every run on this process.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Look up a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Registered plugin names, sorted, for validation and diagnostics.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}
