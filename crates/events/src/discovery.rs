//! Module discovery.
//!
//! The host lists its installed apps and, for the ones that take part in the
//! event substrate, provides a loader for the app's `<app>.edas` module. At
//! boot every installed app is tried; apps without a module are skipped
//! quietly and loader failures are logged. Only loaded modules contribute
//! events and listeners.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use edas_core::App;

use crate::listener::ListenerDeclaration;

/// The `edas` module of one app.
pub trait EdasModule: Send + Sync {
    /// Events this app publishes.
    fn events(&self) -> Vec<String> {
        Vec::new()
    }

    /// Listeners this app contributes (to its own or other apps' events).
    fn listeners(&self) -> Vec<ListenerDeclaration> {
        Vec::new()
    }
}

/// Produces an app's module, or explains why it cannot.
pub type ModuleLoader = Box<dyn Fn() -> anyhow::Result<Arc<dyn EdasModule>> + Send + Sync>;

/// Installed apps plus the loaders of their `edas` modules.
#[derive(Default)]
pub struct ModuleCatalog {
    installed: Vec<String>,
    loaders: HashMap<String, ModuleLoader>,
}

impl core::fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut provided: Vec<&String> = self.loaders.keys().collect();
        provided.sort();
        f.debug_struct("ModuleCatalog")
            .field("installed", &self.installed)
            .field("provided", &provided)
            .finish()
    }
}

impl ModuleCatalog {
    pub fn new<I, S>(installed_apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            installed: installed_apps.into_iter().map(Into::into).collect(),
            loaders: HashMap::new(),
        }
    }

    /// Provide a loader for `app`'s module.
    pub fn provide<F>(mut self, app: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn EdasModule>> + Send + Sync + 'static,
    {
        self.loaders.insert(app.into(), Box::new(loader));
        self
    }

    /// Provide an already-built module for `app`.
    pub fn provide_module(self, app: impl Into<String>, module: Arc<dyn EdasModule>) -> Self {
        self.provide(app, move || Ok(module.clone()))
    }

    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    /// Try to load the module of every installed app.
    pub fn discover(&self) -> Discovery {
        let mut modules = Vec::new();
        let mut report = DiscoveryReport::default();

        for app in &self.installed {
            let path = format!("{app}.edas");
            let Some(loader) = self.loaders.get(app) else {
                debug!(module = %path, "no edas module");
                report.missing.push(app.clone());
                continue;
            };

            let app_name = match App::new(app) {
                Ok(app_name) => app_name,
                Err(err) => {
                    warn!(module = %path, error = %err, "edas module has an invalid app name");
                    report.failed.push((app.clone(), err.to_string()));
                    continue;
                }
            };

            match loader() {
                Ok(module) => {
                    report.loaded.push(app.clone());
                    modules.push(DiscoveredModule {
                        app: app_name,
                        module,
                    });
                }
                Err(err) => {
                    warn!(module = %path, error = %err, "failed to load edas module");
                    report.failed.push((app.clone(), format!("{err:#}")));
                }
            }
        }

        info!(
            loaded = ?report.loaded,
            failed = report.failed.len(),
            missing = report.missing.len(),
            "edas module discovery finished"
        );

        Discovery { modules, report }
    }
}

/// A successfully loaded module.
#[derive(Clone)]
pub struct DiscoveredModule {
    app: App,
    module: Arc<dyn EdasModule>,
}

impl core::fmt::Debug for DiscoveredModule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiscoveredModule")
            .field("app", &self.app)
            .finish_non_exhaustive()
    }
}

impl DiscoveredModule {
    pub fn new(app: App, module: Arc<dyn EdasModule>) -> Self {
        Self { app, module }
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn events(&self) -> Vec<String> {
        self.module.events()
    }

    pub fn listeners(&self) -> Vec<ListenerDeclaration> {
        self.module.listeners()
    }
}

/// Which apps had a module, which did not, and which failed to load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct Discovery {
    pub modules: Vec<DiscoveredModule>,
    pub report: DiscoveryReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::on_event;

    struct PolicyModule;

    impl EdasModule for PolicyModule {
        fn events(&self) -> Vec<String> {
            vec!["PolicyPublished".to_string()]
        }

        fn listeners(&self) -> Vec<ListenerDeclaration> {
            vec![on_event("PolicyPublished", true).bind("policy.handlers", "on_published", |_, _| Ok(()))]
        }
    }

    #[test]
    fn records_loaded_missing_and_failed_modules() {
        let catalog = ModuleCatalog::new(["policy", "vendor", "audit"])
            .provide_module("policy", Arc::new(PolicyModule))
            .provide("audit", || Err(anyhow::anyhow!("import error")));

        let discovery = catalog.discover();

        assert_eq!(discovery.report.loaded, vec!["policy"]);
        assert_eq!(discovery.report.missing, vec!["vendor"]);
        assert_eq!(discovery.report.failed.len(), 1);
        assert_eq!(discovery.report.failed[0].0, "audit");
        assert_eq!(discovery.modules.len(), 1);
        assert_eq!(discovery.modules[0].app().as_str(), "policy");
        assert_eq!(discovery.modules[0].events(), vec!["PolicyPublished"]);
    }

    #[test]
    fn loaders_for_apps_that_are_not_installed_are_ignored() {
        let catalog = ModuleCatalog::new(Vec::<String>::new()).provide_module("policy", Arc::new(PolicyModule));
        let discovery = catalog.discover();
        assert!(discovery.modules.is_empty());
        assert!(discovery.report.loaded.is_empty());
    }
}
