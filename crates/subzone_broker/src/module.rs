//! Module lifecycle management.
//!
//! A module is a self-contained component that registers interfaces,
//! callbacks, and advisors on the broker when loaded. Modules load in
//! declared order and unload in reverse; a module whose interfaces are still
//! leased by others refuses to unload.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::ComponentBroker;

/// A loadable component.
///
/// `load` is where a module resolves its dependencies (keeping the returned
/// leases in its own fields) and registers what it provides (keeping the
/// tokens). `unload` must undo both: drop leases, unregister interfaces. A
/// module with per-arena behavior implements `attach`/`detach`, which receive
/// the arena's broker.
pub trait Module: Send {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()>;

    /// Called after every module in a batch has loaded.
    fn post_load(&mut self, _broker: &Arc<ComponentBroker>) {}

    /// Called before any module in the batch unloads.
    fn pre_unload(&mut self, _broker: &Arc<ComponentBroker>) {}

    /// Returning an error keeps the module loaded (typically
    /// [`BrokerError::InterfaceInUse`](crate::BrokerError::InterfaceInUse)).
    fn unload(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()>;

    fn attach(&mut self, _arena: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        Ok(())
    }

    fn detach(&mut self, _arena: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One line of a module declaration list: a name, optionally followed by a
/// plugin path.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ModuleDecl {
    pub name: String,
    pub plugin_path: Option<String>,
}

impl ModuleDecl {
    /// Parses a declaration list: one module per line, `name [plugin-path]`,
    /// `#` comments and blank lines skipped. Order is preserved.
    pub fn parse_list(text: &str) -> Vec<ModuleDecl> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                let mut parts = l.split_whitespace();
                let name = parts.next().unwrap_or_default().to_owned();
                let plugin_path = parts.next().map(str::to_owned);
                ModuleDecl { name, plugin_path }
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {0} is not registered with the module manager")]
    Unknown(String),
    #[error("module {0} declares a plugin path, but dynamic loading is not supported")]
    PluginUnsupported(String),
    #[error("module {0} is already loaded")]
    AlreadyLoaded(String),
    #[error("module {0} is not loaded")]
    NotLoaded(String),
    #[error("module {name} failed to load: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("module {name} refused to unload: {source}")]
    UnloadRefused {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

type Constructor = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;

struct LoadedModule {
    name: String,
    module: Box<dyn Module>,
}

/// Loads and unloads modules against one root broker.
pub struct ModuleManager {
    broker: Arc<ComponentBroker>,
    constructors: FxHashMap<String, Constructor>,
    loaded: Vec<LoadedModule>,
}

impl ModuleManager {
    pub fn new(broker: Arc<ComponentBroker>) -> Self {
        Self {
            broker,
            constructors: FxHashMap::default(),
            loaded: Vec::new(),
        }
    }

    pub fn broker(&self) -> &Arc<ComponentBroker> {
        &self.broker
    }

    /// Makes `name` loadable. Registration order does not matter; load order
    /// comes from the declaration list.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Module> + Send + Sync + 'static,
    ) {
        self.constructors.insert(name.into(), Box::new(ctor));
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name == name)
    }

    /// Loads every declared module in order. On the first failure, modules
    /// loaded by this call are unloaded again (reverse order) and the error
    /// is returned.
    pub fn load_declared(&mut self, decls: &[ModuleDecl]) -> Result<(), ModuleError> {
        let first = self.loaded.len();

        for decl in decls {
            if let Err(e) = self.load_decl(decl) {
                error!(module = %decl.name, "load failed, rolling back this batch: {e}");
                while self.loaded.len() > first {
                    // Best-effort: a rollback unload that refuses is a leak
                    // we can only report.
                    let name = self.loaded.last().map(|m| m.name.clone());
                    if let Some(name) = name {
                        if let Err(e2) = self.unload_module(&name) {
                            error!(module = %name, "rollback unload failed: {e2}");
                            break;
                        }
                    }
                }
                return Err(e);
            }
        }

        // The whole batch is in; let modules see each other.
        for m in &mut self.loaded[first..] {
            m.module.post_load(&self.broker);
        }
        Ok(())
    }

    fn load_decl(&mut self, decl: &ModuleDecl) -> Result<(), ModuleError> {
        if decl.plugin_path.is_some() {
            return Err(ModuleError::PluginUnsupported(decl.name.clone()));
        }
        self.load_module(&decl.name)
    }

    /// Loads a single module by name.
    pub fn load_module(&mut self, name: &str) -> Result<(), ModuleError> {
        if self.is_loaded(name) {
            return Err(ModuleError::AlreadyLoaded(name.to_owned()));
        }
        let Some(ctor) = self.constructors.get(name) else {
            return Err(ModuleError::Unknown(name.to_owned()));
        };

        let mut module = ctor();
        match module.load(&self.broker) {
            Ok(()) => {
                info!(module = name, "loaded");
                self.loaded.push(LoadedModule {
                    name: name.to_owned(),
                    module,
                });
                Ok(())
            }
            // Dropping `module` here releases any leases it already took.
            Err(source) => Err(ModuleError::LoadFailed {
                name: name.to_owned(),
                source,
            }),
        }
    }

    /// Unloads a single module. Fails (and keeps the module loaded) if the
    /// module refuses, e.g. because its interfaces are still leased.
    pub fn unload_module(&mut self, name: &str) -> Result<(), ModuleError> {
        let Some(pos) = self.loaded.iter().position(|m| m.name == name) else {
            return Err(ModuleError::NotLoaded(name.to_owned()));
        };

        match self.loaded[pos].module.unload(&self.broker) {
            Ok(()) => {
                self.loaded.remove(pos);
                info!(module = name, "unloaded");
                Ok(())
            }
            Err(source) => Err(ModuleError::UnloadRefused {
                name: name.to_owned(),
                source,
            }),
        }
    }

    /// Shutdown: `pre_unload` everything, then unload in reverse load order.
    /// Refusals are logged and skipped so the rest can still come down.
    pub fn unload_all(&mut self) {
        for m in &mut self.loaded {
            m.module.pre_unload(&self.broker);
        }

        let mut remaining = Vec::new();
        while let Some(mut m) = self.loaded.pop() {
            match m.module.unload(&self.broker) {
                Ok(()) => debug!(module = %m.name, "unloaded"),
                Err(e) => {
                    error!(module = %m.name, "refused to unload at shutdown: {e}");
                    remaining.push(m);
                }
            }
        }
        self.loaded = remaining;
    }

    /// Attaches a loaded module to an arena broker.
    pub fn attach_module(
        &mut self,
        name: &str,
        arena: &Arc<ComponentBroker>,
    ) -> Result<(), ModuleError> {
        let Some(m) = self.loaded.iter_mut().find(|m| m.name == name) else {
            return Err(ModuleError::NotLoaded(name.to_owned()));
        };
        m.module.attach(arena).map_err(|source| ModuleError::LoadFailed {
            name: name.to_owned(),
            source,
        })
    }

    /// Detaches a loaded module from an arena broker.
    pub fn detach_module(
        &mut self,
        name: &str,
        arena: &Arc<ComponentBroker>,
    ) -> Result<(), ModuleError> {
        let Some(m) = self.loaded.iter_mut().find(|m| m.name == name) else {
            return Err(ModuleError::NotLoaded(name.to_owned()));
        };
        m.module.detach(arena).map_err(|source| ModuleError::UnloadRefused {
            name: name.to_owned(),
            source,
        })
    }

    /// Names of loaded modules in load order.
    pub fn loaded_names(&self) -> Vec<&str> {
        self.loaded.iter().map(|m| m.name.as_str()).collect()
    }
}

impl fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleManager")
            .field("registered", &self.constructors.len())
            .field("loaded", &self.loaded_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{InterfaceLease, InterfaceToken};

    trait Counter: Send + Sync {
        fn bump(&self) -> u32;
    }

    struct SharedCounter(AtomicU32);
    impl Counter for SharedCounter {
        fn bump(&self) -> u32 {
            self.0.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    /// Registers `dyn Counter`.
    #[derive(Default)]
    struct Provider {
        token: Option<InterfaceToken<dyn Counter>>,
    }

    impl Module for Provider {
        fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
            self.token =
                Some(broker.register_interface::<dyn Counter>(Arc::new(SharedCounter(
                    AtomicU32::new(0),
                ))));
            Ok(())
        }

        fn unload(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
            if let Some(token) = self.token.take() {
                if let Err((token, e)) = broker.unregister_interface(token) {
                    self.token = Some(token);
                    return Err(e.into());
                }
            }
            Ok(())
        }
    }

    /// Depends on `dyn Counter` and holds the lease while loaded.
    #[derive(Default)]
    struct Consumer {
        dep: Option<InterfaceLease<dyn Counter>>,
    }

    impl Module for Consumer {
        fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
            let dep = broker
                .get_interface::<dyn Counter>()
                .ok_or_else(|| anyhow::anyhow!("missing dyn Counter"))?;
            dep.bump();
            self.dep = Some(dep);
            Ok(())
        }

        fn unload(&mut self, _broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
            self.dep = None;
            Ok(())
        }
    }

    fn manager() -> ModuleManager {
        let mut mm = ModuleManager::new(ComponentBroker::new_root());
        mm.register("provider", || Box::new(Provider::default()) as Box<dyn Module>);
        mm.register("consumer", || Box::new(Consumer::default()) as Box<dyn Module>);
        mm
    }

    #[test]
    fn loads_in_order_and_resolves_dependencies() {
        let mut mm = manager();
        let decls = ModuleDecl::parse_list("provider\nconsumer\n");
        mm.load_declared(&decls).unwrap();
        assert_eq!(mm.loaded_names(), vec!["provider", "consumer"]);
    }

    #[test]
    fn missing_dependency_fails_and_rolls_back() {
        let mut mm = manager();
        // consumer first: its dependency is not there yet.
        let decls = ModuleDecl::parse_list("consumer\nprovider\n");
        let err = mm.load_declared(&decls).unwrap_err();
        assert!(matches!(err, ModuleError::LoadFailed { .. }));
        assert_eq!(mm.loaded_names(), Vec::<&str>::new());
    }

    #[test]
    fn unload_blocked_while_dependent_holds_lease() {
        let mut mm = manager();
        mm.load_declared(&ModuleDecl::parse_list("provider\nconsumer")).unwrap();

        // The consumer still holds its lease.
        let err = mm.unload_module("provider").unwrap_err();
        assert!(matches!(err, ModuleError::UnloadRefused { .. }));
        assert!(mm.is_loaded("provider"));

        // Provider's registration is untouched by the failed unload.
        assert!(mm.broker().get_interface::<dyn Counter>().is_some());

        mm.unload_module("consumer").unwrap();
        mm.unload_module("provider").unwrap();
        assert!(mm.broker().get_interface::<dyn Counter>().is_none());
    }

    #[test]
    fn shutdown_unloads_in_reverse_order() {
        let mut mm = manager();
        mm.load_declared(&ModuleDecl::parse_list("provider\nconsumer")).unwrap();
        mm.unload_all();
        assert_eq!(mm.loaded_names(), Vec::<&str>::new());
    }

    #[test]
    fn plugin_paths_are_rejected() {
        let mut mm = manager();
        let decls = ModuleDecl::parse_list("provider plugins/libprovider.so");
        assert!(matches!(
            mm.load_declared(&decls).unwrap_err(),
            ModuleError::PluginUnsupported(_)
        ));
    }
}
