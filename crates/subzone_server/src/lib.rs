#![doc = include_str!("../README.md")]

pub mod arena;
pub mod config;
pub mod core_module;
pub mod extra;
pub mod mainloop;
pub mod map;
pub mod net_module;
pub mod persist;
pub mod player;
pub mod services;

use std::sync::Arc;

use anyhow::Context;
pub use arena::{Arena, ArenaAction, ArenaActionCallback, ArenaId, ArenaManager, ArenaStatus};
pub use config::{ConfigExt, ConfigProvider, TableConfig};
pub use extra::{ExtraDataKey, ExtraDataRegistry};
pub use mainloop::{Mainloop, MainloopHandle, TimerKey, TimerKind, WorkerPool};
pub use map::{GridMap, MapData, RegionFlags, Tile, TileCoord};
pub use net_module::{Network, NetworkModule, PacketHandler, Reliability};
use parking_lot::Mutex;
pub use persist::{MemoryPersist, PersistInterval, PersistentStorage};
pub use player::{
    Player, PlayerAction, PlayerActionCallback, PlayerRegistry, PlayerState, PlayerStatus,
};
pub use services::{AllowAllAuth, Auth, AuthRequest, AuthResult, Chat, CommandDispatch, LagQuery};
use subzone_broker::module::ModuleDecl;
pub use subzone_network::SizedSource;
use subzone_broker::{ComponentBroker, InterfaceToken, ModuleManager};
use tracing::info;

use crate::arena::{ArenaConfigSource, SharedConfigSource};
use crate::core_module::CoreModule;

/// Everything a zone process needs wired together: the root broker with the
/// core singletons registered on it, the mainloop, the worker pool, and the
/// module manager with the built-in modules available.
///
/// ```no_run
/// use std::sync::Arc;
/// use subzone_server::{TableConfig, ZoneServer};
///
/// let server = ZoneServer::new(Arc::new(TableConfig::new())).unwrap();
/// server.load_modules("net\ncore\n").unwrap();
/// server.run();
/// ```
pub struct ZoneServer {
    broker: Arc<ComponentBroker>,
    mainloop: Mutex<Mainloop>,
    handle: MainloopHandle,
    players: Arc<PlayerRegistry>,
    arenas: Arc<ArenaManager>,
    pool: Arc<WorkerPool>,
    modules: Arc<Mutex<ModuleManager>>,
    tokens: Mutex<Option<CoreTokens>>,
}

struct CoreTokens {
    config: InterfaceToken<dyn ConfigProvider>,
    players: InterfaceToken<PlayerRegistry>,
    arenas: InterfaceToken<ArenaManager>,
    mainloop: InterfaceToken<MainloopHandle>,
    pool: InterfaceToken<WorkerPool>,
}

impl ZoneServer {
    pub fn new(config: Arc<dyn ConfigProvider>) -> anyhow::Result<Arc<Self>> {
        let broker = ComponentBroker::new_root();
        let mainloop = Mainloop::new();
        let handle = mainloop.handle();

        let players = Arc::new(PlayerRegistry::new());
        let arenas = Arc::new(ArenaManager::new(
            Arc::clone(&broker),
            Arc::new(SharedConfigSource(Arc::clone(&config))) as Arc<dyn ArenaConfigSource>,
        ));
        let pool = Arc::new(WorkerPool::new(4));

        let tokens = CoreTokens {
            config: broker.register_interface::<dyn ConfigProvider>(Arc::clone(&config)),
            players: broker.register_interface::<PlayerRegistry>(Arc::clone(&players)),
            arenas: broker.register_interface::<ArenaManager>(Arc::clone(&arenas)),
            mainloop: broker.register_interface::<MainloopHandle>(Arc::new(handle.clone())),
            pool: broker.register_interface::<WorkerPool>(Arc::clone(&pool)),
        };

        let mut modules = ModuleManager::new(Arc::clone(&broker));
        modules.register("net", || Box::new(NetworkModule::default()) as Box<dyn subzone_broker::Module>);
        modules.register("core", || Box::new(CoreModule::default()) as Box<dyn subzone_broker::Module>);
        let modules = Arc::new(Mutex::new(modules));
        arenas.set_module_manager(Arc::clone(&modules));

        Ok(Arc::new(Self {
            broker,
            mainloop: Mutex::new(mainloop),
            handle,
            players,
            arenas,
            pool,
            modules,
            tokens: Mutex::new(Some(tokens)),
        }))
    }

    pub fn broker(&self) -> &Arc<ComponentBroker> {
        &self.broker
    }

    pub fn players(&self) -> &Arc<PlayerRegistry> {
        &self.players
    }

    pub fn arenas(&self) -> &Arc<ArenaManager> {
        &self.arenas
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn handle(&self) -> &MainloopHandle {
        &self.handle
    }

    pub fn modules(&self) -> &Arc<Mutex<ModuleManager>> {
        &self.modules
    }

    /// Loads modules from a declaration list (`name [plugin-path]`, one per
    /// line, in order).
    pub fn load_modules(&self, decls: &str) -> anyhow::Result<()> {
        let decls = ModuleDecl::parse_list(decls);
        self.modules
            .lock()
            .load_declared(&decls)
            .context("loading declared modules")
    }

    /// Runs the mainloop on the calling thread until [`stop`](Self::stop).
    pub fn run(&self) {
        info!("zone up");
        self.mainloop.lock().run();
        info!("mainloop stopped");
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Orderly teardown: unload modules (reverse order), then drop the core
    /// interface registrations.
    pub fn shutdown(&self) {
        self.stop();
        self.modules.lock().unload_all();
        if let Some(tokens) = self.tokens.lock().take() {
            let _ = self.broker.unregister_interface(tokens.config);
            let _ = self.broker.unregister_interface(tokens.players);
            let _ = self.broker.unregister_interface(tokens.arenas);
            let _ = self.broker.unregister_interface(tokens.mainloop);
            let _ = self.broker.unregister_interface(tokens.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn core_singletons_resolve_through_broker() {
        let server = ZoneServer::new(Arc::new(TableConfig::new())).unwrap();
        let broker = server.broker();

        assert!(broker.get_interface::<dyn ConfigProvider>().is_some());
        assert!(broker.get_interface::<PlayerRegistry>().is_some());
        assert!(broker.get_interface::<ArenaManager>().is_some());
        assert!(broker.get_interface::<MainloopHandle>().is_some());
        assert!(broker.get_interface::<WorkerPool>().is_some());

        // And from an arena's child broker, via the parent chain.
        let arena = server.arenas().get_or_create("turf");
        assert!(arena.broker().get_interface::<PlayerRegistry>().is_some());

        server.shutdown();
    }

    #[test]
    fn shutdown_releases_core_registrations() {
        let server = ZoneServer::new(Arc::new(TableConfig::new())).unwrap();
        server.shutdown();
        assert!(server.broker().get_interface::<PlayerRegistry>().is_none());
        assert_eq!(server.modules().lock().loaded_names().len(), 0);
    }
}
