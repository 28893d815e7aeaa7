//! Cross-subsystem scenarios: module lifetimes against the broker, and the
//! arena lifecycle with per-arena module attachment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use subzone::broker::{ComponentBroker, InterfaceLease, InterfaceToken, Module, ModuleManager};
use subzone::server::{ArenaAction, ArenaActionCallback, TableConfig, ZoneServer};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

trait Oracle: Send + Sync {
    fn answer(&self) -> u32;
}

struct FortyTwo;
impl Oracle for FortyTwo {
    fn answer(&self) -> u32 {
        42
    }
}

/// Registers `dyn Oracle`.
#[derive(Default)]
struct ProviderModule {
    token: Option<InterfaceToken<dyn Oracle>>,
}

impl Module for ProviderModule {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        self.token = Some(broker.register_interface::<dyn Oracle>(Arc::new(FortyTwo)));
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

/// Holds a lease on `dyn Oracle` for as long as it is loaded.
#[derive(Default)]
struct HolderModule {
    lease: Option<InterfaceLease<dyn Oracle>>,
}

impl Module for HolderModule {
    fn load(&mut self, broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        let lease = broker
            .get_interface::<dyn Oracle>()
            .ok_or_else(|| anyhow::anyhow!("no oracle registered"))?;
        self.lease = Some(lease);
        Ok(())
    }

    fn unload(&mut self, _broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        self.lease = None;
        Ok(())
    }
}

#[test]
fn unload_blocked_by_outstanding_lease() {
    init_tracing();
    let broker = ComponentBroker::new_root();
    let mut mm = ModuleManager::new(Arc::clone(&broker));
    mm.register("provider", || Box::new(ProviderModule::default()) as Box<dyn Module>);
    mm.register("holder", || Box::new(HolderModule::default()) as Box<dyn Module>);

    mm.load_module("provider").unwrap();
    mm.load_module("holder").unwrap();

    // The holder's lease pins the provider in place.
    assert!(mm.unload_module("provider").is_err());
    assert!(mm.is_loaded("provider"));

    // The registration is untouched by the failed unload: lookups still
    // resolve to the same implementation.
    assert_eq!(broker.get_interface::<dyn Oracle>().unwrap().answer(), 42);

    mm.unload_module("holder").unwrap();
    mm.unload_module("provider").unwrap();
    assert!(broker.get_interface::<dyn Oracle>().is_none());
}

/// Counts per-arena attach/detach calls.
#[derive(Default)]
struct ProbeModule {
    attached: Arc<AtomicUsize>,
    detached: Arc<AtomicUsize>,
}

impl Module for ProbeModule {
    fn load(&mut self, _broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        Ok(())
    }

    fn unload(&mut self, _broker: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        Ok(())
    }

    fn attach(&mut self, _arena: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&mut self, _arena: &Arc<ComponentBroker>) -> anyhow::Result<()> {
        self.detached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn arena_lifecycle_pairs_actions_and_attachments() {
    init_tracing();
    let config = Arc::new(TableConfig::new());
    config.set("Modules", "AttachModules", "probe");

    let server = ZoneServer::new(config).unwrap();
    server.arenas().set_empty_grace(Duration::ZERO);

    let attached = Arc::new(AtomicUsize::new(0));
    let detached = Arc::new(AtomicUsize::new(0));
    {
        let attached = Arc::clone(&attached);
        let detached = Arc::clone(&detached);
        server.modules().lock().register("probe", move || {
            Box::new(ProbeModule {
                attached: Arc::clone(&attached),
                detached: Arc::clone(&detached),
            }) as Box<dyn Module>
        });
    }
    server.modules().lock().load_module("probe").unwrap();

    let arena = server.arenas().get_or_create("turf");
    let creates = Arc::new(AtomicUsize::new(0));
    let destroys = Arc::new(AtomicUsize::new(0));
    {
        let creates = Arc::clone(&creates);
        let destroys = Arc::clone(&destroys);
        let _cb = arena
            .broker()
            .register_callback::<ArenaActionCallback>(move |(_, action)| match action {
                ArenaAction::Create => {
                    creates.fetch_add(1, Ordering::SeqCst);
                }
                ArenaAction::Destroy => {
                    destroys.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            });
    }

    // Walk the empty arena through its whole life.
    for _ in 0..12 {
        server.arenas().process(server.players());
    }

    assert!(server.arenas().get("turf").is_none());
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    assert_eq!(destroys.load(Ordering::SeqCst), 1);
    assert_eq!(attached.load(Ordering::SeqCst), 1);
    assert_eq!(detached.load(Ordering::SeqCst), 1);

    server.shutdown();
}
