//! The arena registry and lifecycle state machine.
//!
//! An arena is a named game room and, simultaneously, a child broker scope:
//! modules attach per arena, interfaces resolve locally first, and callbacks
//! fired on the arena reach arena subscribers plus the root's.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use subzone_broker::{Callback, ComponentBroker, ModuleManager};
use tracing::{debug, error, info};

use crate::config::{ConfigExt, ConfigProvider};
use crate::extra::{ExtraData, ExtraDataKey, ExtraDataRegistry};
use crate::player::PlayerRegistry;

/// Stable arena handle; resolves through the manager. Players store this
/// rather than an `Arc<Arena>` so the Player/Arena reference graph stays
/// acyclic.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ArenaId(pub u32);

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Lifecycle states. Creation walks the init states firing callbacks, with
/// `WaitHolds*` letting asynchronous work delay a transition; destruction is
/// symmetric.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArenaStatus {
    DoInit0,
    WaitHolds0,
    DoInit1,
    WaitHolds1,
    Running,
    DoWriteData,
    DoDestroy1,
    WaitHolds2,
    DoDestroy2,
}

/// The arena lifecycle event.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ArenaAction {
    PreCreate,
    Create,
    ConfChanged,
    Destroy,
}

/// Fired on the arena's own broker for every [`ArenaAction`].
pub struct ArenaActionCallback;

impl Callback for ArenaActionCallback {
    type Args = (Arc<Arena>, ArenaAction);
}

pub struct Arena {
    id: ArenaId,
    name: String,
    broker: Arc<ComponentBroker>,
    cfg: Arc<dyn ConfigProvider>,
    status: Mutex<ArenaStatus>,
    holds: AtomicU32,
    attached: Mutex<Vec<String>>,
    created: Instant,
    extra_registry: Arc<ExtraDataRegistry>,
    extra: ExtraData,
}

impl Arena {
    pub fn id(&self) -> ArenaId {
        self.id
    }

    /// Canonical (lower-case) arena name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<ComponentBroker> {
        &self.broker
    }

    pub fn config(&self) -> &Arc<dyn ConfigProvider> {
        &self.cfg
    }

    pub fn status(&self) -> ArenaStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == ArenaStatus::Running
    }

    /// Delays the current `WaitHolds*` transition until released.
    pub fn add_hold(&self) {
        self.holds.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_hold(&self) {
        let prev = self.holds.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "hold released without being taken");
    }

    fn holds(&self) -> u32 {
        self.holds.load(Ordering::SeqCst)
    }

    /// Module data in this arena's slot for `key`.
    pub fn extra<T>(&self, key: ExtraDataKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.extra.get(&self.extra_registry, key)
    }
}

/// Supplies per-arena configuration. The default hands every arena the
/// global config; a `.conf`-reading implementation layers arena overrides.
pub trait ArenaConfigSource: Send + Sync {
    fn arena_config(&self, arena_name: &str) -> Arc<dyn ConfigProvider>;
}

/// Every arena shares one provider.
pub struct SharedConfigSource(pub Arc<dyn ConfigProvider>);

impl ArenaConfigSource for SharedConfigSource {
    fn arena_config(&self, _arena_name: &str) -> Arc<dyn ConfigProvider> {
        Arc::clone(&self.0)
    }
}

/// Owns every arena and drives their state machines from the mainloop.
pub struct ArenaManager {
    broker: Arc<ComponentBroker>,
    arenas: RwLock<FxHashMap<String, Arc<Arena>>>,
    next_id: AtomicU32,
    extra_registry: Arc<ExtraDataRegistry>,
    config_source: RwLock<Arc<dyn ArenaConfigSource>>,
    modules: RwLock<Option<Arc<Mutex<ModuleManager>>>>,
    /// How long an empty arena lingers before destruction, letting the
    /// player who requested it arrive.
    empty_grace: RwLock<Duration>,
}

impl ArenaManager {
    pub fn new(broker: Arc<ComponentBroker>, config_source: Arc<dyn ArenaConfigSource>) -> Self {
        Self {
            broker,
            arenas: RwLock::default(),
            next_id: AtomicU32::new(0),
            extra_registry: Arc::new(ExtraDataRegistry::new()),
            config_source: RwLock::new(config_source),
            modules: RwLock::default(),
            empty_grace: RwLock::new(Duration::from_secs(10)),
        }
    }

    /// How long an empty arena lingers before being destroyed.
    pub fn set_empty_grace(&self, grace: Duration) {
        *self.empty_grace.write() = grace;
    }

    /// The slot registry for per-arena module data.
    pub fn extra_registry(&self) -> &Arc<ExtraDataRegistry> {
        &self.extra_registry
    }

    /// Wires in the module manager used for per-arena attach/detach.
    pub fn set_module_manager(&self, mm: Arc<Mutex<ModuleManager>>) {
        *self.modules.write() = Some(mm);
    }

    pub fn set_config_source(&self, source: Arc<dyn ArenaConfigSource>) {
        *self.config_source.write() = source;
    }

    /// Finds or begins creating the named arena. Creation completes over
    /// the next few mainloop ticks; callers watch for `Running`.
    pub fn get_or_create(&self, name: &str) -> Arc<Arena> {
        let canonical = name.to_ascii_lowercase();
        if let Some(a) = self.arenas.read().get(&canonical) {
            return Arc::clone(a);
        }

        let mut arenas = self.arenas.write();
        if let Some(a) = arenas.get(&canonical) {
            return Arc::clone(a);
        }

        let id = ArenaId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cfg = self.config_source.read().arena_config(&canonical);
        let arena = Arc::new(Arena {
            id,
            name: canonical.clone(),
            broker: self.broker.new_child(canonical.clone()),
            cfg,
            status: Mutex::new(ArenaStatus::DoInit0),
            holds: AtomicU32::new(0),
            attached: Mutex::new(Vec::new()),
            created: Instant::now(),
            extra_registry: Arc::clone(&self.extra_registry),
            extra: ExtraData::new(),
        });
        arenas.insert(canonical, Arc::clone(&arena));
        info!(arena = %arena.name, "arena created");
        arena
    }

    pub fn get(&self, name: &str) -> Option<Arc<Arena>> {
        self.arenas.read().get(&name.to_ascii_lowercase()).map(Arc::clone)
    }

    pub fn get_by_id(&self, id: ArenaId) -> Option<Arc<Arena>> {
        self.arenas.read().values().find(|a| a.id == id).map(Arc::clone)
    }

    pub fn arenas(&self) -> Vec<Arc<Arena>> {
        self.arenas.read().values().map(Arc::clone).collect()
    }

    /// Fires `ConfChanged` on every running arena after a config reload.
    pub fn conf_changed(&self) {
        for arena in self.arenas() {
            if arena.is_running() {
                arena
                    .broker
                    .fire_callback::<ArenaActionCallback>(&(
                        Arc::clone(&arena),
                        ArenaAction::ConfChanged,
                    ));
            }
        }
    }

    /// Advances every arena one lifecycle step. Runs on the mainloop.
    pub fn process(&self, players: &PlayerRegistry) {
        for arena in self.arenas() {
            self.step(&arena, players);
        }
    }

    fn step(&self, arena: &Arc<Arena>, players: &PlayerRegistry) {
        let status = arena.status();
        match status {
            ArenaStatus::DoInit0 => {
                arena
                    .broker
                    .fire_callback::<ArenaActionCallback>(&(
                        Arc::clone(arena),
                        ArenaAction::PreCreate,
                    ));
                self.attach_declared(arena);
                self.set_status(arena, ArenaStatus::WaitHolds0);
            }
            ArenaStatus::WaitHolds0 => {
                if arena.holds() == 0 {
                    self.set_status(arena, ArenaStatus::DoInit1);
                }
            }
            ArenaStatus::DoInit1 => {
                arena
                    .broker
                    .fire_callback::<ArenaActionCallback>(&(
                        Arc::clone(arena),
                        ArenaAction::Create,
                    ));
                self.set_status(arena, ArenaStatus::WaitHolds1);
            }
            ArenaStatus::WaitHolds1 => {
                if arena.holds() == 0 {
                    self.set_status(arena, ArenaStatus::Running);
                }
            }
            ArenaStatus::Running => {
                let occupied = !players.in_arena(arena.id).is_empty()
                    || players
                        .players()
                        .iter()
                        .any(|p| p.state().target_arena.as_deref() == Some(arena.name()));
                if !occupied && arena.created.elapsed() > *self.empty_grace.read() {
                    debug!(arena = %arena.name, "empty, destroying");
                    self.set_status(arena, ArenaStatus::DoWriteData);
                }
            }
            ArenaStatus::DoWriteData => {
                // Persist writes happen in Destroy subscribers; this state
                // exists so holds taken there can delay the teardown.
                self.set_status(arena, ArenaStatus::DoDestroy1);
            }
            ArenaStatus::DoDestroy1 => {
                arena
                    .broker
                    .fire_callback::<ArenaActionCallback>(&(
                        Arc::clone(arena),
                        ArenaAction::Destroy,
                    ));
                self.detach_all(arena);
                self.set_status(arena, ArenaStatus::WaitHolds2);
            }
            ArenaStatus::WaitHolds2 => {
                if arena.holds() == 0 {
                    self.set_status(arena, ArenaStatus::DoDestroy2);
                }
            }
            ArenaStatus::DoDestroy2 => {
                arena.extra.clear();
                self.arenas.write().remove(arena.name());
                info!(arena = %arena.name, "arena destroyed");
            }
        }
    }

    fn set_status(&self, arena: &Arc<Arena>, status: ArenaStatus) {
        *arena.status.lock() = status;
    }

    /// Attaches the modules named in `[Modules] AttachModules`.
    fn attach_declared(&self, arena: &Arc<Arena>) {
        let declared = arena.cfg.get_str("Modules", "AttachModules", "");
        let Some(mm) = self.modules.read().as_ref().map(Arc::clone) else {
            return;
        };
        let mut mm = mm.lock();
        for name in declared.split_whitespace() {
            match mm.attach_module(name, arena.broker()) {
                Ok(()) => arena.attached.lock().push(name.to_owned()),
                Err(e) => error!(arena = %arena.name, module = name, "attach failed: {e}"),
            }
        }
    }

    /// Detaches in reverse attach order.
    fn detach_all(&self, arena: &Arc<Arena>) {
        let Some(mm) = self.modules.read().as_ref().map(Arc::clone) else {
            return;
        };
        let mut mm = mm.lock();
        let mut attached = arena.attached.lock();
        while let Some(name) = attached.pop() {
            if let Err(e) = mm.detach_module(&name, arena.broker()) {
                error!(arena = %arena.name, module = %name, "detach failed: {e}");
            }
        }
    }
}
