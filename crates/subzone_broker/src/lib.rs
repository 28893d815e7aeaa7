#![doc = include_str!("../README.md")]

pub mod module;

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{error, warn};

pub use module::{Module, ModuleManager};

/// Identifies one kind of multicast event. The `Args` type is what every
/// subscriber receives by reference when the callback fires.
///
/// Implementors are zero-sized marker types:
///
/// ```
/// use subzone_broker::Callback;
///
/// struct PlayerKilled;
///
/// impl Callback for PlayerKilled {
///     type Args = (u16, u16); // killer, killed
/// }
/// ```
pub trait Callback: 'static {
    type Args: 'static;
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The registration has outstanding leases and cannot be removed yet.
    #[error("interface {type_name} has {leases} outstanding lease(s)")]
    InterfaceInUse {
        type_name: &'static str,
        leases: usize,
    },
    /// The token does not match any live registration on this broker.
    #[error("no such registration on this broker")]
    NotRegistered,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Grants the registrar the right to unregister an interface registration.
///
/// Tokens are typed by the interface, so handing a token for the wrong
/// interface to `unregister_interface` is a compile error rather than a
/// runtime one.
#[must_use = "dropping the token makes the registration permanent until broker teardown"]
pub struct InterfaceToken<I: ?Sized + 'static> {
    id: u64,
    name: Option<String>,
    _marker: PhantomData<fn(&I)>,
}

impl<I: ?Sized + 'static> fmt::Debug for InterfaceToken<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceToken")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Grants the registrar the right to unregister an advisor.
#[must_use = "dropping the token makes the registration permanent until broker teardown"]
pub struct AdvisorToken<A: ?Sized + 'static> {
    id: u64,
    _marker: PhantomData<fn(&A)>,
}

/// Grants the registrar the right to unregister a callback subscription.
#[must_use = "dropping the token makes the subscription permanent until broker teardown"]
pub struct CallbackToken {
    id: u64,
    type_id: TypeId,
}

/// A refcounted lease on an interface implementation, returned by
/// [`ComponentBroker::get_interface`].
///
/// The lease derefs to the implementation. Dropping it is the release; while
/// any lease is alive the registration cannot be unregistered, which is what
/// keeps a module loaded while others depend on it.
pub struct InterfaceLease<I: ?Sized> {
    imp: Arc<I>,
    refs: Arc<AtomicUsize>,
}

impl<I: ?Sized> InterfaceLease<I> {
    /// An extra lease on the same registration.
    pub fn renew(&self) -> Self {
        self.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            imp: Arc::clone(&self.imp),
            refs: Arc::clone(&self.refs),
        }
    }
}

impl<I: ?Sized> std::ops::Deref for InterfaceLease<I> {
    type Target = I;

    fn deref(&self) -> &I {
        &self.imp
    }
}

impl<I: ?Sized> Drop for InterfaceLease<I> {
    fn drop(&mut self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "interface lease released twice");
    }
}

#[derive(PartialEq, Eq, Hash, Clone)]
struct InterfaceKey {
    type_id: TypeId,
    name: Option<String>,
}

struct InterfaceEntry {
    id: u64,
    /// A `Box<dyn Any>` holding an `Arc<I>`.
    imp: Box<dyn Any + Send + Sync>,
    refs: Arc<AtomicUsize>,
    type_name: &'static str,
}

struct CallbackEntry {
    id: u64,
    /// A `Box<dyn Any>` holding an `Arc<dyn Fn(&C::Args) + Send + Sync>`.
    f: Box<dyn Any + Send + Sync>,
}

struct AdvisorEntry {
    id: u64,
    /// A `Box<dyn Any>` holding an `Arc<A>`.
    imp: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Registry {
    /// Per key, a stack: the most recent registration shadows the rest.
    interfaces: FxHashMap<InterfaceKey, Vec<InterfaceEntry>>,
    /// Per callback type, subscribers in registration order.
    callbacks: FxHashMap<TypeId, Vec<CallbackEntry>>,
    advisors: FxHashMap<TypeId, Vec<AdvisorEntry>>,
}

/// A scoped registry of interfaces, callbacks, and advisors.
///
/// Brokers form a tree: one root for the zone, one child per arena. Interface
/// lookup walks up the tree; callback firing visits the local broker and then
/// each ancestor exactly once.
pub struct ComponentBroker {
    parent: Option<Arc<ComponentBroker>>,
    scope: String,
    inner: RwLock<Registry>,
}

impl ComponentBroker {
    /// Creates the root broker for a zone.
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            scope: "zone".to_owned(),
            inner: RwLock::default(),
        })
    }

    /// Creates a child broker scoped to `scope` (an arena name).
    pub fn new_child(self: &Arc<Self>, scope: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            scope: scope.into(),
            inner: RwLock::default(),
        })
    }

    pub fn parent(&self) -> Option<&Arc<ComponentBroker>> {
        self.parent.as_ref()
    }

    /// The scope label, for diagnostics ("zone" or the arena name).
    pub fn scope(&self) -> &str {
        &self.scope
    }

    // ----- interfaces -----

    /// Registers `imp` as the current implementation of `I`, shadowing any
    /// prior registration for the same (interface, name) pair.
    pub fn register_interface<I>(self: &Arc<Self>, imp: Arc<I>) -> InterfaceToken<I>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.register_interface_named(imp, None)
    }

    /// Like [`register_interface`](Self::register_interface) but under a
    /// distinguishing name, for interfaces with multiple live providers
    /// (encryption schemes, for example).
    pub fn register_interface_named<I>(
        self: &Arc<Self>,
        imp: Arc<I>,
        name: Option<&str>,
    ) -> InterfaceToken<I>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let key = InterfaceKey {
            type_id: TypeId::of::<I>(),
            name: name.map(str::to_owned),
        };
        let id = fresh_id();

        let entry = InterfaceEntry {
            id,
            imp: Box::new(imp),
            refs: Arc::new(AtomicUsize::new(0)),
            type_name: std::any::type_name::<I>(),
        };

        self.inner.write().interfaces.entry(key).or_default().push(entry);

        InterfaceToken {
            id,
            name: name.map(str::to_owned),
            _marker: PhantomData,
        }
    }

    /// Removes the registration identified by `token`.
    ///
    /// Fails with [`BrokerError::InterfaceInUse`] while leases are
    /// outstanding; the caller must treat that as "cannot unload yet".
    pub fn unregister_interface<I>(
        &self,
        token: InterfaceToken<I>,
    ) -> Result<(), (InterfaceToken<I>, BrokerError)>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let key = InterfaceKey {
            type_id: TypeId::of::<I>(),
            name: token.name.clone(),
        };

        let mut reg = self.inner.write();

        let Some(stack) = reg.interfaces.get_mut(&key) else {
            return Err((token, BrokerError::NotRegistered));
        };
        let Some(pos) = stack.iter().position(|e| e.id == token.id) else {
            return Err((token, BrokerError::NotRegistered));
        };

        let leases = stack[pos].refs.load(Ordering::SeqCst);
        if leases > 0 {
            let type_name = stack[pos].type_name;
            return Err((token, BrokerError::InterfaceInUse { type_name, leases }));
        }

        stack.remove(pos);
        if stack.is_empty() {
            reg.interfaces.remove(&key);
        }
        Ok(())
    }

    /// Returns a lease on the most recent live registration of `I` on this
    /// broker, falling back to the parent chain on a miss.
    pub fn get_interface<I>(&self) -> Option<InterfaceLease<I>>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.get_interface_named(None)
    }

    pub fn get_interface_named<I>(&self, name: Option<&str>) -> Option<InterfaceLease<I>>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        let key = InterfaceKey {
            type_id: TypeId::of::<I>(),
            name: name.map(str::to_owned),
        };

        let mut broker = Some(self);
        while let Some(b) = broker {
            let reg = b.inner.read();
            if let Some(entry) = reg.interfaces.get(&key).and_then(|stack| stack.last()) {
                let imp = entry
                    .imp
                    .downcast_ref::<Arc<I>>()
                    .expect("interface entry stored under its own TypeId");
                entry.refs.fetch_add(1, Ordering::SeqCst);
                return Some(InterfaceLease {
                    imp: Arc::clone(imp),
                    refs: Arc::clone(&entry.refs),
                });
            }
            drop(reg);
            broker = b.parent.as_deref();
        }
        None
    }

    // ----- callbacks -----

    /// Subscribes to callback `C` on this broker. Subscribers fire in
    /// registration order.
    pub fn register_callback<C: Callback>(
        &self,
        f: impl Fn(&C::Args) + Send + Sync + 'static,
    ) -> CallbackToken {
        let id = fresh_id();
        let f: Arc<dyn Fn(&C::Args) + Send + Sync> = Arc::new(f);

        self.inner
            .write()
            .callbacks
            .entry(TypeId::of::<C>())
            .or_default()
            .push(CallbackEntry { id, f: Box::new(f) });

        CallbackToken {
            id,
            type_id: TypeId::of::<C>(),
        }
    }

    pub fn unregister_callback(&self, token: CallbackToken) -> Result<(), BrokerError> {
        let mut reg = self.inner.write();
        let Some(list) = reg.callbacks.get_mut(&token.type_id) else {
            return Err(BrokerError::NotRegistered);
        };
        let Some(pos) = list.iter().position(|e| e.id == token.id) else {
            return Err(BrokerError::NotRegistered);
        };
        list.remove(pos);
        Ok(())
    }

    /// Fires `C` on this broker, then on each ancestor once.
    ///
    /// This is the one-and-only entry point for firing: subscribers on an
    /// arena broker see events fired on that arena, subscribers on the root
    /// see events from everywhere. A panicking subscriber is logged and does
    /// not stop the others.
    pub fn fire_callback<C: Callback>(&self, args: &C::Args) {
        let mut broker = Some(self);
        while let Some(b) = broker {
            b.fire_local::<C>(args);
            broker = b.parent.as_deref();
        }
    }

    fn fire_local<C: Callback>(&self, args: &C::Args) {
        // Snapshot under the read lock, invoke outside it, so subscribers can
        // re-enter the broker.
        let snapshot: Vec<Arc<dyn Fn(&C::Args) + Send + Sync>> = {
            let reg = self.inner.read();
            match reg.callbacks.get(&TypeId::of::<C>()) {
                Some(list) => list
                    .iter()
                    .map(|e| {
                        Arc::clone(
                            e.f.downcast_ref::<Arc<dyn Fn(&C::Args) + Send + Sync>>()
                                .expect("callback entry stored under its own TypeId"),
                        )
                    })
                    .collect(),
                None => return,
            }
        };

        for f in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(args))) {
                let msg = panic_message(&payload);
                error!(
                    scope = %self.scope,
                    callback = std::any::type_name::<C>(),
                    "callback subscriber panicked: {msg}"
                );
            }
        }
    }

    // ----- advisors -----

    /// Adds `imp` to the advisor collection for `A`.
    pub fn register_advisor<A>(&self, imp: Arc<A>) -> AdvisorToken<A>
    where
        A: ?Sized + Send + Sync + 'static,
    {
        let id = fresh_id();
        self.inner
            .write()
            .advisors
            .entry(TypeId::of::<A>())
            .or_default()
            .push(AdvisorEntry {
                id,
                imp: Box::new(imp),
            });
        AdvisorToken {
            id,
            _marker: PhantomData,
        }
    }

    pub fn unregister_advisor<A>(&self, token: AdvisorToken<A>) -> Result<(), BrokerError>
    where
        A: ?Sized + Send + Sync + 'static,
    {
        let mut reg = self.inner.write();
        let Some(list) = reg.advisors.get_mut(&TypeId::of::<A>()) else {
            return Err(BrokerError::NotRegistered);
        };
        let Some(pos) = list.iter().position(|e| e.id == token.id) else {
            return Err(BrokerError::NotRegistered);
        };
        list.remove(pos);
        Ok(())
    }

    /// A snapshot of every `A` advisor visible from this scope (local ones
    /// first, then each ancestor's). Safe to iterate while registrations
    /// change.
    pub fn get_advisors<A>(&self) -> Vec<Arc<A>>
    where
        A: ?Sized + Send + Sync + 'static,
    {
        let mut out = Vec::new();
        let mut broker = Some(self);
        while let Some(b) = broker {
            let reg = b.inner.read();
            if let Some(list) = reg.advisors.get(&TypeId::of::<A>()) {
                out.extend(list.iter().map(|e| {
                    Arc::clone(
                        e.imp
                            .downcast_ref::<Arc<A>>()
                            .expect("advisor entry stored under its own TypeId"),
                    )
                }));
            }
            drop(reg);
            broker = b.parent.as_deref();
        }
        out
    }
}

impl Drop for ComponentBroker {
    fn drop(&mut self) {
        // Leak detection at teardown: anything still here was never
        // unregistered, and any nonzero refcount is a lease that outlived
        // its broker.
        let reg = self.inner.get_mut();
        for stack in reg.interfaces.values() {
            for entry in stack {
                let leases = entry.refs.load(Ordering::SeqCst);
                if leases > 0 {
                    warn!(
                        scope = %self.scope,
                        interface = entry.type_name,
                        leases,
                        "interface leases leaked past broker teardown"
                    );
                } else {
                    warn!(
                        scope = %self.scope,
                        interface = entry.type_name,
                        "interface still registered at broker teardown"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for ComponentBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.inner.read();
        f.debug_struct("ComponentBroker")
            .field("scope", &self.scope)
            .field("interfaces", &reg.interfaces.len())
            .field("callbacks", &reg.callbacks.len())
            .field("advisors", &reg.advisors.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}
