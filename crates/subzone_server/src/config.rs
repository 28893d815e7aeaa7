//! The configuration contract.
//!
//! Parsing the hierarchical `.conf` format is an external concern; the core
//! consumes section/key lookups through [`ConfigProvider`] and announces
//! reloads through the arena `ConfChanged` action.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use subzone_broker::Callback;

/// Section/key string lookup. Implementations must be cheap to call; the
/// core reads keys on arena transitions and module loads, not per packet.
pub trait ConfigProvider: Send + Sync {
    fn get(&self, section: &str, key: &str) -> Option<String>;
}

/// Typed accessors over any [`ConfigProvider`].
pub trait ConfigExt: ConfigProvider {
    fn get_str(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or_else(|| default.to_owned())
    }

    fn get_i32(&self, section: &str, key: &str, default: i32) -> i32 {
        self.get(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_u32(&self, section: &str, key: &str, default: u32) -> u32 {
        self.get(section, key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(v.trim(), "1" | "yes" | "Yes" | "true" | "True" | "y" | "Y"),
            None => default,
        }
    }
}

impl<C: ConfigProvider + ?Sized> ConfigExt for C {}

/// Fired on the root broker when the global configuration was reloaded.
/// Arenas react by firing their own `ConfChanged` action.
pub struct ConfigReloadedCallback;

impl Callback for ConfigReloadedCallback {
    type Args = ();
}

/// An in-memory provider for tests and embedders that assemble their
/// configuration programmatically.
#[derive(Default)]
pub struct TableConfig {
    values: RwLock<FxHashMap<(String, String), String>>,
}

impl TableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, section: &str, key: &str, value: impl Into<String>) {
        self.values
            .write()
            .insert((section.to_owned(), key.to_owned()), value.into());
    }

    pub fn remove(&self, section: &str, key: &str) {
        self.values
            .write()
            .remove(&(section.to_owned(), key.to_owned()));
    }
}

impl ConfigProvider for TableConfig {
    fn get(&self, section: &str, key: &str) -> Option<String> {
        self.values
            .read()
            .get(&(section.to_owned(), key.to_owned()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn typed_accessors_fall_back() {
        let cfg = TableConfig::new();
        cfg.set("Net", "Port", "5000");
        cfg.set("Flag", "CarryFlags", "None");
        cfg.set("Flag", "FriendlyTransfer", "yes");

        assert_eq!(cfg.get_i32("Net", "Port", 1), 5000);
        assert_eq!(cfg.get_i32("Net", "Missing", 7), 7);
        assert_eq!(cfg.get_str("Flag", "CarryFlags", ""), "None");
        assert!(cfg.get_bool("Flag", "FriendlyTransfer", false));
        assert!(!cfg.get_bool("Flag", "NoSuchKey", false));
    }
}
