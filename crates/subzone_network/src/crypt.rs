//! The encryption plug-point.
//!
//! The wire engine is cipher-agnostic: between the socket and the core
//! packet parser sit two in-place hooks, decrypt-after-receive and
//! encrypt-before-send, chosen per connection during conn-init. The actual
//! VIE/Continuum ciphers are external; schemes register here by name and the
//! engine selects the one matching the conn-init client kind.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Per-connection cipher state, created by a scheme at conn-init.
pub trait ConnCipher: Send {
    /// Encrypts a fully framed datagram in place, just before the socket.
    fn encrypt(&mut self, data: &mut Vec<u8>);

    /// Decrypts a received datagram in place. Returning `false` drops the
    /// datagram as failing integrity.
    fn decrypt(&mut self, data: &mut Vec<u8>) -> bool;
}

/// An encryption scheme, selected by the conn-init packet.
pub trait EncryptionScheme: Send + Sync {
    /// Consumes the client's conn-init key; returns the key to echo in the
    /// conn-init response and the cipher for the rest of the connection.
    fn init(&self, client_key: i32) -> (i32, Box<dyn ConnCipher>);
}

/// Passthrough "encryption": echoes the client key unchanged and leaves
/// datagrams alone. What a trusted proxy or a test harness speaks.
pub struct NullEncryption;

struct NullCipher;

impl ConnCipher for NullCipher {
    fn encrypt(&mut self, _data: &mut Vec<u8>) {}

    fn decrypt(&mut self, _data: &mut Vec<u8>) -> bool {
        true
    }
}

impl EncryptionScheme for NullEncryption {
    fn init(&self, client_key: i32) -> (i32, Box<dyn ConnCipher>) {
        (client_key, Box::new(NullCipher))
    }
}

/// Named scheme registry. The conn-init handler looks schemes up by the
/// name derived from the announced client kind (`enc-vie`, `enc-cont`).
#[derive(Default)]
pub struct EncryptionRegistry {
    schemes: RwLock<FxHashMap<String, Arc<dyn EncryptionScheme>>>,
}

impl EncryptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, scheme: Arc<dyn EncryptionScheme>) {
        self.schemes.write().insert(name.into(), scheme);
    }

    pub fn unregister(&self, name: &str) {
        self.schemes.write().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EncryptionScheme>> {
        self.schemes.read().get(name).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let reg = EncryptionRegistry::new();
        reg.register("enc-vie", Arc::new(NullEncryption));

        assert!(reg.get("enc-vie").is_some());
        assert!(reg.get("enc-cont").is_none());

        reg.unregister("enc-vie");
        assert!(reg.get("enc-vie").is_none());
    }

    #[test]
    fn null_scheme_echoes_key() {
        let (key, mut cipher) = NullEncryption.init(0x1234_5678);
        assert_eq!(key, 0x1234_5678);

        let mut data = vec![1, 2, 3];
        cipher.encrypt(&mut data);
        assert!(cipher.decrypt(&mut data));
        assert_eq!(data, vec![1, 2, 3]);
    }
}
