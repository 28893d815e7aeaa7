//! Interface contracts for collaborator modules.
//!
//! These traits are resolved through the broker; the core provides either a
//! trivial default (auth) or nothing but the seam (chat, commands). Real
//! implementations live in external modules.

use std::sync::Arc;

use subzone_network::lag::{ConnStats, LagStats};
use subzone_protocol::frame::ClientKind;
use subzone_protocol::packets::s2c::LoginCode;

use crate::arena::Arena;
use crate::player::Player;

/// What a login attempt carries into authentication.
#[derive(Clone, Debug)]
pub struct AuthRequest {
    pub name: String,
    pub password: String,
    pub machine_id: u32,
    pub client_kind: ClientKind,
}

/// The verdict. `name`/`squad` are canonical forms the server adopts.
#[derive(Clone, Debug)]
pub struct AuthResult {
    pub code: LoginCode,
    pub name: String,
    pub squad: String,
}

/// Authenticates logins. Called on the worker pool; implementations may
/// block on files or databases.
pub trait Auth: Send + Sync {
    fn authenticate(&self, req: AuthRequest) -> AuthResult;
}

/// Accepts anyone under the name they asked for. The default when no auth
/// module shadows it.
pub struct AllowAllAuth;

impl Auth for AllowAllAuth {
    fn authenticate(&self, req: AuthRequest) -> AuthResult {
        AuthResult {
            code: LoginCode::Ok,
            name: req.name,
            squad: String::new(),
        }
    }
}

/// Chat delivery, implemented by the chat module.
pub trait Chat: Send + Sync {
    fn send_arena_message(&self, arena: &Arc<Arena>, message: &str);
    fn send_private_message(&self, player: &Arc<Player>, message: &str);
}

/// Command routing (`?commands`), implemented by the command module.
pub trait CommandDispatch: Send + Sync {
    /// Returns `true` when the line was recognized and handled.
    fn dispatch(&self, player: &Arc<Player>, line: &str) -> bool;
}

/// Latency/traffic queries against the transport, registered by the network
/// module.
pub trait LagQuery: Send + Sync {
    fn lag(&self, player: &Arc<Player>) -> Option<LagStats>;
    fn traffic(&self, player: &Arc<Player>) -> Option<ConnStats>;
}
