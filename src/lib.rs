#![doc = include_str!("../README.md")]

#[cfg(feature = "flags")]
pub use subzone_flags as flags;
pub use {
    subzone_broker as broker, subzone_network as network, subzone_protocol as protocol,
    subzone_server as server,
};

/// The types nearly every embedder touches.
pub mod prelude {
    #[cfg(feature = "flags")]
    pub use subzone_flags::{CarryFlagGame, FlagGame, FlagMode, StaticFlagGame};
    pub use subzone_broker::{Callback, ComponentBroker, Module, ModuleManager};
    pub use subzone_network::bandwidth::Priority;
    pub use subzone_protocol::{Freq, PlayerId, ShipType};
    pub use subzone_server::{
        Arena, ArenaAction, ArenaActionCallback, ConfigProvider, MapData, Network, Player,
        PlayerAction, PlayerActionCallback, PlayerRegistry, Reliability, TableConfig, ZoneServer,
    };
}
