//! Game packet definitions, split by direction.
//!
//! Only the packets the zone core itself consumes or emits are defined here;
//! gameplay modules owning other packet types decode them from the raw bytes
//! handed over by the network layer.

pub mod c2s;
pub mod s2c;
