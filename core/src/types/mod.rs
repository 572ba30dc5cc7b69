//! The fixed-layout game records that travel on the wire.
//!
//! Every struct here is a plain value type owned by exactly one component;
//! cross-component references use the record's integer index, never a
//! pointer into somebody else's table.

mod affect;
mod item;
mod mob;
mod position;

pub use affect::Affect;
pub use item::{Item, ItemEffect};
pub use mob::Mob;
pub use position::Position;
