//! Wire-format constants shared by the server and the offline tools.
//!
//! Every size here is part of the legacy on-wire contract: a record encoded
//! by this implementation must be byte-identical to one produced by the
//! original client for the same logical value. Touch these and you break
//! protocol compatibility.

use bitflags::bitflags;

/// Fixed name slot inside a mob record, terminator included.
pub const NAME_LENGTH: usize = 16;

/// Number of (kind, value) effect pairs carried by every item record.
pub const MAX_ITEM_OPTION: usize = 3;

/// Equipment slots in a mob record.
pub const MAX_EQUIP: usize = 16;

/// Inventory slots in a mob record.
pub const MAX_CARRY: usize = 60;

/// Skill-bar slots in a mob record.
pub const MAX_SKILL: usize = 16;

/// Active-affect slots in a mob record.
pub const MAX_AFFECT: usize = 32;

/// Highest level a mob may report. Values above this are rejected by the
/// strict-mode mob validator.
pub const MAX_LEVEL: u16 = 400;

/// Number of item templates the item list can address; `Item::index` must
/// stay below this.
pub const MAX_ITEMLIST: i16 = 6500;

/// Affect kinds are a single byte; 255 is reserved.
pub const MAX_AFFECT_KIND: u8 = 255;

/// Inclusive upper bound for both map axes.
pub const MAP_MAX_COORD: i16 = 4095;

/// Longest variable-length string a decoder will accept (2^16).
pub const MAX_STRING_LENGTH: usize = 1 << 16;

/// Largest element count a decoder will accept for a length-prefixed array.
pub const MAX_ELEMENTS: usize = 1000;

// Encoded record sizes in bytes. These are fixed by the layout in the codec
// module; the codec's unit tests assert each one.

pub const ITEM_EFFECT_SIZE: usize = 2;
pub const ITEM_SIZE: usize = 2 + ITEM_EFFECT_SIZE * MAX_ITEM_OPTION; // 8
pub const AFFECT_SIZE: usize = 5;
pub const POSITION_SIZE: usize = 4;

/// Full mob record: name + scalars + equip + carry + skill bar + affects +
/// position + trailing scalars.
pub const MOB_SIZE: usize = NAME_LENGTH        // name
    + 1                                        // class
    + 2                                        // level
    + 8                                        // str/int/dex/con
    + 4                                        // ac + damage
    + 16                                       // hp/max_hp/mp/max_mp
    + 8                                        // exp
    + ITEM_SIZE * MAX_EQUIP
    + ITEM_SIZE * MAX_CARRY
    + 2 * MAX_SKILL
    + AFFECT_SIZE * MAX_AFFECT
    + POSITION_SIZE
    + 4                                        // gold
    + 4; // kills

bitflags! {
    /// Behaviour flags carried by item templates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u32 {
        /// Item cannot be traded between players.
        const BOUND        = 0x0000_0001;
        /// Item vanishes when the owner dies.
        const VOLATILE     = 0x0000_0002;
        /// Item survives server-side wipes of dungeon loot.
        const PERSISTENT   = 0x0000_0004;
        /// Item is quest-only and cannot be sold.
        const QUEST        = 0x0000_0008;
        /// Item is unique per character.
        const UNIQUE       = 0x0000_0010;
    }
}
