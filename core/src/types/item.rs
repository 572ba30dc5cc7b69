//! Item structure

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_ITEMLIST, MAX_ITEM_OPTION};

/// One (kind, value) effect pair on an item. Kind 0 means the slot is
/// empty; the remaining kinds are defined by the item-effect table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemEffect {
    pub kind: u8,
    pub value: u8,
}

/// The 8-byte item record: a template index plus a fixed run of effect
/// pairs. Index 0 is the empty item; all-zero effects are empty slots.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Item {
    pub index: i16,
    pub effects: [ItemEffect; MAX_ITEM_OPTION],
}

impl Item {
    pub fn new(index: i16) -> Self {
        Self {
            index,
            effects: [ItemEffect::default(); MAX_ITEM_OPTION],
        }
    }

    /// An empty inventory slot.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.index == 0
    }

    /// Whether the template index addresses the item list.
    pub fn has_valid_index(&self) -> bool {
        (0..MAX_ITEMLIST).contains(&self.index)
    }

    /// The first free effect slot, if any.
    pub fn free_effect_slot(&self) -> Option<usize> {
        self.effects.iter().position(|e| e.kind == 0)
    }
}
