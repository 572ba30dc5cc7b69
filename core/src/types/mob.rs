//! Mob structure - the denormalized actor record.

use crate::constants::{MAX_AFFECT, MAX_CARRY, MAX_EQUIP, MAX_SKILL, NAME_LENGTH};
use crate::types::{Affect, Item, Position};

/// The full actor record as it travels on the wire: players, monsters and
/// NPCs all use the same layout. Field order here is the encode order.
#[derive(Debug, Clone, PartialEq)]
pub struct Mob {
    /// NUL-terminated inside the fixed slot; bytes past the terminator
    /// are zero.
    pub name: [u8; NAME_LENGTH],
    pub class: u8,
    pub level: u16,

    pub strength: i16,
    pub intelligence: i16,
    pub dexterity: i16,
    pub constitution: i16,

    pub ac: i16,
    pub damage: i16,

    pub hp: i32,
    pub max_hp: i32,
    pub mp: i32,
    pub max_mp: i32,

    pub exp: i64,

    pub equip: [Item; MAX_EQUIP],
    pub carry: [Item; MAX_CARRY],
    pub skill_bar: [u16; MAX_SKILL],
    pub affects: [Affect; MAX_AFFECT],

    pub position: Position,

    pub gold: u32,
    pub kills: u32,
}

impl Default for Mob {
    fn default() -> Self {
        Self {
            name: [0; NAME_LENGTH],
            class: 0,
            level: 0,
            strength: 0,
            intelligence: 0,
            dexterity: 0,
            constitution: 0,
            ac: 0,
            damage: 0,
            hp: 0,
            max_hp: 0,
            mp: 0,
            max_mp: 0,
            exp: 0,
            equip: [Item::default(); MAX_EQUIP],
            carry: [Item::default(); MAX_CARRY],
            skill_bar: [0; MAX_SKILL],
            affects: [Affect::default(); MAX_AFFECT],
            position: Position::default(),
            gold: 0,
            kills: 0,
        }
    }
}

impl Mob {
    /// Get name as a string slice
    pub fn get_name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("*unknown*")
    }

    /// Copy `name` into the fixed slot, truncating to `NAME_LENGTH - 1`
    /// bytes and zero-filling the remainder.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LENGTH];
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LENGTH - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    /// First active-affect slot holding the given kind.
    pub fn find_affect(&self, kind: u8) -> Option<usize> {
        self.affects
            .iter()
            .position(|a| !a.is_empty() && a.kind == kind)
    }

    /// Count of non-empty inventory slots.
    pub fn carried_count(&self) -> usize {
        self.carry.iter().filter(|i| !i.is_empty()).count()
    }
}
