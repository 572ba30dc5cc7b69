//! Item effect application.
//!
//! Every item record carries a fixed run of (kind, value) effect pairs.
//! This module owns the legacy kind numbering, the slot arithmetic, and
//! the equip/unequip application onto a mob record. Only additive stat
//! kinds are applied to the mob; requirement kinds gate equipping instead.

use wyd_core::types::{Item, ItemEffect, Mob};

/// Effect kinds carried in item effect slots. The numeric values are the
/// legacy on-disk codes and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemEffectKind {
    Empty = 0,
    Level = 1,
    Damage = 2,
    Ac = 3,
    Hp = 4,
    Mp = 5,
    Exp = 6,
    Str = 7,
    Int = 8,
    Dex = 9,
    Con = 10,
    RequiredStr = 22,
    RequiredInt = 23,
    RequiredDex = 24,
    RequiredCon = 25,
    AttackSpeed = 26,
    Range = 27,
    RunSpeed = 29,
    Parry = 40,
    HitRate = 41,
    Critical = 42,
    Sanc = 43,
    RegenHp = 47,
    RegenMp = 48,
}

impl ItemEffectKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Empty),
            1 => Some(Self::Level),
            2 => Some(Self::Damage),
            3 => Some(Self::Ac),
            4 => Some(Self::Hp),
            5 => Some(Self::Mp),
            6 => Some(Self::Exp),
            7 => Some(Self::Str),
            8 => Some(Self::Int),
            9 => Some(Self::Dex),
            10 => Some(Self::Con),
            22 => Some(Self::RequiredStr),
            23 => Some(Self::RequiredInt),
            24 => Some(Self::RequiredDex),
            25 => Some(Self::RequiredCon),
            26 => Some(Self::AttackSpeed),
            27 => Some(Self::Range),
            29 => Some(Self::RunSpeed),
            40 => Some(Self::Parry),
            41 => Some(Self::HitRate),
            42 => Some(Self::Critical),
            43 => Some(Self::Sanc),
            47 => Some(Self::RegenHp),
            48 => Some(Self::RegenMp),
            _ => None,
        }
    }
}

/// Each sanctuary level adds this much damage and defense.
const SANC_DAMAGE_PER_LEVEL: i32 = 2;
const SANC_DEFENSE_PER_LEVEL: i32 = 1;

/// Find the slot holding `kind`, if any.
pub fn find_effect(item: &Item, kind: ItemEffectKind) -> Option<usize> {
    item.effects.iter().position(|e| e.kind == kind as u8)
}

pub fn has_effect(item: &Item, kind: ItemEffectKind) -> bool {
    find_effect(item, kind).is_some()
}

/// The value of `kind` on this item, 0 when absent.
pub fn effect_value(item: &Item, kind: ItemEffectKind) -> u8 {
    find_effect(item, kind)
        .map(|slot| item.effects[slot].value)
        .unwrap_or(0)
}

/// Set `kind` on the item, reusing its slot if present, else taking the
/// first free slot. Fails when the item is full.
pub fn add_effect(item: &mut Item, kind: ItemEffectKind, value: u8) -> bool {
    if kind == ItemEffectKind::Empty {
        return false;
    }
    if let Some(slot) = find_effect(item, kind) {
        item.effects[slot].value = value;
        return true;
    }
    match item.free_effect_slot() {
        Some(slot) => {
            item.effects[slot] = ItemEffect {
                kind: kind as u8,
                value,
            };
            true
        }
        None => false,
    }
}

/// Clear `kind` from the item. Returns whether anything was removed.
pub fn remove_effect(item: &mut Item, kind: ItemEffectKind) -> bool {
    match find_effect(item, kind) {
        Some(slot) => {
            item.effects[slot] = ItemEffect::default();
            true
        }
        None => false,
    }
}

/// Extra damage this item grants: the flat damage effect plus the
/// sanctuary scaling.
pub fn additional_damage(item: &Item) -> i32 {
    effect_value(item, ItemEffectKind::Damage) as i32
        + effect_value(item, ItemEffectKind::Sanc) as i32 * SANC_DAMAGE_PER_LEVEL
}

/// Extra defense this item grants.
pub fn additional_defense(item: &Item) -> i32 {
    effect_value(item, ItemEffectKind::Ac) as i32
        + effect_value(item, ItemEffectKind::Sanc) as i32 * SANC_DEFENSE_PER_LEVEL
}

pub fn additional_hp(item: &Item) -> i32 {
    effect_value(item, ItemEffectKind::Hp) as i32
}

pub fn additional_mp(item: &Item) -> i32 {
    effect_value(item, ItemEffectKind::Mp) as i32
}

/// Whether the mob's attributes meet the item's requirement effects.
pub fn meets_requirements(mob: &Mob, item: &Item) -> bool {
    mob.strength >= effect_value(item, ItemEffectKind::RequiredStr) as i16
        && mob.intelligence >= effect_value(item, ItemEffectKind::RequiredInt) as i16
        && mob.dexterity >= effect_value(item, ItemEffectKind::RequiredDex) as i16
        && mob.constitution >= effect_value(item, ItemEffectKind::RequiredCon) as i16
        && mob.level >= effect_value(item, ItemEffectKind::Level) as u16
}

/// Apply (or revert) an item's wearable effects onto a mob. `equipping`
/// true adds, false removes. Current HP/MP are clamped into the new
/// maxima.
pub fn apply_equip_effects(mob: &mut Mob, item: &Item, equipping: bool) {
    let sign: i32 = if equipping { 1 } else { -1 };

    mob.strength =
        (mob.strength as i32 + sign * effect_value(item, ItemEffectKind::Str) as i32) as i16;
    mob.intelligence =
        (mob.intelligence as i32 + sign * effect_value(item, ItemEffectKind::Int) as i32) as i16;
    mob.dexterity =
        (mob.dexterity as i32 + sign * effect_value(item, ItemEffectKind::Dex) as i32) as i16;
    mob.constitution =
        (mob.constitution as i32 + sign * effect_value(item, ItemEffectKind::Con) as i32) as i16;

    mob.damage = (mob.damage as i32 + sign * additional_damage(item)) as i16;
    mob.ac = (mob.ac as i32 + sign * additional_defense(item)) as i16;

    mob.max_hp += sign * additional_hp(item);
    mob.max_mp += sign * additional_mp(item);
    if mob.hp > mob.max_hp {
        mob.hp = mob.max_hp;
    }
    if mob.mp > mob.max_mp {
        mob.mp = mob.max_mp;
    }
}

/// Sum one additive effect kind across everything the mob has equipped.
pub fn equipped_total(mob: &Mob, kind: ItemEffectKind) -> i32 {
    mob.equip
        .iter()
        .filter(|item| !item.is_empty())
        .map(|item| effect_value(item, kind) as i32)
        .sum()
}
