//! Bit-exact wire codec for the fixed-layout game records.
//!
//! The encoded form must match the legacy client byte for byte: integers are
//! little-endian natural width, fixed strings are NUL-terminated and
//! zero-filled, arrays are always written at full declared length with
//! all-zero records in the empty slots.
//!
//! All entry points take a buffer plus a cursor and only advance the cursor
//! when the whole operation succeeds; a failed encode or decode leaves the
//! cursor at its entry value and never yields a half-written record.

mod bytes;

pub use bytes::{ByteReader, ByteWriter};

use std::fmt;
use std::sync::Mutex;

use crate::constants::{
    MAP_MAX_COORD, MAX_AFFECT, MAX_AFFECT_KIND, MAX_CARRY, MAX_ELEMENTS, MAX_EQUIP, MAX_ITEMLIST,
    MAX_ITEM_OPTION, MAX_LEVEL, MAX_SKILL, NAME_LENGTH,
};
use crate::types::{Affect, Item, ItemEffect, Mob, Position};

/// Codec failure. Reported to the caller, never thrown past the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The cursor plus the required size exceeds the buffer.
    InsufficientSpace { needed: usize, available: usize },
    /// A typed field fell outside its declared range in strict mode.
    Validation {
        record: &'static str,
        reason: &'static str,
    },
    /// A length prefix exceeded the per-type maximum.
    BadCount { declared: usize, max: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::InsufficientSpace { needed, available } => {
                write!(f, "buffer too small: need {needed} bytes, {available} left")
            }
            WireError::Validation { record, reason } => {
                write!(f, "{record} failed validation: {reason}")
            }
            WireError::BadCount { declared, max } => {
                write!(f, "declared count {declared} exceeds maximum {max}")
            }
        }
    }
}

impl std::error::Error for WireError {}

type Validator<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Validators {
    mob: Option<Validator<Mob>>,
    item: Option<Validator<Item>>,
    affect: Option<Validator<Affect>>,
    position: Option<Validator<Position>>,
}

/// The record serializer.
///
/// Holds the per-type validation predicates consulted in strict mode. The
/// defaults mirror the legacy server's checks; embeddings may swap them for
/// table-driven bounds from the data registry.
pub struct Serializer {
    strict: bool,
    validators: Mutex<Validators>,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Serializer {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            validators: Mutex::new(Validators {
                mob: Some(Box::new(default_mob_validator)),
                item: Some(Box::new(default_item_validator)),
                affect: Some(Box::new(default_affect_validator)),
                position: Some(Box::new(default_position_validator)),
            }),
        }
    }

    pub fn set_strict_mode(&mut self, strict: bool) {
        self.strict = strict;
    }

    pub fn strict_mode(&self) -> bool {
        self.strict
    }

    pub fn set_mob_validator(&self, v: impl Fn(&Mob) -> bool + Send + Sync + 'static) {
        self.validators.lock().unwrap().mob = Some(Box::new(v));
    }

    pub fn set_item_validator(&self, v: impl Fn(&Item) -> bool + Send + Sync + 'static) {
        self.validators.lock().unwrap().item = Some(Box::new(v));
    }

    pub fn set_affect_validator(&self, v: impl Fn(&Affect) -> bool + Send + Sync + 'static) {
        self.validators.lock().unwrap().affect = Some(Box::new(v));
    }

    pub fn set_position_validator(&self, v: impl Fn(&Position) -> bool + Send + Sync + 'static) {
        self.validators.lock().unwrap().position = Some(Box::new(v));
    }

    fn validate_mob(&self, mob: &Mob) -> Result<(), WireError> {
        if !self.strict {
            return Ok(());
        }
        let guard = self.validators.lock().unwrap();
        match &guard.mob {
            Some(v) if !v(mob) => Err(WireError::Validation {
                record: "mob",
                reason: "rejected by mob validator",
            }),
            _ => Ok(()),
        }
    }

    fn validate_item(&self, item: &Item) -> Result<(), WireError> {
        if !self.strict {
            return Ok(());
        }
        let guard = self.validators.lock().unwrap();
        match &guard.item {
            Some(v) if !v(item) => Err(WireError::Validation {
                record: "item",
                reason: "rejected by item validator",
            }),
            _ => Ok(()),
        }
    }

    fn validate_affect(&self, affect: &Affect) -> Result<(), WireError> {
        if !self.strict {
            return Ok(());
        }
        let guard = self.validators.lock().unwrap();
        match &guard.affect {
            Some(v) if !v(affect) => Err(WireError::Validation {
                record: "affect",
                reason: "rejected by affect validator",
            }),
            _ => Ok(()),
        }
    }

    fn validate_position(&self, position: &Position) -> Result<(), WireError> {
        if !self.strict {
            return Ok(());
        }
        let guard = self.validators.lock().unwrap();
        match &guard.position {
            Some(v) if !v(position) => Err(WireError::Validation {
                record: "position",
                reason: "rejected by position validator",
            }),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    //  Position
    // ------------------------------------------------------------------

    pub fn serialize_position(
        &self,
        position: &Position,
        buf: &mut [u8],
        offset: &mut usize,
    ) -> Result<(), WireError> {
        self.validate_position(position)?;
        let mut w = ByteWriter::new(buf, *offset);
        write_position(&mut w, position)?;
        *offset = w.position();
        Ok(())
    }

    pub fn deserialize_position(
        &self,
        buf: &[u8],
        offset: &mut usize,
    ) -> Result<Position, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let position = read_position(&mut r)?;
        self.validate_position(&position)?;
        *offset = r.position();
        Ok(position)
    }

    // ------------------------------------------------------------------
    //  Affect
    // ------------------------------------------------------------------

    pub fn serialize_affect(
        &self,
        affect: &Affect,
        buf: &mut [u8],
        offset: &mut usize,
    ) -> Result<(), WireError> {
        self.validate_affect(affect)?;
        let mut w = ByteWriter::new(buf, *offset);
        write_affect(&mut w, affect)?;
        *offset = w.position();
        Ok(())
    }

    pub fn deserialize_affect(&self, buf: &[u8], offset: &mut usize) -> Result<Affect, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let affect = read_affect(&mut r)?;
        self.validate_affect(&affect)?;
        *offset = r.position();
        Ok(affect)
    }

    // ------------------------------------------------------------------
    //  Item
    // ------------------------------------------------------------------

    pub fn serialize_item(
        &self,
        item: &Item,
        buf: &mut [u8],
        offset: &mut usize,
    ) -> Result<(), WireError> {
        self.validate_item(item)?;
        let mut w = ByteWriter::new(buf, *offset);
        write_item(&mut w, item)?;
        *offset = w.position();
        Ok(())
    }

    pub fn deserialize_item(&self, buf: &[u8], offset: &mut usize) -> Result<Item, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let item = read_item(&mut r)?;
        self.validate_item(&item)?;
        *offset = r.position();
        Ok(item)
    }

    /// Variable item array: u32 count prefix, then full item records.
    pub fn serialize_items(
        &self,
        items: &[Item],
        buf: &mut [u8],
        offset: &mut usize,
    ) -> Result<(), WireError> {
        if items.len() > MAX_ELEMENTS {
            return Err(WireError::BadCount {
                declared: items.len(),
                max: MAX_ELEMENTS,
            });
        }
        for item in items {
            self.validate_item(item)?;
        }
        let mut w = ByteWriter::new(buf, *offset);
        w.put_u32(items.len() as u32)?;
        for item in items {
            write_item(&mut w, item)?;
        }
        *offset = w.position();
        Ok(())
    }

    /// Counterpart of [`serialize_items`]; rejects hostile count prefixes
    /// before allocating anything.
    pub fn deserialize_items(
        &self,
        buf: &[u8],
        offset: &mut usize,
    ) -> Result<Vec<Item>, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let count = r.get_u32()? as usize;
        if count > MAX_ELEMENTS {
            return Err(WireError::BadCount {
                declared: count,
                max: MAX_ELEMENTS,
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let item = read_item(&mut r)?;
            self.validate_item(&item)?;
            items.push(item);
        }
        *offset = r.position();
        Ok(items)
    }

    // ------------------------------------------------------------------
    //  Mob
    // ------------------------------------------------------------------

    pub fn serialize_mob(
        &self,
        mob: &Mob,
        buf: &mut [u8],
        offset: &mut usize,
    ) -> Result<(), WireError> {
        self.validate_mob(mob)?;
        if self.strict {
            for item in mob.equip.iter().chain(mob.carry.iter()) {
                self.validate_item(item)?;
            }
            for affect in &mob.affects {
                self.validate_affect(affect)?;
            }
        }
        self.validate_position(&mob.position)?;

        let mut w = ByteWriter::new(buf, *offset);
        w.put_bytes(&mob.name)?;
        w.put_u8(mob.class)?;
        w.put_u16(mob.level)?;
        w.put_i16(mob.strength)?;
        w.put_i16(mob.intelligence)?;
        w.put_i16(mob.dexterity)?;
        w.put_i16(mob.constitution)?;
        w.put_i16(mob.ac)?;
        w.put_i16(mob.damage)?;
        w.put_i32(mob.hp)?;
        w.put_i32(mob.max_hp)?;
        w.put_i32(mob.mp)?;
        w.put_i32(mob.max_mp)?;
        w.put_i64(mob.exp)?;
        for item in &mob.equip {
            write_item(&mut w, item)?;
        }
        for item in &mob.carry {
            write_item(&mut w, item)?;
        }
        for skill in &mob.skill_bar {
            w.put_u16(*skill)?;
        }
        for affect in &mob.affects {
            write_affect(&mut w, affect)?;
        }
        write_position(&mut w, &mob.position)?;
        w.put_u32(mob.gold)?;
        w.put_u32(mob.kills)?;
        *offset = w.position();
        Ok(())
    }

    pub fn deserialize_mob(&self, buf: &[u8], offset: &mut usize) -> Result<Mob, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let mut mob = Mob::default();
        mob.name = r.get_fixed_bytes::<NAME_LENGTH>()?;
        mob.class = r.get_u8()?;
        mob.level = r.get_u16()?;
        mob.strength = r.get_i16()?;
        mob.intelligence = r.get_i16()?;
        mob.dexterity = r.get_i16()?;
        mob.constitution = r.get_i16()?;
        mob.ac = r.get_i16()?;
        mob.damage = r.get_i16()?;
        mob.hp = r.get_i32()?;
        mob.max_hp = r.get_i32()?;
        mob.mp = r.get_i32()?;
        mob.max_mp = r.get_i32()?;
        mob.exp = r.get_i64()?;
        for slot in 0..MAX_EQUIP {
            mob.equip[slot] = read_item(&mut r)?;
        }
        for slot in 0..MAX_CARRY {
            mob.carry[slot] = read_item(&mut r)?;
        }
        for slot in 0..MAX_SKILL {
            mob.skill_bar[slot] = r.get_u16()?;
        }
        for slot in 0..MAX_AFFECT {
            mob.affects[slot] = read_affect(&mut r)?;
        }
        mob.position = read_position(&mut r)?;
        mob.gold = r.get_u32()?;
        mob.kills = r.get_u32()?;

        self.validate_mob(&mob)?;
        if self.strict {
            for item in mob.equip.iter().chain(mob.carry.iter()) {
                self.validate_item(item)?;
            }
            for affect in &mob.affects {
                self.validate_affect(affect)?;
            }
        }
        self.validate_position(&mob.position)?;

        *offset = r.position();
        Ok(mob)
    }
}

// Raw field writers shared by the record entry points. These do layout
// only; validation lives on the `Serializer`.

fn write_position(w: &mut ByteWriter<'_>, p: &Position) -> Result<(), WireError> {
    w.put_i16(p.x)?;
    w.put_i16(p.y)
}

fn read_position(r: &mut ByteReader<'_>) -> Result<Position, WireError> {
    Ok(Position {
        x: r.get_i16()?,
        y: r.get_i16()?,
    })
}

fn write_affect(w: &mut ByteWriter<'_>, a: &Affect) -> Result<(), WireError> {
    w.put_u8(a.kind)?;
    w.put_u8(a.value)?;
    w.put_u8(a.level)?;
    w.put_i16(a.time)
}

fn read_affect(r: &mut ByteReader<'_>) -> Result<Affect, WireError> {
    Ok(Affect {
        kind: r.get_u8()?,
        value: r.get_u8()?,
        level: r.get_u8()?,
        time: r.get_i16()?,
    })
}

fn write_item(w: &mut ByteWriter<'_>, item: &Item) -> Result<(), WireError> {
    w.put_i16(item.index)?;
    for effect in &item.effects {
        w.put_u8(effect.kind)?;
        w.put_u8(effect.value)?;
    }
    Ok(())
}

fn read_item(r: &mut ByteReader<'_>) -> Result<Item, WireError> {
    let mut item = Item::default();
    item.index = r.get_i16()?;
    for slot in 0..MAX_ITEM_OPTION {
        item.effects[slot] = ItemEffect {
            kind: r.get_u8()?,
            value: r.get_u8()?,
        };
    }
    Ok(item)
}

fn default_mob_validator(mob: &Mob) -> bool {
    mob.name[0] != 0 && mob.level <= MAX_LEVEL && mob.hp <= mob.max_hp && mob.mp <= mob.max_mp
}

fn default_item_validator(item: &Item) -> bool {
    (0..MAX_ITEMLIST).contains(&item.index)
}

fn default_affect_validator(affect: &Affect) -> bool {
    affect.kind < MAX_AFFECT_KIND && affect.time >= 0
}

fn default_position_validator(position: &Position) -> bool {
    (0..=MAP_MAX_COORD).contains(&position.x) && (0..=MAP_MAX_COORD).contains(&position.y)
}
