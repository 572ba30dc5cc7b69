//! Immutable, reload-capable game-data tables.
//!
//! Tables are integer-keyed snapshots behind an `Arc`. A reload parses the
//! new data into a fresh [`Tables`] value and swaps it in atomically;
//! readers that grabbed the previous snapshot keep using it until they
//! drop their `Arc`. Nothing in a published snapshot is ever mutated.
//!
//! Table payloads come out of PAK archives (or a plain directory during
//! development) in small count-prefixed binary formats read through the
//! same checked cursors as the wire codec.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;

use crate::skill::types::{
    SkillCategory, SkillDefinition, SkillOptions, SkillRequirements, SkillTiming,
};
use wyd_core::codec::{ByteReader, ByteWriter, Serializer, WireError};
use wyd_core::constants::{ItemFlags, ITEM_SIZE, MAX_ITEM_OPTION, MOB_SIZE};
use wyd_core::pak::PakArchive;
use wyd_core::types::{Item, ItemEffect, Mob};

const TABLE_NAME_LENGTH: usize = 32;

/// Catalog entry for one item template.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDef {
    pub index: u16,
    pub name: String,
    pub flags: ItemFlags,
    pub base: Item,
    pub price: u32,
    pub required_level: u16,
}

/// Catalog entry for one mob template.
#[derive(Debug, Clone, PartialEq)]
pub struct MobDef {
    pub id: u32,
    pub template: Mob,
}

/// Catalog entry for one skill; hydrates the skill engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDef {
    pub id: u16,
    pub name: String,
    pub category: SkillCategory,
    pub timing: SkillTiming,
    pub requirements: SkillRequirements,
    pub interruptible: bool,
    pub max_charges: u32,
    pub charge_restore_ms: u64,
}

impl SkillDef {
    /// Build the engine-side registration record.
    pub fn to_definition(&self) -> SkillDefinition {
        SkillDefinition {
            id: self.id,
            name: self.name.clone(),
            timing: self.timing.clone(),
            requirements: self.requirements.clone(),
            category: self.category,
            options: SkillOptions {
                interruptible: self.interruptible,
                max_charges: self.max_charges.max(1),
                charge_restore_ms: self.charge_restore_ms,
                ..SkillOptions::default()
            },
        }
    }
}

/// One loot-table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropDef {
    pub mob_id: u32,
    pub item_index: u16,
    pub chance_permille: u16,
    pub min_count: u8,
    pub max_count: u8,
}

/// A scheduled world event (double-exp weekend and friends).
#[derive(Debug, Clone, PartialEq)]
pub struct WorldEventDef {
    pub id: u16,
    pub name: String,
    pub start_hour: u8,
    pub duration_minutes: u16,
    pub exp_multiplier: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestStep {
    pub description: String,
    pub target_mob: u32,
    pub required_count: u32,
    pub reward_item: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestDef {
    pub id: u16,
    pub name: String,
    pub required_level: u16,
    pub steps: Vec<QuestStep>,
}

/// One immutable generation of every table.
#[derive(Default)]
pub struct Tables {
    pub generation: u64,
    pub items: HashMap<u16, ItemDef>,
    pub mobs: HashMap<u32, MobDef>,
    pub skills: HashMap<u16, SkillDef>,
    pub drops: HashMap<u32, Vec<DropDef>>,
    pub events: HashMap<u16, WorldEventDef>,
    pub quests: HashMap<u16, QuestDef>,
}

/// The registry handle shared across the runtime.
pub struct DataRegistry {
    current: RwLock<Arc<Tables>>,
    generation: AtomicU64,
}

impl Default for DataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DataRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Tables::default())),
            generation: AtomicU64::new(0),
        }
    }

    /// The current snapshot. Hold the `Arc` for at most one frame.
    pub fn snapshot(&self) -> Arc<Tables> {
        self.current.read().unwrap().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Publish a freshly parsed set of tables. Returns the new generation.
    pub fn reload(&self, mut tables: Tables) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tables.generation = generation;
        *self.current.write().unwrap() = Arc::new(tables);
        log::info!("Data registry swapped to generation {generation}");
        generation
    }

    /// Parse every table found in a PAK archive and swap. Missing tables
    /// load as empty.
    pub fn reload_from_pak(&self, archive: &PakArchive) -> anyhow::Result<u64> {
        let mut tables = Tables::default();
        if let Ok(bytes) = archive.read_entry("tables/item.tbl") {
            tables.items = parse_items(&bytes).context("parsing item table")?;
        }
        if let Ok(bytes) = archive.read_entry("tables/mob.tbl") {
            tables.mobs = parse_mobs(&bytes).context("parsing mob table")?;
        }
        if let Ok(bytes) = archive.read_entry("tables/skill.tbl") {
            tables.skills = parse_skills(&bytes).context("parsing skill table")?;
        }
        if let Ok(bytes) = archive.read_entry("tables/drop.tbl") {
            tables.drops = parse_drops(&bytes).context("parsing drop table")?;
        }
        if let Ok(bytes) = archive.read_entry("tables/event.tbl") {
            tables.events = parse_events(&bytes).context("parsing event table")?;
        }
        if let Ok(bytes) = archive.read_entry("tables/quest.tbl") {
            tables.quests = parse_quests(&bytes).context("parsing quest table")?;
        }
        Ok(self.reload(tables))
    }

    /// Development path: the same tables as loose `.tbl` files in a
    /// directory.
    pub fn reload_from_dir(&self, dir: &Path) -> anyhow::Result<u64> {
        let mut tables = Tables::default();
        let read = |name: &str| -> Option<Vec<u8>> { fs::read(dir.join(name)).ok() };
        if let Some(bytes) = read("item.tbl") {
            tables.items = parse_items(&bytes).context("parsing item.tbl")?;
        }
        if let Some(bytes) = read("mob.tbl") {
            tables.mobs = parse_mobs(&bytes).context("parsing mob.tbl")?;
        }
        if let Some(bytes) = read("skill.tbl") {
            tables.skills = parse_skills(&bytes).context("parsing skill.tbl")?;
        }
        if let Some(bytes) = read("drop.tbl") {
            tables.drops = parse_drops(&bytes).context("parsing drop.tbl")?;
        }
        if let Some(bytes) = read("event.tbl") {
            tables.events = parse_events(&bytes).context("parsing event.tbl")?;
        }
        if let Some(bytes) = read("quest.tbl") {
            tables.quests = parse_quests(&bytes).context("parsing quest.tbl")?;
        }
        Ok(self.reload(tables))
    }
}

// ---------------------------------------------------------------------------
//  Table parsers and writers
// ---------------------------------------------------------------------------
//
// Each table is a u32 count followed by fixed-layout rows. The writers are
// used by the packing tool and by tests; the parsers by reload.

fn read_count(r: &mut ByteReader<'_>) -> Result<usize, WireError> {
    let count = r.get_u32()? as usize;
    if count > 100_000 {
        return Err(WireError::BadCount {
            declared: count,
            max: 100_000,
        });
    }
    Ok(count)
}

pub fn parse_items(bytes: &[u8]) -> Result<HashMap<u16, ItemDef>, WireError> {
    let mut r = ByteReader::new(bytes, 0);
    let count = read_count(&mut r)?;
    let mut items = HashMap::with_capacity(count);
    for _ in 0..count {
        let index = r.get_u16()?;
        let name = r.get_fixed_str(TABLE_NAME_LENGTH)?;
        let flags = ItemFlags::from_bits_truncate(r.get_u32()?);
        let mut base = Item::default();
        base.index = r.get_i16()?;
        for slot in 0..MAX_ITEM_OPTION {
            base.effects[slot] = ItemEffect {
                kind: r.get_u8()?,
                value: r.get_u8()?,
            };
        }
        let price = r.get_u32()?;
        let required_level = r.get_u16()?;
        items.insert(
            index,
            ItemDef {
                index,
                name,
                flags,
                base,
                price,
                required_level,
            },
        );
    }
    Ok(items)
}

const ITEM_ROW_SIZE: usize = 2 + TABLE_NAME_LENGTH + 4 + ITEM_SIZE + 4 + 2;

pub fn write_items(items: &[ItemDef], out: &mut Vec<u8>) {
    let mut buf = vec![0u8; 4 + items.len() * ITEM_ROW_SIZE];
    let mut w = ByteWriter::new(&mut buf, 0);
    w.put_u32(items.len() as u32).expect("sized above");
    for def in items {
        w.put_u16(def.index).expect("sized above");
        w.put_fixed_str(&def.name, TABLE_NAME_LENGTH).expect("sized above");
        w.put_u32(def.flags.bits()).expect("sized above");
        w.put_i16(def.base.index).expect("sized above");
        for effect in &def.base.effects {
            w.put_u8(effect.kind).expect("sized above");
            w.put_u8(effect.value).expect("sized above");
        }
        w.put_u32(def.price).expect("sized above");
        w.put_u16(def.required_level).expect("sized above");
    }
    let len = w.position();
    out.extend_from_slice(&buf[..len]);
}

pub fn parse_mobs(bytes: &[u8]) -> Result<HashMap<u32, MobDef>, WireError> {
    let codec = Serializer::new(false);
    let mut r = ByteReader::new(bytes, 0);
    let count = read_count(&mut r)?;
    let mut mobs = HashMap::with_capacity(count);
    let mut offset = r.position();
    for _ in 0..count {
        let mut id_reader = ByteReader::new(bytes, offset);
        let id = id_reader.get_u32()?;
        offset = id_reader.position();
        let template = codec.deserialize_mob(bytes, &mut offset)?;
        mobs.insert(id, MobDef { id, template });
    }
    Ok(mobs)
}

pub fn write_mobs(mobs: &[MobDef], out: &mut Vec<u8>) {
    let codec = Serializer::new(false);
    let mut buf = vec![0u8; 4 + mobs.len() * (4 + MOB_SIZE)];
    let mut offset;
    {
        let mut w = ByteWriter::new(&mut buf, 0);
        w.put_u32(mobs.len() as u32).expect("sized above");
        offset = w.position();
    }
    for def in mobs {
        {
            let mut w = ByteWriter::new(&mut buf, offset);
            w.put_u32(def.id).expect("sized above");
            offset = w.position();
        }
        codec
            .serialize_mob(&def.template, &mut buf, &mut offset)
            .expect("sized above");
    }
    out.extend_from_slice(&buf[..offset]);
}

pub fn parse_skills(bytes: &[u8]) -> Result<HashMap<u16, SkillDef>, WireError> {
    let mut r = ByteReader::new(bytes, 0);
    let count = read_count(&mut r)?;
    let mut skills = HashMap::with_capacity(count);
    for _ in 0..count {
        let id = r.get_u16()?;
        let name = r.get_fixed_str(TABLE_NAME_LENGTH)?;
        let category = category_from_u8(r.get_u8()?);
        let timing = SkillTiming {
            preparation_ms: r.get_u32()? as u64,
            casting_ms: r.get_u32()? as u64,
            recovery_ms: r.get_u32()? as u64,
            cooldown_ms: r.get_u32()? as u64,
            channel_duration_ms: r.get_u32()? as u64,
            variability: r.get_u16()? as f32 / 1000.0,
        };
        let requirements = SkillRequirements {
            mana: r.get_u32()?,
            stamina: r.get_u32()?,
            health: r.get_u32()?,
            level: r.get_u32()?,
            ..SkillRequirements::default()
        };
        let interruptible = r.get_u8()? != 0;
        let max_charges = r.get_u8()? as u32;
        let charge_restore_ms = r.get_u32()? as u64;
        skills.insert(
            id,
            SkillDef {
                id,
                name,
                category,
                timing,
                requirements,
                interruptible,
                max_charges,
                charge_restore_ms,
            },
        );
    }
    Ok(skills)
}

const SKILL_ROW_SIZE: usize = 2 + TABLE_NAME_LENGTH + 1 + 5 * 4 + 2 + 4 * 4 + 1 + 1 + 4;

pub fn write_skills(skills: &[SkillDef], out: &mut Vec<u8>) {
    let mut buf = vec![0u8; 4 + skills.len() * SKILL_ROW_SIZE];
    let mut w = ByteWriter::new(&mut buf, 0);
    w.put_u32(skills.len() as u32).expect("sized above");
    for def in skills {
        w.put_u16(def.id).expect("sized above");
        w.put_fixed_str(&def.name, TABLE_NAME_LENGTH).expect("sized above");
        w.put_u8(category_to_u8(def.category)).expect("sized above");
        w.put_u32(def.timing.preparation_ms as u32).expect("sized above");
        w.put_u32(def.timing.casting_ms as u32).expect("sized above");
        w.put_u32(def.timing.recovery_ms as u32).expect("sized above");
        w.put_u32(def.timing.cooldown_ms as u32).expect("sized above");
        w.put_u32(def.timing.channel_duration_ms as u32).expect("sized above");
        w.put_u16((def.timing.variability * 1000.0) as u16).expect("sized above");
        w.put_u32(def.requirements.mana).expect("sized above");
        w.put_u32(def.requirements.stamina).expect("sized above");
        w.put_u32(def.requirements.health).expect("sized above");
        w.put_u32(def.requirements.level).expect("sized above");
        w.put_u8(u8::from(def.interruptible)).expect("sized above");
        w.put_u8(def.max_charges as u8).expect("sized above");
        w.put_u32(def.charge_restore_ms as u32).expect("sized above");
    }
    let len = w.position();
    out.extend_from_slice(&buf[..len]);
}

pub fn parse_drops(bytes: &[u8]) -> Result<HashMap<u32, Vec<DropDef>>, WireError> {
    let mut r = ByteReader::new(bytes, 0);
    let count = read_count(&mut r)?;
    let mut drops: HashMap<u32, Vec<DropDef>> = HashMap::new();
    for _ in 0..count {
        let def = DropDef {
            mob_id: r.get_u32()?,
            item_index: r.get_u16()?,
            chance_permille: r.get_u16()?,
            min_count: r.get_u8()?,
            max_count: r.get_u8()?,
        };
        drops.entry(def.mob_id).or_default().push(def);
    }
    Ok(drops)
}

pub fn write_drops(drops: &[DropDef], out: &mut Vec<u8>) {
    let mut buf = vec![0u8; 4 + drops.len() * 10];
    let mut w = ByteWriter::new(&mut buf, 0);
    w.put_u32(drops.len() as u32).expect("sized above");
    for def in drops {
        w.put_u32(def.mob_id).expect("sized above");
        w.put_u16(def.item_index).expect("sized above");
        w.put_u16(def.chance_permille).expect("sized above");
        w.put_u8(def.min_count).expect("sized above");
        w.put_u8(def.max_count).expect("sized above");
    }
    let len = w.position();
    out.extend_from_slice(&buf[..len]);
}

pub fn parse_events(bytes: &[u8]) -> Result<HashMap<u16, WorldEventDef>, WireError> {
    let mut r = ByteReader::new(bytes, 0);
    let count = read_count(&mut r)?;
    let mut events = HashMap::with_capacity(count);
    for _ in 0..count {
        let id = r.get_u16()?;
        let name = r.get_fixed_str(TABLE_NAME_LENGTH)?;
        let start_hour = r.get_u8()?;
        let duration_minutes = r.get_u16()?;
        let exp_multiplier = r.get_u16()? as f32 / 100.0;
        events.insert(
            id,
            WorldEventDef {
                id,
                name,
                start_hour,
                duration_minutes,
                exp_multiplier,
            },
        );
    }
    Ok(events)
}

pub fn write_events(events: &[WorldEventDef], out: &mut Vec<u8>) {
    let mut buf = vec![0u8; 4 + events.len() * (2 + TABLE_NAME_LENGTH + 1 + 2 + 2)];
    let mut w = ByteWriter::new(&mut buf, 0);
    w.put_u32(events.len() as u32).expect("sized above");
    for def in events {
        w.put_u16(def.id).expect("sized above");
        w.put_fixed_str(&def.name, TABLE_NAME_LENGTH).expect("sized above");
        w.put_u8(def.start_hour).expect("sized above");
        w.put_u16(def.duration_minutes).expect("sized above");
        w.put_u16((def.exp_multiplier * 100.0) as u16).expect("sized above");
    }
    let len = w.position();
    out.extend_from_slice(&buf[..len]);
}

pub fn parse_quests(bytes: &[u8]) -> Result<HashMap<u16, QuestDef>, WireError> {
    let mut r = ByteReader::new(bytes, 0);
    let count = read_count(&mut r)?;
    let mut quests = HashMap::with_capacity(count);
    for _ in 0..count {
        let id = r.get_u16()?;
        let name = r.get_fixed_str(TABLE_NAME_LENGTH)?;
        let required_level = r.get_u16()?;
        let step_count = r.get_u8()? as usize;
        let mut steps = Vec::with_capacity(step_count);
        for _ in 0..step_count {
            steps.push(QuestStep {
                description: r.get_var_str()?,
                target_mob: r.get_u32()?,
                required_count: r.get_u32()?,
                reward_item: r.get_u16()?,
            });
        }
        quests.insert(
            id,
            QuestDef {
                id,
                name,
                required_level,
                steps,
            },
        );
    }
    Ok(quests)
}

pub fn write_quests(quests: &[QuestDef], out: &mut Vec<u8>) {
    let mut size = 4;
    for quest in quests {
        size += 2 + TABLE_NAME_LENGTH + 2 + 1;
        for step in &quest.steps {
            size += 4 + step.description.len() + 1 + 4 + 4 + 2;
        }
    }
    let mut buf = vec![0u8; size];
    let mut w = ByteWriter::new(&mut buf, 0);
    w.put_u32(quests.len() as u32).expect("sized above");
    for quest in quests {
        w.put_u16(quest.id).expect("sized above");
        w.put_fixed_str(&quest.name, TABLE_NAME_LENGTH).expect("sized above");
        w.put_u16(quest.required_level).expect("sized above");
        w.put_u8(quest.steps.len() as u8).expect("sized above");
        for step in &quest.steps {
            w.put_var_str(&step.description).expect("sized above");
            w.put_u32(step.target_mob).expect("sized above");
            w.put_u32(step.required_count).expect("sized above");
            w.put_u16(step.reward_item).expect("sized above");
        }
    }
    let len = w.position();
    out.extend_from_slice(&buf[..len]);
}

fn category_from_u8(value: u8) -> SkillCategory {
    match value {
        0 => SkillCategory::Magic,
        1 => SkillCategory::Melee,
        2 => SkillCategory::Ranged,
        3 => SkillCategory::Movement,
        4 => SkillCategory::Buff,
        5 => SkillCategory::Debuff,
        6 => SkillCategory::Healing,
        7 => SkillCategory::Summon,
        _ => SkillCategory::Utility,
    }
}

fn category_to_u8(category: SkillCategory) -> u8 {
    match category {
        SkillCategory::Magic => 0,
        SkillCategory::Melee => 1,
        SkillCategory::Ranged => 2,
        SkillCategory::Movement => 3,
        SkillCategory::Buff => 4,
        SkillCategory::Debuff => 5,
        SkillCategory::Healing => 6,
        SkillCategory::Summon => 7,
        SkillCategory::Utility => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wyd_core::pak::PakBuilder;

    fn sample_skill(id: u16, cooldown_ms: u64) -> SkillDef {
        SkillDef {
            id,
            name: format!("Skill {id}"),
            category: SkillCategory::Magic,
            timing: SkillTiming {
                preparation_ms: 100,
                casting_ms: 200,
                recovery_ms: 50,
                cooldown_ms,
                channel_duration_ms: 0,
                variability: 0.25,
            },
            requirements: SkillRequirements {
                mana: 30,
                stamina: 0,
                health: 1,
                level: 10,
                ..SkillRequirements::default()
            },
            interruptible: true,
            max_charges: 2,
            charge_restore_ms: 4000,
        }
    }

    #[test]
    fn skill_table_round_trip() {
        let skills = vec![sample_skill(1, 1000), sample_skill(2, 0)];
        let mut bytes = Vec::new();
        write_skills(&skills, &mut bytes);
        let parsed = parse_skills(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&1], skills[0]);
        assert_eq!(parsed[&2], skills[1]);
    }

    #[test]
    fn item_table_round_trip() {
        let mut base = Item::new(1024);
        base.effects[0] = ItemEffect { kind: 10, value: 7 };
        let items = vec![ItemDef {
            index: 1024,
            name: "Bow of the Wind".to_string(),
            flags: ItemFlags::BOUND | ItemFlags::UNIQUE,
            base,
            price: 125_000,
            required_level: 80,
        }];
        let mut bytes = Vec::new();
        write_items(&items, &mut bytes);
        let parsed = parse_items(&bytes).unwrap();
        assert_eq!(parsed[&1024], items[0]);
    }

    #[test]
    fn mob_table_round_trip() {
        let mut template = Mob::default();
        template.set_name("Troll");
        template.level = 40;
        template.hp = 900;
        template.max_hp = 900;
        let mobs = vec![MobDef { id: 7, template }];
        let mut bytes = Vec::new();
        write_mobs(&mobs, &mut bytes);
        let parsed = parse_mobs(&bytes).unwrap();
        assert_eq!(parsed[&7], mobs[0]);
    }

    #[test]
    fn drop_table_groups_by_mob() {
        let drops = vec![
            DropDef {
                mob_id: 7,
                item_index: 100,
                chance_permille: 250,
                min_count: 1,
                max_count: 3,
            },
            DropDef {
                mob_id: 7,
                item_index: 101,
                chance_permille: 10,
                min_count: 1,
                max_count: 1,
            },
            DropDef {
                mob_id: 9,
                item_index: 102,
                chance_permille: 500,
                min_count: 2,
                max_count: 4,
            },
        ];
        let mut bytes = Vec::new();
        write_drops(&drops, &mut bytes);
        let parsed = parse_drops(&bytes).unwrap();
        assert_eq!(parsed[&7].len(), 2);
        assert_eq!(parsed[&9].len(), 1);
        assert_eq!(parsed[&9][0], drops[2]);
    }

    #[test]
    fn event_and_quest_tables_round_trip() {
        let events = vec![WorldEventDef {
            id: 3,
            name: "Double Experience".to_string(),
            start_hour: 18,
            duration_minutes: 120,
            exp_multiplier: 2.0,
        }];
        let mut bytes = Vec::new();
        write_events(&events, &mut bytes);
        let parsed = parse_events(&bytes).unwrap();
        assert_eq!(parsed[&3], events[0]);

        let quests = vec![QuestDef {
            id: 12,
            name: "Troll Cull".to_string(),
            required_level: 35,
            steps: vec![
                QuestStep {
                    description: "Slay trolls in the northern pass".to_string(),
                    target_mob: 7,
                    required_count: 10,
                    reward_item: 0,
                },
                QuestStep {
                    description: "Report back to the captain".to_string(),
                    target_mob: 0,
                    required_count: 1,
                    reward_item: 1024,
                },
            ],
        }];
        let mut bytes = Vec::new();
        write_quests(&quests, &mut bytes);
        let parsed = parse_quests(&bytes).unwrap();
        assert_eq!(parsed[&12], quests[0]);
    }

    #[test]
    fn reload_from_pak_populates_every_table() {
        let mut skill_bytes = Vec::new();
        write_skills(&[sample_skill(1, 500)], &mut skill_bytes);
        let mut drop_bytes = Vec::new();
        write_drops(
            &[DropDef {
                mob_id: 1,
                item_index: 5,
                chance_permille: 100,
                min_count: 1,
                max_count: 1,
            }],
            &mut drop_bytes,
        );

        let mut builder = PakBuilder::new();
        builder.add("tables/skill.tbl", &skill_bytes, true, 0);
        builder.add("tables/drop.tbl", &drop_bytes, false, 0);
        let archive = PakArchive::from_bytes(builder.finish().unwrap()).unwrap();

        let registry = DataRegistry::new();
        let generation = registry.reload_from_pak(&archive).unwrap();
        assert_eq!(generation, 1);

        let tables = registry.snapshot();
        assert_eq!(tables.generation, 1);
        assert_eq!(tables.skills.len(), 1);
        assert_eq!(tables.drops.len(), 1);
        assert!(tables.items.is_empty());
    }

    /// Readers holding an old snapshot keep seeing it after a reload.
    #[test]
    fn reload_does_not_disturb_existing_readers() {
        let registry = DataRegistry::new();
        let mut tables = Tables::default();
        tables.skills.insert(1, sample_skill(1, 100));
        registry.reload(tables);

        let held = registry.snapshot();
        assert_eq!(held.generation, 1);

        let mut replacement = Tables::default();
        replacement.skills.insert(2, sample_skill(2, 100));
        registry.reload(replacement);

        // The held snapshot is unchanged; a fresh one sees generation 2.
        assert!(held.skills.contains_key(&1));
        assert!(!held.skills.contains_key(&2));
        let fresh = registry.snapshot();
        assert_eq!(fresh.generation, 2);
        assert!(fresh.skills.contains_key(&2));
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn skill_def_hydrates_an_engine_definition() {
        let def = sample_skill(4, 900).to_definition();
        assert_eq!(def.id, 4);
        assert_eq!(def.timing.cooldown_ms, 900);
        assert_eq!(def.options.max_charges, 2);
        assert_eq!(def.options.charge_restore_ms, 4000);
        assert!(def.options.interruptible);
    }

    #[test]
    fn hostile_count_prefix_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(parse_skills(&bytes).is_err());
        assert!(parse_items(&bytes).is_err());
        assert!(parse_drops(&bytes).is_err());
    }
}
