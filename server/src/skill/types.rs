//! Shared types for the skill engine.

use crate::item_effects;
use crate::violation::ViolationKind;
use wyd_core::types::Mob;

pub type ActorId = u32;
pub type SkillId = u16;
pub type ExecutionId = u64;
pub type CallbackId = u64;

/// Lifecycle states of a skill. `Interrupted` and `Failed` are transient:
/// the machine passes through them on its way back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillState {
    Idle,
    Preparation,
    Casting,
    Recovery,
    Cooldown,
    Channeling,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillCategory {
    Magic,
    Melee,
    Ranged,
    Movement,
    Buff,
    Debuff,
    Healing,
    Summon,
    Utility,
}

/// Events surfaced through per-skill callbacks on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillEventKind {
    Execute,
    Progress,
    FinishPrep,
    FinishCast,
    FinishRecovery,
    Interrupt,
    Cancel,
    CooldownEnd,
    ChargeGained,
    Chaining,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    FailedCooldown,
    FailedNoCharges,
    FailedRequirements,
    FailedState,
    FailedInterrupted,
    FailedPermissions,
    FailedTarget,
    FailedCombo,
    FailedSecurity,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Success,
    FailedUninterruptible,
    FailedState,
    FailedPermissions,
    FailedPriority,
    None,
}

/// Stage durations in milliseconds. `variability` widens each active stage
/// by a factor sampled once per execution from `1 ± variability`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillTiming {
    pub preparation_ms: u64,
    pub casting_ms: u64,
    pub recovery_ms: u64,
    pub cooldown_ms: u64,
    pub channel_duration_ms: u64,
    pub variability: f32,
}

/// What the actor must have to start (and keep) an execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillRequirements {
    pub mana: u32,
    pub stamina: u32,
    pub health: u32,
    pub level: u32,
    pub items: Vec<u16>,
    pub buffs: Vec<u8>,
    pub states: Vec<String>,
}

impl SkillRequirements {
    pub fn satisfied_by(&self, actor: &ActorSnapshot) -> bool {
        actor.mana >= self.mana
            && actor.stamina >= self.stamina
            && actor.health >= self.health
            && actor.level >= self.level
            && self.items.iter().all(|item| actor.items.contains(item))
            && self.buffs.iter().all(|buff| actor.buffs.contains(buff))
            && self.states.iter().all(|state| actor.states.contains(state))
    }
}

/// Point-in-time view of the executing actor, captured by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorSnapshot {
    pub mana: u32,
    pub stamina: u32,
    pub health: u32,
    pub level: u32,
    pub items: Vec<u16>,
    pub buffs: Vec<u8>,
    pub states: Vec<String>,
}

impl ActorSnapshot {
    /// Build the view the requirement checks run against from an actor's
    /// mob record. Carried items always count; equipped items count only
    /// while the mob still meets their requirement effects. Active
    /// affects become the buff list.
    pub fn from_mob(mob: &Mob) -> Self {
        let mut items: Vec<u16> = mob
            .carry
            .iter()
            .filter(|item| !item.is_empty())
            .map(|item| item.index.max(0) as u16)
            .collect();
        for item in mob.equip.iter().filter(|item| !item.is_empty()) {
            if item_effects::meets_requirements(mob, item) {
                items.push(item.index.max(0) as u16);
            }
        }

        let buffs = mob
            .affects
            .iter()
            .filter(|affect| !affect.is_empty())
            .map(|affect| affect.kind)
            .collect();

        let mut states = Vec::new();
        if mob.is_alive() {
            states.push("alive".to_string());
        }

        Self {
            mana: mob.mp.max(0) as u32,
            // The legacy record carries no separate endurance pool;
            // constitution stands in for it.
            stamina: mob.constitution.max(0) as u32,
            health: mob.hp.max(0) as u32,
            level: mob.level as u32,
            items,
            buffs,
            states,
        }
    }
}

/// Everything one execution request carries.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub target_id: Option<ActorId>,
    pub security_token: u64,
    pub client_timestamp_ms: u64,
    pub actor: ActorSnapshot,
    pub server_authoritative: bool,
}

impl ExecutionContext {
    /// A context with the client clock in agreement with the server; test
    /// and tooling convenience.
    pub fn simple(execution_id: ExecutionId, now_ms: u64, actor: ActorSnapshot) -> Self {
        Self {
            execution_id,
            target_id: None,
            security_token: execution_id ^ 0xA5A5_A5A5_A5A5_A5A5,
            client_timestamp_ms: now_ms,
            actor,
            server_authoritative: true,
        }
    }
}

/// One step in a combo table entry: executing the owning skill inside
/// `[prev_end + window_start, prev_end + window_start + window_duration]`
/// grants `damage_multiplier`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComboStep {
    pub window_start_ms: u64,
    pub window_duration_ms: u64,
    pub damage_multiplier: f32,
    pub requires_success: bool,
}

/// Outcome handed back to the caller of `execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub execution_id: ExecutionId,
    pub damage_multiplier: f32,
}

impl ExecutionResult {
    pub fn success(execution_id: ExecutionId, damage_multiplier: f32) -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            execution_id,
            damage_multiplier,
        }
    }

    pub fn failed(outcome: ExecutionOutcome, execution_id: ExecutionId) -> Self {
        Self {
            outcome,
            execution_id,
            damage_multiplier: 1.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}

/// Live record of an accepted execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillExecution {
    pub execution_id: ExecutionId,
    pub state: SkillState,
    pub start_time: u64,
    pub state_start_time: u64,
    pub interrupted: bool,
    pub progress_percent: u32,
    pub damage_multiplier: f32,
    pub completed: bool,
    pub retry_count: u32,
    pub context: ExecutionContext,
}

/// Emitted when an execution leaves the machine, successfully or not. The
/// manager consumes these to drive combo tracking and shared cooldowns.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedExecution {
    pub skill_id: SkillId,
    pub execution_id: ExecutionId,
    pub end_time: u64,
    pub success: bool,
    pub damage_multiplier: f32,
}

/// Per-skill configuration knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillOptions {
    pub interruptible: bool,
    pub min_interrupt_priority: u32,
    pub max_charges: u32,
    /// Timed charge regeneration. 0 means a charge comes back when the
    /// cooldown ends instead.
    pub charge_restore_ms: u64,
    pub execution_buffer_size: usize,
    pub anomaly_threshold: f32,
    pub timestamp_drift_ms: u64,
    pub replay_window_ms: u64,
}

impl Default for SkillOptions {
    fn default() -> Self {
        Self {
            interruptible: true,
            min_interrupt_priority: 0,
            max_charges: 1,
            charge_restore_ms: 0,
            execution_buffer_size: 5,
            anomaly_threshold: 0.85,
            timestamp_drift_ms: 5000,
            replay_window_ms: 30000,
        }
    }
}

/// Full registration record for one skill.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillDefinition {
    pub id: SkillId,
    pub name: String,
    pub timing: SkillTiming,
    pub requirements: SkillRequirements,
    pub category: SkillCategory,
    pub options: SkillOptions,
}

impl SkillDefinition {
    /// An instant skill with only a cooldown; the common case in tests and
    /// in the legacy data.
    pub fn instant(id: SkillId, name: &str, cooldown_ms: u64) -> Self {
        Self {
            id,
            name: name.to_string(),
            timing: SkillTiming {
                cooldown_ms,
                ..SkillTiming::default()
            },
            requirements: SkillRequirements::default(),
            category: SkillCategory::Melee,
            options: SkillOptions::default(),
        }
    }
}

/// Payload handed to event callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillEventData {
    pub skill_id: SkillId,
    pub state: SkillState,
    pub progress_percent: u32,
}

pub type EventCallback = Box<dyn Fn(ExecutionId, SkillEventKind, &SkillEventData) + Send + Sync>;
pub type SecurityCallback = Box<dyn Fn(ViolationKind, &str) + Send + Sync>;

/// Per-skill counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkillStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub interruptions: u64,
    pub security_violations: u64,
    pub buffer_overflows: u64,
    pub buffered_retries: u64,
    pub callback_panics: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_check_covers_every_field() {
        let req = SkillRequirements {
            mana: 50,
            stamina: 10,
            health: 1,
            level: 5,
            items: vec![100],
            buffs: vec![7],
            states: vec!["standing".to_string()],
        };
        let mut actor = ActorSnapshot {
            mana: 60,
            stamina: 20,
            health: 100,
            level: 10,
            items: vec![100, 200],
            buffs: vec![7, 9],
            states: vec!["standing".to_string()],
        };
        assert!(req.satisfied_by(&actor));

        actor.mana = 49;
        assert!(!req.satisfied_by(&actor));
        actor.mana = 60;
        actor.items.clear();
        assert!(!req.satisfied_by(&actor));
    }

    #[test]
    fn empty_requirements_accept_any_actor() {
        assert!(SkillRequirements::default().satisfied_by(&ActorSnapshot::default()));
    }

    #[test]
    fn instant_definition_has_only_a_cooldown() {
        let def = SkillDefinition::instant(4, "Slash", 750);
        assert_eq!(def.timing.cooldown_ms, 750);
        assert_eq!(def.timing.preparation_ms, 0);
        assert_eq!(def.timing.casting_ms, 0);
        assert_eq!(def.options.max_charges, 1);
    }

    #[test]
    fn snapshot_from_mob_reflects_pools_items_and_affects() {
        use crate::item_effects::{add_effect, ItemEffectKind};
        use wyd_core::types::{Affect, Item};

        let mut mob = Mob::default();
        mob.set_name("Scout");
        mob.level = 30;
        mob.hp = 400;
        mob.mp = 120;
        mob.constitution = 55;
        mob.strength = 40;
        mob.carry[3] = Item::new(200);
        mob.equip[0] = Item::new(1024);
        // A second equipped item the mob is too weak to use.
        mob.equip[1] = Item::new(1025);
        assert!(add_effect(
            &mut mob.equip[1],
            ItemEffectKind::RequiredStr,
            80
        ));
        mob.affects[2] = Affect::new(9, 1, 1, 500);

        let snapshot = ActorSnapshot::from_mob(&mob);
        assert_eq!(snapshot.mana, 120);
        assert_eq!(snapshot.health, 400);
        assert_eq!(snapshot.stamina, 55);
        assert_eq!(snapshot.level, 30);
        assert!(snapshot.items.contains(&200));
        assert!(snapshot.items.contains(&1024));
        // Unusable equipment contributes nothing.
        assert!(!snapshot.items.contains(&1025));
        assert_eq!(snapshot.buffs, vec![9]);
        assert_eq!(snapshot.states, vec!["alive".to_string()]);
    }

    #[test]
    fn snapshot_from_dead_mob_has_no_alive_state() {
        let mob = Mob::default();
        let snapshot = ActorSnapshot::from_mob(&mob);
        assert!(snapshot.states.is_empty());
        assert!(snapshot.items.is_empty());
    }
}
