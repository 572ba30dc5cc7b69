//! Per-actor skill manager.
//!
//! Owns every state machine the actor has learned, the combo tracker that
//! remembers the last completed skill, and the category table for shared
//! cooldowns. A manager is single-threaded by construction: the engine
//! keeps it behind the actor's mutex.

use std::collections::HashMap;

use crate::skill::machine::SkillStateMachine;
use crate::skill::types::*;

pub type CategoryId = u16;

struct CategoryInfo {
    name: String,
    cooldown_sharing: bool,
    global_cooldown_end: u64,
    skills: Vec<SkillId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LastCompleted {
    skill_id: SkillId,
    end_time: u64,
    success: bool,
}

/// Manager-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub interruptions: u64,
    pub combos_applied: u64,
}

pub struct SkillManager {
    entity_id: ActorId,
    skills: HashMap<SkillId, SkillStateMachine>,
    categories: HashMap<CategoryId, CategoryInfo>,
    skill_category: HashMap<SkillId, CategoryId>,
    last_completed: Option<LastCompleted>,
    stats: ManagerStats,
}

impl SkillManager {
    pub fn new(entity_id: ActorId) -> Self {
        Self {
            entity_id,
            skills: HashMap::new(),
            categories: HashMap::new(),
            skill_category: HashMap::new(),
            last_completed: None,
            stats: ManagerStats::default(),
        }
    }

    pub fn entity_id(&self) -> ActorId {
        self.entity_id
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }

    // ------------------------------------------------------------------
    //  Registration
    // ------------------------------------------------------------------

    /// Register a skill. Re-registering an id replaces the old machine.
    pub fn register_skill(&mut self, def: SkillDefinition) -> &mut SkillStateMachine {
        let id = def.id;
        self.skills.insert(id, SkillStateMachine::new(def));
        self.skills.get_mut(&id).expect("just inserted")
    }

    pub fn unregister_skill(&mut self, skill_id: SkillId) -> bool {
        self.skill_category.remove(&skill_id);
        for category in self.categories.values_mut() {
            category.skills.retain(|s| *s != skill_id);
        }
        self.skills.remove(&skill_id).is_some()
    }

    pub fn skill(&self, skill_id: SkillId) -> Option<&SkillStateMachine> {
        self.skills.get(&skill_id)
    }

    pub fn skill_mut(&mut self, skill_id: SkillId) -> Option<&mut SkillStateMachine> {
        self.skills.get_mut(&skill_id)
    }

    pub fn register_category(
        &mut self,
        category_id: CategoryId,
        name: &str,
        cooldown_sharing: bool,
    ) {
        self.categories.insert(
            category_id,
            CategoryInfo {
                name: name.to_string(),
                cooldown_sharing,
                global_cooldown_end: 0,
                skills: Vec::new(),
            },
        );
    }

    pub fn category_name(&self, category_id: CategoryId) -> Option<&str> {
        self.categories.get(&category_id).map(|c| c.name.as_str())
    }

    /// Put a registered skill into a category. Fails when either side is
    /// unknown.
    pub fn assign_category(&mut self, skill_id: SkillId, category_id: CategoryId) -> bool {
        if !self.skills.contains_key(&skill_id) {
            return false;
        }
        let Some(category) = self.categories.get_mut(&category_id) else {
            return false;
        };
        if !category.skills.contains(&skill_id) {
            category.skills.push(skill_id);
        }
        self.skill_category.insert(skill_id, category_id);
        true
    }

    /// Add a combo step on `skill_id`, reachable after `previous_skill`.
    pub fn register_combo(
        &mut self,
        previous_skill: SkillId,
        skill_id: SkillId,
        step: ComboStep,
    ) -> bool {
        let Some(machine) = self.skills.get_mut(&skill_id) else {
            return false;
        };
        machine.add_combo_step(previous_skill, step);
        true
    }

    /// Refresh the live actor snapshot every machine re-checks its
    /// requirements against.
    pub fn update_actor(&mut self, actor: ActorSnapshot) {
        for machine in self.skills.values_mut() {
            machine.set_actor_snapshot(actor.clone());
        }
    }

    /// Same, derived from the actor's mob record (equipment effects and
    /// affects included).
    pub fn update_actor_from_mob(&mut self, mob: &wyd_core::types::Mob) {
        self.update_actor(ActorSnapshot::from_mob(mob));
    }

    // ------------------------------------------------------------------
    //  Execution
    // ------------------------------------------------------------------

    pub fn execute(
        &mut self,
        skill_id: SkillId,
        ctx: ExecutionContext,
        now: u64,
    ) -> ExecutionResult {
        self.stats.total_executions += 1;
        let execution_id = ctx.execution_id;

        if !self.skills.contains_key(&skill_id) {
            log::warn!(
                "Actor {} tried unknown skill {skill_id}",
                self.entity_id
            );
            self.stats.failed_executions += 1;
            return ExecutionResult::failed(ExecutionOutcome::FailedState, execution_id);
        }

        // Category-shared cooldown gates before the machine is consulted.
        if let Some(category_id) = self.skill_category.get(&skill_id) {
            if let Some(category) = self.categories.get(category_id) {
                if category.cooldown_sharing && now < category.global_cooldown_end {
                    self.stats.failed_executions += 1;
                    return ExecutionResult::failed(ExecutionOutcome::FailedCooldown, execution_id);
                }
            }
        }

        let combo_multiplier = self.resolve_combo_multiplier(skill_id, now);
        let machine = self.skills.get_mut(&skill_id).expect("checked above");
        let (result, completions) = machine.execute(ctx, combo_multiplier, now);

        if result.is_success() {
            self.stats.successful_executions += 1;
            if combo_multiplier > 1.0 {
                self.stats.combos_applied += 1;
            }
        } else if result.outcome != ExecutionOutcome::Buffered {
            self.stats.failed_executions += 1;
        }

        self.process_completions(&completions);
        result
    }

    pub fn interrupt(
        &mut self,
        skill_id: SkillId,
        execution_id: ExecutionId,
        reason: &str,
        priority: u32,
        now: u64,
    ) -> InterruptOutcome {
        let Some(machine) = self.skills.get_mut(&skill_id) else {
            return InterruptOutcome::FailedState;
        };
        let (outcome, completions) = machine.interrupt(execution_id, reason, priority, now);
        if outcome == InterruptOutcome::Success {
            self.stats.interruptions += 1;
        }
        self.process_completions(&completions);
        outcome
    }

    /// Drive every machine forward.
    pub fn update(&mut self, now: u64) {
        let mut all_completions = Vec::new();
        for machine in self.skills.values_mut() {
            all_completions.extend(machine.update(now));
        }
        self.process_completions(&all_completions);
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    fn resolve_combo_multiplier(&self, skill_id: SkillId, now: u64) -> f32 {
        let Some(last) = self.last_completed else {
            return 1.0;
        };
        let Some(machine) = self.skills.get(&skill_id) else {
            return 1.0;
        };
        machine
            .combo_multiplier_for(last.skill_id, last.end_time, last.success, now)
            .unwrap_or(1.0)
    }

    fn process_completions(&mut self, completions: &[CompletedExecution]) {
        for completion in completions {
            // Latest completion wins the combo tracker.
            let replace = match self.last_completed {
                None => true,
                Some(last) => completion.end_time >= last.end_time,
            };
            if replace {
                self.last_completed = Some(LastCompleted {
                    skill_id: completion.skill_id,
                    end_time: completion.end_time,
                    success: completion.success,
                });
            }

            // Successful completions arm the category's shared cooldown.
            if completion.success {
                if let Some(category_id) = self.skill_category.get(&completion.skill_id) {
                    if let Some(category) = self.categories.get_mut(category_id) {
                        if category.cooldown_sharing {
                            let cooldown = self
                                .skills
                                .get(&completion.skill_id)
                                .map(|m| m.timing().cooldown_ms)
                                .unwrap_or(0);
                            let end = completion.end_time + cooldown;
                            if end > category.global_cooldown_end {
                                category.global_cooldown_end = end;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: ExecutionId, now: u64) -> ExecutionContext {
        ExecutionContext::simple(id, now, ActorSnapshot::default())
    }

    fn combo_pair() -> SkillManager {
        let mut manager = SkillManager::new(77);
        manager.register_skill(SkillDefinition::instant(1, "Opener", 200));
        manager.register_skill(SkillDefinition::instant(2, "Finisher", 200));
        manager.register_combo(
            1,
            2,
            ComboStep {
                window_start_ms: 50,
                window_duration_ms: 300,
                damage_multiplier: 1.5,
                requires_success: true,
            },
        );
        manager
    }

    /// Scenario: A then B inside the [50, 300] window gets the 1.5x bonus.
    #[test]
    fn combo_inside_window_applies_multiplier() {
        let mut manager = combo_pair();
        let result = manager.execute(1, ctx(1, 0), 0);
        assert_eq!(result.outcome, ExecutionOutcome::Success);

        let result = manager.execute(2, ctx(2, 300), 300);
        assert_eq!(result.outcome, ExecutionOutcome::Success);
        assert!((result.damage_multiplier - 1.5).abs() < f32::EPSILON);
        assert_eq!(manager.stats().combos_applied, 1);
    }

    /// Scenario: B at +600 ms still succeeds, without the bonus.
    #[test]
    fn combo_outside_window_succeeds_without_bonus() {
        let mut manager = combo_pair();
        assert!(manager.execute(1, ctx(1, 0), 0).is_success());

        let result = manager.execute(2, ctx(2, 600), 600);
        assert_eq!(result.outcome, ExecutionOutcome::Success);
        assert!((result.damage_multiplier - 1.0).abs() < f32::EPSILON);
        assert_eq!(manager.stats().combos_applied, 0);
    }

    /// An off-combo execution replaces the tracker, expiring the chain.
    #[test]
    fn off_combo_execution_breaks_the_chain() {
        let mut manager = combo_pair();
        manager.register_skill(SkillDefinition::instant(9, "Shrug", 0));

        assert!(manager.execute(1, ctx(1, 0), 0).is_success());
        assert!(manager.execute(9, ctx(2, 100), 100).is_success());
        // B is now inside A's window but the tracker points at skill 9.
        let result = manager.execute(2, ctx(3, 200), 200);
        assert_eq!(result.outcome, ExecutionOutcome::Success);
        assert!((result.damage_multiplier - 1.0).abs() < f32::EPSILON);
    }

    /// requires_success steps do not fire after an interrupted opener.
    #[test]
    fn interrupted_opener_does_not_combo() {
        let mut manager = SkillManager::new(5);
        let mut opener = SkillDefinition::instant(1, "Opener", 0);
        opener.timing.casting_ms = 500;
        manager.register_skill(opener);
        manager.register_skill(SkillDefinition::instant(2, "Finisher", 0));
        manager.register_combo(
            1,
            2,
            ComboStep {
                window_start_ms: 0,
                window_duration_ms: 1000,
                damage_multiplier: 2.0,
                requires_success: true,
            },
        );

        assert!(manager.execute(1, ctx(1, 0), 0).is_success());
        assert_eq!(
            manager.interrupt(1, 1, "shield bash", 1, 100),
            InterruptOutcome::Success
        );
        let result = manager.execute(2, ctx(2, 200), 200);
        assert!(result.is_success());
        assert!((result.damage_multiplier - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_skill_fails_cleanly() {
        let mut manager = SkillManager::new(1);
        let result = manager.execute(42, ctx(1, 0), 0);
        assert_eq!(result.outcome, ExecutionOutcome::FailedState);
        assert_eq!(manager.stats().failed_executions, 1);
    }

    #[test]
    fn shared_category_cooldown_gates_siblings() {
        let mut manager = SkillManager::new(3);
        manager.register_skill(SkillDefinition::instant(1, "Fireball", 500));
        manager.register_skill(SkillDefinition::instant(2, "Frostbolt", 500));
        manager.register_category(1, "elemental", true);
        assert!(manager.assign_category(1, 1));
        assert!(manager.assign_category(2, 1));

        assert!(manager.execute(1, ctx(1, 0), 0).is_success());
        // Sibling is blocked by the shared cooldown, not its own.
        let result = manager.execute(2, ctx(2, 100), 100);
        assert_eq!(result.outcome, ExecutionOutcome::FailedCooldown);
        // After the window both are usable again.
        let result = manager.execute(2, ctx(3, 600), 600);
        assert_eq!(result.outcome, ExecutionOutcome::Success);
    }

    #[test]
    fn non_sharing_category_does_not_gate() {
        let mut manager = SkillManager::new(3);
        manager.register_skill(SkillDefinition::instant(1, "Jab", 500));
        manager.register_skill(SkillDefinition::instant(2, "Hook", 500));
        manager.register_category(1, "boxing", false);
        manager.assign_category(1, 1);
        manager.assign_category(2, 1);

        assert!(manager.execute(1, ctx(1, 0), 0).is_success());
        assert!(manager.execute(2, ctx(2, 100), 100).is_success());
    }

    #[test]
    fn unregister_removes_skill_and_category_links() {
        let mut manager = SkillManager::new(3);
        manager.register_skill(SkillDefinition::instant(1, "Old", 0));
        manager.register_category(1, "relics", true);
        manager.assign_category(1, 1);
        assert!(manager.unregister_skill(1));
        assert!(!manager.unregister_skill(1));
        assert_eq!(manager.skill_count(), 0);
        assert!(!manager.assign_category(1, 1));
    }

    #[test]
    fn update_actor_propagates_to_machines() {
        let mut manager = SkillManager::new(3);
        let mut def = SkillDefinition::instant(1, "Costly", 0);
        def.timing.casting_ms = 500;
        def.requirements.mana = 50;
        manager.register_skill(def);

        let rich = ExecutionContext::simple(
            1,
            0,
            ActorSnapshot {
                mana: 100,
                ..ActorSnapshot::default()
            },
        );
        assert!(manager.execute(1, rich, 0).is_success());
        manager.update_actor(ActorSnapshot {
            mana: 0,
            ..ActorSnapshot::default()
        });
        manager.update(250);
        assert_eq!(
            manager.skill(1).unwrap().state(),
            SkillState::Idle
        );
    }
}
