//! Actor-sharded skill engine.
//!
//! Every actor owns a [`SkillManager`] behind its own mutex: concurrent
//! executes against one actor serialize, executes across actors run fully
//! in parallel, and there is no global skill lock. Security violations
//! detected by the machines are forwarded to the violation sink and may
//! throttle the offending actor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::clock::Clock;
use crate::config::SkillEngineConfig;
use crate::skill::manager::{CategoryId, SkillManager};
use crate::skill::types::*;
use crate::violation::{
    DetectionMethod, Severity, ViolationKind, ViolationReport, ViolationSink,
};

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub interruptions: u64,
    pub security_violations: u64,
    pub throttled_rejections: u64,
}

struct EngineShared {
    sink: Arc<ViolationSink>,
    clock: Arc<dyn Clock>,
    config: SkillEngineConfig,
    throttled: Mutex<HashMap<ActorId, u64>>,
    violation_count: AtomicU64,
}

impl EngineShared {
    fn on_violation(&self, actor: ActorId, kind: ViolationKind, detail: &str) {
        self.violation_count.fetch_add(1, Ordering::Relaxed);
        self.sink.report(ViolationReport {
            kind,
            severity: Severity::High,
            method: DetectionMethod::BehaviorAnalysis,
            client_id: actor,
            context: detail.to_string(),
        });
        let until = self.clock.now_ms() + self.config.throttle_duration_ms;
        self.throttled.lock().unwrap().insert(actor, until);
    }
}

pub struct SkillEngine {
    actors: RwLock<HashMap<ActorId, Arc<Mutex<SkillManager>>>>,
    shared: Arc<EngineShared>,
    stats: Mutex<EngineStats>,
}

impl SkillEngine {
    pub fn new(config: SkillEngineConfig, clock: Arc<dyn Clock>, sink: Arc<ViolationSink>) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            shared: Arc::new(EngineShared {
                sink,
                clock,
                config,
                throttled: Mutex::new(HashMap::new()),
                violation_count: AtomicU64::new(0),
            }),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    // ------------------------------------------------------------------
    //  Actor and skill registration
    // ------------------------------------------------------------------

    pub fn register_actor(&self, actor: ActorId) {
        let mut actors = self.actors.write().unwrap();
        actors
            .entry(actor)
            .or_insert_with(|| Arc::new(Mutex::new(SkillManager::new(actor))));
    }

    pub fn unregister_actor(&self, actor: ActorId) -> bool {
        self.actors.write().unwrap().remove(&actor).is_some()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.read().unwrap().len()
    }

    fn manager(&self, actor: ActorId) -> Option<Arc<Mutex<SkillManager>>> {
        self.actors.read().unwrap().get(&actor).cloned()
    }

    /// Register a skill for an actor (creating the actor on first use) and
    /// wire its security reports into the violation sink. A definition
    /// carrying untouched default options inherits the engine-wide
    /// configuration.
    pub fn register_skill(&self, actor: ActorId, mut def: SkillDefinition) -> bool {
        if def.options == SkillOptions::default() {
            let config = &self.shared.config;
            def.options = SkillOptions {
                interruptible: config.interruptible,
                max_charges: config.max_charges,
                charge_restore_ms: config.charge_restore_ms,
                execution_buffer_size: config.execution_buffer_size,
                anomaly_threshold: config.anomaly_threshold,
                timestamp_drift_ms: config.timestamp_drift_ms,
                replay_window_ms: config.replay_window_ms,
                ..SkillOptions::default()
            };
        }
        self.register_actor(actor);
        let Some(manager) = self.manager(actor) else {
            return false;
        };
        let mut manager = manager.lock().unwrap();
        let machine = manager.register_skill(def);
        let shared = self.shared.clone();
        machine.register_security_callback(move |kind, detail| {
            shared.on_violation(actor, kind, detail);
        });
        true
    }

    pub fn unregister_skill(&self, actor: ActorId, skill_id: SkillId) -> bool {
        match self.manager(actor) {
            Some(manager) => manager.lock().unwrap().unregister_skill(skill_id),
            None => false,
        }
    }

    pub fn register_combo(
        &self,
        actor: ActorId,
        previous_skill: SkillId,
        skill_id: SkillId,
        step: ComboStep,
    ) -> bool {
        match self.manager(actor) {
            Some(manager) => manager
                .lock()
                .unwrap()
                .register_combo(previous_skill, skill_id, step),
            None => false,
        }
    }

    pub fn register_category(
        &self,
        actor: ActorId,
        category_id: CategoryId,
        name: &str,
        cooldown_sharing: bool,
    ) -> bool {
        match self.manager(actor) {
            Some(manager) => {
                manager
                    .lock()
                    .unwrap()
                    .register_category(category_id, name, cooldown_sharing);
                true
            }
            None => false,
        }
    }

    pub fn assign_category(
        &self,
        actor: ActorId,
        skill_id: SkillId,
        category_id: CategoryId,
    ) -> bool {
        match self.manager(actor) {
            Some(manager) => manager.lock().unwrap().assign_category(skill_id, category_id),
            None => false,
        }
    }

    /// Push a fresh actor snapshot for mid-execution requirement checks.
    pub fn update_actor_state(&self, actor: ActorId, snapshot: ActorSnapshot) -> bool {
        match self.manager(actor) {
            Some(manager) => {
                manager.lock().unwrap().update_actor(snapshot);
                true
            }
            None => false,
        }
    }

    /// Push the actor's current mob record; the snapshot derivation folds
    /// in equipment and affects.
    pub fn update_actor_mob(&self, actor: ActorId, mob: &wyd_core::types::Mob) -> bool {
        match self.manager(actor) {
            Some(manager) => {
                manager.lock().unwrap().update_actor_from_mob(mob);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    //  Execution surface
    // ------------------------------------------------------------------

    pub fn execute(&self, actor: ActorId, skill_id: SkillId, ctx: ExecutionContext) -> ExecutionResult {
        let now = self.shared.clock.now_ms();
        let execution_id = ctx.execution_id;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.total_executions += 1;
        }

        if self.is_throttled(actor, now) {
            let mut stats = self.stats.lock().unwrap();
            stats.throttled_rejections += 1;
            stats.failed_executions += 1;
            return ExecutionResult::failed(ExecutionOutcome::FailedPermissions, execution_id);
        }

        let Some(manager) = self.manager(actor) else {
            self.stats.lock().unwrap().failed_executions += 1;
            return ExecutionResult::failed(ExecutionOutcome::FailedTarget, execution_id);
        };
        let result = manager.lock().unwrap().execute(skill_id, ctx, now);

        let mut stats = self.stats.lock().unwrap();
        match result.outcome {
            ExecutionOutcome::Success => stats.successful_executions += 1,
            ExecutionOutcome::Buffered => {}
            _ => stats.failed_executions += 1,
        }
        result
    }

    pub fn interrupt(
        &self,
        actor: ActorId,
        skill_id: SkillId,
        execution_id: ExecutionId,
        reason: &str,
        priority: u32,
    ) -> InterruptOutcome {
        let now = self.shared.clock.now_ms();
        let Some(manager) = self.manager(actor) else {
            return InterruptOutcome::FailedState;
        };
        let outcome = manager
            .lock()
            .unwrap()
            .interrupt(skill_id, execution_id, reason, priority, now);
        if outcome == InterruptOutcome::Success {
            self.stats.lock().unwrap().interruptions += 1;
        }
        outcome
    }

    /// Drive every actor's machines forward. Called from the main loop.
    pub fn update(&self) {
        let now = self.shared.clock.now_ms();
        let managers: Vec<Arc<Mutex<SkillManager>>> =
            self.actors.read().unwrap().values().cloned().collect();
        for manager in managers {
            manager.lock().unwrap().update(now);
        }
        // Throttle entries expire lazily.
        self.shared
            .throttled
            .lock()
            .unwrap()
            .retain(|_, until| *until > now);
    }

    // ------------------------------------------------------------------
    //  Observers
    // ------------------------------------------------------------------

    pub fn is_throttled(&self, actor: ActorId, now: u64) -> bool {
        match self.shared.throttled.lock().unwrap().get(&actor) {
            Some(until) => now < *until,
            None => false,
        }
    }

    pub fn skill_state(&self, actor: ActorId, skill_id: SkillId) -> Option<SkillState> {
        let manager = self.manager(actor)?;
        let guard = manager.lock().unwrap();
        guard.skill(skill_id).map(|m| m.state())
    }

    pub fn charges(&self, actor: ActorId, skill_id: SkillId) -> Option<u32> {
        let manager = self.manager(actor)?;
        let guard = manager.lock().unwrap();
        guard.skill(skill_id).map(|m| m.charges())
    }

    pub fn time_to_next_charge(&self, actor: ActorId, skill_id: SkillId) -> Option<u64> {
        let now = self.shared.clock.now_ms();
        let manager = self.manager(actor)?;
        let guard = manager.lock().unwrap();
        guard.skill(skill_id).map(|m| m.time_to_next_charge(now))
    }

    pub fn remaining_cooldown(&self, actor: ActorId, skill_id: SkillId) -> Option<u64> {
        let now = self.shared.clock.now_ms();
        let manager = self.manager(actor)?;
        let guard = manager.lock().unwrap();
        guard.skill(skill_id).map(|m| m.remaining_cooldown(now))
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.security_violations = self.shared.violation_count.load(Ordering::Relaxed);
        stats
    }

    /// Run `f` under the actor's lock with its manager. For observers and
    /// tooling; gameplay paths use the typed surface above.
    pub fn with_manager<R>(&self, actor: ActorId, f: impl FnOnce(&mut SkillManager) -> R) -> Option<R> {
        let manager = self.manager(actor)?;
        let mut guard = manager.lock().unwrap();
        Some(f(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn engine_with_clock() -> (SkillEngine, Arc<ManualClock>, Arc<ViolationSink>) {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(ViolationSink::new(32, 0));
        let engine = SkillEngine::new(
            SkillEngineConfig::default(),
            clock.clone() as Arc<dyn Clock>,
            sink.clone(),
        );
        (engine, clock, sink)
    }

    fn ctx(id: ExecutionId, now: u64) -> ExecutionContext {
        ExecutionContext::simple(id, now, ActorSnapshot::default())
    }

    /// A 1000 ms cooldown rejects a retry at +500 and accepts one at +1001.
    #[test]
    fn cooldown_scenario_through_the_engine() {
        let (engine, clock, _) = engine_with_clock();
        engine.register_skill(1, SkillDefinition::instant(10, "Slash", 1000));

        clock.set(5000);
        assert!(engine.execute(1, 10, ctx(1, 5000)).is_success());
        clock.set(5500);
        assert_eq!(
            engine.execute(1, 10, ctx(2, 5500)).outcome,
            ExecutionOutcome::FailedCooldown
        );
        assert_eq!(engine.remaining_cooldown(1, 10), Some(500));
        clock.set(6001);
        assert!(engine.execute(1, 10, ctx(3, 6001)).is_success());
    }

    /// Combo A→B with window [50, 300] grants 1.5x at t=300 and
    /// nothing at t=600.
    #[test]
    fn combo_scenario_through_the_engine() {
        let (engine, clock, _) = engine_with_clock();
        for actor in [1, 2] {
            engine.register_skill(actor, SkillDefinition::instant(1, "Opener", 200));
            engine.register_skill(actor, SkillDefinition::instant(2, "Finisher", 200));
            engine.register_combo(
                actor,
                1,
                2,
                ComboStep {
                    window_start_ms: 50,
                    window_duration_ms: 300,
                    damage_multiplier: 1.5,
                    requires_success: true,
                },
            );
        }

        clock.set(0);
        assert!(engine.execute(1, 1, ctx(1, 0)).is_success());
        clock.set(300);
        let result = engine.execute(1, 2, ctx(2, 300));
        assert!(result.is_success());
        assert!((result.damage_multiplier - 1.5).abs() < f32::EPSILON);

        // Same pair on a second actor, finisher late: no bonus.
        clock.set(1000);
        assert!(engine.execute(2, 1, ctx(3, 1000)).is_success());
        clock.set(1600);
        let result = engine.execute(2, 2, ctx(4, 1600));
        assert!(result.is_success());
        assert!((result.damage_multiplier - 1.0).abs() < f32::EPSILON);
    }

    /// Two concurrent executes against the same actor's same skill yield
    /// exactly one Success; the charge is consumed once.
    #[test]
    fn concurrent_executes_serialize_per_actor() {
        let (engine, clock, _) = engine_with_clock();
        engine.register_skill(7, SkillDefinition::instant(3, "Bash", 1000));
        clock.set(100);

        let engine = Arc::new(engine);
        let mut handles = Vec::new();
        for n in 0..2u64 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                engine.execute(7, 3, ctx(n + 1, 100)).outcome
            }));
        }
        let outcomes: Vec<ExecutionOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let successes = outcomes
            .iter()
            .filter(|o| **o == ExecutionOutcome::Success)
            .count();
        assert_eq!(successes, 1, "outcomes: {outcomes:?}");
        assert_eq!(engine.charges(7, 3), Some(0));
    }

    #[test]
    fn actors_execute_independently() {
        let (engine, clock, _) = engine_with_clock();
        engine.register_skill(1, SkillDefinition::instant(5, "Stab", 1000));
        engine.register_skill(2, SkillDefinition::instant(5, "Stab", 1000));
        clock.set(50);
        assert!(engine.execute(1, 5, ctx(1, 50)).is_success());
        // Actor 2's copy of the skill is unaffected by actor 1's cooldown.
        assert!(engine.execute(2, 5, ctx(2, 50)).is_success());
    }

    /// Replaying an execution id reports TokenMismatch to the sink, fails
    /// with FailedSecurity, and throttles the actor.
    #[test]
    fn replay_reports_to_sink_and_throttles() {
        let (engine, clock, sink) = engine_with_clock();
        let mut def = SkillDefinition::instant(4, "Blink", 0);
        def.options.max_charges = 5;
        engine.register_skill(9, def);

        clock.set(1000);
        assert!(engine.execute(9, 4, ctx(77, 1000)).is_success());
        clock.set(1100);
        let result = engine.execute(9, 4, ctx(77, 1100));
        assert_eq!(result.outcome, ExecutionOutcome::FailedSecurity);

        let events = sink.recent_events(8);
        assert!(events
            .iter()
            .any(|e| e.kind == ViolationKind::TokenMismatch && e.client_id == 9));

        // The actor is throttled for the configured window.
        clock.set(1200);
        let result = engine.execute(9, 4, ctx(78, 1200));
        assert_eq!(result.outcome, ExecutionOutcome::FailedPermissions);
        assert_eq!(engine.stats().throttled_rejections, 1);

        // Past the window the actor can act again.
        clock.set(1100 + SkillEngineConfig::default().throttle_duration_ms + 1);
        let now = clock.now_ms();
        let result = engine.execute(9, 4, ExecutionContext::simple(79, now, ActorSnapshot::default()));
        assert_eq!(result.outcome, ExecutionOutcome::Success);
    }

    /// Interrupt scenario: priority 1 interrupts a default skill mid-prep;
    /// the same priority bounces off a skill demanding priority 5, and the
    /// cast proceeds to Casting.
    #[test]
    fn interrupt_priority_scenario() {
        let (engine, clock, _) = engine_with_clock();
        let mut easy = SkillDefinition::instant(1, "Long Chant", 0);
        easy.timing.preparation_ms = 1000;
        easy.timing.casting_ms = 500;
        engine.register_skill(1, easy);

        let mut stubborn = SkillDefinition::instant(2, "Focused Chant", 0);
        stubborn.timing.preparation_ms = 1000;
        stubborn.timing.casting_ms = 500;
        stubborn.options.min_interrupt_priority = 5;
        engine.register_skill(1, stubborn);

        clock.set(0);
        assert!(engine.execute(1, 1, ctx(1, 0)).is_success());
        clock.set(500);
        assert_eq!(
            engine.interrupt(1, 1, 1, "hit", 1),
            InterruptOutcome::Success
        );
        assert_eq!(engine.skill_state(1, 1), Some(SkillState::Idle));

        clock.set(2000);
        assert!(engine.execute(1, 2, ctx(2, 2000)).is_success());
        clock.set(2500);
        assert_eq!(
            engine.interrupt(1, 2, 2, "hit", 1),
            InterruptOutcome::FailedPriority
        );
        clock.set(3000);
        engine.update();
        assert_eq!(engine.skill_state(1, 2), Some(SkillState::Casting));
    }

    #[test]
    fn unknown_actor_fails_with_target() {
        let (engine, _, _) = engine_with_clock();
        let result = engine.execute(99, 1, ctx(1, 0));
        assert_eq!(result.outcome, ExecutionOutcome::FailedTarget);
    }

    #[test]
    fn unregister_actor_drops_its_manager() {
        let (engine, _, _) = engine_with_clock();
        engine.register_skill(3, SkillDefinition::instant(1, "Any", 0));
        assert_eq!(engine.actor_count(), 1);
        assert!(engine.unregister_actor(3));
        assert!(!engine.unregister_actor(3));
        assert_eq!(engine.actor_count(), 0);
    }

    #[test]
    fn engine_stats_track_outcomes() {
        let (engine, clock, _) = engine_with_clock();
        engine.register_skill(1, SkillDefinition::instant(1, "Hit", 1000));
        clock.set(100);
        engine.execute(1, 1, ctx(1, 100));
        clock.set(200);
        engine.execute(1, 1, ctx(2, 200));
        let stats = engine.stats();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
    }
}
