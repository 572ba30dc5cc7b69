//! Per-skill execution state machine.
//!
//! One machine instance exists per registered skill per actor. It is not
//! internally synchronized: the owning actor's manager lives behind that
//! actor's mutex, which linearizes all state transitions for the actor.
//!
//! Time is passed in explicitly as milliseconds. Transitions happen at
//! exact stage boundaries (`state_start + effective_duration`), not at the
//! moment `update` happens to be called, so combo windows and cooldowns are
//! insensitive to update cadence.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use rand::Rng;

use crate::skill::types::*;
use crate::violation::ViolationKind;

/// Upper bound on remembered execution ids before old entries are pruned.
const RECENT_EXECUTIONS_CAP: usize = 1024;

pub struct SkillStateMachine {
    skill_id: SkillId,
    name: String,
    timing: SkillTiming,
    requirements: SkillRequirements,
    category: SkillCategory,
    options: SkillOptions,

    state: SkillState,
    /// Per-execution stage-duration factor drawn from `1 ± variability`.
    stage_scale: f64,
    cooldown_end: u64,
    charges: u32,
    /// Next timed charge regen, 0 when none is pending.
    next_charge_time: u64,

    current: Option<SkillExecution>,
    buffer: VecDeque<ExecutionContext>,

    combo_table: HashMap<SkillId, Vec<ComboStep>>,

    event_callbacks: Vec<(CallbackId, EventCallback)>,
    security_callbacks: Vec<(CallbackId, SecurityCallback)>,
    next_callback_id: CallbackId,

    /// Accept times of recently seen execution ids, for replay detection.
    recent_executions: HashMap<ExecutionId, u64>,
    token_bindings: HashMap<ExecutionId, u64>,
    last_success_start: Option<u64>,

    /// Fresher actor state than the execution context, when the owner has
    /// one; used for mid-execution requirement re-checks.
    live_actor: Option<ActorSnapshot>,

    stats: SkillStats,
}

impl SkillStateMachine {
    pub fn new(def: SkillDefinition) -> Self {
        let charges = def.options.max_charges.max(1);
        Self {
            skill_id: def.id,
            name: def.name,
            timing: def.timing,
            requirements: def.requirements,
            category: def.category,
            options: SkillOptions {
                max_charges: charges,
                ..def.options
            },
            state: SkillState::Idle,
            stage_scale: 1.0,
            cooldown_end: 0,
            charges,
            next_charge_time: 0,
            current: None,
            buffer: VecDeque::new(),
            combo_table: HashMap::new(),
            event_callbacks: Vec::new(),
            security_callbacks: Vec::new(),
            next_callback_id: 1,
            recent_executions: HashMap::new(),
            token_bindings: HashMap::new(),
            last_success_start: None,
            live_actor: None,
            stats: SkillStats::default(),
        }
    }

    // ------------------------------------------------------------------
    //  Observers
    // ------------------------------------------------------------------

    pub fn skill_id(&self) -> SkillId {
        self.skill_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> SkillCategory {
        self.category
    }

    pub fn timing(&self) -> &SkillTiming {
        &self.timing
    }

    pub fn state(&self) -> SkillState {
        self.state
    }

    pub fn charges(&self) -> u32 {
        self.charges
    }

    pub fn is_on_cooldown(&self, now: u64) -> bool {
        self.state == SkillState::Cooldown && now < self.cooldown_end
    }

    pub fn remaining_cooldown(&self, now: u64) -> u64 {
        if self.state == SkillState::Cooldown {
            self.cooldown_end.saturating_sub(now)
        } else {
            0
        }
    }

    /// Milliseconds until the next timed charge, 0 when nothing is pending.
    pub fn time_to_next_charge(&self, now: u64) -> u64 {
        if self.next_charge_time == 0 || self.charges >= self.options.max_charges {
            0
        } else {
            self.next_charge_time.saturating_sub(now)
        }
    }

    pub fn current_execution(&self) -> Option<&SkillExecution> {
        self.current.as_ref()
    }

    pub fn stats(&self) -> &SkillStats {
        &self.stats
    }

    pub fn is_interruptible(&self) -> bool {
        self.options.interruptible
    }

    pub fn set_interruptible(&mut self, interruptible: bool) {
        self.options.interruptible = interruptible;
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Replace the actor snapshot used for mid-execution requirement
    /// re-checks.
    pub fn set_actor_snapshot(&mut self, actor: ActorSnapshot) {
        self.live_actor = Some(actor);
    }

    // ------------------------------------------------------------------
    //  Combos
    // ------------------------------------------------------------------

    pub fn add_combo_step(&mut self, previous_skill: SkillId, step: ComboStep) {
        self.combo_table.entry(previous_skill).or_default().push(step);
    }

    pub fn can_combo_after(&self, previous_skill: SkillId) -> bool {
        self.combo_table.contains_key(&previous_skill)
    }

    /// The bonus multiplier for executing this skill at `now`, given the
    /// previous completed skill, or `None` when no window is open.
    pub fn combo_multiplier_for(
        &self,
        previous_skill: SkillId,
        previous_end: u64,
        previous_success: bool,
        now: u64,
    ) -> Option<f32> {
        let steps = self.combo_table.get(&previous_skill)?;
        for step in steps {
            if step.requires_success && !previous_success {
                continue;
            }
            let opens = previous_end + step.window_start_ms;
            let closes = opens + step.window_duration_ms;
            if (opens..=closes).contains(&now) {
                return Some(step.damage_multiplier);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    //  Callbacks
    // ------------------------------------------------------------------

    pub fn register_event_callback(
        &mut self,
        callback: impl Fn(ExecutionId, SkillEventKind, &SkillEventData) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.event_callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn unregister_event_callback(&mut self, id: CallbackId) -> bool {
        let before = self.event_callbacks.len();
        self.event_callbacks.retain(|(cb_id, _)| *cb_id != id);
        self.event_callbacks.len() != before
    }

    pub fn register_security_callback(
        &mut self,
        callback: impl Fn(ViolationKind, &str) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.security_callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn unregister_security_callback(&mut self, id: CallbackId) -> bool {
        let before = self.security_callbacks.len();
        self.security_callbacks.retain(|(cb_id, _)| *cb_id != id);
        self.security_callbacks.len() != before
    }

    // ------------------------------------------------------------------
    //  Execution
    // ------------------------------------------------------------------

    /// Attempt an execution. `combo_multiplier` is the bonus the manager
    /// resolved from its combo tracker (1.0 when none applies).
    pub fn execute(
        &mut self,
        ctx: ExecutionContext,
        combo_multiplier: f32,
        now: u64,
    ) -> (ExecutionResult, Vec<CompletedExecution>) {
        let mut completions = Vec::new();
        self.advance(now, &mut completions);
        let result = self.execute_internal(ctx, combo_multiplier, now, &mut completions, false);
        (result, completions)
    }

    /// Drive time-based transitions up to `now`.
    pub fn update(&mut self, now: u64) -> Vec<CompletedExecution> {
        let mut completions = Vec::new();
        self.advance(now, &mut completions);
        completions
    }

    /// Attempt to interrupt the active execution.
    pub fn interrupt(
        &mut self,
        execution_id: ExecutionId,
        reason: &str,
        priority: u32,
        now: u64,
    ) -> (InterruptOutcome, Vec<CompletedExecution>) {
        let mut completions = Vec::new();
        self.advance(now, &mut completions);

        let matches = match &self.current {
            Some(exec) => exec.execution_id == execution_id,
            None => return (InterruptOutcome::None, completions),
        };
        if !matches {
            return (InterruptOutcome::None, completions);
        }

        match self.state {
            SkillState::Preparation | SkillState::Casting | SkillState::Channeling => {
                if !self.options.interruptible {
                    return (InterruptOutcome::FailedUninterruptible, completions);
                }
                if priority < self.options.min_interrupt_priority {
                    return (InterruptOutcome::FailedPriority, completions);
                }

                self.state = SkillState::Interrupted;
                if let Some(exec) = self.current.as_mut() {
                    exec.interrupted = true;
                    exec.state = SkillState::Interrupted;
                }
                self.stats.interruptions += 1;
                log::debug!(
                    "Skill {} execution {execution_id} interrupted: {reason}",
                    self.skill_id
                );
                self.fire_for_current(SkillEventKind::Interrupt);

                let exec = self.current.take().expect("interrupting without execution");
                completions.push(CompletedExecution {
                    skill_id: self.skill_id,
                    execution_id: exec.execution_id,
                    end_time: now,
                    success: false,
                    damage_multiplier: 1.0,
                });
                // The ability never fired; hand the charge back.
                self.refund_charge();
                self.state = SkillState::Idle;
                self.try_buffered(now, &mut completions);
                (InterruptOutcome::Success, completions)
            }
            _ => (InterruptOutcome::FailedState, completions),
        }
    }

    /// Attest a client-reported state for an execution. A token or state
    /// mismatch is a manipulation attempt: the active execution fails.
    pub fn report_client_state(
        &mut self,
        execution_id: ExecutionId,
        token: u64,
        claimed_state: SkillState,
        now: u64,
    ) -> bool {
        let bound = self.token_bindings.get(&execution_id).copied();
        let token_ok = bound == Some(token);
        let state_ok = match &self.current {
            Some(exec) if exec.execution_id == execution_id => claimed_state == self.state,
            _ => claimed_state == SkillState::Idle,
        };
        if token_ok && state_ok {
            return true;
        }

        self.stats.security_violations += 1;
        self.report_violation(
            ViolationKind::StateManipulation,
            &format!("execution {execution_id}: client attested {claimed_state:?}"),
        );
        let active = matches!(&self.current, Some(exec) if exec.execution_id == execution_id);
        if active {
            let mut completions = Vec::new();
            self.fail_active(now, &mut completions, "state attestation mismatch");
            self.advance(now, &mut completions);
        }
        false
    }

    fn execute_internal(
        &mut self,
        ctx: ExecutionContext,
        combo_multiplier: f32,
        now: u64,
        completions: &mut Vec<CompletedExecution>,
        is_retry: bool,
    ) -> ExecutionResult {
        let id = ctx.execution_id;
        self.stats.total_executions += 1;

        // Attestation gates run before anything can change state.
        let drift = now.abs_diff(ctx.client_timestamp_ms);
        if drift > self.options.timestamp_drift_ms {
            self.stats.security_violations += 1;
            self.report_violation(
                ViolationKind::TimingAnomaly,
                &format!("execution {id}: client timestamp drift {drift} ms"),
            );
            return ExecutionResult::failed(ExecutionOutcome::FailedSecurity, id);
        }
        if let Some(seen_at) = self.recent_executions.get(&id) {
            if now.saturating_sub(*seen_at) < self.options.replay_window_ms {
                self.stats.security_violations += 1;
                self.report_violation(
                    ViolationKind::TokenMismatch,
                    &format!("execution id {id} replayed"),
                );
                return ExecutionResult::failed(ExecutionOutcome::FailedSecurity, id);
            }
        }

        match self.state {
            SkillState::Preparation
            | SkillState::Casting
            | SkillState::Channeling
            | SkillState::Recovery => {
                if is_retry {
                    return ExecutionResult::failed(ExecutionOutcome::FailedState, id);
                }
                // Busy: park the request for the next legal transition.
                if self.buffer.len() >= self.options.execution_buffer_size {
                    self.buffer.pop_front();
                    self.stats.buffer_overflows += 1;
                }
                self.buffer.push_back(ctx);
                return ExecutionResult {
                    outcome: ExecutionOutcome::Buffered,
                    execution_id: id,
                    damage_multiplier: 1.0,
                };
            }
            SkillState::Cooldown => {
                return ExecutionResult::failed(ExecutionOutcome::FailedCooldown, id);
            }
            SkillState::Interrupted | SkillState::Failed => {
                return ExecutionResult::failed(ExecutionOutcome::FailedState, id);
            }
            SkillState::Idle => {}
        }

        if self.charges == 0 {
            return ExecutionResult::failed(ExecutionOutcome::FailedNoCharges, id);
        }
        if !self.requirements.satisfied_by(&ctx.actor) {
            return ExecutionResult::failed(ExecutionOutcome::FailedRequirements, id);
        }

        // Cooldown bypass guard. The state gate above makes this
        // unreachable through normal flow; it catches manipulated state.
        // The anomaly threshold leaves headroom for clock skew.
        if self.timing.cooldown_ms > 0 {
            if let Some(last) = self.last_success_start {
                let gap = now.saturating_sub(last);
                if (gap as f32) < self.timing.cooldown_ms as f32 * self.options.anomaly_threshold {
                    self.stats.security_violations += 1;
                    self.report_violation(
                        ViolationKind::RapidExecution,
                        &format!("execution {id}: {gap} ms since last, cooldown is {} ms", self.timing.cooldown_ms),
                    );
                    return ExecutionResult::failed(ExecutionOutcome::FailedSecurity, id);
                }
            }
        }

        self.consume_charge(now);
        self.recent_executions.insert(id, now);
        self.token_bindings.insert(id, ctx.security_token);
        self.prune_recent(now);
        self.last_success_start = Some(now);
        self.stage_scale = self.sample_stage_scale();
        if is_retry {
            self.stats.buffered_retries += 1;
        }

        self.current = Some(SkillExecution {
            execution_id: id,
            state: SkillState::Preparation,
            start_time: now,
            state_start_time: now,
            interrupted: false,
            progress_percent: 0,
            damage_multiplier: combo_multiplier,
            completed: false,
            retry_count: u32::from(is_retry),
            context: ctx,
        });
        self.state = SkillState::Preparation;
        self.fire_for_current(SkillEventKind::Execute);
        if combo_multiplier > 1.0 {
            self.fire_for_current(SkillEventKind::Chaining);
        }

        self.advance(now, completions);
        ExecutionResult::success(id, combo_multiplier)
    }

    // ------------------------------------------------------------------
    //  Internal transitions
    // ------------------------------------------------------------------

    fn advance(&mut self, now: u64, completions: &mut Vec<CompletedExecution>) {
        self.regen_charges(now);
        loop {
            match self.state {
                SkillState::Idle => break,
                SkillState::Cooldown => {
                    if now < self.cooldown_end {
                        break;
                    }
                    let ended_at = self.cooldown_end;
                    self.state = SkillState::Idle;
                    self.fire_plain(SkillEventKind::CooldownEnd);
                    if self.options.charge_restore_ms == 0 {
                        self.restore_charge();
                    }
                    log::trace!("Skill {} cooldown ended at {ended_at}", self.skill_id);
                    self.try_buffered(now, completions);
                }
                SkillState::Interrupted | SkillState::Failed => {
                    self.state = SkillState::Idle;
                    self.try_buffered(now, completions);
                }
                SkillState::Preparation
                | SkillState::Casting
                | SkillState::Channeling
                | SkillState::Recovery => {
                    if !self.requirements_hold() {
                        self.fail_active(now, completions, "requirements lost mid-execution");
                        continue;
                    }
                    let stage = self.state;
                    let eff = self.effective_stage_ms(stage);
                    let state_start = self
                        .current
                        .as_ref()
                        .map(|e| e.state_start_time)
                        .expect("active stage without execution");
                    let boundary = state_start + eff;
                    if now < boundary {
                        self.update_progress(now);
                        break;
                    }
                    match stage {
                        SkillState::Preparation => {
                            let next = if self.timing.channel_duration_ms > 0 {
                                SkillState::Channeling
                            } else {
                                SkillState::Casting
                            };
                            self.enter_stage(next, boundary);
                            self.fire_for_current(SkillEventKind::FinishPrep);
                        }
                        SkillState::Casting | SkillState::Channeling => {
                            self.enter_stage(SkillState::Recovery, boundary);
                            self.fire_for_current(SkillEventKind::FinishCast);
                        }
                        SkillState::Recovery => {
                            self.complete_active(boundary, now, completions);
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    }

    fn enter_stage(&mut self, stage: SkillState, at: u64) {
        self.state = stage;
        if let Some(exec) = self.current.as_mut() {
            exec.state = stage;
            exec.state_start_time = at;
        }
    }

    fn complete_active(&mut self, boundary: u64, now: u64, completions: &mut Vec<CompletedExecution>) {
        self.fire_for_current(SkillEventKind::FinishRecovery);
        let exec = self.current.take().expect("completing without execution");
        self.stats.successful_executions += 1;
        completions.push(CompletedExecution {
            skill_id: self.skill_id,
            execution_id: exec.execution_id,
            end_time: boundary,
            success: true,
            damage_multiplier: exec.damage_multiplier,
        });

        if self.timing.cooldown_ms > 0 {
            self.state = SkillState::Cooldown;
            self.cooldown_end = boundary + self.timing.cooldown_ms;
        } else {
            self.state = SkillState::Idle;
            if self.options.charge_restore_ms == 0 {
                self.restore_charge();
            }
            self.try_buffered(now, completions);
        }
    }

    fn fail_active(&mut self, now: u64, completions: &mut Vec<CompletedExecution>, reason: &str) {
        self.fire_for_current(SkillEventKind::Error);
        let exec = self.current.take().expect("failing without execution");
        self.stats.failed_executions += 1;
        log::debug!(
            "Skill {} execution {} failed: {reason}",
            self.skill_id,
            exec.execution_id
        );
        completions.push(CompletedExecution {
            skill_id: self.skill_id,
            execution_id: exec.execution_id,
            end_time: now,
            success: false,
            damage_multiplier: 1.0,
        });
        self.refund_charge();
        self.state = SkillState::Failed;
    }

    fn try_buffered(&mut self, now: u64, completions: &mut Vec<CompletedExecution>) {
        while self.state == SkillState::Idle {
            let Some(ctx) = self.buffer.pop_front() else {
                return;
            };
            let result = self.execute_internal(ctx, 1.0, now, completions, true);
            if result.is_success() {
                return;
            }
        }
    }

    fn consume_charge(&mut self, now: u64) {
        self.charges = self.charges.saturating_sub(1);
        if self.options.charge_restore_ms > 0 && self.next_charge_time == 0 {
            self.next_charge_time = now + self.options.charge_restore_ms;
        }
    }

    fn regen_charges(&mut self, now: u64) {
        if self.options.charge_restore_ms == 0 {
            return;
        }
        while self.next_charge_time != 0
            && now >= self.next_charge_time
            && self.charges < self.options.max_charges
        {
            self.charges += 1;
            self.fire_plain(SkillEventKind::ChargeGained);
            self.next_charge_time = if self.charges < self.options.max_charges {
                self.next_charge_time + self.options.charge_restore_ms
            } else {
                0
            };
        }
        if self.charges >= self.options.max_charges {
            self.next_charge_time = 0;
        }
    }

    /// Cooldown-coupled restore, used when no timed regen is configured.
    fn restore_charge(&mut self) {
        if self.charges < self.options.max_charges {
            self.charges += 1;
            self.fire_plain(SkillEventKind::ChargeGained);
        }
    }

    /// Give back the charge of an execution that never fired.
    fn refund_charge(&mut self) {
        if self.charges < self.options.max_charges {
            self.charges += 1;
        }
    }

    fn requirements_hold(&self) -> bool {
        let Some(exec) = &self.current else {
            return true;
        };
        let actor = self.live_actor.as_ref().unwrap_or(&exec.context.actor);
        self.requirements.satisfied_by(actor)
    }

    fn effective_stage_ms(&self, stage: SkillState) -> u64 {
        let nominal = match stage {
            SkillState::Preparation => self.timing.preparation_ms,
            SkillState::Casting => self.timing.casting_ms,
            SkillState::Channeling => self.timing.channel_duration_ms,
            SkillState::Recovery => self.timing.recovery_ms,
            _ => 0,
        };
        (nominal as f64 * self.stage_scale) as u64
    }

    fn sample_stage_scale(&self) -> f64 {
        if self.timing.variability <= 0.0 {
            return 1.0;
        }
        let u: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        (1.0 + self.timing.variability as f64 * u).max(0.0)
    }

    fn update_progress(&mut self, now: u64) {
        let (start, old_pct) = match &self.current {
            Some(exec) => (exec.start_time, exec.progress_percent),
            None => return,
        };
        let active = if self.timing.channel_duration_ms > 0 {
            self.timing.channel_duration_ms
        } else {
            self.timing.casting_ms
        };
        let total = ((self.timing.preparation_ms + active + self.timing.recovery_ms) as f64
            * self.stage_scale) as u64;
        if total == 0 {
            return;
        }
        let elapsed = now.saturating_sub(start).min(total);
        let pct = (elapsed * 100 / total) as u32;
        if let Some(exec) = self.current.as_mut() {
            exec.progress_percent = pct;
        }
        if pct / 25 != old_pct / 25 {
            self.fire_for_current(SkillEventKind::Progress);
        }
    }

    fn prune_recent(&mut self, now: u64) {
        if self.recent_executions.len() <= RECENT_EXECUTIONS_CAP {
            return;
        }
        let window = self.options.replay_window_ms;
        self.recent_executions
            .retain(|_, seen| now.saturating_sub(*seen) < window);
        let recent = &self.recent_executions;
        self.token_bindings.retain(|id, _| recent.contains_key(id));
    }

    // ------------------------------------------------------------------
    //  Callback plumbing
    // ------------------------------------------------------------------

    fn fire_for_current(&mut self, kind: SkillEventKind) {
        let (id, data) = match &self.current {
            Some(exec) => (
                exec.execution_id,
                SkillEventData {
                    skill_id: self.skill_id,
                    state: self.state,
                    progress_percent: exec.progress_percent,
                },
            ),
            None => (
                0,
                SkillEventData {
                    skill_id: self.skill_id,
                    state: self.state,
                    progress_percent: 0,
                },
            ),
        };
        self.fire_event(id, kind, data);
    }

    fn fire_plain(&mut self, kind: SkillEventKind) {
        let data = SkillEventData {
            skill_id: self.skill_id,
            state: self.state,
            progress_percent: 0,
        };
        self.fire_event(0, kind, data);
    }

    fn fire_event(&mut self, execution_id: ExecutionId, kind: SkillEventKind, data: SkillEventData) {
        let mut panics = 0u64;
        for (_, callback) in &self.event_callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(execution_id, kind, &data))).is_err() {
                panics += 1;
            }
        }
        if panics > 0 {
            self.stats.callback_panics += panics;
            log::error!("Skill {} event callback panicked on {kind:?}", self.skill_id);
        }
    }

    fn report_violation(&mut self, kind: ViolationKind, detail: &str) {
        let mut panics = 0u64;
        for (_, callback) in &self.security_callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(kind, detail))).is_err() {
                panics += 1;
            }
        }
        if panics > 0 {
            self.stats.callback_panics += panics;
            log::error!("Skill {} security callback panicked", self.skill_id);
        }
    }
}
