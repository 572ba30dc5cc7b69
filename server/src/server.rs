//! The server aggregate.
//!
//! Owns every core component and fixes the bring-up order: data registry,
//! event bus, game timer, violation sink, skill engine — leaves first.
//! Teardown runs in reverse. Reconnection controllers are created per
//! client as connections arrive.
//!
//! Cross-component calls never hold two component locks; the ordering
//! `registry < bus < timers < reconnection < skill-engine` is the rule for
//! any call path that must touch several components in sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, MonotonicClock};
use crate::config::ServerConfig;
use crate::event_bus::EventBus;
use crate::events::GameEvent;
use crate::game_timer::GameTimer;
use crate::reconnection::{ReconnectTransport, ReconnectionController};
use crate::registry::DataRegistry;
use crate::item_effects;
use crate::skill::{ActorId, ExecutionContext, ExecutionResult, SkillEngine, SkillId};
use crate::violation::ViolationSink;
use wyd_core::codec::{Serializer, WireError};
use wyd_core::constants::AFFECT_SIZE;
use wyd_core::types::{Affect, Item, Mob};

/// Target tick rate, matching the legacy server's 36 TPS.
pub const TICK_MS: u64 = 28;

const VIOLATION_LOG_CAPACITY: usize = 256;
const VIOLATION_DEDUP_WINDOW_MS: u64 = 5000;

pub struct Server {
    config: ServerConfig,
    registry: Arc<DataRegistry>,
    codec: Arc<Serializer>,
    bus: Arc<EventBus>,
    timer: Arc<GameTimer>,
    sink: Arc<ViolationSink>,
    skills: Arc<SkillEngine>,
    clients: Mutex<HashMap<u32, Arc<ReconnectionController>>>,
    tick: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(DataRegistry::new());
        let codec = Arc::new(Serializer::default());
        let bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let timer = Arc::new(GameTimer::new(config.timer.clone()));
        let sink = Arc::new(ViolationSink::new(
            VIOLATION_LOG_CAPACITY,
            VIOLATION_DEDUP_WINDOW_MS,
        ));
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let skills = Arc::new(SkillEngine::new(
            config.skill_engine.clone(),
            clock,
            sink.clone(),
        ));

        Self {
            config,
            registry,
            codec,
            bus,
            timer,
            sink,
            skills,
            clients: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    /// Load (or reload) game data from the configured directory, when one
    /// is set.
    pub fn load_data(&self) -> anyhow::Result<()> {
        if let Some(dir) = &self.config.data_dir {
            let generation = self.registry.reload_from_dir(std::path::Path::new(dir))?;
            let _ = self
                .bus
                .publish(GameEvent::RegistryReloaded { generation });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Component access
    // ------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<DataRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &Arc<Serializer> {
        &self.codec
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn timer(&self) -> &Arc<GameTimer> {
        &self.timer
    }

    pub fn violations(&self) -> &Arc<ViolationSink> {
        &self.sink
    }

    pub fn skills(&self) -> &Arc<SkillEngine> {
        &self.skills
    }

    // ------------------------------------------------------------------
    //  Clients
    // ------------------------------------------------------------------

    /// Create the reconnection controller for a newly connected client.
    /// One controller per client; reconnecting an existing id replaces the
    /// old controller after shutting it down.
    pub fn add_client(
        &self,
        client_id: u32,
        transport: Box<dyn ReconnectTransport>,
    ) -> Arc<ReconnectionController> {
        let controller = Arc::new(ReconnectionController::new(
            self.config.reconnection.clone(),
            transport,
        ));
        let previous = self
            .clients
            .lock()
            .unwrap()
            .insert(client_id, controller.clone());
        if let Some(previous) = previous {
            previous.shutdown();
        }
        let _ = self.bus.publish(GameEvent::PlayerConnected { client_id });
        controller
    }

    pub fn client(&self, client_id: u32) -> Option<Arc<ReconnectionController>> {
        self.clients.lock().unwrap().get(&client_id).cloned()
    }

    pub fn remove_client(&self, client_id: u32, reason: u16) -> bool {
        let removed = self.clients.lock().unwrap().remove(&client_id);
        match removed {
            Some(controller) => {
                controller.shutdown();
                let _ = self
                    .bus
                    .publish(GameEvent::PlayerDisconnected { client_id, reason });
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    // ------------------------------------------------------------------
    //  Gameplay entry points
    // ------------------------------------------------------------------

    /// Execute a skill for an actor and announce the result on the bus.
    /// The engine's actor lock is released before any other component is
    /// touched, keeping the one-lock-at-a-time rule.
    pub fn execute_skill(
        &self,
        actor: ActorId,
        skill_id: SkillId,
        ctx: ExecutionContext,
    ) -> ExecutionResult {
        let execution_id = ctx.execution_id;
        let result = self.skills.execute(actor, skill_id, ctx);
        if result.is_success() {
            let _ = self.bus.publish(GameEvent::SkillCast {
                actor,
                skill_id,
                execution_id,
            });
        }
        result
    }

    /// Encode an affect record announcing a skill's status effect, ready
    /// for the I/O layer to broadcast to clients.
    pub fn encode_affect_update(&self, affect: &Affect) -> Result<Vec<u8>, WireError> {
        let mut buf = vec![0u8; AFFECT_SIZE];
        let mut offset = 0;
        self.codec.serialize_affect(affect, &mut buf, &mut offset)?;
        Ok(buf)
    }

    /// Move an inventory item into an equipment slot, applying its
    /// wearable effects and refreshing the skill engine's view of the
    /// actor. Refuses empty sources, occupied slots, and items whose
    /// requirement effects the mob fails.
    pub fn equip_item(
        &self,
        actor: ActorId,
        mob: &mut Mob,
        carry_slot: usize,
        equip_slot: usize,
    ) -> bool {
        if carry_slot >= mob.carry.len() || equip_slot >= mob.equip.len() {
            return false;
        }
        let item = mob.carry[carry_slot];
        if item.is_empty() || !mob.equip[equip_slot].is_empty() {
            return false;
        }
        if !item_effects::meets_requirements(mob, &item) {
            log::debug!("Actor {actor} fails requirements for item {}", item.index);
            return false;
        }
        mob.carry[carry_slot] = Item::empty();
        mob.equip[equip_slot] = item;
        item_effects::apply_equip_effects(mob, &item, true);
        self.skills.update_actor_mob(actor, mob);
        true
    }

    /// Reverse of [`Self::equip_item`]: revert the item's effects and return it
    /// to the first free inventory slot. Fails when the inventory is
    /// full.
    pub fn unequip_item(&self, actor: ActorId, mob: &mut Mob, equip_slot: usize) -> bool {
        if equip_slot >= mob.equip.len() {
            return false;
        }
        let item = mob.equip[equip_slot];
        if item.is_empty() {
            return false;
        }
        let Some(free_slot) = mob.carry.iter().position(|slot| slot.is_empty()) else {
            return false;
        };
        item_effects::apply_equip_effects(mob, &item, false);
        mob.equip[equip_slot] = Item::empty();
        mob.carry[free_slot] = item;
        self.skills.update_actor_mob(actor, mob);
        true
    }

    // ------------------------------------------------------------------
    //  Main loop
    // ------------------------------------------------------------------

    /// One frame: drive the skill engine and publish the tick event.
    pub fn tick(&self) {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        self.skills.update();
        if let Err(e) = self.bus.publish(GameEvent::ServerTick { tick }) {
            log::debug!("Tick event dropped: {e}");
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Tear everything down in reverse bring-up order. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        log::info!("Server shutting down...");
        let clients: Vec<Arc<ReconnectionController>> =
            self.clients.lock().unwrap().drain().map(|(_, c)| c).collect();
        for controller in clients {
            controller.shutdown();
        }
        self.timer.shutdown();
        self.bus.shutdown();
        log::info!("Server shutdown complete.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::reconnection::PersistentSession;
    use crate::skill::SkillDefinition;
    use std::sync::Mutex as StdMutex;

    struct NullTransport;

    impl ReconnectTransport for NullTransport {
        fn attempt(
            &mut self,
            _session: &PersistentSession,
            _attempt: u32,
        ) -> Result<(), (i32, String)> {
            Err((111, "refused".to_string()))
        }

        fn ping(&mut self) -> Result<u64, (i32, String)> {
            Ok(5)
        }
    }

    fn test_server() -> Server {
        let mut config = ServerConfig::default();
        config.event_bus.use_async_dispatch = false;
        Server::new(config)
    }

    #[test]
    fn components_come_up_and_shut_down() {
        let server = test_server();
        assert_eq!(server.tick_count(), 0);
        server.tick();
        assert_eq!(server.tick_count(), 1);
        server.shutdown();
        server.shutdown(); // second call is a no-op
    }

    #[test]
    fn tick_publishes_server_tick_events() {
        let server = test_server();
        let ticks = Arc::new(StdMutex::new(Vec::new()));
        let t = ticks.clone();
        server.bus().subscribe(EventKind::ServerTick, 0, move |e| {
            if let GameEvent::ServerTick { tick } = e {
                t.lock().unwrap().push(*tick);
            }
        });
        server.tick();
        server.tick();
        assert_eq!(*ticks.lock().unwrap(), vec![1, 2]);
        server.shutdown();
    }

    #[test]
    fn clients_are_tracked_and_replaced() {
        let server = test_server();
        let events = Arc::new(StdMutex::new(0));
        let e = events.clone();
        server
            .bus()
            .subscribe(EventKind::PlayerConnected, 0, move |_| {
                *e.lock().unwrap() += 1;
            });

        let controller = server.add_client(5, Box::new(NullTransport));
        controller.setup_session("s", "t", "localhost", 8281);
        assert_eq!(server.client_count(), 1);
        assert!(server.client(5).is_some());
        assert!(server.client(6).is_none());

        // Re-adding replaces the controller.
        server.add_client(5, Box::new(NullTransport));
        assert_eq!(server.client_count(), 1);
        assert_eq!(*events.lock().unwrap(), 2);

        assert!(server.remove_client(5, 0));
        assert!(!server.remove_client(5, 0));
        assert_eq!(server.client_count(), 0);
        server.shutdown();
    }

    /// Registry skills hydrate the engine: end-to-end wiring smoke test.
    #[test]
    fn registry_definitions_drive_the_skill_engine() {
        let server = test_server();
        let mut tables = crate::registry::Tables::default();
        tables.skills.insert(
            1,
            crate::registry::SkillDef {
                id: 1,
                name: "Thrust".to_string(),
                category: crate::skill::SkillCategory::Melee,
                timing: crate::skill::SkillTiming {
                    cooldown_ms: 500,
                    ..crate::skill::SkillTiming::default()
                },
                requirements: Default::default(),
                interruptible: true,
                max_charges: 1,
                charge_restore_ms: 0,
            },
        );
        server.registry().reload(tables);

        let snapshot = server.registry().snapshot();
        let def: SkillDefinition = snapshot.skills[&1].to_definition();
        assert!(server.skills().register_skill(10, def));

        let now = server.skills().now_ms();
        let result = server.skills().execute(
            10,
            1,
            crate::skill::ExecutionContext::simple(1, now, Default::default()),
        );
        assert!(result.is_success());
        server.shutdown();
    }

    /// A successful skill execution through the server announces itself
    /// on the event bus; a failed one stays quiet.
    #[test]
    fn execute_skill_publishes_skill_cast_events() {
        let server = test_server();
        server
            .skills()
            .register_skill(3, SkillDefinition::instant(7, "Lunge", 1000));

        let casts = Arc::new(StdMutex::new(Vec::new()));
        let c = casts.clone();
        server.bus().subscribe(EventKind::SkillCast, 0, move |e| {
            if let GameEvent::SkillCast {
                actor,
                skill_id,
                execution_id,
            } = e
            {
                c.lock().unwrap().push((*actor, *skill_id, *execution_id));
            }
        });

        let now = server.skills().now_ms();
        let result = server.execute_skill(
            3,
            7,
            crate::skill::ExecutionContext::simple(1, now, Default::default()),
        );
        assert!(result.is_success());

        // Second cast sits inside the cooldown: no event.
        let now = server.skills().now_ms();
        let result = server.execute_skill(
            3,
            7,
            crate::skill::ExecutionContext::simple(2, now, Default::default()),
        );
        assert!(!result.is_success());

        assert_eq!(*casts.lock().unwrap(), vec![(3, 7, 1)]);
        server.shutdown();
    }

    /// Equipping applies the item's wearable effects to the mob and the
    /// skill engine's requirement checks see the refreshed actor view;
    /// unequipping mid-cast costs the execution its required item.
    #[test]
    fn equip_path_feeds_the_skill_engine() {
        use crate::item_effects::{add_effect, ItemEffectKind};
        use crate::skill::{ActorSnapshot, SkillState};

        let server = test_server();
        let mut def = SkillDefinition::instant(2, "Piercing Shot", 0);
        def.timing.casting_ms = 60_000;
        def.requirements.items = vec![1024];
        server.skills().register_skill(4, def);

        let mut mob = Mob::default();
        mob.set_name("Ranger");
        mob.level = 50;
        mob.hp = 500;
        mob.max_hp = 500;
        mob.mp = 100;
        mob.max_mp = 100;
        mob.strength = 60;
        mob.carry[0] = Item::new(1024);
        assert!(add_effect(&mut mob.carry[0], ItemEffectKind::Damage, 12));

        let base_damage = mob.damage;
        assert!(server.equip_item(4, &mut mob, 0, 0));
        assert_eq!(mob.damage, base_damage + 12);
        assert!(mob.carry[0].is_empty());
        assert_eq!(mob.equip[0].index, 1024);

        let now = server.skills().now_ms();
        let result = server.execute_skill(
            4,
            2,
            ExecutionContext::simple(1, now, ActorSnapshot::from_mob(&mob)),
        );
        assert!(result.is_success());

        // Taking the bow off mid-cast returns it to the pack: the cast
        // keeps its requirement and continues.
        assert!(server.unequip_item(4, &mut mob, 0));
        assert_eq!(mob.damage, base_damage);
        assert_eq!(mob.carry[0].index, 1024);
        server.skills().update();
        assert_eq!(server.skills().skill_state(4, 2), Some(SkillState::Casting));

        // Losing the bow entirely is what kills the shot.
        mob.carry[0] = Item::empty();
        server.skills().update_actor_mob(4, &mob);
        server.skills().update();
        assert_eq!(server.skills().skill_state(4, 2), Some(SkillState::Idle));
        server.shutdown();
    }

    #[test]
    fn equip_refuses_unmet_requirements_and_occupied_slots() {
        use crate::item_effects::{add_effect, ItemEffectKind};

        let server = test_server();
        let mut mob = Mob::default();
        mob.strength = 40;
        mob.carry[0] = Item::new(900);
        assert!(add_effect(&mut mob.carry[0], ItemEffectKind::RequiredStr, 50));

        // Too weak for the item.
        assert!(!server.equip_item(7, &mut mob, 0, 0));
        assert_eq!(mob.carry[0].index, 900);

        mob.strength = 50;
        assert!(server.equip_item(7, &mut mob, 0, 0));

        // Slot already taken.
        mob.carry[1] = Item::new(901);
        assert!(!server.equip_item(7, &mut mob, 1, 0));
        // Empty source slot.
        assert!(!server.equip_item(7, &mut mob, 2, 1));
        // Unequipping an empty slot is a no-op.
        assert!(!server.unequip_item(7, &mut mob, 5));
        server.shutdown();
    }

    #[test]
    fn affect_updates_encode_to_the_wire_size() {
        let server = test_server();
        let affect = wyd_core::types::Affect::new(12, 30, 2, 900);
        let bytes = server.encode_affect_update(&affect).unwrap();
        assert_eq!(bytes.len(), AFFECT_SIZE);

        let mut offset = 0;
        let decoded = server.codec().deserialize_affect(&bytes, &mut offset).unwrap();
        assert_eq!(decoded, affect);
        server.shutdown();
    }
}
