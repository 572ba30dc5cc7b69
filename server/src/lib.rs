/// Server runtime library — the subsystems the game binary is built from.
///
/// The crate is primarily consumed by the `wyd-server` binary, but every
/// subsystem is exposed here so embeddings (tools, simulators, tests) can
/// assemble their own runtime from the same parts.
///
/// Component bring-up order is leaves first: registry, event bus, game
/// timer, reconnection, skill engine. When a call path needs more than one
/// component it must never hold two component locks at once; the documented
/// lock order is `registry < bus < timers < reconnection < skill-engine`.

/// Monotonic millisecond clocks, including the manual clock used to drive
/// deterministic gameplay tests.
pub mod clock;

/// Runtime configuration for every subsystem, with `.env` overrides.
pub mod config;

/// Typed event definitions for the event bus.
pub mod events;

/// Typed publish/subscribe bus with sync, delayed and periodic dispatch.
pub mod event_bus;

/// One-shot and periodic timers plus the scaled, pausable game clock.
pub mod game_timer;

/// Equip/unequip arithmetic for item effect pairs.
pub mod item_effects;

/// Per-client session persistence and backoff-driven reconnection.
pub mod reconnection;

/// Immutable, reload-capable game-data tables.
pub mod registry;

/// The aggregate that owns all components and tears them down in order.
pub mod server;

/// Per-actor skill state machines: cooldowns, charges, combos, interrupts.
pub mod skill;

/// Cheat-report routing and response actions.
pub mod violation;
