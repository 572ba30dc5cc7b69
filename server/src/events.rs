//! Typed event payloads for the event bus.
//!
//! The bus dispatches a closed tagged union rather than type-erased
//! payloads: a subscription binds one [`EventKind`] and handlers match on
//! the variant, so a mis-cast is a compile error instead of a runtime one.

use wyd_core::types::Position;

/// Discriminant used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlayerConnected,
    PlayerDisconnected,
    Damage,
    SkillCast,
    SkillInterrupted,
    AffectExpired,
    ItemDropped,
    ChatMessage,
    RegistryReloaded,
    SecurityAlert,
    ServerTick,
}

/// Every event the runtime publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    PlayerConnected {
        client_id: u32,
    },
    PlayerDisconnected {
        client_id: u32,
        reason: u16,
    },
    Damage {
        attacker: u32,
        target: u32,
        amount: i32,
    },
    SkillCast {
        actor: u32,
        skill_id: u16,
        execution_id: u64,
    },
    SkillInterrupted {
        actor: u32,
        skill_id: u16,
        execution_id: u64,
    },
    AffectExpired {
        actor: u32,
        affect_kind: u8,
    },
    ItemDropped {
        dropper: u32,
        item_index: i16,
        position: Position,
    },
    ChatMessage {
        sender: u32,
        channel: u8,
        text: String,
    },
    RegistryReloaded {
        generation: u64,
    },
    SecurityAlert {
        client_id: u32,
        severity: u8,
    },
    ServerTick {
        tick: u64,
    },
}

impl GameEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GameEvent::PlayerConnected { .. } => EventKind::PlayerConnected,
            GameEvent::PlayerDisconnected { .. } => EventKind::PlayerDisconnected,
            GameEvent::Damage { .. } => EventKind::Damage,
            GameEvent::SkillCast { .. } => EventKind::SkillCast,
            GameEvent::SkillInterrupted { .. } => EventKind::SkillInterrupted,
            GameEvent::AffectExpired { .. } => EventKind::AffectExpired,
            GameEvent::ItemDropped { .. } => EventKind::ItemDropped,
            GameEvent::ChatMessage { .. } => EventKind::ChatMessage,
            GameEvent::RegistryReloaded { .. } => EventKind::RegistryReloaded,
            GameEvent::SecurityAlert { .. } => EventKind::SecurityAlert,
            GameEvent::ServerTick { .. } => EventKind::ServerTick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let e = GameEvent::Damage {
            attacker: 1,
            target: 2,
            amount: 30,
        };
        assert_eq!(e.kind(), EventKind::Damage);

        let e = GameEvent::ServerTick { tick: 9 };
        assert_eq!(e.kind(), EventKind::ServerTick);
    }
}
