//! Skill execution engine.
//!
//! Layered per actor: [`engine::SkillEngine`] shards actors across
//! independent mutexes, each guarding a [`manager::SkillManager`] that owns
//! one [`machine::SkillStateMachine`] per learned skill.

pub mod engine;
pub mod machine;
pub mod manager;
pub mod types;

pub use engine::{EngineStats, SkillEngine};
pub use machine::SkillStateMachine;
pub use manager::{CategoryId, ManagerStats, SkillManager};
pub use types::*;
