use serde::{Deserialize, Serialize};

/// A timed status effect on an actor. `time` counts down in game ticks;
/// zero in slot kind means the slot is unused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Affect {
    pub kind: u8,
    pub value: u8,
    pub level: u8,
    pub time: i16,
}

impl Affect {
    pub fn new(kind: u8, value: u8, level: u8, time: i16) -> Self {
        Self {
            kind,
            value,
            level,
            time,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Affect;

    #[test]
    fn default_affect_is_empty() {
        assert!(Affect::default().is_empty());
    }

    #[test]
    fn constructed_affect_keeps_fields() {
        let a = Affect::new(7, 20, 3, 600);
        assert_eq!(a.kind, 7);
        assert_eq!(a.value, 20);
        assert_eq!(a.level, 3);
        assert_eq!(a.time, 600);
        assert!(!a.is_empty());
    }
}
