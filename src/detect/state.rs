use super::VerdictState;

/// What the detector saw for a target on one evaluated tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Window not yet at minimum fill.
    Insufficient,
    Sample { anomalous: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Insufficient,
    Normal,
    Suspected { streak: u32 },
    Alerting,
    Cooldown { elapsed: u32 },
}

/// Debounce/cooldown state machine for a single target.
///
/// ```text
/// Insufficient -> Normal -> Suspected -> Alerting -> Cooldown -> Alerting | Normal
///                    ^          |
///                    +----------+  (clears before debounce)
/// ```
///
/// `step` returns `true` exactly on the ticks where an alert must be emitted.
#[derive(Debug, Clone)]
pub struct StateMachine {
    phase: Phase,
    debounce: u32,
    cooldown: u32,
}

impl StateMachine {
    pub fn new(debounce: u32, cooldown: u32) -> Self {
        Self {
            phase: Phase::Insufficient,
            debounce: debounce.max(1),
            cooldown,
        }
    }

    pub fn state(&self) -> VerdictState {
        match self.phase {
            Phase::Insufficient => VerdictState::Insufficient,
            Phase::Normal => VerdictState::Normal,
            Phase::Suspected { .. } => VerdictState::Suspected,
            Phase::Alerting => VerdictState::Alerting,
            Phase::Cooldown { .. } => VerdictState::Cooldown,
        }
    }

    pub fn step(&mut self, obs: Observation) -> (VerdictState, bool) {
        let anomalous = match obs {
            // The window never shrinks, so this only happens before the
            // first ready tick. Hold whatever state we are in.
            Observation::Insufficient => return (self.state(), false),
            Observation::Sample { anomalous } => anomalous,
        };

        let (next, alert) = match self.phase {
            Phase::Insufficient | Phase::Normal => self.from_normal(anomalous),
            Phase::Suspected { streak } => {
                if !anomalous {
                    (Phase::Normal, false)
                } else if streak + 1 >= self.debounce {
                    (Phase::Alerting, true)
                } else {
                    (Phase::Suspected { streak: streak + 1 }, false)
                }
            }
            Phase::Alerting => {
                if self.cooldown == 0 {
                    Self::after_cooldown(anomalous)
                } else {
                    (Phase::Cooldown { elapsed: 1 }, false)
                }
            }
            Phase::Cooldown { elapsed } => {
                if elapsed < self.cooldown {
                    (Phase::Cooldown { elapsed: elapsed + 1 }, false)
                } else {
                    Self::after_cooldown(anomalous)
                }
            }
        };

        self.phase = next;
        (self.state(), alert)
    }

    fn from_normal(&self, anomalous: bool) -> (Phase, bool) {
        if !anomalous {
            (Phase::Normal, false)
        } else if self.debounce <= 1 {
            (Phase::Alerting, true)
        } else {
            (Phase::Suspected { streak: 1 }, false)
        }
    }

    fn after_cooldown(anomalous: bool) -> (Phase, bool) {
        if anomalous {
            (Phase::Alerting, true)
        } else {
            (Phase::Normal, false)
        }
    }
}
