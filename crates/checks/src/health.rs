//! Rise/fall health automaton.

use crate::status::{CheckStatus, ChkResult};
use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What drove a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeCause {
    HealthCheck,
    AgentCheck,
    HealthAnalysis,
    Administrative,
}

/// Side effect requested when a server is marked down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMarkedDown {
    #[default]
    None,
    /// Ask the routing layer to shut down established sessions.
    ShutdownSessions,
}

/// Side effect requested when a server is marked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMarkedUp {
    #[default]
    None,
    /// Ask the routing layer to shut down sessions on backup servers.
    ShutdownBackupSessions,
}

/// Availability transition raised by the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
}

/// Event delivered to the routing collaborator on a transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    pub server: String,
    pub proxy: String,
    pub up: bool,
    pub cause: StateChangeCause,
    pub result: ChkResult,
    pub status: CheckStatus,
    pub description: String,
    /// Duration of the run that triggered the transition, if any.
    pub duration: Option<Duration>,
    pub on_marked_down: OnMarkedDown,
    pub on_marked_up: OnMarkedUp,
}

/// Bounded-state automaton converting check outcomes into up/down.
///
/// `health` lives in `[0, rise+fall-1]`; `health < rise` means down,
/// `health >= rise` means up. This counter is the single source of truth
/// for availability derived from scripted checks.
#[derive(Debug, Clone)]
pub struct HealthCounter {
    rise: u32,
    fall: u32,
    health: u32,
    draining: bool,
}

impl HealthCounter {
    /// Create a counter starting down (`health = 0`).
    pub fn new(rise: u32, fall: u32) -> Result<Self> {
        Self::with_seed(rise, fall, 0)
    }

    /// Create a counter with an explicit initial health value.
    pub fn with_seed(rise: u32, fall: u32, health: u32) -> Result<Self> {
        if rise == 0 || fall == 0 {
            return Err(Error::config("rise and fall must be at least 1"));
        }
        if health > rise + fall - 1 {
            return Err(Error::config(format!(
                "health seed {health} outside [0, {}]",
                rise + fall - 1
            )));
        }
        Ok(Self { rise, fall, health, draining: false })
    }

    pub fn rise(&self) -> u32 {
        self.rise
    }

    pub fn fall(&self) -> u32 {
        self.fall
    }

    pub fn health(&self) -> u32 {
        self.health
    }

    /// Upper bound of the health range, `rise + fall - 1`.
    pub fn max_health(&self) -> u32 {
        self.rise + self.fall - 1
    }

    pub fn is_up(&self) -> bool {
        self.health >= self.rise
    }

    /// Whether the server asked to receive no new sessions.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Whether the counter sits strictly between its stable bounds.
    /// Used to pick the accelerated check interval.
    pub fn is_transitioning(&self) -> bool {
        if self.is_up() { self.health < self.max_health() } else { self.health > 0 }
    }

    /// Apply one check outcome. `Unknown` and `Neutral` leave the counter
    /// untouched.
    pub fn apply(&mut self, result: ChkResult) -> Option<Transition> {
        match result {
            ChkResult::Passed => {
                self.draining = false;
                self.pass()
            }
            ChkResult::CondPass => {
                self.draining = true;
                self.pass()
            }
            ChkResult::Failed => self.fail(),
            ChkResult::Unknown | ChkResult::Neutral => None,
        }
    }

    fn pass(&mut self) -> Option<Transition> {
        if self.health < self.rise {
            self.health += 1;
            if self.health == self.rise { Some(Transition::Up) } else { None }
        } else {
            self.health = (self.health + 1).min(self.max_health());
            None
        }
    }

    fn fail(&mut self) -> Option<Transition> {
        if self.health >= self.rise {
            self.health -= 1;
            if self.health == self.rise - 1 { Some(Transition::Down) } else { None }
        } else {
            self.health = self.health.saturating_sub(1);
            None
        }
    }

    /// Enter sudden-death mode: one more failure marks the server down.
    pub fn sudden_death(&mut self) {
        if self.health > self.rise {
            self.health = self.rise;
        }
    }

    /// Drop straight to the bottom of the range. Returns the transition if
    /// the server was up.
    pub fn force_down(&mut self) -> Option<Transition> {
        let was_up = self.is_up();
        self.health = 0;
        was_up.then_some(Transition::Down)
    }
}
