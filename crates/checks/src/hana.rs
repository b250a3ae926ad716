//! Passive health analysis.
//!
//! Live traffic observations are mapped through a static table to an effect
//! at the configured observation layer. Consecutive errors accumulate; at
//! the configured threshold the aggregator issues one corrective directive
//! and starts counting again. This path is independent of scripted checks;
//! either may drive the server down.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Layer at which live traffic is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserveLayer {
    Layer4,
    Layer7,
}

/// Discrete traffic observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HanaStatus {
    Unknown,

    /// L4 successful connection.
    L4Ok,
    /// L4 unsuccessful connection.
    L4Err,

    /// Correct HTTP response.
    HttpOk,
    /// Wrong HTTP response, e.g. HTTP 5xx.
    HttpSts,
    /// Invalid HTTP response headers.
    HttpHdrRsp,
    /// Invalid HTTP response.
    HttpRsp,

    /// Read error.
    HttpReadError,
    /// Read timeout.
    HttpReadTimeout,
    /// Unexpected close from the server.
    HttpBrokenPipe,
}

/// Effect of an observation at one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Ignore,
    Error,
    Ok,
}

/// One row of the static analyze-status table.
pub struct AnalyzeStatusEntry {
    pub desc: &'static str,
    pub l4: Effect,
    pub l7: Effect,
}

impl AnalyzeStatusEntry {
    pub fn effect(&self, layer: ObserveLayer) -> Effect {
        match layer {
            ObserveLayer::Layer4 => self.l4,
            ObserveLayer::Layer7 => self.l7,
        }
    }
}

impl HanaStatus {
    /// Static registry lookup for this observation.
    pub fn entry(self) -> &'static AnalyzeStatusEntry {
        use Effect::*;
        macro_rules! entry {
            ($desc:expr, $l4:expr, $l7:expr) => {
                &AnalyzeStatusEntry { desc: $desc, l4: $l4, l7: $l7 }
            };
        }
        match self {
            HanaStatus::Unknown => entry!("Unknown", Ignore, Ignore),
            HanaStatus::L4Ok => entry!("L4 successful connection", Ok, Ignore),
            HanaStatus::L4Err => entry!("L4 unsuccessful connection", Error, Error),
            HanaStatus::HttpOk => entry!("Correct http response", Ignore, Ok),
            HanaStatus::HttpSts => entry!("Wrong http response", Ignore, Error),
            HanaStatus::HttpHdrRsp => entry!("Invalid http response (headers)", Ignore, Error),
            HanaStatus::HttpRsp => entry!("Invalid http response", Ignore, Error),
            HanaStatus::HttpReadError => entry!("Read error", Ignore, Error),
            HanaStatus::HttpReadTimeout => entry!("Read timeout", Ignore, Error),
            HanaStatus::HttpBrokenPipe => entry!("Close from server", Ignore, Error),
        }
    }
}

impl fmt::Display for HanaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry().desc)
    }
}

/// Corrective action issued when the error threshold is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorAction {
    /// Accelerate the check interval.
    Fastinter,
    /// Synthesize a failed check result.
    FailCheck,
    /// One more failed check marks the server down.
    SuddenDeath,
    /// Mark the server down immediately.
    MarkDown,
}

/// Converts traffic observations into corrective directives.
#[derive(Debug, Clone)]
pub struct HanaAggregator {
    layer: ObserveLayer,
    threshold: u32,
    on_error: OnErrorAction,
    errors: u32,
}

impl HanaAggregator {
    pub fn new(layer: ObserveLayer, threshold: u32, on_error: OnErrorAction) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::config("error threshold must be at least 1"));
        }
        Ok(Self { layer, threshold, on_error, errors: 0 })
    }

    pub fn layer(&self) -> ObserveLayer {
        self.layer
    }

    /// Consecutive errors observed since the last ok or directive.
    pub fn consecutive_errors(&self) -> u32 {
        self.errors
    }

    /// Feed one observation. Returns the directive to apply, if the error
    /// threshold was just reached.
    pub fn observe(&mut self, status: HanaStatus) -> Option<OnErrorAction> {
        match status.entry().effect(self.layer) {
            Effect::Ignore => None,
            Effect::Ok => {
                if self.errors > 0 {
                    tracing::debug!(
                        observation = %status,
                        cleared = self.errors,
                        "traffic recovered, resetting error streak"
                    );
                }
                self.errors = 0;
                None
            }
            Effect::Error => {
                self.errors += 1;
                if self.errors >= self.threshold {
                    tracing::warn!(
                        observation = %status,
                        errors = self.errors,
                        action = ?self.on_error,
                        "consecutive traffic errors reached threshold"
                    );
                    self.errors = 0;
                    Some(self.on_error)
                } else {
                    None
                }
            }
        }
    }
}
