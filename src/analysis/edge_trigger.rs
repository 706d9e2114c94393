// src/analysis/edge_trigger.rs
//
// Debounced two-state trigger. Turns a noisy scalar (per-lane occupancy
// count) into discrete rising/falling edges.
//
// Dead band:
//   `hysteresis` is the full width of the band centred on `threshold`.
//   Rising needs v >= threshold + hysteresis/2, falling needs
//   v <= threshold - hysteresis/2. Readings inside the band never flip state.
//
// Run length:
//   The `min_run` most recent readings, current one included, must all be
//   beyond the band edge before the state flips. One outlier never flips.
//
// `update` is a pure state transition: no errors, no panics. Bad parameters
// are rejected once in `EdgeTrigger::new`.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "RISING",
            Self::Falling => "FALLING",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeTriggerConfig {
    pub threshold: f32,
    /// Full dead-band width around the threshold
    pub hysteresis: f32,
    /// Consecutive readings beyond the band required to flip
    pub min_run: usize,
    pub initial_state: TriggerState,
}

impl Default for EdgeTriggerConfig {
    fn default() -> Self {
        // Occupancy counts are integers: 0 → 1 rises, 1 → 0 falls.
        Self {
            threshold: 0.5,
            hysteresis: 0.0,
            min_run: 1,
            initial_state: TriggerState::Low,
        }
    }
}

impl EdgeTriggerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.threshold.is_finite(), "trigger threshold must be finite");
        ensure!(
            self.hysteresis.is_finite() && self.hysteresis >= 0.0,
            "trigger hysteresis must be >= 0 (got {})",
            self.hysteresis
        );
        ensure!(self.min_run > 0, "trigger min_run must be > 0");
        Ok(())
    }
}

pub struct EdgeTrigger {
    config: EdgeTriggerConfig,
    state: TriggerState,
    history: VecDeque<f32>,
    history_cap: usize,
}

impl EdgeTrigger {
    pub fn new(config: EdgeTriggerConfig) -> Result<Self> {
        config.validate()?;
        let history_cap = config.min_run.max(16);
        Ok(Self {
            state: config.initial_state,
            history: VecDeque::with_capacity(history_cap),
            history_cap,
            config,
        })
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn upper(&self) -> f32 {
        self.config.threshold + self.config.hysteresis * 0.5
    }

    pub fn lower(&self) -> f32 {
        self.config.threshold - self.config.hysteresis * 0.5
    }

    pub fn history(&self) -> &VecDeque<f32> {
        &self.history
    }

    /// Feed one reading. Returns the edge if the state flipped.
    pub fn update(&mut self, value: f32) -> Option<Edge> {
        self.history.push_back(value);
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }

        match self.state {
            TriggerState::High if value <= self.lower() => {
                let lower = self.lower();
                if self.trailing_run(|v| v <= lower) >= self.config.min_run {
                    self.state = TriggerState::Low;
                    return Some(Edge::Falling);
                }
                None
            }
            TriggerState::Low if value >= self.upper() => {
                let upper = self.upper();
                if self.trailing_run(|v| v >= upper) >= self.config.min_run {
                    self.state = TriggerState::High;
                    return Some(Edge::Rising);
                }
                None
            }
            _ => None,
        }
    }

    /// Length of the consecutive run, counted from the newest reading, that
    /// satisfies `pred`.
    fn trailing_run<F: Fn(f32) -> bool>(&self, pred: F) -> usize {
        self.history.iter().rev().take_while(|v| pred(**v)).count()
    }
}
