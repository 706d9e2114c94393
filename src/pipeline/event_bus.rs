// src/pipeline/event_bus.rs
//
// Decoupled event system. Stages publish what happened this cycle; the
// runtime drains and reports it after each frame.

use crate::analysis::Edge;
use std::collections::VecDeque;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    LaneEdge {
        frame_index: u64,
        lane: String,
        edge: Edge,
        previous: u32,
        current: u32,
    },

    CheapResolved {
        lane: String,
        origin_frame: u64,
        offset: usize,
        merged: usize,
    },

    HeavyEscalated {
        frame_index: u64,
        lane: Option<String>,
        label: String,
        cheap_confidence: f32,
        heavy_confidence: Option<f32>,
    },

    EscalationSkipped {
        lane: String,
        reason: String,
    },

    PathEmitted {
        track_id: u64,
        label: String,
        first_frame: u64,
        last_frame: u64,
        length: usize,
    },
}

impl PipelineEvent {
    pub fn log(&self) {
        match self {
            Self::LaneEdge {
                frame_index,
                lane,
                edge,
                previous,
                current,
            } => info!(
                "📶 F{} {}: {} ({} → {})",
                frame_index,
                lane,
                edge.as_str(),
                previous,
                current
            ),
            Self::CheapResolved {
                lane,
                origin_frame,
                offset,
                merged,
            } => info!(
                "✅ {}: origin F{} (offset {}), {} merged",
                lane, origin_frame, offset, merged
            ),
            Self::HeavyEscalated {
                frame_index,
                lane,
                label,
                cheap_confidence,
                heavy_confidence,
            } => info!(
                "🧠 F{} {}: {} {:.2} → {}",
                frame_index,
                lane.as_deref().unwrap_or("-"),
                label,
                cheap_confidence,
                heavy_confidence
                    .map(|c| format!("{:.2}", c))
                    .unwrap_or_else(|| "no match".to_string())
            ),
            Self::EscalationSkipped { lane, reason } => info!("⏭️  {}: {}", lane, reason),
            Self::PathEmitted {
                track_id,
                label,
                first_frame,
                last_frame,
                length,
            } => info!(
                "🧵 Track #{} {}: F{}..F{} ({} bundles)",
                track_id, label, first_frame, last_frame, length
            ),
        }
    }
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped(lane: &str) -> PipelineEvent {
        PipelineEvent::EscalationSkipped {
            lane: lane.to_string(),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_full_bus_drops_oldest() {
        let mut bus = EventBus::new(2);
        bus.publish(skipped("a"));
        bus.publish(skipped("b"));
        bus.publish(skipped("c"));
        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(&drained[0], PipelineEvent::EscalationSkipped { lane, .. } if lane == "b"));
        assert_eq!(bus.pending_count(), 0);
    }
}
