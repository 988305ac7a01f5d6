// ── Canopy Retrieval: Observation Sink ─────────────────────────────────────
//
// Append-only record of retrieval outcomes and teaching events. The sink is
// consumed asynchronously by an importance-update process (external); the
// engine only records and exposes the explicit update rule.
//
// Recording is best-effort: a failed JSONL spill is logged and swallowed.

use log::warn;
use parking_lot::Mutex;
use std::io::Write;
use std::path::PathBuf;

use crate::atoms::retrieval_types::Observation;

/// Importance EWMA with a time-scaled blend factor.
///
/// `α = 1 − 2^(−Δdays / half_life)`, floored at 0.05 so back-to-back
/// observations still move the needle. `outcome` is 1.0 for a success and
/// 0.0 for a failure.
pub fn ewma_importance(
    current: f32,
    outcome: f32,
    days_since_update: f64,
    half_life_days: f64,
) -> f32 {
    if half_life_days <= 0.0 {
        return outcome.clamp(0.0, 1.0);
    }
    let alpha =
        (1.0 - (2.0f64).powf(-days_since_update.max(0.0) / half_life_days)).max(0.05) as f32;
    (alpha * outcome + (1.0 - alpha) * current).clamp(0.0, 1.0)
}

pub struct ObservationSink {
    events: Mutex<Vec<Observation>>,
    spill_path: Option<PathBuf>,
    /// In-memory retention; older events only survive in the spill file.
    cap: usize,
}

impl ObservationSink {
    pub fn new(spill_path: Option<PathBuf>) -> Self {
        Self { events: Mutex::new(Vec::new()), spill_path, cap: 10_000 }
    }

    pub fn record_query_success(&self, query: &str, node_ids: Vec<u64>, top_score: f32) {
        self.push(Observation::QuerySuccess {
            query: query.to_string(),
            node_ids,
            top_score,
            ts: chrono::Utc::now(),
        });
    }

    pub fn record_query_failure(&self, query: &str, partial_matches: Vec<u64>) {
        self.push(Observation::QueryFailure {
            query: query.to_string(),
            partial_matches,
            ts: chrono::Utc::now(),
        });
    }

    pub fn record_teach(&self, content: &str, source: &str) {
        self.push(Observation::Teach {
            content: content.to_string(),
            source: source.to_string(),
            ts: chrono::Utc::now(),
        });
    }

    fn push(&self, event: Observation) {
        if let Some(path) = &self.spill_path {
            let append = || -> std::io::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut f =
                    std::fs::OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(f, "{}", serde_json::to_string(&event).unwrap_or_default())?;
                Ok(())
            };
            if let Err(e) = append() {
                warn!("[retrieval:observations] spill failed: {}", e);
            }
        }

        let mut events = self.events.lock();
        events.push(event);
        if events.len() > self.cap {
            let drop_count = events.len() - self.cap;
            events.drain(..drop_count);
        }
    }

    /// Hand the buffered events to the consumer and clear the buffer.
    pub fn drain(&self) -> Vec<Observation> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_moves_toward_outcome() {
        let up = ewma_importance(0.5, 1.0, 7.0, 14.0);
        assert!(up > 0.5 && up < 1.0);
        let down = ewma_importance(0.5, 0.0, 7.0, 14.0);
        assert!(down < 0.5 && down > 0.0);
    }

    #[test]
    fn ewma_alpha_floor_applies() {
        // Immediate re-observation still nudges by at least the floor.
        let nudged = ewma_importance(0.5, 1.0, 0.0, 14.0);
        assert!((nudged - 0.525).abs() < 1e-4);
    }

    #[test]
    fn ewma_stays_in_unit_interval() {
        assert!(ewma_importance(1.0, 1.0, 1000.0, 1.0) <= 1.0);
        assert!(ewma_importance(0.0, 0.0, 1000.0, 1.0) >= 0.0);
    }

    #[test]
    fn sink_records_and_drains() {
        let sink = ObservationSink::new(None);
        sink.record_query_success("q1", vec![1, 2], 0.9);
        sink.record_query_failure("q2", vec![]);
        sink.record_teach("fact", "user");
        assert_eq!(sink.len(), 3);

        let events = sink.drain();
        assert_eq!(events.len(), 3);
        assert!(sink.is_empty());
        assert!(matches!(events[0], Observation::QuerySuccess { .. }));
        assert!(matches!(events[2], Observation::Teach { .. }));
    }

    #[test]
    fn sink_spills_jsonl() {
        let path = std::env::temp_dir()
            .join(format!("canopy-obs-{}.jsonl", uuid::Uuid::new_v4()));
        let sink = ObservationSink::new(Some(path.clone()));
        sink.record_query_success("q", vec![7], 0.8);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("query_success"));
        std::fs::remove_file(path).ok();
    }
}
