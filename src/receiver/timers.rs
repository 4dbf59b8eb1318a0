//! Timer model and conflict detection.
//!
//! Conflict semantics are conservative: the receiver may share tuners across
//! services, so overlapping timers conflict even on different service
//! references.

use recast_common::TimerId;
use serde::{Deserialize, Serialize};

/// Receiver timer state for a completed recording.
pub const TIMER_STATE_FINISHED: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    #[serde(default)]
    pub id: Option<TimerId>,
    pub service_ref: String,
    /// Begin/end as unix seconds.
    pub begin: i64,
    pub end: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub disabled: i32,
}

impl Timer {
    fn is_ignorable(&self) -> bool {
        self.state == TIMER_STATE_FINISHED || self.disabled == 1
    }
}

/// A timer under consideration, with padding applied before overlap checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedTimer {
    pub service_ref: String,
    pub begin: i64,
    pub end: i64,
    #[serde(default)]
    pub padding_before: i64,
    #[serde(default)]
    pub padding_after: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Conflict {
    /// Exact (serviceRef, begin, end) match with a live timer.
    Duplicate {
        timer_id: Option<TimerId>,
        service_ref: String,
    },
    /// Padded interval overlap with a live timer.
    Overlap {
        timer_id: Option<TimerId>,
        service_ref: String,
        begin: i64,
        end: i64,
    },
}

/// Compute conflicts between a proposed timer and the existing list.
///
/// Finished and disabled timers are ignored. Boundary touching is not a
/// conflict. An exact match is a `Duplicate`; any padded interval overlap is
/// an `Overlap`, regardless of service reference (shared-tuner rule).
#[must_use]
pub fn detect_conflicts(proposed: &ProposedTimer, existing: &[Timer]) -> Vec<Conflict> {
    let padded_begin = proposed.begin - proposed.padding_before.max(0);
    let padded_end = proposed.end + proposed.padding_after.max(0);

    let mut conflicts = Vec::new();
    for timer in existing {
        if timer.is_ignorable() {
            continue;
        }

        if timer.service_ref == proposed.service_ref
            && timer.begin == proposed.begin
            && timer.end == proposed.end
        {
            conflicts.push(Conflict::Duplicate {
                timer_id: timer.id,
                service_ref: timer.service_ref.clone(),
            });
            continue;
        }

        // Strict inequalities: touching boundaries do not conflict.
        if padded_begin < timer.end && timer.begin < padded_end {
            conflicts.push(Conflict::Overlap {
                timer_id: timer.id,
                service_ref: timer.service_ref.clone(),
                begin: timer.begin,
                end: timer.end,
            });
        }
    }
    conflicts
}
