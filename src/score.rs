//! Compliance score calculation and tracking.
//!
//! The score walks the audit's flags in creation order and applies
//! per-class penalties with exponential decay over consecutive runs. A
//! flag set that is entirely one class (all RED or all GREEN) scores 0:
//! unbalanced output is treated as not a real audit.

use chrono::Utc;
use tracing::info;

use crate::core::{ComplianceScore, Flag, FlagClass};
use crate::error::Result;
use crate::storage::Storage;

/// Penalty for a RED flag at the start of a run.
const RED_PENALTY: f64 = 20.0;
/// Penalty for a YELLOW flag at the start of a run.
const YELLOW_PENALTY: f64 = 10.0;
/// Decay applied per additional consecutive flag of the same class.
const DECAY_FACTOR: f64 = 0.9;

/// Calculates the compliance score for a flag set.
///
/// - No flags: 100 (fully compliant).
/// - All flags one class (all RED or all GREEN): 0.
/// - Otherwise start at 100; walk flags sorted by `(created_at, id)`
///   maintaining consecutive-run counters per class. Each RED subtracts
///   `20 * 0.9^(run-1)`, each YELLOW `10 * 0.9^(run-1)`; GREEN adds no
///   penalty but resets the other runs.
/// - Clamped to `[0, 100]`.
#[must_use]
pub fn calculate_compliance_score(flags: &[Flag]) -> f64 {
    if flags.is_empty() {
        return 100.0;
    }

    let total = flags.len();
    let red_count = flags.iter().filter(|f| f.class == FlagClass::Red).count();
    let green_count = flags.iter().filter(|f| f.class == FlagClass::Green).count();
    if red_count == total || green_count == total {
        return 0.0;
    }

    let mut sorted: Vec<&Flag> = flags.iter().collect();
    sorted.sort_by_key(|flag| (flag.created_at, flag.id));

    let mut penalty = 0.0;
    let mut consecutive_red: u32 = 0;
    let mut consecutive_yellow: u32 = 0;

    for flag in sorted {
        match flag.class {
            FlagClass::Red => {
                consecutive_red += 1;
                consecutive_yellow = 0;
                penalty += RED_PENALTY * DECAY_FACTOR.powi(consecutive_red as i32 - 1);
            }
            FlagClass::Yellow => {
                consecutive_yellow += 1;
                consecutive_red = 0;
                penalty += YELLOW_PENALTY * DECAY_FACTOR.powi(consecutive_yellow as i32 - 1);
            }
            FlagClass::Green => {
                consecutive_red = 0;
                consecutive_yellow = 0;
            }
        }
    }

    (100.0 - penalty).clamp(0.0, 100.0)
}

/// Summary statistics for a flag set.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSummary {
    /// Total flags.
    pub total_flags: usize,
    /// RED flag count.
    pub red_count: usize,
    /// YELLOW flag count.
    pub yellow_count: usize,
    /// GREEN flag count.
    pub green_count: usize,
    /// Mean severity score.
    pub avg_severity_score: f64,
    /// Overall compliance score.
    pub compliance_score: f64,
}

/// Computes summary statistics for a flag set.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn flag_summary(flags: &[Flag]) -> FlagSummary {
    let total = flags.len();
    let avg = if total == 0 {
        0.0
    } else {
        flags.iter().map(|f| f.severity_score).sum::<i64>() as f64 / total as f64
    };
    FlagSummary {
        total_flags: total,
        red_count: flags.iter().filter(|f| f.class == FlagClass::Red).count(),
        yellow_count: flags.iter().filter(|f| f.class == FlagClass::Yellow).count(),
        green_count: flags.iter().filter(|f| f.class == FlagClass::Green).count(),
        avg_severity_score: avg,
        compliance_score: calculate_compliance_score(flags),
    }
}

/// Tracks and persists compliance scores for audits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreTracker;

impl ScoreTracker {
    /// Creates a tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Calculates and persists the score snapshot for an audit.
    ///
    /// Idempotent per audit: repeated calls update the same row, and the
    /// counts and overall score are functions of the current flag set.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn record_score(
        &self,
        storage: &mut dyn Storage,
        audit_id: i64,
    ) -> Result<ComplianceScore> {
        let flags = storage.flags_for_audit(audit_id)?;
        let summary = flag_summary(&flags);

        let snapshot = ComplianceScore {
            id: None,
            audit_id,
            overall_score: summary.compliance_score,
            red_count: summary.red_count as i64,
            yellow_count: summary.yellow_count as i64,
            green_count: summary.green_count as i64,
            total_flags: summary.total_flags as i64,
            created_at: Utc::now(),
        };
        let stored = storage.upsert_score(&snapshot)?;
        info!(
            audit_id,
            overall_score = stored.overall_score,
            red = stored.red_count,
            yellow = stored.yellow_count,
            green = stored.green_count,
            "recorded compliance score"
        );
        Ok(stored)
    }

    /// Score history: the latest snapshot per audit, newest first,
    /// optionally filtered by organization. The limit is capped at 100 by
    /// the storage layer.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn get_score_history(
        &self,
        storage: &dyn Storage,
        organization: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ComplianceScore>> {
        storage.score_history(organization, limit)
    }

    /// The most recent snapshot, optionally filtered by organization.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn get_latest_score(
        &self,
        storage: &dyn Storage,
        organization: Option<&str>,
    ) -> Result<Option<ComplianceScore>> {
        Ok(self
            .get_score_history(storage, organization, 1)?
            .into_iter()
            .next())
    }
}
