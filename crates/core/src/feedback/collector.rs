use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::feedback::{FeedbackSignal, UserFeedback};
use crate::domain::operation::{AtomicOperation, OperationId};
use crate::domain::taxonomy::ClassificationLabel;

pub const CORRECTION_CONFIDENCE: f64 = 0.95;
pub const RATING_CONFIDENCE: f64 = 0.9;
pub const APPROVAL_CONFIDENCE: f64 = 0.85;
pub const MODIFIED_APPROVAL_CONFIDENCE: f64 = 0.7;

const BEHAVIORAL_BASE: f64 = 0.6;
const UNDO_SIGNAL: f64 = 0.8;
const ABANDON_SIGNAL: f64 = 0.7;
const REPEATED_RETRY_SIGNAL: f64 = 0.75;

/// Sessions kept before the oldest is evicted.
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

const LONG_TERM_BASE: f64 = 0.5;
const PERSISTED_SIGNAL: f64 = 0.7;
const REUSED_SIGNAL: f64 = 0.8;
const REFERENCED_SIGNAL: f64 = 0.75;

/// Timestamps and behavioral counters observed for one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSession {
    pub operation_id: OperationId,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub presented_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub execution_completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub undone_at: Option<DateTime<Utc>>,
    pub abandoned: bool,
}

impl FeedbackSession {
    fn new(operation: &AtomicOperation, started_at: DateTime<Utc>) -> Self {
        Self {
            operation_id: operation.id.clone(),
            user_id: operation.user_id.clone(),
            started_at,
            presented_at: None,
            decided_at: None,
            execution_completed_at: None,
            retry_count: 0,
            last_retry_at: None,
            undone_at: None,
            abandoned: false,
        }
    }

    fn has_behavioral_signal(&self) -> bool {
        self.retry_count > 0 || self.undone_at.is_some() || self.abandoned
    }
}

/// Collects feedback signals for operations.
///
/// The session map is the only shared mutable state in the core and is safe
/// to use from concurrent requests. The collector never mutates operations;
/// callers persist the returned [`UserFeedback`] records. At most
/// `max_sessions` are tracked; starting one more evicts the oldest.
#[derive(Debug)]
pub struct FeedbackCollector {
    sessions: Mutex<HashMap<OperationId, FeedbackSession>>,
    max_sessions: usize,
}

impl Default for FeedbackCollector {
    fn default() -> Self {
        Self::with_max_sessions(DEFAULT_MAX_SESSIONS)
    }
}

impl FeedbackCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), max_sessions: max_sessions.max(1) }
    }

    /// Begin tracking an operation. An existing session is kept as is.
    pub fn start_session(&self, operation: &AtomicOperation, at: DateTime<Utc>) -> FeedbackSession {
        let mut sessions = self.sessions();
        if let Some(session) = sessions.get(&operation.id) {
            return session.clone();
        }
        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .values()
                .min_by_key(|session| session.started_at)
                .map(|session| session.operation_id.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
        }
        let session = FeedbackSession::new(operation, at);
        sessions.insert(operation.id.clone(), session.clone());
        session
    }

    pub fn session(&self, operation_id: &OperationId) -> Option<FeedbackSession> {
        self.sessions().get(operation_id).cloned()
    }

    pub fn end_session(&self, operation_id: &OperationId) -> Option<FeedbackSession> {
        self.sessions().remove(operation_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    pub fn mark_presented(&self, operation_id: &OperationId, at: DateTime<Utc>) -> bool {
        self.update(operation_id, |session| session.presented_at = Some(at))
    }

    pub fn mark_execution_completed(&self, operation_id: &OperationId, at: DateTime<Utc>) -> bool {
        self.update(operation_id, |session| session.execution_completed_at = Some(at))
    }

    pub fn record_retry(&self, operation_id: &OperationId, at: DateTime<Utc>) -> bool {
        self.update(operation_id, |session| {
            session.retry_count += 1;
            session.last_retry_at = Some(at);
        })
    }

    pub fn record_undo(&self, operation_id: &OperationId, at: DateTime<Utc>) -> bool {
        self.update(operation_id, |session| session.undone_at = Some(at))
    }

    pub fn record_abandon(&self, operation_id: &OperationId) -> bool {
        self.update(operation_id, |session| session.abandoned = true)
    }

    /// Explicit 1-5 rating; out-of-range values are clamped.
    pub fn collect_rating(
        &self,
        operation: &AtomicOperation,
        rating: u8,
        dimensions: BTreeMap<String, u8>,
        comment: Option<String>,
    ) -> UserFeedback {
        let dimensions =
            dimensions.into_iter().map(|(name, value)| (name, value.clamp(1, 5))).collect();
        UserFeedback::new(
            operation.id.clone(),
            operation.user_id.clone(),
            FeedbackSignal::ExplicitRating { rating: rating.clamp(1, 5), dimensions, comment },
            RATING_CONFIDENCE,
        )
    }

    pub fn collect_correction(
        &self,
        operation: &AtomicOperation,
        corrected: ClassificationLabel,
        reasoning: Option<String>,
    ) -> UserFeedback {
        let system = operation.classification.as_ref().map(|classification| classification.label());
        UserFeedback::new(
            operation.id.clone(),
            operation.user_id.clone(),
            FeedbackSignal::Correction { system, corrected, reasoning },
            CORRECTION_CONFIDENCE,
        )
    }

    /// Approval decision. Decision latency is present only when the
    /// operation was marked as presented.
    pub fn collect_approval(
        &self,
        operation: &AtomicOperation,
        approved: bool,
        modified: bool,
        modification_extent: f64,
        modification_details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> UserFeedback {
        let mut time_to_decision_ms = None;
        self.update(&operation.id, |session| {
            session.decided_at = Some(at);
            time_to_decision_ms = session.presented_at.map(|presented| millis_between(presented, at));
        });

        let confidence = if modified { MODIFIED_APPROVAL_CONFIDENCE } else { APPROVAL_CONFIDENCE };
        UserFeedback::new(
            operation.id.clone(),
            operation.user_id.clone(),
            FeedbackSignal::Approval {
                approved,
                modified,
                modification_extent: modification_extent.clamp(0.0, 1.0),
                modification_details,
                time_to_decision_ms,
            },
            confidence,
        )
    }

    /// Behavioral feedback accumulated in the session, or `None` when no
    /// retry, undo or abandon was observed.
    pub fn collect_behavioral(&self, operation: &AtomicOperation) -> Option<UserFeedback> {
        let session = self.session(&operation.id)?;
        if !session.has_behavioral_signal() {
            return None;
        }

        let time_to_retry_ms = session.last_retry_at.map(|retry| millis_between(session.started_at, retry));
        let time_to_undo_ms = session
            .undone_at
            .zip(session.execution_completed_at)
            .map(|(undone, completed)| millis_between(completed, undone));

        let mut confidence = BEHAVIORAL_BASE;
        if session.undone_at.is_some() {
            confidence = confidence.max(UNDO_SIGNAL);
        }
        if session.abandoned {
            confidence = confidence.max(ABANDON_SIGNAL);
        }
        if session.retry_count > 2 {
            confidence = confidence.max(REPEATED_RETRY_SIGNAL);
        }

        Some(UserFeedback::new(
            operation.id.clone(),
            operation.user_id.clone(),
            FeedbackSignal::Behavioral {
                retried: session.retry_count > 0,
                retry_count: session.retry_count,
                time_to_retry_ms,
                undid: session.undone_at.is_some(),
                time_to_undo_ms,
                abandoned: session.abandoned,
            },
            confidence,
        ))
    }

    pub fn collect_long_term(
        &self,
        operation: &AtomicOperation,
        persisted: bool,
        days_persisted: Option<u32>,
        reused_pattern: bool,
        referenced_later: bool,
    ) -> UserFeedback {
        let mut confidence = LONG_TERM_BASE;
        if persisted && days_persisted.is_some_and(|days| days > 7) {
            confidence = confidence.max(PERSISTED_SIGNAL);
        }
        if reused_pattern {
            confidence = confidence.max(REUSED_SIGNAL);
        }
        if referenced_later {
            confidence = confidence.max(REFERENCED_SIGNAL);
        }

        UserFeedback::new(
            operation.id.clone(),
            operation.user_id.clone(),
            FeedbackSignal::LongTerm { persisted, days_persisted, reused_pattern, referenced_later },
            confidence,
        )
    }

    fn update(&self, operation_id: &OperationId, apply: impl FnOnce(&mut FeedbackSession)) -> bool {
        match self.sessions().get_mut(operation_id) {
            Some(session) => {
                apply(session);
                true
            }
            None => false,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<OperationId, FeedbackSession>> {
        match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds()
}
