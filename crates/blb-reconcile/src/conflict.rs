//! Route conflict detection.
//!
//! Route-table entries are split into those the controller manages (tagged
//! with [`ROUTE_DESCRIPTION_MARKER`]) and those a user manages. Every
//! overlapping (managed, user) pair is reported as a warning event. Nothing
//! is ever remediated.

use async_trait::async_trait;
use blb_cloud::RouteRule;
use blb_core::cidr;
use parking_lot::Mutex;
use tracing::warn;

/// Description marking route rules created by the controller.
pub const ROUTE_DESCRIPTION_MARKER: &str = "auto generated by cce";

/// Event reason used for route conflicts.
pub const ROUTE_CONFLICT_REASON: &str = "RouteConflict";

/// Sink for user-visible warning events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Emit a warning event. Delivery is best-effort.
    async fn warn(&self, reason: &str, message: &str);
}

/// Recorder that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventRecorder;

#[async_trait]
impl EventRecorder for TracingEventRecorder {
    async fn warn(&self, reason: &str, message: &str) {
        warn!(reason, message, "Warning event");
    }
}

/// Recorder that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<(String, String)>>,
}

impl MemoryEventRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(reason, message)` pairs recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn warn(&self, reason: &str, message: &str) {
        self.events.lock().push((reason.to_string(), message.to_string()));
    }
}

/// A managed route overlapping a user route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConflict {
    /// The controller's rule.
    pub managed: RouteRule,
    /// The user's rule.
    pub user: RouteRule,
}

impl RouteConflict {
    /// Human-readable description for the warning event.
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "route {} ({} via {}) overlaps user route {} ({} via {})",
            self.managed.route_rule_id,
            self.managed.destination,
            self.managed.next_hop_id,
            self.user.route_rule_id,
            self.user.destination,
            self.user.next_hop_id,
        )
    }
}

/// Whether a rule was created by the controller.
#[must_use]
pub fn is_managed(rule: &RouteRule) -> bool {
    rule.description.contains(ROUTE_DESCRIPTION_MARKER)
}

/// Whether two rules claim overlapping destinations.
///
/// A user default route overlaps every pod CIDR and is reported like any
/// other overlap.
#[must_use]
pub fn is_conflict(a: &RouteRule, b: &RouteRule) -> bool {
    cidr::overlaps(&a.destination, &b.destination)
}

/// Split rules into `(managed, user)`.
#[must_use]
pub fn partition(rules: &[RouteRule]) -> (Vec<&RouteRule>, Vec<&RouteRule>) {
    rules.iter().partition(|r| is_managed(r))
}

/// Every overlapping (managed, user) pair.
#[must_use]
pub fn detect_conflicts(rules: &[RouteRule]) -> Vec<RouteConflict> {
    let (managed, user) = partition(rules);
    let mut conflicts = Vec::new();
    for m in &managed {
        for u in &user {
            if is_conflict(m, u) {
                conflicts.push(RouteConflict {
                    managed: (*m).clone(),
                    user: (*u).clone(),
                });
            }
        }
    }
    conflicts
}

/// Detect conflicts and emit one warning event per pair.
///
/// Returns the number of conflicts found.
pub async fn audit_routes(rules: &[RouteRule], recorder: &dyn EventRecorder) -> usize {
    let conflicts = detect_conflicts(rules);
    for conflict in &conflicts {
        let message = conflict.message();
        warn!(
            managed = %conflict.managed.route_rule_id,
            user = %conflict.user.route_rule_id,
            "Route conflict detected"
        );
        recorder.warn(ROUTE_CONFLICT_REASON, &message).await;
    }
    conflicts.len()
}
