//! Builder-style filter over audit events.

use chrono::{DateTime, Utc};

use super::event::{AuditEvent, EventCategory, Severity};

/// Every `Some` predicate must hold for an event to match.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub min_severity: Option<Severity>,
    pub category: Option<EventCategory>,
    pub event_type: Option<String>,
    pub child_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn in_category(mut self, category: EventCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn of_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn for_child(mut self, child_id: impl Into<String>) -> Self {
        self.child_id = Some(child_id.into());
        self
    }

    pub fn since(mut self, dt: DateTime<Utc>) -> Self {
        self.since = Some(dt);
        self
    }

    pub fn until(mut self, dt: DateTime<Utc>) -> Self {
        self.until = Some(dt);
        self
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(min) = self.min_severity
            && event.severity < min
        {
            return false;
        }
        if let Some(category) = self.category
            && event.category != category
        {
            return false;
        }
        if let Some(ref event_type) = self.event_type
            && &event.event_type != event_type
        {
            return false;
        }
        if let Some(ref child_id) = self.child_id
            && event.context.child_id.as_ref() != Some(child_id)
        {
            return false;
        }
        if let Some(since) = self.since
            && event.timestamp < since
        {
            return false;
        }
        if let Some(until) = self.until
            && event.timestamp > until
        {
            return false;
        }
        true
    }

    /// Matching events in their original order.
    pub fn filter<'a>(&self, events: &'a [AuditEvent]) -> Vec<&'a AuditEvent> {
        events.iter().filter(|e| self.matches(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::EventContext;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(
        event_type: &str,
        severity: Severity,
        category: EventCategory,
        child: Option<&str>,
        ts: DateTime<Utc>,
    ) -> AuditEvent {
        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: ts,
            event_type: event_type.into(),
            severity,
            category,
            description: String::new(),
            context: EventContext {
                child_id: child.map(String::from),
                ..EventContext::default()
            },
            details: BTreeMap::new(),
            integrity_hash: None,
            retention_date: ts,
        }
    }

    fn sample() -> Vec<AuditEvent> {
        let now = Utc::now();
        vec![
            event(
                "safety_decision",
                Severity::Info,
                EventCategory::ContentSafety,
                Some("a"),
                now - Duration::hours(2),
            ),
            event(
                "safety_decision",
                Severity::Critical,
                EventCategory::ContentSafety,
                Some("b"),
                now - Duration::hours(1),
            ),
            event(
                "consent_revoked",
                Severity::Warning,
                EventCategory::Consent,
                Some("a"),
                now,
            ),
            event("ledger_rotated", Severity::Debug, EventCategory::System, None, now),
        ]
    }

    #[test]
    fn test_empty_query_matches_all() {
        let events = sample();
        assert_eq!(AuditQuery::new().filter(&events).len(), 4);
    }

    #[test]
    fn test_severity_floor() {
        let events = sample();
        let hits = AuditQuery::new()
            .min_severity(Severity::Warning)
            .filter(&events);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|e| e.severity >= Severity::Warning));
    }

    #[test]
    fn test_category_and_child() {
        let events = sample();
        let hits = AuditQuery::new()
            .in_category(EventCategory::ContentSafety)
            .for_child("a")
            .filter(&events);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].severity, Severity::Info);
    }

    #[test]
    fn test_event_type_and_time_range() {
        let events = sample();
        let now = Utc::now();
        let hits = AuditQuery::new()
            .of_type("safety_decision")
            .since(now - Duration::minutes(90))
            .until(now)
            .filter(&events);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].context.child_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_child_filter_skips_anonymous_events() {
        let events = sample();
        let hits = AuditQuery::new().for_child("nobody").filter(&events);
        assert!(hits.is_empty());
    }
}
