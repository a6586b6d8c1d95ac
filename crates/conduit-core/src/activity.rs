//! Activity Tracker (C11): tracks concurrent tool/agent activities and
//! re-emits them as `Activity` events for UI consumption.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::events::{ActivityStatus, Event, EventBus, EventKind};
use crate::types::Provider;

#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub activity_id: String,
    pub parent_activity_id: Option<String>,
    pub activity_type: String,
    pub name: String,
    pub status: ActivityStatus,
    pub progress: Option<f32>,
    pub detail: Option<String>,
    pub concurrent_group: Option<String>,
    pub is_cancellable: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Owns the set of in-flight and recently-finished activities for one
/// engine. Every mutation emits a corresponding `Activity` event on the
/// shared bus so UIs never need to poll.
pub struct ActivityTracker {
    provider: Provider,
    activities: Mutex<HashMap<String, ActivityRecord>>,
}

impl ActivityTracker {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            activities: Mutex::new(HashMap::new()),
        }
    }

    fn emit(&self, bus: &EventBus, record: &ActivityRecord) {
        bus.emit(Event::new(
            self.provider,
            EventKind::Activity {
                activity_id: record.activity_id.clone(),
                parent_activity_id: record.parent_activity_id.clone(),
                activity_type: record.activity_type.clone(),
                name: record.name.clone(),
                status: record.status,
                progress: record.progress,
                detail: record.detail.clone(),
                concurrent_group: record.concurrent_group.clone(),
                is_cancellable: record.is_cancellable,
                started_at: record.started_at,
                completed_at: record.completed_at,
            },
        ));
    }

    pub fn start(
        &self,
        bus: &EventBus,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        name: impl Into<String>,
        parent_activity_id: Option<String>,
    ) {
        let record = ActivityRecord {
            activity_id: activity_id.into(),
            parent_activity_id,
            activity_type: activity_type.into(),
            name: name.into(),
            status: ActivityStatus::Running,
            progress: None,
            detail: None,
            concurrent_group: None,
            is_cancellable: false,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.emit(bus, &record);
        self.activities
            .lock()
            .unwrap()
            .insert(record.activity_id.clone(), record);
    }

    pub fn progress(&self, bus: &EventBus, activity_id: &str, progress: f32, detail: Option<String>) {
        let mut activities = self.activities.lock().unwrap();
        if let Some(record) = activities.get_mut(activity_id) {
            record.progress = Some(progress);
            record.detail = detail;
            self.emit(bus, record);
        }
    }

    pub fn complete(&self, bus: &EventBus, activity_id: &str) {
        self.finish(bus, activity_id, ActivityStatus::Completed);
    }

    pub fn fail(&self, bus: &EventBus, activity_id: &str, detail: impl Into<String>) {
        let mut activities = self.activities.lock().unwrap();
        if let Some(record) = activities.get_mut(activity_id) {
            record.status = ActivityStatus::Failed;
            record.detail = Some(detail.into());
            record.completed_at = Some(Utc::now());
            self.emit(bus, record);
        }
    }

    pub fn cancel(&self, bus: &EventBus, activity_id: &str) {
        self.finish(bus, activity_id, ActivityStatus::Cancelled);
    }

    fn finish(&self, bus: &EventBus, activity_id: &str, status: ActivityStatus) {
        let mut activities = self.activities.lock().unwrap();
        if let Some(record) = activities.get_mut(activity_id) {
            record.status = status;
            record.completed_at = Some(Utc::now());
            self.emit(bus, record);
        }
    }

    pub fn active_count(&self) -> usize {
        self.activities
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == ActivityStatus::Running || r.status == ActivityStatus::Pending)
            .count()
    }

    pub fn snapshot(&self) -> Vec<ActivityRecord> {
        self.activities.lock().unwrap().values().cloned().collect()
    }
}
