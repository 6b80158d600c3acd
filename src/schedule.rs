//! Recurring batch triggers.
//!
//! Only the definitions and their registration live here; evaluating a
//! calendar against the clock is up to the [`Scheduler`] implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::DEFAULT_TASK_QUEUE;

/// Time zone of the calendar based definitions.
pub const PACIFIC_TIME_ZONE: &str = "US/Pacific";
/// Run timeout of every scheduled batch.
pub const SCHEDULED_RUN_TIMEOUT: Duration = Duration::from_secs(30);
const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inclusive range of calendar values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRange {
    pub start: u32,
    pub end: u32,
}

impl ScheduleRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn single(value: u32) -> Self {
        Self::new(value, value)
    }

    fn check(&self, field: &'static str, min: u32, max: u32) -> Result<(), ScheduleError> {
        if self.start > self.end || self.start < min || self.end > max {
            return Err(ScheduleError::Invalid(format!(
                "{field} range {}..={} outside {min}..={max}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Calendar match. An empty field matches every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSpec {
    pub hour: Vec<ScheduleRange>,
    /// 0 is Sunday.
    pub day_of_week: Vec<ScheduleRange>,
    pub month: Vec<ScheduleRange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub intervals: Vec<Duration>,
    pub calendars: Vec<CalendarSpec>,
    pub time_zone: Option<String>,
    pub jitter: Option<Duration>,
}

impl ScheduleSpec {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.intervals.is_empty() && self.calendars.is_empty() {
            return Err(ScheduleError::Invalid(
                "schedule has neither intervals nor calendars".to_string(),
            ));
        }
        if self.intervals.iter().any(Duration::is_zero) {
            return Err(ScheduleError::Invalid("zero schedule interval".to_string()));
        }
        for calendar in &self.calendars {
            for range in &calendar.hour {
                range.check("hour", 0, 23)?;
            }
            for range in &calendar.day_of_week {
                range.check("day of week", 0, 6)?;
            }
            for range in &calendar.month {
                range.check("month", 1, 12)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Start every trigger even when earlier runs are still going.
    #[default]
    AllowAll,
}

/// Batch run started by each trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleAction {
    pub task_queue: String,
    pub run_timeout: Duration,
}

impl Default for ScheduleAction {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            run_timeout: SCHEDULED_RUN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub schedule_id: String,
    /// Id of the batch started by each trigger.
    pub workflow_id: String,
    pub spec: ScheduleSpec,
    pub action: ScheduleAction,
    pub overlap: OverlapPolicy,
    /// Fire once as soon as the schedule is created.
    pub trigger_immediately: bool,
}

impl ScheduleDefinition {
    pub fn new(
        schedule_id: impl Into<String>,
        workflow_id: impl Into<String>,
        spec: ScheduleSpec,
        trigger_immediately: bool,
    ) -> Self {
        Self {
            schedule_id: schedule_id.into(),
            workflow_id: workflow_id.into(),
            spec,
            action: ScheduleAction::default(),
            overlap: OverlapPolicy::AllowAll,
            trigger_immediately,
        }
    }
}

pub fn every_5_seconds() -> ScheduleSpec {
    ScheduleSpec {
        intervals: vec![Duration::from_secs(5)],
        ..ScheduleSpec::default()
    }
}

/// Hourly from 9:00 to 17:00, Monday to Friday, Pacific time.
pub fn business_hours_hourly() -> ScheduleSpec {
    ScheduleSpec {
        calendars: vec![CalendarSpec {
            hour: vec![ScheduleRange::new(9, 17)],
            day_of_week: vec![ScheduleRange::new(1, 5)],
            month: Vec::new(),
        }],
        time_zone: Some(PACIFIC_TIME_ZONE.to_string()),
        jitter: Some(Duration::from_secs(5 * 60)),
        ..ScheduleSpec::default()
    }
}

/// Thursdays at 14:00 in September and December, Pacific time.
pub fn custom_schedule() -> ScheduleSpec {
    ScheduleSpec {
        calendars: vec![CalendarSpec {
            hour: vec![ScheduleRange::single(14)],
            day_of_week: vec![ScheduleRange::single(4)],
            month: vec![ScheduleRange::single(9), ScheduleRange::single(12)],
        }],
        time_zone: Some(PACIFIC_TIME_ZONE.to_string()),
        ..ScheduleSpec::default()
    }
}

pub fn default_definitions() -> Vec<ScheduleDefinition> {
    vec![
        ScheduleDefinition::new("schedule_every_5s", "payment_every_5s", every_5_seconds(), false),
        ScheduleDefinition::new(
            "schedule_business_hourly",
            "payment_hourly",
            business_hours_hourly(),
            true,
        ),
        ScheduleDefinition::new(
            "schedule_custom",
            "payment_custom_schedule",
            custom_schedule(),
            false,
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule {0} already registered")]
    AlreadyExists(String),

    #[error("invalid schedule: {0}")]
    Invalid(String),

    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn create(&self, definition: ScheduleDefinition) -> Result<(), ScheduleError>;
}

/// Scheduler keeping its definitions in memory, keyed by schedule id.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    schedules: Mutex<BTreeMap<String, ScheduleDefinition>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered definitions, ordered by schedule id.
    pub async fn list(&self) -> Vec<ScheduleDefinition> {
        self.schedules.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn create(&self, definition: ScheduleDefinition) -> Result<(), ScheduleError> {
        definition.spec.validate()?;
        let mut schedules = self.schedules.lock().await;
        if schedules.contains_key(&definition.schedule_id) {
            return Err(ScheduleError::AlreadyExists(definition.schedule_id));
        }
        schedules.insert(definition.schedule_id.clone(), definition);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(String),
    AlreadyRegistered(String),
    Failed {
        schedule_id: String,
        error: ScheduleError,
    },
}

/// Register every definition, continuing past failures.
pub async fn register_all(
    scheduler: &dyn Scheduler,
    definitions: Vec<ScheduleDefinition>,
) -> Vec<Registration> {
    let mut registrations = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let schedule_id = definition.schedule_id.clone();
        let result = tokio::time::timeout(CREATE_TIMEOUT, scheduler.create(definition))
            .await
            .unwrap_or_else(|_| Err(ScheduleError::Unavailable("create timed out".to_string())));

        let registration = match result {
            Ok(()) => {
                info!(%schedule_id, "schedule created");
                Registration::Created(schedule_id)
            }
            Err(ScheduleError::AlreadyExists(_)) => {
                info!(%schedule_id, "schedule already registered");
                Registration::AlreadyRegistered(schedule_id)
            }
            Err(error) => {
                warn!(%schedule_id, %error, "failed to create schedule");
                Registration::Failed { schedule_id, error }
            }
        };
        registrations.push(registration);
    }
    registrations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_definitions_match_reference_triggers() {
        let definitions = default_definitions();
        let ids: Vec<_> = definitions
            .iter()
            .map(|d| (d.schedule_id.as_str(), d.workflow_id.as_str(), d.trigger_immediately))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("schedule_every_5s", "payment_every_5s", false),
                ("schedule_business_hourly", "payment_hourly", true),
                ("schedule_custom", "payment_custom_schedule", false),
            ]
        );
        for definition in &definitions {
            assert_eq!(definition.action.run_timeout, Duration::from_secs(30));
            assert_eq!(definition.action.task_queue, "demo-tq");
            assert_eq!(definition.overlap, OverlapPolicy::AllowAll);
            definition.spec.validate().unwrap();
        }
    }

    #[test]
    fn business_hours_spec() {
        let spec = business_hours_hourly();
        assert_eq!(spec.calendars[0].hour, vec![ScheduleRange::new(9, 17)]);
        assert_eq!(spec.calendars[0].day_of_week, vec![ScheduleRange::new(1, 5)]);
        assert_eq!(spec.time_zone.as_deref(), Some("US/Pacific"));
        assert_eq!(spec.jitter, Some(Duration::from_secs(300)));
    }

    #[test]
    fn custom_spec_runs_thursday_afternoons_in_two_months() {
        let calendar = &custom_schedule().calendars[0];
        assert_eq!(calendar.hour, vec![ScheduleRange::single(14)]);
        assert_eq!(calendar.day_of_week, vec![ScheduleRange::single(4)]);
        assert_eq!(
            calendar.month,
            vec![ScheduleRange::single(9), ScheduleRange::single(12)]
        );
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(ScheduleSpec::default().validate().is_err());

        let zero = ScheduleSpec {
            intervals: vec![Duration::ZERO],
            ..ScheduleSpec::default()
        };
        assert!(zero.validate().is_err());

        let bad_hour = ScheduleSpec {
            calendars: vec![CalendarSpec {
                hour: vec![ScheduleRange::new(20, 24)],
                ..CalendarSpec::default()
            }],
            ..ScheduleSpec::default()
        };
        assert!(matches!(bad_hour.validate(), Err(ScheduleError::Invalid(_))));
    }

    #[tokio::test]
    async fn registering_twice_reports_already_registered() {
        let scheduler = InMemoryScheduler::new();

        let first = register_all(&scheduler, default_definitions()).await;
        assert!(first.iter().all(|r| matches!(r, Registration::Created(_))));

        let second = register_all(&scheduler, default_definitions()).await;
        assert_eq!(
            second,
            vec![
                Registration::AlreadyRegistered("schedule_every_5s".to_string()),
                Registration::AlreadyRegistered("schedule_business_hourly".to_string()),
                Registration::AlreadyRegistered("schedule_custom".to_string()),
            ]
        );
        assert_eq!(scheduler.list().await.len(), 3);
    }

    #[tokio::test]
    async fn failed_registration_does_not_stop_the_rest() {
        let scheduler = InMemoryScheduler::new();
        let mut definitions = default_definitions();
        definitions[0].spec = ScheduleSpec::default();

        let registrations = register_all(&scheduler, definitions).await;
        assert!(matches!(
            &registrations[0],
            Registration::Failed { error: ScheduleError::Invalid(_), .. }
        ));
        assert_eq!(
            registrations[1],
            Registration::Created("schedule_business_hourly".to_string())
        );
        assert_eq!(scheduler.list().await.len(), 2);
    }
}
