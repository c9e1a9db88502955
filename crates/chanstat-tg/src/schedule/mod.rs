//! Wall-clock triggers of the report jobs

mod boundary;

pub(crate) use boundary::*;

use crate::api::Urgency;
use crate::config::{AppConfig, ConfigHandle, GroupConfig, GroupKey};
use crate::delivery::{ReportSink, Sinks};
use crate::prelude::*;
use crate::report::{Granularity, GroupReport, ReportPipeline};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use futures::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;

/// How often a waiting job looks at the config to notice that it was
/// reloaded or the job was enabled.
const CONFIG_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Source of the current time
type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobTarget {
    AllGroups,
    Group(GroupKey),
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::AllGroups => f.write_str("all groups"),
            JobTarget::Group(key) => write!(f, "group `{key}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduleJob {
    pub(crate) trigger: Trigger,
    pub(crate) target: JobTarget,
}

impl fmt::Display for ScheduleJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.trigger, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Succeeded {
        groups: usize,
    },
    PartiallyFailed {
        failed_groups: Vec<GroupKey>,
        succeeded: usize,
    },

    /// The run was stopped without finishing all groups
    Aborted {
        error_id: String,
    },
}

impl JobOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded { .. } => "succeeded",
            JobOutcome::PartiallyFailed { .. } => "partially_failed",
            JobOutcome::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct JobRecord {
    pub(crate) job: ScheduleJob,
    pub(crate) report_date: NaiveDate,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) duration: Duration,
    pub(crate) outcome: JobOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobState {
    Disabled,
    Idle { next_run: Option<DateTime<Utc>> },
    Running { since: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub(crate) struct JobStatus {
    pub(crate) state: JobState,
    pub(crate) last_run: Option<JobRecord>,
}

pub(crate) struct Scheduler {
    config: Arc<ConfigHandle>,
    pipeline: Arc<ReportPipeline>,
    sinks: Sinks,

    /// Keyed by `daily`, `hourly` and `manual`
    status: parking_lot::Mutex<BTreeMap<&'static str, JobStatus>>,

    clock: Clock,
}

impl Scheduler {
    pub(crate) fn new(config: Arc<ConfigHandle>, pipeline: Arc<ReportPipeline>, sinks: Sinks) -> Self {
        Self {
            config,
            pipeline,
            sinks,
            status: Default::default(),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    fn with_clock(self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Snapshot of the state of every job that ran or is scheduled
    pub(crate) fn status(&self) -> BTreeMap<&'static str, JobStatus> {
        self.status.lock().clone()
    }

    /// Runs the job loops until one of them fails. They only fail if the
    /// API credentials are rejected.
    pub(crate) async fn run(self: Arc<Self>) -> Result {
        let tasks = JobKind::iter().map(|kind| {
            let scheduler = self.clone();
            let span = info_span!("job", job = %kind);
            tokio::spawn(scheduler.job_loop(kind).instrument(span))
        });

        let (result, _, remaining) = future::select_all(tasks).await;

        remaining.iter().for_each(tokio::task::JoinHandle::abort);

        result.fatal_ctx(|| "Scheduler job task has panicked")?
    }

    async fn job_loop(self: Arc<Self>, kind: JobKind) -> Result {
        'schedule: loop {
            let config = self.config.get();

            let Some(trigger) = kind.trigger(&config.schedule) else {
                self.set_state(kind.name(), JobState::Disabled);
                tokio::time::sleep(CONFIG_RECHECK_INTERVAL).await;
                continue;
            };

            let now = self.now().with_timezone(&config.timezone);

            let Some(boundary) = next_boundary(now, trigger) else {
                warn!(%trigger, "Could not find the next boundary, checking again later");
                tokio::time::sleep(CONFIG_RECHECK_INTERVAL).await;
                continue;
            };

            self.set_state(
                kind.name(),
                JobState::Idle {
                    next_run: Some(boundary.with_timezone(&Utc)),
                },
            );

            info!(
                %trigger,
                next_run = %boundary.to_human_readable_with_offset(),
                "Waiting for the next run"
            );

            loop {
                let Ok(remaining) = (boundary.with_timezone(&Utc) - self.now()).to_std() else {
                    break;
                };
                if remaining.is_zero() {
                    break;
                }

                tokio::time::sleep(remaining.min(CONFIG_RECHECK_INTERVAL)).await;

                if !Arc::ptr_eq(&config, &self.config.get()) {
                    debug!("Config was reloaded, recomputing the next run");
                    continue 'schedule;
                }
            }

            let job = ScheduleJob {
                trigger,
                target: JobTarget::AllGroups,
            };

            self.run_cycle(kind, &job, kind.report_date(boundary), &config)
                .await?;
        }
    }

    /// Processes all groups with bounded parallelism. A failure of one group
    /// doesn't affect the others. Rejected credentials or a rejected fresh
    /// token stop the whole run, and only the former fails the scheduler.
    #[instrument(skip_all, fields(job = %job, %report_date))]
    pub(crate) async fn run_cycle(
        &self,
        kind: JobKind,
        job: &ScheduleJob,
        report_date: NaiveDate,
        config: &AppConfig,
    ) -> Result<JobOutcome> {
        let started_at = self.now();
        let start = Instant::now();

        self.set_state(kind.name(), JobState::Running { since: started_at });

        info!(groups = config.groups.len(), "Starting the job run");

        let sinks = self.sinks.select(kind.sinks(&config.schedule));
        let granularity = kind.granularity();

        let groups: Vec<_> = config
            .groups
            .iter()
            .map(|(key, group)| (key.clone(), group.clone()))
            .collect();

        let mut results = stream::iter(groups)
            .map(|(key, group)| self.run_group(key, group, report_date, granularity, &sinks))
            .buffer_unordered(config.parallelism);

        let mut failed_groups = vec![];
        let mut succeeded = 0;
        let mut aborted = None;

        while let Some((key, result)) = results.next().await {
            let Err(err) = result else {
                succeeded += 1;
                continue;
            };

            if err.is_credentials_invalid() {
                error!(
                    err = tracing_err(&err),
                    group = %key,
                    "API credentials were rejected, aborting the job"
                );
                aborted = Some(err);
                break;
            }

            if err.is_authentication() {
                error!(
                    err = tracing_err(&err),
                    group = %key,
                    "API rejected a fresh access token, aborting the job until the next run"
                );
                aborted = Some(err);
                break;
            }

            warn!(
                err = tracing_err(&err),
                group = %key,
                upstream_unavailable = err.is_upstream_unavailable(),
                "Group report failed"
            );
            failed_groups.push(key);
        }

        drop(results);

        failed_groups.sort();

        let outcome = match &aborted {
            Some(err) => JobOutcome::Aborted {
                error_id: err.id().to_owned(),
            },
            None if failed_groups.is_empty() => JobOutcome::Succeeded { groups: succeeded },
            None => JobOutcome::PartiallyFailed {
                failed_groups,
                succeeded,
            },
        };

        let duration = start.elapsed();

        let job_label = kind.name();
        metrics::increment_counter!(
            "report_job_runs_total",
            "job" => job_label,
            "outcome" => outcome.as_label(),
        );
        if let JobOutcome::PartiallyFailed { failed_groups, .. } = &outcome {
            metrics::counter!(
                "report_job_failed_groups_total",
                failed_groups.len() as u64,
                "job" => job_label,
            );
        }
        metrics::histogram!("report_job_duration_seconds", duration, "job" => job_label);

        info!(
            ?outcome,
            duration = tracing_duration(duration),
            "Job run finished"
        );

        self.finish(
            job_label,
            JobRecord {
                job: job.clone(),
                report_date,
                started_at,
                duration,
                outcome: outcome.clone(),
            },
        );

        match aborted {
            Some(err) if err.is_credentials_invalid() => Err(err),
            _ => Ok(outcome),
        }
    }

    async fn run_group(
        &self,
        key: GroupKey,
        group: GroupConfig,
        report_date: NaiveDate,
        granularity: Granularity,
        sinks: &[Arc<dyn ReportSink>],
    ) -> (GroupKey, Result<GroupReport>) {
        let result = self
            .pipeline
            .run_group(
                (&key, &group),
                report_date,
                granularity,
                Urgency::Background,
                sinks,
            )
            .await;

        (key, result)
    }

    /// Runs the report of one group right away and delivers it to all sinks
    #[instrument(skip_all, fields(group = %group_key, %report_date, %granularity))]
    pub(crate) async fn run_manual(
        &self,
        (group_key, group): (&GroupKey, &GroupConfig),
        report_date: NaiveDate,
        granularity: Granularity,
    ) -> Result<GroupReport> {
        let started_at = self.now();
        let start = Instant::now();

        let result = self
            .pipeline
            .run_group(
                (group_key, group),
                report_date,
                granularity,
                Urgency::Interactive,
                &self.sinks.all(),
            )
            .await;

        let outcome = match &result {
            Ok(_) => JobOutcome::Succeeded { groups: 1 },
            Err(_) => JobOutcome::PartiallyFailed {
                failed_groups: vec![group_key.clone()],
                succeeded: 0,
            },
        };

        metrics::increment_counter!(
            "report_job_runs_total",
            "job" => "manual",
            "outcome" => outcome.as_label(),
        );

        self.finish(
            "manual",
            JobRecord {
                job: ScheduleJob {
                    trigger: Trigger::Manual,
                    target: JobTarget::Group(group_key.clone()),
                },
                report_date,
                started_at,
                duration: start.elapsed(),
                outcome,
            },
        );

        result
    }

    fn set_state(&self, job: &'static str, state: JobState) {
        self.status
            .lock()
            .entry(job)
            .and_modify(|status| status.state = state.clone())
            .or_insert(JobStatus {
                state,
                last_run: None,
            });
    }

    fn finish(&self, job: &'static str, record: JobRecord) {
        let mut status = self.status.lock();
        let status = status.entry(job).or_insert(JobStatus {
            state: JobState::Idle { next_run: None },
            last_run: None,
        });

        if let JobState::Running { .. } = status.state {
            status.state = JobState::Idle { next_run: None };
        }
        status.last_run = Some(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::config::ChannelId;
    use crate::report::aggregate::tests::raw;
    use crate::report::pipeline::tests::{FakeSource, RecordingSink};
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use teloxide::types::ChatId;

    fn config() -> AppConfig {
        let mut config = sample();
        config.groups = [("g1", "A", -1), ("g2", "B", -2)]
            .into_iter()
            .map(|(key, channel, chat)| {
                let group = GroupConfig {
                    name: key.to_uppercase(),
                    tg_group: ChatId(chat),
                    channel_ids: vec![ChannelId::from(channel)],
                };
                (GroupKey::from(key), group)
            })
            .collect();
        config
    }

    fn scheduler(source: FakeSource, sink: Arc<RecordingSink>, config: &AppConfig) -> Scheduler {
        let handle = ConfigHandle::new("config.yaml".into(), config.clone());
        let sinks = Sinks {
            telegram: sink as Arc<dyn ReportSink>,
            sheets: None,
        };
        Scheduler::new(
            Arc::new(handle),
            Arc::new(ReportPipeline::new(Arc::new(source))),
            sinks,
        )
    }

    fn all_groups_job() -> ScheduleJob {
        ScheduleJob {
            trigger: Trigger::Daily {
                at: chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            },
            target: JobTarget::AllGroups,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn one_failing_group_does_not_stop_the_others() {
        let source = FakeSource {
            records: HashMap::from([("A".to_owned(), vec![raw("A", 5, 100, 10)])]),
            unavailable: vec!["B".to_owned()],
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let config = config();
        let scheduler = scheduler(source, sink.clone(), &config);

        let outcome = scheduler
            .run_cycle(JobKind::Daily, &all_groups_job(), date(), &config)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            JobOutcome::PartiallyFailed {
                failed_groups: vec![GroupKey::from("g2")],
                succeeded: 1,
            }
        );

        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].group_key, GroupKey::from("g1"));
        assert_eq!(delivered[0].totals.new_registrations, 5);

        let status = scheduler.status();
        let last_run = status["daily"].last_run.as_ref().unwrap();
        assert_eq!(last_run.outcome, outcome);
        assert_eq!(last_run.report_date, date());
    }

    #[test_log::test(tokio::test)]
    async fn rejected_credentials_abort_the_job() {
        let source = FakeSource {
            credentials_rejected: true,
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let config = config();
        let scheduler = scheduler(source, sink.clone(), &config);

        let err = scheduler
            .run_cycle(JobKind::Hourly, &all_groups_job(), date(), &config)
            .await
            .unwrap_err();

        assert!(err.is_credentials_invalid());
        assert!(sink.delivered.lock().is_empty());

        let status = scheduler.status();
        assert_matches!(
            &status["hourly"].last_run.as_ref().unwrap().outcome,
            JobOutcome::Aborted { error_id } if error_id == err.id()
        );
    }

    #[test_log::test(tokio::test)]
    async fn rejected_fresh_token_stops_the_run_but_not_the_scheduler() {
        let source = Arc::new(FakeSource {
            token_rejected: true,
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let mut config = config();
        config.parallelism = 1;
        config.groups.insert(
            GroupKey::from("g3"),
            GroupConfig {
                name: "G3".to_owned(),
                tg_group: ChatId(-3),
                channel_ids: vec![ChannelId::from("C")],
            },
        );

        let scheduler = Scheduler::new(
            Arc::new(ConfigHandle::new("config.yaml".into(), config.clone())),
            Arc::new(ReportPipeline::new(source.clone())),
            Sinks {
                telegram: sink.clone(),
                sheets: None,
            },
        );

        let outcome = scheduler
            .run_cycle(JobKind::Daily, &all_groups_job(), date(), &config)
            .await
            .unwrap();

        assert_matches!(outcome, JobOutcome::Aborted { .. });
        assert_eq!(source.calls.lock().len(), 1);
        assert!(sink.delivered.lock().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn job_loop_runs_the_job_at_the_boundary() {
        let source = FakeSource {
            records: HashMap::from([("A".to_owned(), vec![raw("A", 5, 100, 10)])]),
            ..Default::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let config = config();

        // 15:30 in Kolkata, the hourly job runs at minute 5
        let origin = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let started = tokio::time::Instant::now();
        let clock = move || origin + chrono::Duration::from_std(started.elapsed()).unwrap();

        let scheduler = Arc::new(scheduler(source, sink.clone(), &config).with_clock(clock));

        let task = tokio::spawn(scheduler.clone().job_loop(JobKind::Hourly));

        tokio::time::sleep(Duration::from_secs(34 * 60)).await;

        assert!(sink.delivered.lock().is_empty());
        assert_eq!(
            scheduler.status()["hourly"].state,
            JobState::Idle {
                next_run: Some(Utc.with_ymd_and_hms(2025, 3, 1, 10, 35, 0).unwrap()),
            }
        );

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;

        assert_eq!(sink.delivered.lock().len(), 2);

        let status = scheduler.status();
        let last_run = status["hourly"].last_run.as_ref().unwrap();
        assert_eq!(last_run.report_date, date());
        assert_eq!(last_run.outcome, JobOutcome::Succeeded { groups: 2 });
        assert_eq!(
            status["hourly"].state,
            JobState::Idle {
                next_run: Some(Utc.with_ymd_and_hms(2025, 3, 1, 11, 35, 0).unwrap()),
            }
        );

        task.abort();
    }

    #[test_log::test(tokio::test)]
    async fn disabled_sinks_are_not_used() {
        let source = FakeSource::default();
        let sink = Arc::new(RecordingSink::default());
        let mut config = config();
        config.schedule.hourly.sinks.telegram = false;
        let scheduler = scheduler(source, sink.clone(), &config);

        let outcome = scheduler
            .run_cycle(JobKind::Hourly, &all_groups_job(), date(), &config)
            .await
            .unwrap();

        assert_eq!(outcome, JobOutcome::Succeeded { groups: 2 });
        assert!(sink.delivered.lock().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn manual_run_is_interactive() {
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(RecordingSink::default());
        let config = config();

        let scheduler = Scheduler::new(
            Arc::new(ConfigHandle::new("config.yaml".into(), config.clone())),
            Arc::new(ReportPipeline::new(source.clone())),
            Sinks {
                telegram: sink.clone(),
                sheets: None,
            },
        );

        let key = GroupKey::from("g1");
        let report = scheduler
            .run_manual((&key, &config.groups[&key]), date(), Granularity::Daily)
            .await
            .unwrap();

        assert_eq!(report.group_key, key);
        assert_eq!(source.calls.lock()[0].2, Urgency::Interactive);
        assert_eq!(sink.delivered.lock().len(), 1);
        assert_matches!(
            scheduler.status()["manual"].last_run.as_ref().unwrap().outcome,
            JobOutcome::Succeeded { groups: 1 }
        );
    }
}
