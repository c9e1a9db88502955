use super::{aggregate, DateRange, Granularity, GroupReport, MetricsSource};
use crate::api::Urgency;
use crate::config::{GroupConfig, GroupKey};
use crate::delivery::ReportSink;
use crate::error::ErrorKind;
use crate::prelude::*;
use crate::{err, Result};
use chrono::NaiveDate;
use futures::prelude::*;
use std::sync::Arc;

/// Fetch, aggregate and deliver sequence shared by the scheduled jobs and
/// the chat commands
pub(crate) struct ReportPipeline {
    source: Arc<dyn MetricsSource>,
}

impl ReportPipeline {
    pub(crate) fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self { source }
    }

    #[instrument(skip_all, fields(group = %group_key, %report_date, %granularity))]
    pub(crate) async fn build_report(
        &self,
        (group_key, group): (&GroupKey, &GroupConfig),
        report_date: NaiveDate,
        granularity: Granularity,
        urgency: Urgency,
    ) -> Result<GroupReport> {
        if group.channel_ids.is_empty() {
            debug!("The group has no channels configured, skipping the fetch");
            return Ok(aggregate(&[], (group_key, group), report_date, granularity));
        }

        let raw = self
            .source
            .fetch_analysis(&group.channel_ids, DateRange::day(report_date), urgency)
            .await?;

        Ok(aggregate(&raw, (group_key, group), report_date, granularity))
    }

    /// Builds the report and hands it to every sink. A failure of one sink
    /// doesn't prevent delivery to the others.
    pub(crate) async fn run_group(
        &self,
        group: (&GroupKey, &GroupConfig),
        report_date: NaiveDate,
        granularity: Granularity,
        urgency: Urgency,
        sinks: &[Arc<dyn ReportSink>],
    ) -> Result<GroupReport> {
        let report = self
            .build_report(group, report_date, granularity, urgency)
            .await?;

        let report_ref = &report;

        let mut errs: Vec<_> = future::join_all(sinks.iter().map(|sink| async move {
            let result = sink
                .deliver(report_ref)
                .instrument(info_span!("deliver", sink = sink.name(), group = %report_ref.group_key))
                .await;

            if let Err(err) = &result {
                warn!(
                    err = tracing_err(err),
                    sink = sink.name(),
                    "Failed to deliver the report"
                );
            }
            result
        }))
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();

        match errs.len() {
            0 => Ok(report),
            1 => Err(errs.remove(0)),
            _ => Err(err!(ErrorKind::Multiple { errs })),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{ApiError, RawAnalysisRecord, SessionError};
    use crate::config::ChannelId;
    use crate::fatal;
    use crate::report::aggregate::tests::{group, raw};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Serves canned records per first allow-listed channel. Channels listed
    /// in `unavailable` fail as if the API timed out.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub(crate) records: HashMap<String, Vec<RawAnalysisRecord>>,
        pub(crate) unavailable: Vec<String>,
        pub(crate) credentials_rejected: bool,
        pub(crate) token_rejected: bool,
        pub(crate) calls: Mutex<Vec<(Vec<ChannelId>, DateRange, Urgency)>>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn fetch_analysis(
            &self,
            channel_filter: &[ChannelId],
            range: DateRange,
            urgency: Urgency,
        ) -> Result<Vec<RawAnalysisRecord>> {
            self.calls
                .lock()
                .push((channel_filter.to_vec(), range, urgency));

            if self.credentials_rejected {
                return Err(err!(SessionError::CredentialsInvalid {
                    message: "invalid TOTP code".to_owned(),
                }));
            }

            if self.token_rejected {
                return Err(err!(ApiError::Authentication {
                    endpoint: "/api/Package/GetPageList",
                }));
            }

            let key = channel_filter[0].as_str();

            if self.unavailable.iter().any(|channel| channel == key) {
                return Err(err!(ApiError::UpstreamUnavailable {
                    endpoint: "/api/RptDataAnalysis/GetPackageAnalysis",
                    source: fatal!("operation timed out"),
                }));
            }

            Ok(self.records.get(key).cloned().unwrap_or_default())
        }
    }

    /// Remembers every delivered report
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) delivered: Mutex<Vec<GroupReport>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, report: &GroupReport) -> Result {
            if self.fail {
                return Err(fatal!("sink is broken"));
            }
            self.delivered.lock().push(report.clone());
            Ok(())
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn one_failing_sink_does_not_block_the_others() {
        let source = FakeSource {
            records: HashMap::from([("A".to_owned(), vec![raw("A", 1, 10, 1)])]),
            ..Default::default()
        };
        let pipeline = ReportPipeline::new(Arc::new(source));

        let broken = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn ReportSink>> = vec![broken, healthy.clone()];

        let key = GroupKey::from("alpha");
        let group = group(&["A"]);

        let err = pipeline
            .run_group(
                (&key, &group),
                date(),
                Granularity::Daily,
                Urgency::Background,
                &sinks,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("sink is broken"), "{err}");
        assert_eq!(healthy.delivered.lock().len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn group_without_channels_is_not_fetched() {
        let source = Arc::new(FakeSource::default());
        let pipeline = ReportPipeline::new(source.clone());

        let key = GroupKey::from("empty");
        let report = pipeline
            .build_report(
                (&key, &group(&[])),
                date(),
                Granularity::Hourly,
                Urgency::Interactive,
            )
            .await
            .unwrap();

        assert!(report.channels.is_empty());
        assert!(source.calls.lock().is_empty());
    }
}
