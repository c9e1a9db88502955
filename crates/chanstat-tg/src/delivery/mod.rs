//! Places where the finished reports are delivered

mod sheets;
mod telegram;

pub(crate) use sheets::*;
pub(crate) use telegram::*;

use crate::config::SinksConfig;
use crate::report::GroupReport;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub(crate) trait ReportSink: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn deliver(&self, report: &GroupReport) -> Result;
}

/// All sinks available to the process
#[derive(Clone)]
pub(crate) struct Sinks {
    pub(crate) telegram: Arc<dyn ReportSink>,

    /// Absent when Google Sheets aren't configured
    pub(crate) sheets: Option<Arc<dyn ReportSink>>,
}

impl Sinks {
    /// Sinks enabled for a specific job
    pub(crate) fn select(&self, config: SinksConfig) -> Vec<Arc<dyn ReportSink>> {
        let telegram = config.telegram.then(|| self.telegram.clone());
        let sheets = self.sheets.clone().filter(|_| config.sheets);

        telegram.into_iter().chain(sheets).collect()
    }

    /// Every available sink, used by the manual triggers
    pub(crate) fn all(&self) -> Vec<Arc<dyn ReportSink>> {
        self.select(SinksConfig {
            telegram: true,
            sheets: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::pipeline::tests::RecordingSink;

    #[test]
    fn sinks_are_selected_per_job() {
        let sinks = Sinks {
            telegram: Arc::new(RecordingSink::default()),
            sheets: Some(Arc::new(RecordingSink::default())),
        };

        let only_telegram = sinks.select(SinksConfig {
            telegram: true,
            sheets: false,
        });
        assert_eq!(only_telegram.len(), 1);
        assert_eq!(sinks.all().len(), 2);

        let without_sheets = Sinks {
            sheets: None,
            ..sinks
        };
        assert_eq!(without_sheets.all().len(), 1);
    }
}
