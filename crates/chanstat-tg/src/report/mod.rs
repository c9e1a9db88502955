//! Turning raw backend records into per-group reports

pub(crate) mod aggregate;
mod model;
pub(crate) mod pipeline;

pub(crate) use aggregate::*;
pub(crate) use model::*;
pub(crate) use pipeline::*;

use crate::api::{RawAnalysisRecord, Urgency};
use crate::config::ChannelId;
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt;

/// Where the raw channel metrics come from
#[async_trait]
pub(crate) trait MetricsSource: Send + Sync {
    /// Records of the channels from `channel_filter` for the given date range
    async fn fetch_analysis(
        &self,
        channel_filter: &[ChannelId],
        range: DateRange,
        urgency: Urgency,
    ) -> Result<Vec<RawAnalysisRecord>>;
}

/// Inclusive range of dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DateRange {
    pub(crate) start: NaiveDate,
    pub(crate) end: NaiveDate,
}

impl DateRange {
    pub(crate) fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            return write!(f, "{}", self.start);
        }
        write!(f, "{}..={}", self.start, self.end)
    }
}
