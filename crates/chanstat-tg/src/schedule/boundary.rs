use crate::config::{ScheduleConfig, SinksConfig};
use crate::report::Granularity;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use std::fmt;

/// When a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Every day at the given local time
    Daily { at: NaiveTime },

    /// Every hour at the given minute
    Hourly { minute: u32 },

    /// Only on request
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Daily { at } => write!(f, "daily at {}", at.format("%H:%M")),
            Trigger::Hourly { minute } => write!(f, "hourly at minute {minute}"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// How many local candidates are inspected before giving up. Covers the
/// DST gaps and the days that don't have the given local time at all.
const MAX_CANDIDATES: u32 = 72;

/// The first boundary strictly after `now`. Boundaries that fall into a DST
/// gap are moved forward by an hour, ambiguous ones resolve to the earliest
/// instant.
pub(crate) fn next_boundary(now: DateTime<Tz>, trigger: Trigger) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let local_now = now.naive_local();

    let (first, step) = match trigger {
        Trigger::Manual => return None,
        Trigger::Daily { at } => (local_now.date().and_time(at), Duration::days(1)),
        Trigger::Hourly { minute } => {
            let hour_start = local_now.date().and_hms_opt(local_now.hour(), 0, 0)?;
            (hour_start + Duration::minutes(minute.into()), Duration::hours(1))
        }
    };

    (0..MAX_CANDIDATES)
        .map(|i| first + step * i as i32)
        .filter_map(|candidate| resolve_local(tz, candidate))
        .find(|boundary| *boundary > now)
}

fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
}

/// Scheduled jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::IntoStaticStr, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum JobKind {
    /// Reports yesterday once a day
    Daily,

    /// Reports today so far every hour
    Hourly,
}

impl JobKind {
    pub(crate) fn name(self) -> &'static str {
        self.into()
    }

    pub(crate) fn granularity(self) -> Granularity {
        match self {
            JobKind::Daily => Granularity::Daily,
            JobKind::Hourly => Granularity::Hourly,
        }
    }

    /// `None` if the job is disabled
    pub(crate) fn trigger(self, config: &ScheduleConfig) -> Option<Trigger> {
        match self {
            JobKind::Daily => config.daily.enabled.then_some(Trigger::Daily {
                at: config.daily.send_time.0,
            }),
            JobKind::Hourly => config.hourly.enabled.then_some(Trigger::Hourly {
                minute: config.hourly.minute,
            }),
        }
    }

    pub(crate) fn sinks(self, config: &ScheduleConfig) -> SinksConfig {
        match self {
            JobKind::Daily => config.daily.sinks,
            JobKind::Hourly => config.hourly.sinks,
        }
    }

    /// The date the run at the given boundary reports
    pub(crate) fn report_date(self, boundary: DateTime<Tz>) -> NaiveDate {
        let today = boundary.date_naive();
        match self {
            JobKind::Daily => today.pred_opt().unwrap_or(today),
            JobKind::Hourly => today,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Kolkata;
    use chrono_tz::Europe::Berlin;

    fn at(tz: Tz, text: &str) -> DateTime<Tz> {
        let local = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap();
        tz.from_local_datetime(&local).earliest().unwrap()
    }

    fn daily(time: &str) -> Trigger {
        Trigger::Daily {
            at: NaiveTime::parse_from_str(time, "%H:%M").unwrap(),
        }
    }

    fn next(now: DateTime<Tz>, trigger: Trigger) -> String {
        next_boundary(now, trigger)
            .unwrap()
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string()
    }

    #[test]
    fn daily_boundary_is_strictly_after_now() {
        let trigger = daily("18:00");

        assert_eq!(next(at(Kolkata, "2025-03-01 17:59:59"), trigger), "2025-03-01 18:00:00 IST");
        assert_eq!(next(at(Kolkata, "2025-03-01 18:00:00"), trigger), "2025-03-02 18:00:00 IST");
        assert_eq!(next(at(Kolkata, "2025-03-01 23:00:00"), trigger), "2025-03-02 18:00:00 IST");
    }

    #[test]
    fn hourly_boundary_is_strictly_after_now() {
        let trigger = Trigger::Hourly { minute: 5 };

        assert_eq!(next(at(Kolkata, "2025-03-01 10:04:59"), trigger), "2025-03-01 10:05:00 IST");
        assert_eq!(next(at(Kolkata, "2025-03-01 10:05:00"), trigger), "2025-03-01 11:05:00 IST");
        assert_eq!(next(at(Kolkata, "2025-03-01 23:30:00"), trigger), "2025-03-02 00:05:00 IST");
    }

    #[test]
    fn boundary_in_dst_gap_is_moved_forward() {
        // 02:30 doesn't exist in Berlin on 2025-03-30
        let boundary = next(at(Berlin, "2025-03-29 12:00:00"), daily("02:30"));
        assert_eq!(boundary, "2025-03-30 03:30:00 CEST");

        let boundary = next(at(Berlin, "2025-03-30 01:45:00"), Trigger::Hourly { minute: 30 });
        assert_eq!(boundary, "2025-03-30 03:30:00 CEST");
    }

    #[test]
    fn manual_trigger_has_no_boundary() {
        assert_eq!(next_boundary(at(Kolkata, "2025-03-01 10:00:00"), Trigger::Manual), None);
    }

    #[test]
    fn daily_reports_yesterday_and_hourly_reports_today() {
        let boundary = at(Kolkata, "2025-03-01 18:00:00");

        assert_eq!(JobKind::Daily.report_date(boundary).to_string(), "2025-02-28");
        assert_eq!(JobKind::Hourly.report_date(boundary).to_string(), "2025-03-01");
    }

    #[test]
    fn disabled_jobs_have_no_trigger() {
        let mut config = ScheduleConfig::default();
        config.hourly.enabled = false;

        assert_eq!(JobKind::Daily.trigger(&config), Some(daily("18:00")));
        assert_eq!(JobKind::Hourly.trigger(&config), None);
    }
}
