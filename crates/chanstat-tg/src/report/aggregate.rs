use super::{ChannelMetrics, ChannelRecord, Granularity, GroupReport};
use crate::api::RawAnalysisRecord;
use crate::config::{ChannelId, GroupConfig, GroupKey};
use crate::prelude::*;
use chrono::NaiveDate;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

/// An allow-listed channel is absent upstream. Not fatal, the report is
/// produced without it.
#[derive(Debug, thiserror::Error)]
#[error("Channel `{channel}` of group `{group}` is configured, but the API didn't report it")]
pub(crate) struct ConfigurationMismatch {
    pub(crate) group: GroupKey,
    pub(crate) channel: ChannelId,
}

impl From<&RawAnalysisRecord> for ChannelMetrics {
    fn from(record: &RawAnalysisRecord) -> Self {
        // `charge_withdraw_diff` is not trusted and is recomputed
        Self::new(
            record.new_member_count,
            record.new_member_recharge_count,
            record.new_member_recharge_amount,
            record.recharge_amount,
            record.withdraw_amount,
        )
    }
}

/// Folds the raw records into the report of a single group. Pure and
/// deterministic, several records of the same channel are summed up.
pub(crate) fn aggregate(
    raw_records: &[RawAnalysisRecord],
    (group_key, group): (&GroupKey, &GroupConfig),
    report_date: NaiveDate,
    granularity: Granularity,
) -> GroupReport {
    let mut by_channel: HashMap<&str, ChannelRecord> = HashMap::new();
    let mut dropped = BTreeSet::new();

    for record in raw_records {
        let name = record.package_name.as_str();

        if !group.channel_ids.iter().any(|id| id.as_str() == name) {
            dropped.insert(name);
            continue;
        }

        let metrics = ChannelMetrics::from(record);

        match by_channel.entry(name) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.metrics += &metrics;
                existing.channel_id = existing.channel_id.or(record.package_id);
            }
            Entry::Vacant(entry) => {
                entry.insert(ChannelRecord {
                    channel_id: record.package_id,
                    channel_name: ChannelId::from(name),
                    metrics,
                });
            }
        }
    }

    if !dropped.is_empty() {
        info!(
            group = %group_key,
            channels = ?dropped,
            "Dropping channels that are not allow-listed"
        );
    }

    let mut channels = Vec::with_capacity(group.channel_ids.len());
    let mut missing_channels = vec![];
    let mut totals = ChannelMetrics::default();

    for channel in &group.channel_ids {
        let Some(record) = by_channel.remove(channel.as_str()) else {
            let mismatch = ConfigurationMismatch {
                group: group_key.clone(),
                channel: channel.clone(),
            };
            warn!(err = tracing_err(&mismatch), "Channel is missing in the API response");
            missing_channels.push(channel.clone());
            continue;
        };

        totals += &record.metrics;
        channels.push(record);
    }

    GroupReport {
        group_key: group_key.clone(),
        group_name: group.name.clone(),
        tg_group: group.tg_group,
        report_date,
        granularity,
        channels,
        totals,
        missing_channels,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use teloxide::types::ChatId;

    pub(crate) fn raw(name: &str, registrations: u64, deposit: i64, withdraw: i64) -> RawAnalysisRecord {
        RawAnalysisRecord {
            package_id: None,
            package_name: name.to_owned(),
            new_member_count: registrations,
            new_member_recharge_count: registrations / 2,
            new_member_recharge_amount: Decimal::new(deposit, 1),
            recharge_amount: Decimal::from(deposit),
            withdraw_amount: Decimal::from(withdraw),
            charge_withdraw_diff: None,
        }
    }

    pub(crate) fn group(channels: &[&str]) -> GroupConfig {
        GroupConfig {
            name: "Alpha team".to_owned(),
            tg_group: ChatId(-1001),
            channel_ids: channels.iter().map(|&id| ChannelId::from(id)).collect(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test]
    fn only_allow_listed_channels_in_allow_list_order() {
        let records = [raw("C", 3, 300, 30), raw("B", 2, 200, 20), raw("A", 1, 100, 10)];
        let group = group(&["A", "C"]);
        let key = GroupKey::from("alpha");

        let report = aggregate(&records, (&key, &group), date(), Granularity::Daily);

        let names: Vec<_> = report
            .channels
            .iter()
            .map(|record| record.channel_name.as_str())
            .collect();

        assert_eq!(names, ["A", "C"]);

        let mut expected_totals = ChannelMetrics::from(&records[2]);
        expected_totals += &ChannelMetrics::from(&records[0]);

        assert_eq!(report.totals, expected_totals);
        assert_eq!(report.totals.new_registrations, 4);
        assert_eq!(report.totals.deposit_withdraw_diff, Decimal::from(360));
        assert!(report.missing_channels.is_empty());
    }

    #[test]
    fn stale_upstream_diff_is_recomputed() {
        let record = RawAnalysisRecord {
            charge_withdraw_diff: Some(Decimal::from(999_999)),
            ..raw("A", 1, 500, 120)
        };

        let report = aggregate(
            &[record],
            (&GroupKey::from("alpha"), &group(&["A"])),
            date(),
            Granularity::Hourly,
        );

        assert_eq!(report.channels[0].metrics.deposit_withdraw_diff, Decimal::from(380));
    }

    #[test]
    fn duplicate_rows_are_summed_and_missing_channels_listed() {
        let records = [
            RawAnalysisRecord {
                package_id: Some(7),
                ..raw("A", 1, 100, 10)
            },
            raw("A", 2, 50, 5),
        ];

        let report = aggregate(
            &records,
            (&GroupKey::from("alpha"), &group(&["B", "A"])),
            date(),
            Granularity::Daily,
        );

        assert_eq!(report.channels.len(), 1);

        let channel = &report.channels[0];
        assert_eq!(channel.channel_id, Some(7));
        assert_eq!(channel.metrics.new_registrations, 3);
        assert_eq!(channel.metrics.total_deposit_amount, Decimal::from(150));
        assert_eq!(channel.metrics.deposit_withdraw_diff, Decimal::from(135));
        assert_eq!(report.missing_channels, [ChannelId::from("B")]);
        assert_eq!(report.totals, channel.metrics);
    }

    #[test]
    fn empty_input_gives_empty_report() {
        let report = aggregate(
            &[],
            (&GroupKey::from("alpha"), &group(&[])),
            date(),
            Granularity::Daily,
        );

        assert!(report.channels.is_empty());
        assert_eq!(report.totals, ChannelMetrics::default());
    }

    #[test]
    fn dropped_channels_are_reported_once_at_info_level() {
        use std::sync::{Arc, Mutex};
        use tracing::field::{Field, Visit};
        use tracing_subscriber::layer::{Context, SubscriberExt};

        #[derive(Clone, Default)]
        struct Events(Arc<Mutex<Vec<(tracing::Level, String)>>>);

        struct Message<'a>(&'a mut String);

        impl Visit for Message<'_> {
            fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    *self.0 = format!("{value:?}");
                }
            }
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Events {
            fn on_event(&self, event: &tracing::Event<'_>, _: Context<'_, S>) {
                let mut message = String::new();
                event.record(&mut Message(&mut message));
                self.0
                    .lock()
                    .unwrap()
                    .push((*event.metadata().level(), message));
            }
        }

        let events = Events::default();
        let subscriber = tracing_subscriber::registry().with(events.clone());

        let records = [raw("X", 1, 1, 1), raw("A", 1, 1, 1), raw("X", 1, 1, 1), raw("Y", 1, 1, 1)];

        tracing::subscriber::with_default(subscriber, || {
            aggregate(
                &records,
                (&GroupKey::from("alpha"), &group(&["A"])),
                date(),
                Granularity::Daily,
            )
        });

        let events = events.0.lock().unwrap();
        let dropped: Vec<_> = events
            .iter()
            .filter(|(_, message)| message == "Dropping channels that are not allow-listed")
            .collect();

        assert_eq!(dropped.len(), 1, "{events:?}");
        assert_eq!(dropped[0].0, tracing::Level::INFO);
    }
}
