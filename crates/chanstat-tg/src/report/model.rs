use crate::config::{ChannelId, GroupKey};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::ops::AddAssign;
use teloxide::types::ChatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Granularity {
    /// Whole finished day
    Daily,

    /// Current day so far
    Hourly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ChannelMetrics {
    pub(crate) new_registrations: u64,
    pub(crate) new_paying_users: u64,
    pub(crate) new_deposit_amount: Decimal,
    pub(crate) total_deposit_amount: Decimal,
    pub(crate) total_withdraw_amount: Decimal,

    /// Always equals `total_deposit_amount - total_withdraw_amount`
    pub(crate) deposit_withdraw_diff: Decimal,
}

impl ChannelMetrics {
    pub(crate) fn new(
        new_registrations: u64,
        new_paying_users: u64,
        new_deposit_amount: Decimal,
        total_deposit_amount: Decimal,
        total_withdraw_amount: Decimal,
    ) -> Self {
        Self {
            new_registrations,
            new_paying_users,
            new_deposit_amount,
            total_deposit_amount,
            total_withdraw_amount,
            deposit_withdraw_diff: total_deposit_amount - total_withdraw_amount,
        }
    }
}

impl AddAssign<&ChannelMetrics> for ChannelMetrics {
    fn add_assign(&mut self, other: &ChannelMetrics) {
        *self = Self::new(
            self.new_registrations + other.new_registrations,
            self.new_paying_users + other.new_paying_users,
            self.new_deposit_amount + other.new_deposit_amount,
            self.total_deposit_amount + other.total_deposit_amount,
            self.total_withdraw_amount + other.total_withdraw_amount,
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelRecord {
    /// Upstream package id when known
    pub(crate) channel_id: Option<i64>,
    pub(crate) channel_name: ChannelId,
    pub(crate) metrics: ChannelMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GroupReport {
    pub(crate) group_key: GroupKey,
    pub(crate) group_name: String,

    /// Chat of the group where the report is delivered
    pub(crate) tg_group: ChatId,

    pub(crate) report_date: NaiveDate,
    pub(crate) granularity: Granularity,

    /// Allow-listed channels only, in the allow-list order
    pub(crate) channels: Vec<ChannelRecord>,

    /// Sum over `channels`
    pub(crate) totals: ChannelMetrics,

    /// Allow-listed channels that the API didn't report
    pub(crate) missing_channels: Vec<ChannelId>,
}
