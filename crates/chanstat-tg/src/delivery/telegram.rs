use super::ReportSink;
use crate::prelude::*;
use crate::report::{ChannelMetrics, Granularity, GroupReport};
use crate::util::text::{chunk_lines, MAX_MESSAGE_CHARS};
use crate::{tg, Result};
use async_trait::async_trait;
use itertools::Itertools;
use teloxide::prelude::*;
use teloxide::utils::markdown;

const HEADER: [&str; 7] = [
    "Channel",
    "New",
    "Paying",
    "Paid amt",
    "Deposits",
    "Withdrawals",
    "Diff",
];

/// "```\n" + "\n```"
const CODE_BLOCK_OVERHEAD: usize = 8;

/// Sends the report to the chat of the group
pub(crate) struct TelegramSink {
    bot: tg::Bot,
}

impl TelegramSink {
    pub(crate) fn new(bot: tg::Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ReportSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, report: &GroupReport) -> Result {
        let messages = render_report(report);

        for message in &messages {
            self.bot.send_message(report.tg_group, message).await?;
        }

        debug!(
            chat = %report.tg_group,
            messages = messages.len(),
            "Report was sent to Telegram"
        );

        Ok(())
    }
}

/// Renders the report as MarkdownV2 messages that fit into the Telegram limit.
/// The table is never split in the middle of a row.
pub(crate) fn render_report(report: &GroupReport) -> Vec<String> {
    let title = match report.granularity {
        Granularity::Daily => format!("Daily report for {}", report.report_date),
        Granularity::Hourly => format!("Hourly report for {} (so far)", report.report_date),
    };

    let title = format!(
        "📊 {}\n{}",
        markdown::bold(&markdown::escape(&report.group_name)),
        markdown::escape(&title),
    );

    let table = render_table(report);

    let tables = chunk_lines(
        table.iter().map(String::as_str),
        MAX_MESSAGE_CHARS - CODE_BLOCK_OVERHEAD,
    )
    .into_iter()
    .map(|chunk| markdown::code_block(&markdown::escape_code(&chunk)));

    let missing = (!report.missing_channels.is_empty())
        .then(|| {
            let note = markdown::escape("⚠️ Channels not reported by the API:");
            let channels = report
                .missing_channels
                .iter()
                .map(|channel| markdown::escape(&format!("• {channel}")));

            std::iter::once(note).chain(channels)
        })
        .into_iter()
        .flatten();

    let blocks: Vec<String> = std::iter::once(title).chain(tables).chain(missing).collect();

    chunk_lines(blocks.iter().map(String::as_str), MAX_MESSAGE_CHARS)
}

fn render_table(report: &GroupReport) -> Vec<String> {
    let channels = report
        .channels
        .iter()
        .map(|record| metric_cells(record.channel_name.to_string(), &record.metrics));

    let header = HEADER.map(str::to_owned).to_vec();
    let totals = metric_cells("TOTAL".to_owned(), &report.totals);

    let rows: Vec<Vec<String>> = std::iter::once(header)
        .chain(channels)
        .chain([totals])
        .collect();

    let widths: Vec<usize> = (0..HEADER.len())
        .map(|column| {
            rows.iter()
                .map(|row| row[column].chars().count())
                .max()
                .unwrap_or_default()
        })
        .collect();

    let format_row = |row: &[String]| {
        row.iter()
            .zip(&widths)
            .enumerate()
            .map(|(column, (cell, &width))| {
                if column == 0 {
                    format!("{cell:<width$}")
                } else {
                    format!("{cell:>width$}")
                }
            })
            .join(" | ")
    };

    let separator = widths.iter().map(|&width| "-".repeat(width)).join("-+-");

    let (header, rest) = rows.split_first().expect("BUG: the header row is always present");
    let (totals, channels) = rest.split_last().expect("BUG: the totals row is always present");

    std::iter::once(format_row(header))
        .chain([separator.clone()])
        .chain(channels.iter().map(|row| format_row(row)))
        .chain([separator, format_row(totals)])
        .collect()
}

fn metric_cells(name: String, metrics: &ChannelMetrics) -> Vec<String> {
    vec![
        name,
        metrics.new_registrations.to_string(),
        metrics.new_paying_users.to_string(),
        format!("{:.2}", metrics.new_deposit_amount),
        format!("{:.2}", metrics.total_deposit_amount),
        format!("{:.2}", metrics.total_withdraw_amount),
        format!("{:.2}", metrics.deposit_withdraw_diff),
    ]
}
