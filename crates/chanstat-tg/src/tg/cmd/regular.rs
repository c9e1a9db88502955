use super::{reply_all, ReportCommandError};
use crate::api::Urgency;
use crate::config::{GroupConfig, GroupKey};
use crate::delivery::render_report;
use crate::prelude::*;
use crate::report::{Granularity, ReportPipeline};
use crate::{err, tg, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "snake_case",
    description = "The following commands are available:"
)]
pub(crate) enum Cmd {
    #[command(description = "display this text")]
    Help,

    #[command(
        description = "display the id of this chat and your user id, in a reply \
        to a forwarded message also the ids of its origin"
    )]
    Getid,

    #[command(description = "today's report so far for the groups of this chat")]
    Today,

    #[command(description = "yesterday's report for the groups of this chat")]
    Yesterday,
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::Help => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
            }
            Cmd::Getid => {
                let user = msg
                    .from
                    .as_ref()
                    .map(|user| user.id.to_string())
                    .unwrap_or_else(|| "{unknown}".to_owned());

                let mut ids = vec![
                    format!("chat_id = {}", msg.chat.id),
                    format!("user_id = {user}"),
                ];

                let origin = msg
                    .reply_to_message()
                    .and_then(|replied| replied.forward_origin());

                if let Some(origin) = origin {
                    ids.extend(super::forward_origin_lines(origin));
                }

                let ids = ids.join("\n");

                ctx.bot
                    .reply_to(msg, markdown::code_block(&markdown::escape_code(&ids)))
                    .await?;
            }
            Cmd::Today => reply_chat_reports(ctx, msg, Granularity::Hourly).await?,
            Cmd::Yesterday => reply_chat_reports(ctx, msg, Granularity::Daily).await?,
        }
        Ok(())
    }
}

/// Builds the reports of every group bound to the chat and replies with them.
/// The reports are not written to the other sinks.
async fn reply_chat_reports(ctx: &tg::Ctx, msg: &Message, granularity: Granularity) -> Result {
    let config = ctx.config.get();

    let keys = config.groups_for_chat(msg.chat.id);

    if keys.is_empty() {
        return Err(err!(ReportCommandError::ChatNotConfigured { chat: msg.chat.id }));
    }

    let today = Utc::now().with_timezone(&config.timezone).date_naive();
    let report_date = match granularity {
        Granularity::Hourly => today,
        Granularity::Daily => today - Duration::days(1),
    };

    let groups = keys
        .iter()
        .filter_map(|key| Some((key, config.groups.get(key)?)))
        .collect();

    let replies = chat_replies(&ctx.pipeline, groups, report_date, granularity).await;

    reply_all(ctx, msg, &replies).await
}

/// Rendered reports of the groups. A group that failed gets a short note
/// instead, so that the other groups are still reported.
async fn chat_replies(
    pipeline: &ReportPipeline,
    groups: Vec<(&GroupKey, &GroupConfig)>,
    report_date: NaiveDate,
    granularity: Granularity,
) -> Vec<String> {
    let mut replies = vec![];
    let mut failures = vec![];

    for (key, group) in groups {
        let result = pipeline
            .build_report((key, group), report_date, granularity, Urgency::Interactive)
            .await;

        match result {
            Ok(report) => replies.extend(render_report(&report)),
            Err(err) => {
                warn!(err = tracing_err(&err), group = %key, "Group report failed");
                failures.push(failure_note(&group.name, &err));
            }
        }
    }

    replies.extend(failures);
    replies
}

fn failure_note(group_name: &str, err: &crate::Error) -> String {
    let reason = if err.is_upstream_unavailable() {
        "the API is unavailable"
    } else if err.is_credentials_invalid() {
        "the API rejected the login credentials"
    } else {
        "the report failed"
    };

    format!(
        "⚠️ {}: {}",
        markdown::bold(&markdown::escape(group_name)),
        markdown::escape(&format!("{reason} (error id: {})", err.id())),
    )
}
