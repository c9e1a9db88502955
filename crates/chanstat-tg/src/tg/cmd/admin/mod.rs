mod config_edits;

use super::ReportCommandError;
use crate::api::{SessionSnapshot, SessionState};
use crate::config::{ConfigEdit, GroupKey};
use crate::prelude::*;
use crate::report::Granularity;
use crate::schedule::{JobOutcome, JobState, JobStatus};
use crate::{err, tg, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

pub(crate) use config_edits::{handle_callback_query, handle_forwarded_message};

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "snake_case",
    description = "Commands for the bot admins only:"
)]
pub(crate) enum Cmd {
    #[command(description = "display this text")]
    AdminHelp,

    #[command(description = "re-read the config file")]
    Reload,

    #[command(description = "send the report of the group to all destinations: <group_key> [YYYY-MM-DD]")]
    Report(String),

    #[command(description = "display the API session and the state of the scheduled jobs")]
    Status,

    #[command(description = "display version info")]
    Version,

    #[command(description = "list the admins")]
    Admins,

    #[command(description = "add an admin: <user_id>")]
    AddAdmin(String),

    #[command(description = "remove an admin: <user_id>")]
    DelAdmin(String),

    #[command(description = "list the groups with their channels and spreadsheets")]
    Groups,

    #[command(description = "add a group: <group_key> <chat_id> [name]")]
    AddGroup(String),

    #[command(description = "remove a group: <group_key>")]
    DelGroup(String),

    #[command(
        description = "add channels to a group: <group_key> <channel ids separated \
        with spaces, new lines or |>"
    )]
    AddChannels(String),

    #[command(description = "remove channels from a group: <group_key> <channel ids>")]
    DelChannels(String),

    #[command(description = "write the reports of a group to a spreadsheet: <group_key> <spreadsheet_id>")]
    SetSheet(String),

    #[command(description = "stop writing the reports of a group to Google Sheets: <group_key>")]
    DelSheet(String),
}

pub(crate) fn filter(ctx: Arc<tg::Ctx>, msg: Message) -> bool {
    let config = ctx.config.get();
    matches!(&msg.from, Some(sender) if config.is_admin(sender.id))
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::AdminHelp => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
            }
            Cmd::Reload => {
                let config = ctx.config.reload().await?;

                let reply = format!(
                    "Config was reloaded ✔️ Groups: {}, admins: {}",
                    config.groups.len(),
                    config.admins.len()
                );

                ctx.bot.reply_to(msg, markdown::escape(&reply)).await?;
            }
            Cmd::Report(args) => {
                let (key, date) = parse_report_args(&args)?;

                let config = ctx.config.get();

                let group = config.groups.get(&key).ok_or_else(|| {
                    err!(ReportCommandError::UnknownGroup {
                        key: key.to_string(),
                        known: config.groups.keys().join(", "),
                    })
                })?;

                let today = Utc::now().with_timezone(&config.timezone).date_naive();
                let report_date = date.unwrap_or(today - Duration::days(1));

                let granularity = if report_date >= today {
                    Granularity::Hourly
                } else {
                    Granularity::Daily
                };

                let report = ctx
                    .scheduler
                    .run_manual((&key, group), report_date, granularity)
                    .await?;

                let reply = format!(
                    "The {granularity} report of {} for {report_date} was delivered ✔️ \
                    Channels: {}, missing: {}",
                    report.group_name,
                    report.channels.len(),
                    report.missing_channels.len(),
                );

                ctx.bot.reply_to(msg, markdown::escape(&reply)).await?;
            }
            Cmd::Status => {
                let config = ctx.config.get();
                let status = render_status(
                    &ctx.session.snapshot(),
                    &ctx.scheduler.status(),
                    config.timezone,
                );

                ctx.bot
                    .reply_to(msg, markdown::code_block(&markdown::escape_code(&status)))
                    .await?;
            }
            Cmd::Version => {
                /// Generate the key-value pairs with vergen metadata
                macro_rules! vergen_meta {
                    ( $($meta_name:literal),* $(,)? ) => {
                        [$( ($meta_name, env!(concat!("VERGEN_", $meta_name))) ),*]
                    }
                }

                let meta = vergen_meta![
                    "BUILD_TIMESTAMP",
                    "GIT_BRANCH",
                    "GIT_SHA",
                    "RUSTC_HOST_TRIPLE",
                    "RUSTC_SEMVER",
                    "CARGO_TARGET_TRIPLE",
                    "CARGO_OPT_LEVEL",
                ];

                let meta = [("VERSION", env!("CARGO_PKG_VERSION"))]
                    .into_iter()
                    .chain(meta);

                let max_name_len = meta.clone().map(|(name, _)| name.len()).max().unwrap_or(0);

                let metadata = meta.format_with("\n", |(name, val), f| {
                    let name = name.to_lowercase();
                    f(&format_args!("{name:<max_name_len$} = {val}"))
                });

                let metadata = markdown::code_block(&markdown::escape_code(&metadata.to_string()));

                ctx.bot.reply_to(msg, metadata).await?;
            }
            Cmd::Admins => {
                let admins = config_edits::render_admins(&ctx.config.get());
                ctx.bot.reply_to(msg, admins).await?;
            }
            Cmd::AddAdmin(args) => {
                let edit = ConfigEdit::AddAdmin(config_edits::parse_user_id(&args)?);
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::DelAdmin(args) => {
                let edit = ConfigEdit::RemoveAdmin(config_edits::parse_user_id(&args)?);
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::Groups => config_edits::reply_groups_page(ctx, msg).await?,
            Cmd::AddGroup(args) => {
                let edit = config_edits::parse_new_group(&args)?;
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::DelGroup(args) => {
                let edit = ConfigEdit::RemoveGroup(config_edits::parse_group_key(&args)?);
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::AddChannels(args) => {
                let (group, channels) = config_edits::parse_group_channels(&args)?;
                let edit = ConfigEdit::AddChannels { group, channels };
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::DelChannels(args) => {
                let (group, channels) = config_edits::parse_group_channels(&args)?;
                let edit = ConfigEdit::RemoveChannels { group, channels };
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::SetSheet(args) => {
                let edit = config_edits::parse_spreadsheet(&args)?;
                config_edits::edit_config(ctx, msg, edit).await?;
            }
            Cmd::DelSheet(args) => {
                let edit = ConfigEdit::RemoveSpreadsheet(config_edits::parse_group_key(&args)?);
                config_edits::edit_config(ctx, msg, edit).await?;
            }
        };

        Ok(())
    }
}

/// `<group_key> [YYYY-MM-DD]`
fn parse_report_args(
    args: &str,
) -> std::result::Result<(GroupKey, Option<NaiveDate>), ReportCommandError> {
    let mut args = args.split_whitespace();

    let key = args.next().ok_or(ReportCommandError::MissingGroup)?;

    let date = args
        .next()
        .map(|input| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|source| {
                ReportCommandError::BadDate {
                    input: input.to_owned(),
                    source,
                }
            })
        })
        .transpose()?;

    Ok((GroupKey::from(key), date))
}

fn render_status(
    session: &SessionSnapshot,
    jobs: &BTreeMap<&'static str, JobStatus>,
    tz: Tz,
) -> String {
    let time = |time: DateTime<Utc>| time.with_timezone(&tz).to_human_readable_with_offset();

    let session_state = match &session.state {
        SessionState::Unauthenticated => "not logged in".to_owned(),
        SessionState::Authenticating => "logging in".to_owned(),
        SessionState::Authenticated { expires_at } => {
            format!("authenticated until {}", time(*expires_at))
        }
        SessionState::Expired { expired_at } => format!("expired at {}", time(*expired_at)),
        SessionState::CredentialsRejected { message } => {
            format!("credentials rejected: {message}")
        }
    };

    let last_login = session
        .last_login_at
        .map(time)
        .unwrap_or_else(|| "never".to_owned());

    let mut lines = vec![
        format!("session: {session_state}"),
        format!("logins: {}, last login: {last_login}", session.logins),
    ];

    if jobs.is_empty() {
        lines.push("no jobs were scheduled yet".to_owned());
    }

    for (name, status) in jobs {
        let state = match &status.state {
            JobState::Disabled => "disabled".to_owned(),
            JobState::Idle {
                next_run: Some(next_run),
            } => format!("idle, next run at {}", time(*next_run)),
            JobState::Idle { next_run: None } => "idle".to_owned(),
            JobState::Running { since } => format!("running since {}", time(*since)),
        };

        lines.push(format!("{name}: {state}"));

        let Some(run) = &status.last_run else {
            continue;
        };

        lines.push(format!(
            "  last run: {}, date {}, started at {}, took {:.1?}",
            run.job,
            run.report_date,
            time(run.started_at),
            run.duration,
        ));

        let outcome = match &run.outcome {
            JobOutcome::Succeeded { groups } => format!("succeeded, {groups} groups"),
            JobOutcome::PartiallyFailed {
                failed_groups,
                succeeded,
            } => format!(
                "partially failed, {succeeded} succeeded, failed groups: {}",
                failed_groups.iter().join(", ")
            ),
            JobOutcome::Aborted { error_id } => format!("aborted, error id: {error_id}"),
        };

        lines.push(format!("  outcome: {outcome}"));
    }

    lines.join("\n")
}
