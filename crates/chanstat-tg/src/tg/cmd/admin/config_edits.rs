//! Editing the groups, channels, spreadsheets and admins from the chat

use crate::config::{AppConfig, ChannelId, ConfigEdit, ConfigEditError, EditOutcome, GroupKey};
use crate::prelude::*;
use crate::util::DynResult;
use crate::{tg, Error, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use teloxide::utils::markdown;

const GROUPS_PER_PAGE: usize = 15;

pub(super) async fn edit_config(ctx: &tg::Ctx, msg: &Message, edit: ConfigEdit) -> Result {
    let (_, outcome) = ctx.config.edit(&edit).await?;

    ctx.bot
        .reply_to(msg, markdown::escape(&describe_edit(&edit, &outcome)))
        .await?;

    Ok(())
}

pub(super) async fn reply_groups_page(ctx: &tg::Ctx, msg: &Message) -> Result {
    let (text, keyboard) = render_groups_page(&ctx.config.get(), 0);

    let mut request = ctx.bot.reply_to(msg, text);
    if let Some(keyboard) = keyboard {
        request = request.reply_markup(keyboard);
    }
    request.await?;

    Ok(())
}

pub(super) fn render_admins(config: &AppConfig) -> String {
    let admins = if config.admins.is_empty() {
        "no admins".to_owned()
    } else {
        config.admins.iter().join("\n")
    };
    markdown::code_block(&markdown::escape_code(&admins))
}

/// `<user_id>`
pub(super) fn parse_user_id(args: &str) -> Result<UserId, ConfigEditError> {
    let input = single_arg(args, "/add_admin <user_id> or /del_admin <user_id>")?;
    input
        .parse()
        .map(UserId)
        .map_err(|_| ConfigEditError::BadId {
            input: input.to_owned(),
        })
}

/// `<group_key> <chat_id> [name]`, the name defaults to the key
pub(super) fn parse_new_group(args: &str) -> Result<ConfigEdit, ConfigEditError> {
    let usage = ConfigEditError::Usage {
        usage: "/add_group <group_key> <chat_id> [name]",
    };

    let (key, rest) = split_first(args).ok_or(usage)?;
    let (chat, name) = split_first(rest).unwrap_or((rest, ""));

    let tg_group = chat.parse().map(ChatId).map_err(|_| ConfigEditError::BadId {
        input: chat.to_owned(),
    })?;

    let name = if name.is_empty() { key } else { name };

    Ok(ConfigEdit::AddGroup {
        key: key.into(),
        name: name.to_owned(),
        tg_group,
    })
}

/// `<group_key>`
pub(super) fn parse_group_key(args: &str) -> Result<GroupKey, ConfigEditError> {
    single_arg(args, "/del_group <group_key> or /del_sheet <group_key>").map(GroupKey::from)
}

/// `<group_key> <channel ids>`
pub(super) fn parse_group_channels(
    args: &str,
) -> Result<(GroupKey, Vec<ChannelId>), ConfigEditError> {
    let usage = ConfigEditError::Usage {
        usage: "/add_channels <group_key> <channel ids> or /del_channels <group_key> <channel ids>",
    };

    let (key, rest) = split_first(args).ok_or(usage)?;
    let channels = parse_channel_ids(rest);

    if channels.is_empty() {
        return Err(ConfigEditError::Usage {
            usage: "at least one channel id is required",
        });
    }

    Ok((key.into(), channels))
}

/// `<group_key> <spreadsheet_id>`
pub(super) fn parse_spreadsheet(args: &str) -> Result<ConfigEdit, ConfigEditError> {
    let usage = || ConfigEditError::Usage {
        usage: "/set_sheet <group_key> <spreadsheet_id>",
    };

    let (key, spreadsheet_id) = split_first(args).ok_or_else(usage)?;
    if spreadsheet_id.contains(char::is_whitespace) {
        return Err(usage());
    }

    Ok(ConfigEdit::SetSpreadsheet {
        group: key.into(),
        spreadsheet_id: spreadsheet_id.to_owned(),
    })
}

/// Channel ids may be separated with spaces, new lines, `|` or `,`,
/// and may be listed with `•` bullets
fn parse_channel_ids(text: &str) -> Vec<ChannelId> {
    text.split(|c: char| c.is_whitespace() || matches!(c, '|' | ',' | '•'))
        .filter(|id| !id.is_empty())
        .map(ChannelId::from)
        .collect()
}

/// First word and the trimmed rest of the text. `None` if the rest is empty.
fn split_first(text: &str) -> Option<(&str, &str)> {
    let (first, rest) = text.trim().split_once(char::is_whitespace)?;
    Some((first, rest.trim()))
}

fn single_arg<'a>(args: &'a str, usage: &'static str) -> Result<&'a str, ConfigEditError> {
    let mut words = args.split_whitespace();
    match (words.next(), words.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(ConfigEditError::Usage { usage }),
    }
}

fn describe_edit(edit: &ConfigEdit, outcome: &EditOutcome) -> String {
    let list = |channels: &[ChannelId]| channels.iter().join(", ");

    match edit {
        ConfigEdit::AddAdmin(id) => format!("User {id} is now an admin ✔️"),
        ConfigEdit::RemoveAdmin(id) => format!("User {id} is no longer an admin ✔️"),
        ConfigEdit::AddGroup { key, tg_group, .. } => format!(
            "Group {key} was added ✔️ Its reports go to the chat {tg_group}. \
            Add its channels with /add_channels {key} <channel ids>"
        ),
        ConfigEdit::RemoveGroup(key) => format!("Group {key} was removed ✔️"),
        ConfigEdit::AddChannels { group, .. } | ConfigEdit::RemoveChannels { group, .. } => {
            let (verb, skip_reason) = match edit {
                ConfigEdit::AddChannels { .. } => ("added to", "already in the group"),
                _ => ("removed from", "not in the group"),
            };

            let mut lines = vec![format!(
                "Channels {verb} {group}: {}",
                outcome.changed.len()
            )];

            if !outcome.changed.is_empty() {
                lines.push(list(&outcome.changed));
            }
            if !outcome.skipped.is_empty() {
                lines.push(format!(
                    "Skipped as {skip_reason}: {}",
                    list(&outcome.skipped)
                ));
            }

            lines.join("\n")
        }
        ConfigEdit::SetSpreadsheet {
            group,
            spreadsheet_id,
        } => format!("Reports of {group} will be written to the spreadsheet {spreadsheet_id} ✔️"),
        ConfigEdit::RemoveSpreadsheet(group) => {
            format!("Reports of {group} will no longer be written to Google Sheets ✔️")
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum AdminCallback {
    GroupsPage { page: usize },
}

/// The page is clamped to the last one, the number of groups may
/// have changed since the buttons were sent
fn render_groups_page(config: &AppConfig, page: usize) -> (String, Option<InlineKeyboardMarkup>) {
    let total = config.groups.len();
    if total == 0 {
        let text = "No groups are configured. Add one with /add_group <group_key> <chat_id> [name]";
        return (markdown::escape(text), None);
    }

    let pages = total.div_ceil(GROUPS_PER_PAGE);
    let page = page.min(pages - 1);

    let spreadsheets = config
        .google_sheets
        .as_ref()
        .map(|sheets| &sheets.group_spreadsheets);

    let groups = config
        .groups
        .iter()
        .skip(page * GROUPS_PER_PAGE)
        .take(GROUPS_PER_PAGE)
        .map(|(key, group)| {
            let channels = if group.channel_ids.is_empty() {
                "none".to_owned()
            } else {
                group.channel_ids.iter().join(", ")
            };

            let spreadsheet = spreadsheets
                .and_then(|spreadsheets| spreadsheets.get(key))
                .map(String::as_str)
                .unwrap_or("none");

            format!(
                "{key}: {} (chat {})\n  channels: {channels}\n  spreadsheet: {spreadsheet}",
                group.name, group.tg_group,
            )
        })
        .join("\n");

    let text = format!("page {}/{pages}, groups: {total}\n{groups}", page + 1);
    let text = markdown::code_block(&markdown::escape_code(&text));

    if pages == 1 {
        return (text, None);
    }

    let button = |label: &str, page: usize| {
        let payload = AdminCallback::GroupsPage { page };
        let payload = serde_json::to_string(&payload)
            .unwrap_or_else(|err| panic!("BUG: callback payload must serialize: {err}"));
        InlineKeyboardButton::callback(label, payload)
    };

    let buttons = [
        (page > 0).then(|| button("◀️", page - 1)),
        (page + 1 < pages).then(|| button("▶️", page + 1)),
    ];

    let keyboard = InlineKeyboardMarkup::new([buttons.into_iter().flatten()]);

    (text, Some(keyboard))
}

#[instrument(skip_all, fields(
    from = %callback_query.from.debug_id(),
    chat = callback_query.message.as_ref()
        .map(|msg| msg.chat().debug_id())
        .as_deref()
        .unwrap_or("{{unknown_chat}}"),
))]
pub(crate) async fn handle_callback_query(
    ctx: Arc<tg::Ctx>,
    callback_query: CallbackQuery,
) -> DynResult {
    async {
        debug!("Processing callback query");

        ctx.bot.answer_callback_query(callback_query.id.clone()).await?;

        let Some(data) = &callback_query.data else {
            warn!("Received empty callback data");
            return Ok(());
        };

        let Some(message) = &callback_query.message else {
            warn!("Received empty callback message");
            return Ok(());
        };

        let config = ctx.config.get();

        if !config.is_admin(callback_query.from.id) {
            info!("Non-admin user pressed an admin button");
            return Ok(());
        }

        let payload: AdminCallback = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(err = tracing_err(&err), %data, "Received malformed callback data");
                return Ok(());
            }
        };

        match payload {
            AdminCallback::GroupsPage { page } => {
                let (text, keyboard) = render_groups_page(&config, page);

                let mut request = ctx
                    .bot
                    .edit_message_text(message.chat().id, message.id(), text);

                if let Some(keyboard) = keyboard {
                    request = request.reply_markup(keyboard);
                }

                request.await?;
            }
        }

        Ok::<_, Error>(())
    }
    .await
    .map_err(Into::into)
}

/// Replies to a message forwarded to the bot in PM with the ids of its
/// origin, which is the simplest way to find out the id of a chat
#[instrument(skip_all, fields(from = msg.from.as_ref().map(|user| user.debug_id()).as_deref()))]
pub(crate) async fn handle_forwarded_message(ctx: Arc<tg::Ctx>, msg: Message) -> DynResult {
    async {
        let Some(origin) = msg.forward_origin() else {
            return Ok(());
        };

        let ids = tg::cmd::forward_origin_lines(origin).join("\n");

        ctx.bot
            .reply_to(&msg, markdown::code_block(&markdown::escape_code(&ids)))
            .await?;

        Ok::<_, Error>(())
    }
    .await
    .map_err(Into::into)
}
