pub(crate) mod admin;
pub(crate) mod regular;

use crate::prelude::*;
use crate::util::DynResult;
use crate::{tg, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use teloxide::macros::BotCommands;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageOrigin, User};
use teloxide::utils::markdown;

#[async_trait]
pub(crate) trait Command: fmt::Debug + Send + Sync + 'static {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result;
}

pub(crate) fn handle<'a, C: Command>(
) -> impl Fn(Arc<tg::Ctx>, Message, C) -> BoxFuture<'a, DynResult> {
    move |ctx, msg, cmd| {
        let info = info_span!(
            "handle_message",
            sender = msg.from.as_ref().map(User::debug_id).as_deref(),
            msg_text = msg.text(),
            chat = %msg.chat.debug_id(),
            cmd = format_args!("{cmd:#?}")
        );

        let fut = async move {
            debug!("Processing command");

            let result = cmd.handle(&ctx, &msg).await;
            if let Err(err) = &result {
                let span = warn_span!("err", err = tracing_err(err), id = err.id());
                async {
                    if !err.is_user_error() {
                        warn!("Command handler returned an error");
                    }

                    let reply_msg =
                        markdown::code_block(&markdown::escape_code(&err.display_chain().to_string()));

                    let msg_result = ctx.bot.reply_to(&msg, reply_msg).await;

                    if let Err(err) = msg_result {
                        warn!(
                            err = tracing_err(&err),
                            "Failed to reply with the error message to the user"
                        );
                    }
                }
                .instrument(span)
                .await;
            }
            result.map_err(Into::into)
        };

        Box::pin(fut.instrument(info))
    }
}

/// Sends the messages one by one as replies to the command
pub(crate) async fn reply_all(ctx: &tg::Ctx, msg: &Message, messages: &[String]) -> Result {
    for message in messages {
        ctx.bot.reply_to(msg, message).await?;
    }
    Ok(())
}

/// Ids of the chat or user the forwarded message came from, as
/// `key = value` lines
pub(crate) fn forward_origin_lines(origin: &MessageOrigin) -> Vec<String> {
    match origin {
        MessageOrigin::Channel {
            chat, message_id, ..
        } => vec![
            "origin = channel".to_owned(),
            format!("origin_chat_id = {}", chat.id),
            format!("origin_title = {}", chat.title().unwrap_or("{untitled}")),
            format!("origin_message_id = {}", message_id.0),
        ],
        MessageOrigin::Chat { sender_chat, .. } => vec![
            "origin = chat".to_owned(),
            format!("origin_chat_id = {}", sender_chat.id),
            format!(
                "origin_title = {}",
                sender_chat.title().unwrap_or("{untitled}")
            ),
        ],
        MessageOrigin::User { sender_user, .. } => {
            let mut lines = vec![
                "origin = user".to_owned(),
                format!("origin_user_id = {}", sender_user.id),
            ];
            if let Some(username) = &sender_user.username {
                lines.push(format!("origin_username = @{username}"));
            }
            lines
        }
        MessageOrigin::HiddenUser {
            sender_user_name, ..
        } => vec![
            "origin = hidden user".to_owned(),
            format!("origin_user_name = {sender_user_name}"),
        ],
    }
}

/// Errors caused by wrong input of the user
#[derive(Debug, thiserror::Error)]
pub(crate) enum ReportCommandError {
    #[error("Usage: /report <group_key> [YYYY-MM-DD]")]
    MissingGroup,

    #[error("Unknown group `{key}`, the known groups are: {known}")]
    UnknownGroup { key: String, known: String },

    #[error("Invalid date `{input}`, expected the format YYYY-MM-DD")]
    BadDate {
        input: String,
        source: chrono::ParseError,
    },

    #[error("No groups deliver their reports to this chat (chat id: {chat})")]
    ChatNotConfigured { chat: ChatId },
}

/// Special case for the `/start` command in PM with the bot.
///
/// We don't want this command to appear in the help message, so we handle
/// it separately
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case")]
pub(crate) enum StartCommand {
    #[command(description = "unreachable")]
    Start,
}

#[async_trait]
impl Command for StartCommand {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        regular::Cmd::Help.handle(ctx, msg).await
    }
}

pub(crate) fn filter_pm_with_bot(msg: Message) -> bool {
    msg.chat.is_private()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    fn origin(json: serde_json::Value) -> MessageOrigin {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn forward_origins() {
        let channel = origin(serde_json::json!({
            "type": "channel",
            "date": 1740787200,
            "chat": { "id": -1001234, "type": "channel", "title": "Daily numbers" },
            "message_id": 42,
        }));

        let user = origin(serde_json::json!({
            "type": "user",
            "date": 1740787200,
            "sender_user": { "id": 300, "is_bot": false, "first_name": "Ann", "username": "ann" },
        }));

        let hidden = origin(serde_json::json!({
            "type": "hidden_user",
            "date": 1740787200,
            "sender_user_name": "Bob",
        }));

        let lines = [channel, user, hidden]
            .iter()
            .map(|origin| forward_origin_lines(origin).join("\n"))
            .collect::<Vec<_>>()
            .join("\n\n");

        expect![[r#"
            origin = channel
            origin_chat_id = -1001234
            origin_title = Daily numbers
            origin_message_id = 42

            origin = user
            origin_user_id = 300
            origin_username = @ann

            origin = hidden user
            origin_user_name = Bob"#]]
        .assert_eq(&lines);
    }
}
