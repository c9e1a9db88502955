//! Telegram commands root module

mod cmd;

use crate::api::SessionManager;
use crate::config::ConfigHandle;
use crate::prelude::*;
use crate::report::ReportPipeline;
use crate::schedule::Scheduler;
use crate::Result;
use dptree::di::DependencyMap;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;

pub(crate) use cmd::ReportCommandError;

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    pub(crate) token: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config").field("token", &"***").finish()
    }
}

pub(crate) fn create_bot(config: &Config) -> Bot {
    teloxide::Bot::new(config.token.clone())
        .throttle(Default::default())
        .parse_mode(ParseMode::MarkdownV2)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all())
}

pub(crate) struct Ctx {
    pub(crate) bot: Bot,
    pub(crate) config: Arc<ConfigHandle>,
    pub(crate) pipeline: Arc<ReportPipeline>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) session: Arc<SessionManager>,
}

pub(crate) async fn run_bot(ctx: Ctx) -> Result {
    let bot = ctx.bot.clone();

    let mut di = DependencyMap::new();
    di.insert(Arc::new(ctx));

    info!("Starting bot...");

    bot.set_my_commands(cmd::regular::Cmd::bot_commands())
        .await?;

    let handler = dptree::entry()
        .inspect(|update: Update| {
            metrics::increment_counter!(
                "tg_updates_total",
                "kind" => update.kind.discriminator(),
            );
        })
        .branch(
            Update::filter_message()
                .filter_command::<cmd::StartCommand>()
                .filter(cmd::filter_pm_with_bot)
                .endpoint(cmd::handle::<cmd::StartCommand>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::regular::Cmd>()
                .endpoint(cmd::handle::<cmd::regular::Cmd>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::admin::Cmd>()
                .chain(dptree::filter(cmd::admin::filter))
                .endpoint(cmd::handle::<cmd::admin::Cmd>()),
        )
        .branch(
            Update::filter_message()
                .filter(cmd::filter_pm_with_bot)
                .filter(|msg: Message| msg.forward_origin().is_some())
                .chain(dptree::filter(cmd::admin::filter))
                .endpoint(cmd::admin::handle_forwarded_message),
        )
        .branch(Update::filter_callback_query().endpoint(cmd::admin::handle_callback_query))
        .inspect(|update: Update| {
            metrics::increment_counter!(
                "tg_updates_skipped_total",
                "kind" => update.kind.discriminator(),
            );
        });

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // Most of the messages in the report chats are not for the bot,
        // so a noop default handler suppresses the warnings about them
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}
