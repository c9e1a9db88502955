mod api;
mod config;
mod delivery;
mod error;
mod http;
mod observability;
mod report;
mod schedule;
mod tg;

mod util;

pub use crate::error::*;
pub use config::Config;
pub use observability::*;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::http::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
}

use crate::prelude::*;
use api::{ApiClient, LoginClient, SessionManager};
use config::ConfigHandle;
use delivery::{ReportSink, ServiceAccountTokens, SheetsClient, SheetsSink, Sinks, TelegramSink};
use report::ReportPipeline;
use schedule::Scheduler;
use std::sync::Arc;

/// Run the report scheduler and the telegram bot until the bot is stopped
/// or a fatal error occurs.
pub async fn run(config: Config) -> Result {
    let app_config = Arc::new(ConfigHandle::load(config.app.config_path).await?);
    let snapshot = app_config.get();

    info!(
        groups = snapshot.groups.len(),
        timezone = %snapshot.timezone,
        "Loaded the app config"
    );

    let api_config = snapshot.api.clone();
    let api_http = http::create_client_without_retries(&api_config.http)?;

    let login = LoginClient::new(api_http.clone(), api_config.clone())?;
    let session = Arc::new(SessionManager::new(
        Arc::new(login),
        api_config.session.clone(),
    ));
    let api = ApiClient::new(api_http, api_config.clone(), session.clone());

    let pipeline = Arc::new(ReportPipeline::new(Arc::new(api)));

    let bot = tg::create_bot(&config.tg);

    let sheets = match &snapshot.google_sheets {
        Some(sheets) => {
            let tokens = ServiceAccountTokens::new(&sheets.credentials_file).await?;
            let sheets_http = http::create_client(&api_config.http)?;
            let client = SheetsClient::new(sheets_http, Arc::new(tokens), sheets.api_url.clone());
            let sink: Arc<dyn ReportSink> = Arc::new(SheetsSink::new(client, app_config.clone()));
            Some(sink)
        }
        None => {
            info!("Google Sheets are not configured, reports are sent to Telegram only");
            None
        }
    };

    let sinks = Sinks {
        telegram: Arc::new(TelegramSink::new(bot.clone())),
        sheets,
    };

    let scheduler = Arc::new(Scheduler::new(
        app_config.clone(),
        pipeline.clone(),
        sinks,
    ));

    let ctx = tg::Ctx {
        bot,
        config: app_config,
        pipeline,
        scheduler: scheduler.clone(),
        session: session.clone(),
    };

    tokio::select! {
        result = tg::run_bot(ctx) => result,
        result = scheduler.run() => result,
        err = session.credentials_rejected() => Err(err),
    }
}
