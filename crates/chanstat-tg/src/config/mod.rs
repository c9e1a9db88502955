mod app;
mod edit;

use crate::prelude::*;
use crate::{err, err_ctx, tg, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize};
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) use app::*;
pub(crate) use edit::*;

pub struct Config {
    pub(crate) tg: tg::Config,
    pub(crate) app: EnvAppConfig,
}

impl Config {
    pub fn load_or_panic() -> Config {
        Self {
            tg: from_env_or_panic("TG_"),
            app: from_env_or_panic("APP_"),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct EnvAppConfig {
    /// Path to the YAML file with the groups, API credentials and schedules
    #[serde(default = "default_app_config_path")]
    pub(crate) config_path: PathBuf,
}

fn default_app_config_path() -> PathBuf {
    "config.yaml".into()
}

pub(crate) fn from_env_or_panic<T: DeserializeOwned>(prefix: &str) -> T {
    envy::prefixed(prefix).from_env().unwrap_or_else(|err| {
        panic!(
            "BUG: Couldn't load config from environment for {}: {:#?}",
            std::any::type_name::<T>(),
            err
        );
    })
}

/// The latest successfully loaded [`AppConfig`]. Readers get a cheap snapshot
/// that stays the same for them even if the config is reloaded in the meantime.
pub(crate) struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<AppConfig>>,

    /// Serializes the read-modify-write cycles of the file
    edits: tokio::sync::Mutex<()>,
}

impl ConfigHandle {
    pub(crate) async fn load(path: PathBuf) -> Result<Self> {
        let config = AppConfig::load(&path).await?;
        Ok(Self::new(path, config))
    }

    pub(crate) fn new(path: PathBuf, config: AppConfig) -> Self {
        Self {
            path,
            current: RwLock::new(Arc::new(config)),
            edits: Default::default(),
        }
    }

    pub(crate) fn get(&self) -> Arc<AppConfig> {
        self.current.read().clone()
    }

    /// Re-reads the file. The previous snapshot is kept if the new file is invalid.
    /// Changes to the `api` section take effect only after a restart.
    pub(crate) async fn reload(&self) -> Result<Arc<AppConfig>> {
        let new = Arc::new(AppConfig::load(&self.path).await?);

        let old = std::mem::replace(&mut *self.current.write(), new.clone());

        if old.api != new.api {
            warn!("API settings were changed, they will be applied after a restart");
        }

        info!(
            groups = new.groups.len(),
            admins = new.admins.len(),
            "Config was reloaded"
        );

        Ok(new)
    }

    /// Applies the edit to the file and switches to the edited config.
    /// The file stays untouched if the edited config doesn't pass the validation.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub(crate) async fn edit(&self, edit: &ConfigEdit) -> Result<(Arc<AppConfig>, EditOutcome)> {
        let _guard = self.edits.lock().await;

        let text = fs_err::tokio::read_to_string(&self.path)
            .await
            .map_err(err_ctx!(ConfigError::Read))?;

        let mut doc: serde_yaml::Mapping =
            serde_yaml::from_str(&text).map_err(err_ctx!(ConfigError::Parse))?;

        let outcome = edit.apply(&mut doc)?;

        let text = serde_yaml::to_string(&doc).map_err(err_ctx!(ConfigError::Serialize))?;

        let new = Arc::new(AppConfig::parse(&text)?);

        fs_err::tokio::write(&self.path, &text)
            .await
            .map_err(err_ctx!(ConfigError::Write))?;

        *self.current.write() = new.clone();

        info!(
            groups = new.groups.len(),
            admins = new.admins.len(),
            "Config was edited"
        );

        Ok((new, outcome))
    }
}

impl AppConfig {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub(crate) async fn load(path: &std::path::Path) -> Result<Self> {
        let text = fs_err::tokio::read_to_string(path)
            .await
            .map_err(err_ctx!(ConfigError::Read))?;

        Self::parse(&text)
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(err_ctx!(ConfigError::Parse))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result {
        let mut problems = vec![];

        let login = &self.api.login;
        for (name, value) in [
            ("api.login.url", login.url.as_str()),
            ("api.login.username", login.username.as_str()),
            ("api.login.totp_secret", login.totp_secret.as_str()),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("`{name}` must not be empty"));
            }
        }

        if self.schedule.hourly.minute >= 60 {
            problems.push(format!(
                "`schedule.hourly.minute` must be less than 60, but got {}",
                self.schedule.hourly.minute
            ));
        }

        if self.parallelism == 0 {
            problems.push("`parallelism` must be greater than zero".to_owned());
        }

        if !(1..=18).contains(&self.api.signing.nonce_digits) {
            problems.push(format!(
                "`api.signing.nonce_digits` must be between 1 and 18, but got {}",
                self.api.signing.nonce_digits
            ));
        }

        if self.api.page_size == 0 || self.api.max_pages == 0 {
            problems.push("`api.page_size` and `api.max_pages` must be greater than zero".to_owned());
        }

        for (key, group) in &self.groups {
            let mut seen = std::collections::HashSet::new();
            for channel in &group.channel_ids {
                if !seen.insert(channel) {
                    problems.push(format!(
                        "channel `{channel}` is listed more than once in group `{key}`"
                    ));
                }
            }
        }

        if problems.is_empty() {
            return Ok(());
        }

        Err(err!(ConfigError::Invalid {
            message: problems.join("; ")
        }))
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("Failed to read the config file")]
    Read { source: std::io::Error },

    #[error("Failed to parse the config file")]
    Parse { source: serde_yaml::Error },

    #[error("Failed to serialize the edited config")]
    Serialize { source: serde_yaml::Error },

    #[error("Failed to write the config file")]
    Write { source: std::io::Error },

    #[error("Invalid config: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use assert_matches::assert_matches;
    use std::time::Duration;

    pub(crate) const SAMPLE: &str = r#"
admins: [100, 200]
api:
  login:
    url: https://panel.example.com/api/Login/Login
    username: reporter
    password: hunter2
    totp_secret: JBSWY3DPEHPK3PXP
groups:
  alpha:
    name: Alpha team
    tg_group: -1001
    channel_ids:
      - id: FBA8-18
      - FBA8-19
  beta:
    name: Beta team
    tg_group: -1002
    channel_ids: []
google_sheets:
  credentials_file: service-account.json
  group_spreadsheets:
    alpha: sheet-alpha
schedule:
  daily:
    send_time: "09:30"
  hourly:
    minute: 5
    sinks:
      sheets: false
"#;

    pub(crate) fn sample() -> AppConfig {
        AppConfig::parse(SAMPLE).unwrap()
    }

    pub(crate) fn http_config() -> HttpConfig {
        HttpConfig {
            ssl_verify: true,
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_retries: 2,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        }
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = sample();

        assert_eq!(config.timezone, chrono_tz::Asia::Kolkata);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.api.page_size, 1000);
        assert!(config.api.http.ssl_verify);
        assert_eq!(config.api.session.totp_window_offsets, [0, -1, 1]);
        assert_eq!(config.api.signing.nonce_digits, 16);

        let alpha = &config.groups[&GroupKey::from("alpha")];
        assert_eq!(alpha.tg_group, teloxide::types::ChatId(-1001));
        assert_eq!(
            alpha.channel_ids,
            [ChannelId::from("FBA8-18"), ChannelId::from("FBA8-19")]
        );

        let daily = &config.schedule.daily;
        assert_eq!(daily.send_time.to_string(), "09:30");
        assert!(daily.sinks.telegram && daily.sinks.sheets);

        let hourly = &config.schedule.hourly;
        assert_eq!(hourly.minute, 5);
        assert!(hourly.sinks.telegram && !hourly.sinks.sheets);

        let sheets = config.google_sheets.unwrap();
        assert_eq!(sheets.daily_sheet_name, "Daily-Report");
        assert_eq!(sheets.hourly_sheet_name, "Hourly-Report");
    }

    #[test]
    fn rejects_invalid_values() {
        let text = SAMPLE
            .replace("minute: 5", "minute: 60")
            .replace("username: reporter", "username: ''")
            .replace("- FBA8-19", "- FBA8-18");

        let err = AppConfig::parse(&text).unwrap_err();

        let message = assert_matches!(
            err.kind(),
            ErrorKind::Config { source: ConfigError::Invalid { message } } => message
        );

        expect_test::expect![[r#"`api.login.username` must not be empty; `schedule.hourly.minute` must be less than 60, but got 60; channel `FBA8-18` is listed more than once in group `alpha`"#]]
            .assert_eq(message);
    }

    async fn handle_with_sample() -> (tempfile::NamedTempFile, ConfigHandle) {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs_err::write(file.path(), SAMPLE).unwrap();
        let handle = ConfigHandle::load(file.path().to_owned()).await.unwrap();
        (file, handle)
    }

    #[test_log::test(tokio::test)]
    async fn edit_is_written_and_becomes_current() {
        let (file, handle) = handle_with_sample().await;
        let before = handle.get();

        let edit = ConfigEdit::AddChannels {
            group: "beta".into(),
            channels: vec![ChannelId::from("FBWX-77")],
        };

        let (config, outcome) = handle.edit(&edit).await.unwrap();

        assert_eq!(outcome.changed, [ChannelId::from("FBWX-77")]);

        let beta = GroupKey::from("beta");
        assert_eq!(config.groups[&beta].channel_ids, [ChannelId::from("FBWX-77")]);
        assert_eq!(handle.get().groups[&beta].channel_ids, [ChannelId::from("FBWX-77")]);
        assert!(before.groups[&beta].channel_ids.is_empty());

        let reloaded = AppConfig::load(file.path()).await.unwrap();
        assert_eq!(reloaded.groups[&beta].channel_ids, [ChannelId::from("FBWX-77")]);
        assert_eq!(reloaded.schedule.daily.send_time.to_string(), "09:30");
        assert_eq!(reloaded.api, config.api);
    }

    #[test_log::test(tokio::test)]
    async fn rejected_edit_leaves_the_file_and_snapshot_alone() {
        let (file, handle) = handle_with_sample().await;

        let err = handle
            .edit(&ConfigEdit::RemoveGroup("gamma".into()))
            .await
            .unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::ConfigEdit {
                source: ConfigEditError::GroupNotFound { .. }
            }
        );
        assert!(err.is_user_error());
        assert_eq!(fs_err::read_to_string(file.path()).unwrap(), SAMPLE);
        assert_eq!(handle.get().groups.len(), 2);

        // The edited config must still be valid as a whole
        let invalid = SAMPLE.replace("minute: 5", "minute: 60");
        fs_err::write(file.path(), &invalid).unwrap();

        let err = handle
            .edit(&ConfigEdit::AddAdmin(teloxide::types::UserId(300)))
            .await
            .unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Config {
                source: ConfigError::Invalid { .. }
            }
        );
        assert_eq!(fs_err::read_to_string(file.path()).unwrap(), invalid);
        assert_eq!(handle.get().admins.len(), 2);
    }

    #[test]
    fn rejects_malformed_send_time() {
        let text = SAMPLE.replace("\"09:30\"", "\"25:00\"");

        let err = AppConfig::parse(&text).unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Config {
                source: ConfigError::Parse { .. }
            }
        );
    }
}
