//! Shape of the YAML config file

use chrono::NaiveTime;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use teloxide::types::{ChatId, UserId};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AppConfig {
    /// Telegram users allowed to run admin commands
    #[serde(default)]
    pub(crate) admins: Vec<UserId>,

    /// Time zone that defines "today", "yesterday" and the schedule boundaries
    #[serde(default = "default_timezone")]
    pub(crate) timezone: chrono_tz::Tz,

    /// Max number of groups processed concurrently by a single job run
    #[serde(default = "default_parallelism")]
    pub(crate) parallelism: usize,

    pub(crate) api: ApiConfig,

    #[serde(default)]
    pub(crate) groups: BTreeMap<GroupKey, GroupConfig>,

    #[serde(default)]
    pub(crate) google_sheets: Option<GoogleSheetsConfig>,

    #[serde(default)]
    pub(crate) schedule: ScheduleConfig,
}

impl AppConfig {
    pub(crate) fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }

    /// Groups that deliver their reports to the given chat
    pub(crate) fn groups_for_chat(&self, chat: ChatId) -> Vec<GroupKey> {
        self.groups
            .iter()
            .filter(|(_, group)| group.tg_group == chat)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[derive(derive_more::Display, derive_more::From)]
#[serde(transparent)]
pub(crate) struct GroupKey(String);

impl From<&str> for GroupKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}

impl GroupKey {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

/// Channel name as the upstream analytics API reports it, e.g. `FBA8-18`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[derive(derive_more::Display)]
#[serde(from = "ChannelIdRepr")]
pub(crate) struct ChannelId(String);

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl ChannelId {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

/// Both `- FBA8-18` and `- id: FBA8-18` forms are accepted
#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelIdRepr {
    Plain(String),
    Object { id: String },
}

impl From<ChannelIdRepr> for ChannelId {
    fn from(repr: ChannelIdRepr) -> Self {
        match repr {
            ChannelIdRepr::Plain(id) | ChannelIdRepr::Object { id } => Self(id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GroupConfig {
    pub(crate) name: String,

    /// Chat where the reports of this group are sent
    pub(crate) tg_group: ChatId,

    /// Allow-list of channels in the order they are displayed in the report
    #[serde(default)]
    pub(crate) channel_ids: Vec<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct ApiConfig {
    pub(crate) login: LoginConfig,

    #[serde(flatten)]
    pub(crate) http: HttpConfig,

    #[serde(default = "default_page_size")]
    pub(crate) page_size: u32,

    /// Guards against a backend that never stops returning full pages
    #[serde(default = "default_max_pages")]
    pub(crate) max_pages: u32,

    #[serde(default)]
    pub(crate) timeouts: TimeoutsConfig,

    #[serde(default)]
    pub(crate) session: SessionConfig,

    #[serde(default)]
    pub(crate) signing: SigningConfig,
}

#[derive(Clone, PartialEq, Deserialize)]
pub(crate) struct LoginConfig {
    /// Full URL of the login endpoint, normally ending with `/api/Login/Login`
    pub(crate) url: String,
    pub(crate) username: String,
    pub(crate) password: String,

    /// Base32-encoded TOTP secret
    pub(crate) totp_secret: String,
}

impl fmt::Debug for LoginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct HttpConfig {
    #[serde(default = "default_true")]
    pub(crate) ssl_verify: bool,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_secs")]
    pub(crate) connect_timeout: Duration,

    #[serde(default)]
    pub(crate) retry: RetryConfig,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct RetryConfig {
    pub(crate) max_retries: u32,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "min_backoff_ms")]
    pub(crate) min_backoff: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_backoff_ms")]
    pub(crate) max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct TimeoutsConfig {
    /// Per-request timeout for scheduled jobs
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "background_secs")]
    pub(crate) background: Duration,

    /// Per-request timeout for chat commands, where a human waits for the reply
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interactive_secs")]
    pub(crate) interactive: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            background: Duration::from_secs(60),
            interactive: Duration::from_secs(15),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct SessionConfig {
    /// Used when the login response doesn't declare `expiresIn`
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "default_ttl_secs")]
    pub(crate) default_ttl: Duration,

    /// The token is refreshed this long before it actually expires
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "safety_margin_secs")]
    pub(crate) safety_margin: Duration,

    /// TOTP windows (30 second steps relative to now) tried when the
    /// code is rejected, to tolerate clock drift
    pub(crate) totp_window_offsets: Vec<i64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 60 * 60),
            safety_margin: Duration::from_secs(60),
            totp_window_offsets: vec![0, -1, 1],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct SigningConfig {
    pub(crate) algorithm: crate::api::SignatureAlgorithm,

    /// Appended to the canonical string before hashing if set
    pub(crate) secret: Option<String>,

    pub(crate) nonce_digits: u32,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: crate::api::SignatureAlgorithm::Md5,
            secret: None,
            nonce_digits: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GoogleSheetsConfig {
    /// Service account key JSON file
    pub(crate) credentials_file: PathBuf,

    #[serde(default = "default_daily_sheet_name")]
    pub(crate) daily_sheet_name: String,

    #[serde(default = "default_hourly_sheet_name")]
    pub(crate) hourly_sheet_name: String,

    /// Groups without a spreadsheet are not written to sheets
    #[serde(default)]
    pub(crate) group_spreadsheets: BTreeMap<GroupKey, String>,

    #[serde(default = "default_sheets_api_url")]
    pub(crate) api_url: url::Url,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ScheduleConfig {
    pub(crate) daily: DailyJobConfig,
    pub(crate) hourly: HourlyJobConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct DailyJobConfig {
    pub(crate) enabled: bool,

    /// Local time (`HH:MM`) when yesterday's report is sent
    pub(crate) send_time: LocalTime,

    pub(crate) sinks: SinksConfig,
}

impl Default for DailyJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_time: LocalTime(
                NaiveTime::from_hms_opt(18, 0, 0).expect("BUG: 18:00 is a valid time"),
            ),
            sinks: SinksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct HourlyJobConfig {
    pub(crate) enabled: bool,

    /// Minute of every hour when today's report so far is sent
    pub(crate) minute: u32,

    pub(crate) sinks: SinksConfig,
}

impl Default for HourlyJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minute: 0,
            sinks: SinksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub(crate) struct SinksConfig {
    pub(crate) telegram: bool,
    pub(crate) sheets: bool,
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            telegram: true,
            sheets: true,
        }
    }
}

/// Time of day in the `HH:MM` format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub(crate) struct LocalTime(pub(crate) NaiveTime);

impl TryFrom<String> for LocalTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .map(Self)
            .map_err(|err| format!("expected time in `HH:MM` format, but got `{value}`: {err}"))
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

fn default_timezone() -> chrono_tz::Tz {
    chrono_tz::Asia::Kolkata
}

fn default_parallelism() -> usize {
    4
}

fn default_page_size() -> u32 {
    1000
}

fn default_max_pages() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_daily_sheet_name() -> String {
    "Daily-Report".to_owned()
}

fn default_hourly_sheet_name() -> String {
    "Hourly-Report".to_owned()
}

fn default_sheets_api_url() -> url::Url {
    url::Url::parse("https://sheets.googleapis.com/").expect("BUG: the default sheets API URL is valid")
}
