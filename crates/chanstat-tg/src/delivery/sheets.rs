//! Google Sheets writer. Every report run replaces the rows it wrote
//! previously for the same group and date, so re-runs are idempotent.

use super::ReportSink;
use crate::config::ConfigHandle;
use crate::prelude::*;
use crate::report::{ChannelMetrics, Granularity, GroupReport};
use crate::{err, err_ctx, fatal, http, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use futures::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const COLUMNS: [&str; 10] = [
    "Written at",
    "Group",
    "Date",
    "Channel",
    "New registrations",
    "New paying users",
    "New deposit amount",
    "Total deposits",
    "Total withdrawals",
    "Deposit-withdraw diff",
];

const GROUP_COLUMN: usize = 1;
const DATE_COLUMN: usize = 2;
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub(crate) enum SheetsError {
    #[error("Failed to read the service account key from {path}")]
    ReadServiceAccountKey {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create the service account authenticator")]
    CreateAuthenticator { source: std::io::Error },

    #[error("Failed to obtain a Google API access token")]
    AccessToken { source: yup_oauth2::Error },

    #[error("Google API returned an empty access token")]
    EmptyAccessToken,

    #[error("Google API didn't return the properties of the created sheet `{title}`")]
    MissingAddSheetReply { title: String },
}

#[async_trait]
pub(crate) trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// OAuth tokens of a Google service account. The tokens are cached and
/// refreshed by the authenticator itself.
pub(crate) struct ServiceAccountTokens {
    fetch: Box<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>,
}

impl ServiceAccountTokens {
    #[instrument(skip_all, fields(path = %credentials_file.display()))]
    pub(crate) async fn new(credentials_file: &Path) -> Result<Self> {
        let key = yup_oauth2::read_service_account_key(credentials_file)
            .await
            .map_err(err_ctx!(SheetsError::ReadServiceAccountKey {
                path: credentials_file.to_owned()
            }))?;

        let auth = yup_oauth2::ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(err_ctx!(SheetsError::CreateAuthenticator))?;

        let auth = Arc::new(auth);

        let fetch = move || {
            let auth = auth.clone();
            async move {
                let token = auth
                    .token(&[SPREADSHEETS_SCOPE])
                    .await
                    .map_err(err_ctx!(SheetsError::AccessToken))?;

                token
                    .token()
                    .filter(|token| !token.is_empty())
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| err!(SheetsError::EmptyAccessToken))
            }
            .boxed()
        };

        Ok(Self {
            fetch: Box::new(fetch),
        })
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String> {
        (self.fetch)().await
    }
}

#[derive(Deserialize)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: i64,
    title: String,
}

#[derive(Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<BatchUpdateReply>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateReply {
    add_sheet: Option<Sheet>,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Thin client of the Sheets REST API v4
pub(crate) struct SheetsClient {
    http: http::Client,
    tokens: Arc<dyn AccessTokenSource>,
    api_url: Url,
}

impl SheetsClient {
    pub(crate) fn new(http: http::Client, tokens: Arc<dyn AccessTokenSource>, api_url: Url) -> Self {
        Self {
            http,
            tokens,
            api_url,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| fatal!("Sheets API URL can't be a base: {}", self.api_url))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets"])
            .extend(segments);
        Ok(url)
    }

    /// Returns the id of the sheet with the given title, creating the sheet
    /// if it doesn't exist yet.
    async fn ensure_sheet(&self, spreadsheet: &str, title: &str) -> Result<i64> {
        let token = self.tokens.access_token().await?;

        let existing: Spreadsheet = self
            .http
            .get(self.url(&[spreadsheet])?)
            .bearer_auth(&token)
            .query(&[("fields", "sheets.properties(sheetId,title)")])
            .read_json()
            .await?;

        if let Some(sheet) = existing
            .sheets
            .into_iter()
            .find(|sheet| sheet.properties.title == title)
        {
            return Ok(sheet.properties.sheet_id);
        }

        info!(spreadsheet, title, "Creating a new sheet");

        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": title } } }]
        });

        let response: BatchUpdateResponse = self
            .http
            .post(self.url(&[&format!("{spreadsheet}:batchUpdate")])?)
            .bearer_auth(&token)
            .json(&body)
            .read_json()
            .await?;

        response
            .replies
            .into_iter()
            .find_map(|reply| reply.add_sheet)
            .map(|sheet| sheet.properties.sheet_id)
            .ok_or_else(|| {
                err!(SheetsError::MissingAddSheetReply {
                    title: title.to_owned()
                })
            })
    }

    async fn read_rows(&self, spreadsheet: &str, title: &str) -> Result<Vec<Vec<String>>> {
        let token = self.tokens.access_token().await?;
        let range = a1_range(title, "A:J");

        let response: ValueRange = self
            .http
            .get(self.url(&[spreadsheet, "values", &range])?)
            .bearer_auth(&token)
            .read_json()
            .await?;

        let rows = response
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect();

        Ok(rows)
    }

    /// Writes the header into the first row. If the sheet already has data
    /// an empty row is inserted at the top first.
    async fn write_header(&self, spreadsheet: &str, sheet_id: i64, title: &str, insert: bool) -> Result {
        let token = self.tokens.access_token().await?;

        if insert {
            let body = json!({
                "requests": [{
                    "insertDimension": {
                        "range": {
                            "sheetId": sheet_id,
                            "dimension": "ROWS",
                            "startIndex": 0,
                            "endIndex": 1,
                        },
                        "inheritFromBefore": false,
                    }
                }]
            });
            self.batch_update(spreadsheet, &token, &body).await?;
        }

        let range = a1_range(title, "A1:J1");

        self.http
            .put(self.url(&[spreadsheet, "values", &range])?)
            .bearer_auth(&token)
            .query(&[("valueInputOption", "RAW")])
            .json(&json!({ "values": [COLUMNS] }))
            .try_send()
            .await?;

        Ok(())
    }

    /// Deletes the given row ranges. They are removed bottom-up so that the
    /// indices of the remaining ranges stay valid.
    async fn delete_rows(&self, spreadsheet: &str, sheet_id: i64, ranges: &[Range<usize>]) -> Result {
        let token = self.tokens.access_token().await?;

        let requests: Vec<_> = ranges
            .iter()
            .rev()
            .map(|range| {
                json!({
                    "deleteDimension": {
                        "range": {
                            "sheetId": sheet_id,
                            "dimension": "ROWS",
                            "startIndex": range.start,
                            "endIndex": range.end,
                        }
                    }
                })
            })
            .collect();

        self.batch_update(spreadsheet, &token, &json!({ "requests": requests }))
            .await
    }

    async fn append_rows(&self, spreadsheet: &str, title: &str, rows: Vec<Vec<Value>>) -> Result {
        let token = self.tokens.access_token().await?;
        let range = format!("{}:append", a1_range(title, "A:J"));

        self.http
            .post(self.url(&[spreadsheet, "values", &range])?)
            .bearer_auth(&token)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": rows }))
            .try_send()
            .await?;

        Ok(())
    }

    async fn batch_update(&self, spreadsheet: &str, token: &str, body: &Value) -> Result {
        self.http
            .post(self.url(&[&format!("{spreadsheet}:batchUpdate")])?)
            .bearer_auth(token)
            .json(body)
            .try_send()
            .await?;
        Ok(())
    }
}

/// Writes reports into the spreadsheet configured for the group
pub(crate) struct SheetsSink {
    client: SheetsClient,
    config: Arc<ConfigHandle>,
}

impl SheetsSink {
    pub(crate) fn new(client: SheetsClient, config: Arc<ConfigHandle>) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ReportSink for SheetsSink {
    fn name(&self) -> &'static str {
        "sheets"
    }

    async fn deliver(&self, report: &GroupReport) -> Result {
        let config = self.config.get();

        let Some(sheets) = &config.google_sheets else {
            return Ok(());
        };

        let Some(spreadsheet) = sheets.group_spreadsheets.get(&report.group_key) else {
            debug!(group = %report.group_key, "No spreadsheet configured for the group");
            return Ok(());
        };

        let title = match report.granularity {
            Granularity::Daily => &sheets.daily_sheet_name,
            Granularity::Hourly => &sheets.hourly_sheet_name,
        };

        let sheet_id = self.client.ensure_sheet(spreadsheet, title).await?;
        let mut rows = self.client.read_rows(spreadsheet, title).await?;

        let has_header = rows.first().is_some_and(|row| row.len() >= COLUMNS.len());

        if !has_header {
            self.client
                .write_header(spreadsheet, sheet_id, title, !rows.is_empty())
                .await?;
            rows.insert(0, COLUMNS.map(str::to_owned).to_vec());
        }

        let stale = stale_row_ranges(&rows, &report.group_name, report.report_date, report.granularity);

        if !stale.is_empty() {
            debug!(
                ranges = ?stale,
                "Deleting rows written by the previous runs"
            );
            self.client.delete_rows(spreadsheet, sheet_id, &stale).await?;
        }

        let written_at = Utc::now().with_timezone(&config.timezone).to_human_readable();
        let new_rows = report_rows(report, &written_at);
        let appended = new_rows.len();

        self.client.append_rows(spreadsheet, title, new_rows).await?;

        debug!(spreadsheet, title, appended, "Report was written to the sheet");

        Ok(())
    }
}

/// Ranges of row indices (header excluded) that the new report replaces.
/// The daily sheet keeps one set of rows per day, the hourly sheet keeps
/// only the latest day.
fn stale_row_ranges(
    rows: &[Vec<String>],
    group_name: &str,
    report_date: NaiveDate,
    granularity: Granularity,
) -> Vec<Range<usize>> {
    let is_stale = |row: &Vec<String>| {
        if row.get(GROUP_COLUMN).map(String::as_str) != Some(group_name) {
            return false;
        }
        let Some(date) = row
            .get(DATE_COLUMN)
            .and_then(|date| NaiveDate::parse_from_str(date.trim(), DATE_FORMAT).ok())
        else {
            return false;
        };
        match granularity {
            Granularity::Daily => date == report_date,
            Granularity::Hourly => date <= report_date,
        }
    };

    let mut ranges: Vec<Range<usize>> = vec![];

    for (index, _) in rows.iter().enumerate().skip(1).filter(|&(_, row)| is_stale(row)) {
        match ranges.last_mut() {
            Some(last) if last.end == index => last.end += 1,
            _ => ranges.push(index..index + 1),
        }
    }

    ranges
}

fn report_rows(report: &GroupReport, written_at: &str) -> Vec<Vec<Value>> {
    let date = report.report_date.format(DATE_FORMAT).to_string();

    report
        .channels
        .iter()
        .map(|record| {
            let ChannelMetrics {
                new_registrations,
                new_paying_users,
                new_deposit_amount,
                total_deposit_amount,
                total_withdraw_amount,
                deposit_withdraw_diff,
            } = &record.metrics;

            vec![
                Value::from(written_at),
                Value::from(report.group_name.as_str()),
                Value::from(date.as_str()),
                Value::from(record.channel_name.as_str()),
                Value::from(*new_registrations),
                Value::from(*new_paying_users),
                decimal_cell(new_deposit_amount),
                decimal_cell(total_deposit_amount),
                decimal_cell(total_withdraw_amount),
                decimal_cell(deposit_withdraw_diff),
            ]
        })
        .collect()
}

fn decimal_cell(value: &Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

fn cell_text(cell: Value) -> String {
    match cell {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// A1 notation with the sheet title quoted
fn a1_range(title: &str, cells: &str) -> String {
    format!("'{}'!{cells}", title.replace('\'', "''"))
}
