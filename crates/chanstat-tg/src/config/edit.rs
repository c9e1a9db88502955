//! Changes of the config file requested by the admins from the chat.
//!
//! Edits are applied to the raw YAML document rather than to [`super::AppConfig`],
//! so the sections the bot doesn't manage stay as the operator wrote them.

use super::{ChannelId, GroupKey};
use serde_yaml::{Mapping, Value};
use teloxide::types::{ChatId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConfigEdit {
    AddAdmin(UserId),
    RemoveAdmin(UserId),
    AddGroup {
        key: GroupKey,
        name: String,
        tg_group: ChatId,
    },
    /// Also forgets the spreadsheet of the group
    RemoveGroup(GroupKey),
    AddChannels {
        group: GroupKey,
        channels: Vec<ChannelId>,
    },
    RemoveChannels {
        group: GroupKey,
        channels: Vec<ChannelId>,
    },
    SetSpreadsheet {
        group: GroupKey,
        spreadsheet_id: String,
    },
    RemoveSpreadsheet(GroupKey),
}

/// Per-channel result of the channel edits. The other edits either
/// apply fully or fail.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EditOutcome {
    pub(crate) changed: Vec<ChannelId>,

    /// Channels that were already in the group when adding,
    /// or weren't in it when removing
    pub(crate) skipped: Vec<ChannelId>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigEditError {
    #[error("User {id} is already an admin")]
    AdminExists { id: UserId },

    #[error("User {id} is not an admin")]
    AdminNotFound { id: UserId },

    #[error("The last admin can't be removed")]
    LastAdmin,

    #[error("Group `{key}` already exists")]
    GroupExists { key: GroupKey },

    #[error("Unknown group `{key}`")]
    GroupNotFound { key: GroupKey },

    #[error("Group `{key}` has no spreadsheet")]
    SpreadsheetNotFound { key: GroupKey },

    #[error("The `google_sheets` section with the credentials file must be configured first")]
    SheetsNotConfigured,

    #[error("Expected `{path}` to be a {expected} in the config file")]
    UnexpectedShape { path: String, expected: &'static str },

    #[error("Usage: {usage}")]
    Usage { usage: &'static str },

    #[error("Invalid id `{input}`, expected an integer")]
    BadId { input: String },
}

impl ConfigEdit {
    /// The document is left in an unspecified state if an error is returned
    pub(crate) fn apply(&self, doc: &mut Mapping) -> Result<EditOutcome, ConfigEditError> {
        let mut outcome = EditOutcome::default();

        match self {
            Self::AddAdmin(id) => {
                let admins = child_sequence(doc, "admins", "admins")?;
                if admins.iter().any(|admin| is_user(admin, *id)) {
                    return Err(ConfigEditError::AdminExists { id: *id });
                }
                admins.push(Value::from(id.0));
            }
            Self::RemoveAdmin(id) => {
                let admins = child_sequence(doc, "admins", "admins")?;
                if !admins.iter().any(|admin| is_user(admin, *id)) {
                    return Err(ConfigEditError::AdminNotFound { id: *id });
                }
                if admins.len() == 1 {
                    return Err(ConfigEditError::LastAdmin);
                }
                admins.retain(|admin| !is_user(admin, *id));
            }
            Self::AddGroup {
                key,
                name,
                tg_group,
            } => {
                let groups = child_mapping(doc, "groups", "groups")?;
                if groups.contains_key(key.as_str()) {
                    return Err(ConfigEditError::GroupExists { key: key.clone() });
                }

                let mut group = Mapping::new();
                group.insert("name".into(), name.as_str().into());
                group.insert("tg_group".into(), tg_group.0.into());
                group.insert("channel_ids".into(), Value::Sequence(vec![]));

                groups.insert(key.as_str().into(), group.into());
            }
            Self::RemoveGroup(key) => {
                let groups = child_mapping(doc, "groups", "groups")?;
                if groups.shift_remove(key.as_str()).is_none() {
                    return Err(ConfigEditError::GroupNotFound { key: key.clone() });
                }

                if let Some(spreadsheets) = group_spreadsheets(doc)? {
                    spreadsheets.shift_remove(key.as_str());
                }
            }
            Self::AddChannels { group, channels } => {
                let ids = group_channels(doc, group)?;
                for channel in channels {
                    if ids.iter().any(|id| channel_id(id) == Some(channel.as_str())) {
                        outcome.skipped.push(channel.clone());
                        continue;
                    }
                    ids.push(channel.as_str().into());
                    outcome.changed.push(channel.clone());
                }
            }
            Self::RemoveChannels { group, channels } => {
                let ids = group_channels(doc, group)?;
                for channel in channels {
                    let position = ids
                        .iter()
                        .position(|id| channel_id(id) == Some(channel.as_str()));

                    match position {
                        Some(position) => {
                            ids.remove(position);
                            outcome.changed.push(channel.clone());
                        }
                        None => outcome.skipped.push(channel.clone()),
                    }
                }
            }
            Self::SetSpreadsheet {
                group,
                spreadsheet_id,
            } => {
                ensure_group_exists(doc, group)?;
                let spreadsheets =
                    group_spreadsheets(doc)?.ok_or(ConfigEditError::SheetsNotConfigured)?;
                spreadsheets.insert(group.as_str().into(), spreadsheet_id.as_str().into());
            }
            Self::RemoveSpreadsheet(group) => {
                let removed = group_spreadsheets(doc)?
                    .and_then(|spreadsheets| spreadsheets.shift_remove(group.as_str()));

                if removed.is_none() {
                    return Err(ConfigEditError::SpreadsheetNotFound { key: group.clone() });
                }
            }
        }

        Ok(outcome)
    }
}

fn is_user(value: &Value, id: UserId) -> bool {
    value.as_u64() == Some(id.0)
}

/// Channels are written either as `- FBA8-18` or `- id: FBA8-18`
fn channel_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id),
        Value::Mapping(mapping) => mapping.get("id")?.as_str(),
        _ => None,
    }
}

fn unexpected_shape(path: &str, expected: &'static str) -> ConfigEditError {
    ConfigEditError::UnexpectedShape {
        path: path.to_owned(),
        expected,
    }
}

/// A missing or empty value is replaced with an empty mapping
fn child_mapping<'a>(
    parent: &'a mut Mapping,
    key: &str,
    path: &str,
) -> Result<&'a mut Mapping, ConfigEditError> {
    let value = parent.entry(key.into()).or_insert(Value::Null);
    if value.is_null() {
        *value = Mapping::new().into();
    }
    value
        .as_mapping_mut()
        .ok_or_else(|| unexpected_shape(path, "mapping"))
}

/// A missing or empty value is replaced with an empty sequence
fn child_sequence<'a>(
    parent: &'a mut Mapping,
    key: &str,
    path: &str,
) -> Result<&'a mut Vec<Value>, ConfigEditError> {
    let value = parent.entry(key.into()).or_insert(Value::Null);
    if value.is_null() {
        *value = Value::Sequence(vec![]);
    }
    value
        .as_sequence_mut()
        .ok_or_else(|| unexpected_shape(path, "sequence"))
}

fn existing_group<'a>(
    doc: &'a mut Mapping,
    key: &GroupKey,
) -> Result<&'a mut Mapping, ConfigEditError> {
    child_mapping(doc, "groups", "groups")?
        .get_mut(key.as_str())
        .ok_or_else(|| ConfigEditError::GroupNotFound { key: key.clone() })?
        .as_mapping_mut()
        .ok_or_else(|| unexpected_shape(&format!("groups.{key}"), "mapping"))
}

fn ensure_group_exists(doc: &mut Mapping, key: &GroupKey) -> Result<(), ConfigEditError> {
    existing_group(doc, key).map(drop)
}

fn group_channels<'a>(
    doc: &'a mut Mapping,
    key: &GroupKey,
) -> Result<&'a mut Vec<Value>, ConfigEditError> {
    let path = format!("groups.{key}.channel_ids");
    child_sequence(existing_group(doc, key)?, "channel_ids", &path)
}

/// `None` if there is no `google_sheets` section
fn group_spreadsheets(doc: &mut Mapping) -> Result<Option<&mut Mapping>, ConfigEditError> {
    let Some(sheets) = doc.get_mut("google_sheets").filter(|sheets| !sheets.is_null()) else {
        return Ok(None);
    };

    let sheets = sheets
        .as_mapping_mut()
        .ok_or_else(|| unexpected_shape("google_sheets", "mapping"))?;

    child_mapping(
        sheets,
        "group_spreadsheets",
        "google_sheets.group_spreadsheets",
    )
    .map(Some)
}
