use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DisplayFromStr, PickFirst};

/// Common shape of every backend response
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) code: i64,

    #[serde(default)]
    pub(crate) msg: Option<String>,

    #[serde(default)]
    pub(crate) success: Option<bool>,

    #[serde(default)]
    pub(crate) data: Value,
}

impl Envelope {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self.code, 0 | 200) && self.success != Some(false)
    }

    pub(crate) fn is_unauthorized(&self) -> bool {
        self.code == 401
    }

    pub(crate) fn msg(&self) -> &str {
        self.msg.as_deref().unwrap_or("<no message>")
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageData<T> {
    #[serde(default = "Vec::new")]
    pub(crate) list: Vec<T>,

    #[serde(default)]
    pub(crate) total: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest<'a> {
    pub(crate) user_name: &'a str,
    pub(crate) pwd: &'a str,
    pub(crate) v_code: &'a str,
    pub(crate) language: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginData {
    #[serde(default)]
    pub(crate) token: Option<String>,

    /// Token lifetime in seconds
    #[serde(default)]
    pub(crate) expires_in: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageListParams {
    pub(crate) sort_field: &'static str,
    pub(crate) order_by: &'static str,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageRecord {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub(crate) id: i64,

    #[serde(default)]
    pub(crate) channel_package_name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PackageAnalysisParams {
    pub(crate) start_time: String,
    pub(crate) end_time: String,
    pub(crate) order_by: &'static str,
}

/// Per-channel metrics as the backend reports them
#[serde_as]
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawAnalysisRecord {
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub(crate) package_id: Option<i64>,

    /// Replaced with the name from the package list when the id is known
    #[serde(default)]
    pub(crate) package_name: String,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub(crate) new_member_count: u64,

    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub(crate) new_member_recharge_count: u64,

    #[serde(default)]
    pub(crate) new_member_recharge_amount: Decimal,

    #[serde(default)]
    pub(crate) recharge_amount: Decimal,

    #[serde(default)]
    pub(crate) withdraw_amount: Decimal,

    /// Never trusted, the difference is always recomputed
    #[serde(default)]
    pub(crate) charge_withdraw_diff: Option<Decimal>,
}
