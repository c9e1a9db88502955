//! Request signing expected by the analytics backend.
//!
//! The canonical string is the compact JSON of all the parameters plus the
//! nonce sorted by key. Nested objects are canonicalized recursively and
//! embedded as JSON strings. The `timestamp`, `signature` and `track` keys
//! and any array values don't participate in the digest.

use crate::config::SigningConfig;
use crate::{err, Result};
use md5::{Digest, Md5};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const RESERVED_KEYS: &[&str] = &["timestamp", "random", "signature"];
const EXCLUDED_FROM_DIGEST: &[&str] = &["timestamp", "signature", "track"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SignatureAlgorithm {
    /// The only algorithm supported by the backend
    #[default]
    Md5,
}

/// Request body with the signature parameters. Must be created for every
/// request anew, because the backend may reject a reused nonce.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SignedRequest {
    #[serde(flatten)]
    pub(crate) base_params: Map<String, Value>,

    pub(crate) timestamp: i64,

    #[serde(rename = "random")]
    pub(crate) nonce: u64,

    pub(crate) signature: String,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SigningError {
    #[error("Invalid request parameters for signing: {message}")]
    InvalidParameter { message: String },
}

/// Signs the parameters with the current time and a random nonce
pub(crate) fn sign(params: &impl Serialize, config: &SigningConfig) -> Result<SignedRequest> {
    let timestamp = chrono::Utc::now().timestamp();
    let nonce = generate_nonce(config.nonce_digits)?;

    sign_with(params, timestamp, nonce, config)
}

/// Deterministic part of [`sign`]
pub(crate) fn sign_with(
    params: &impl Serialize,
    timestamp: i64,
    nonce: u64,
    config: &SigningConfig,
) -> Result<SignedRequest> {
    let value = serde_json::to_value(params).map_err(|source| {
        err!(SigningError::InvalidParameter {
            message: format!("couldn't serialize the parameters: {source}"),
        })
    })?;

    let Value::Object(base_params) = value else {
        return Err(err!(SigningError::InvalidParameter {
            message: format!("parameters must be a JSON object, but got `{value}`"),
        }));
    };

    if let Some(key) = RESERVED_KEYS.iter().find(|key| base_params.contains_key(**key)) {
        return Err(err!(SigningError::InvalidParameter {
            message: format!("`{key}` is a reserved parameter name"),
        }));
    }

    let mut with_nonce = base_params.clone();
    with_nonce.insert("random".to_owned(), Value::from(nonce));

    let mut canonical = canonicalize(&with_nonce)?;

    if let Some(secret) = &config.secret {
        canonical.push_str(secret);
    }

    let signature = match config.algorithm {
        SignatureAlgorithm::Md5 => hex::encode_upper(Md5::digest(canonical.as_bytes())),
    };

    Ok(SignedRequest {
        base_params,
        timestamp,
        nonce,
        signature,
    })
}

fn canonicalize(params: &Map<String, Value>) -> Result<String> {
    let mut sorted = BTreeMap::new();

    for (key, value) in params {
        if EXCLUDED_FROM_DIGEST.contains(&key.as_str()) || value.is_array() {
            continue;
        }
        let value = match value {
            Value::Object(nested) => Value::String(canonicalize(nested)?),
            other => other.clone(),
        };
        sorted.insert(key.as_str(), value);
    }

    serde_json::to_string(&sorted).map_err(|source| {
        err!(SigningError::InvalidParameter {
            message: format!("couldn't render the canonical string: {source}"),
        })
    })
}

/// Random number with exactly `digits` decimal digits
fn generate_nonce(digits: u32) -> Result<u64> {
    if !(1..=18).contains(&digits) {
        return Err(err!(SigningError::InvalidParameter {
            message: format!("nonce must have from 1 to 18 digits, but {digits} were requested"),
        }));
    }

    let min = 10_u64.pow(digits - 1);
    let max = 10_u64.pow(digits);

    Ok(rand::thread_rng().gen_range(min..max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use assert_matches::assert_matches;
    use expect_test::expect;
    use serde_json::json;

    fn config(secret: Option<&str>) -> SigningConfig {
        SigningConfig {
            secret: secret.map(ToOwned::to_owned),
            ..Default::default()
        }
    }

    fn login_params() -> Value {
        json!({
            "userName": "reporter",
            "pwd": "hunter2",
            "vCode": "123456",
            "language": "zh",
        })
    }

    #[test]
    fn frozen_time_and_nonce_give_stable_signature() {
        let params = login_params();

        let first = sign_with(&params, 1_700_000_000, 1234567890123456, &config(None)).unwrap();
        let second = sign_with(&params, 1_700_000_999, 1234567890123456, &config(None)).unwrap();

        expect!["7DC2CB6263C4B0AB1D6590701A5F0308"].assert_eq(&first.signature);

        // timestamp doesn't participate in the digest
        assert_eq!(first.signature, second.signature);

        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            json!({
                "userName": "reporter",
                "pwd": "hunter2",
                "vCode": "123456",
                "language": "zh",
                "timestamp": 1_700_000_000,
                "random": 1234567890123456_u64,
                "signature": "7DC2CB6263C4B0AB1D6590701A5F0308",
            })
        );
    }

    #[test]
    fn secret_is_appended_to_canonical_string() {
        let signed = sign_with(
            &login_params(),
            1_700_000_000,
            1234567890123456,
            &config(Some("s3cr3t")),
        )
        .unwrap();

        expect!["5D1C00686B8C940DCA85823310921661"].assert_eq(&signed.signature);
    }

    #[test]
    fn nested_objects_arrays_and_excluded_keys() {
        let params = json!({
            "pageNo": 1,
            "endTime": "2025-03-01 23:59:59",
            "ids": [1, 2],
            "track": "x",
            "filter": {
                "z": null,
                "name": "Канал",
                "timestamp": 5,
                "tags": ["a"],
            },
        });

        let canonical = {
            let Value::Object(mut map) = params.clone() else {
                unreachable!()
            };
            map.insert("random".to_owned(), Value::from(5000000000000001_u64));
            canonicalize(&map).unwrap()
        };

        expect![[r#"{"endTime":"2025-03-01 23:59:59","filter":"{\"name\":\"Канал\",\"z\":null}","pageNo":1,"random":5000000000000001}"#]]
            .assert_eq(&canonical);

        let signed = sign_with(&params, 0, 5000000000000001, &config(None)).unwrap();
        expect!["7EEC891462366F9C62AC7DC52CEE58C5"].assert_eq(&signed.signature);

        // excluded keys are still sent
        assert!(signed.base_params.contains_key("track"));
        assert!(signed.base_params.contains_key("ids"));
    }

    #[test]
    fn nonces_differ_between_calls() {
        let params = login_params();
        let config = config(None);

        let nonces: std::collections::HashSet<_> = (0..20)
            .map(|_| sign(&params, &config).unwrap())
            .inspect(|signed| assert_eq!(signed.nonce.to_string().len(), 16))
            .map(|signed| signed.nonce)
            .collect();

        assert_eq!(nonces.len(), 20);
    }

    #[test]
    fn invalid_parameters_fail_fast() {
        let cases = [
            json!([1, 2, 3]),
            json!("string"),
            json!({ "random": 1 }),
            json!({ "signature": "x" }),
            json!({ "timestamp": 1 }),
        ];

        for params in cases {
            let err = sign_with(&params, 0, 1, &config(None)).unwrap_err();
            assert_matches!(
                err.kind(),
                ErrorKind::Signing {
                    source: SigningError::InvalidParameter { .. }
                },
                "{params}"
            );
        }
    }
}
