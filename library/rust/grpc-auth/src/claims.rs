//! JWT Claims 構造体と検証済みトークン。

use jsonwebtoken::Header;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;

/// Access はリソースアクセスのロール一覧を表す。
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct Access {
    #[serde(default, deserialize_with = "lenient_roles")]
    pub roles: Vec<String>,
}

/// ロール Claim を解釈する。単一文字列は 1 件、配列は文字列要素のみ、それ以外は 0 件。
fn roles_from_value(value: Value) -> Vec<String> {
    match value {
        Value::String(role) => vec![role],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(role) => Some(role),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn lenient_roles<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(roles_from_value(Value::deserialize(deserializer)?))
}

fn lenient_optional_roles<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        other => Some(roles_from_value(other)),
    })
}

/// resource_access を解釈する。オブジェクト以外は無視し、形式の崩れたエントリはロール 0 件とする。
fn lenient_resource_access<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<HashMap<String, Access>>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(entries) => Some(
            entries
                .into_iter()
                .map(|(resource, entry)| {
                    let access = serde_json::from_value(entry).unwrap_or_default();
                    (resource, access)
                })
                .collect(),
        ),
        _ => None,
    })
}

/// NumericDate（RFC 7519）を解釈する。小数は四捨五入し、u64 で表せない値はエラー。
fn numeric_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64)
                    .map(|f| f.round() as u64)
            })
            .map(Some)
            .ok_or_else(|| D::Error::custom("NumericDate must be representable as a u64")),
        _ => Err(D::Error::custom("NumericDate must be a number")),
    }
}

/// Claims は検証対象トークンの Claims 構造体。
///
/// 認可判定に使うフィールドのみ型付けし、それ以外は `extra` に保持する。
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Claims {
    /// トークン発行者
    #[serde(default)]
    pub iss: Option<String>,

    /// ユーザーの一意識別子
    #[serde(default)]
    pub sub: Option<String>,

    /// トークンの有効期限（Unix タイムスタンプ）
    #[serde(default, deserialize_with = "numeric_date")]
    pub exp: Option<u64>,

    /// 有効開始時刻（Unix タイムスタンプ）
    #[serde(default, deserialize_with = "numeric_date")]
    pub nbf: Option<u64>,

    /// トークンの発行時刻（Unix タイムスタンプ）
    #[serde(default, deserialize_with = "numeric_date")]
    pub iat: Option<u64>,

    /// リソース単位のロール（Keycloak 形式）
    #[serde(default, deserialize_with = "lenient_resource_access")]
    pub resource_access: Option<HashMap<String, Access>>,

    /// フラットなロール一覧
    #[serde(default, deserialize_with = "lenient_optional_roles")]
    pub roles: Option<Vec<String>>,

    /// その他の Claim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// 指定リソースのロール一覧を返す。resource_access にリソースが無い場合は None。
    pub fn resource_roles(&self, resource: &str) -> Option<&[String]> {
        self.resource_access
            .as_ref()
            .and_then(|ra| ra.get(resource))
            .map(|a| a.roles.as_slice())
    }

    /// フラットなロール一覧を返す。
    pub fn flat_roles(&self) -> Option<&[String]> {
        self.roles.as_deref()
    }

    /// 任意の Claim を返す。
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.extra.get(name)
    }
}

/// VerifiedToken は署名・発行者・有効期限の検証を通過したトークン。
///
/// 転送時にリクエストエクステンションへ格納され、ハンドラーから参照できる。
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub header: Header,
    pub claims: Claims,
}

impl VerifiedToken {
    /// トークンヘッダーの kid を返す。
    pub fn key_id(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    pub fn issuer(&self) -> Option<&str> {
        self.claims.iss.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.claims.exp
    }
}

impl std::fmt::Display for VerifiedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VerifiedToken{{kid={:?}, sub={:?}, iss={:?}, exp={:?}}}",
            self.key_id(),
            self.subject(),
            self.issuer(),
            self.expires_at(),
        )
    }
}
