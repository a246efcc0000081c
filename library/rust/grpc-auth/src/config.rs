//! 認証設定: YAML から読み込む AuthSettings と、検証済みの TrustConfig。

use crate::error::ConfigError;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// jwks-uri に付与する well-known パス。
const WELL_KNOWN_JWKS_PATH: &str = "/.well-known/jwks.json";

/// jwks_cache_ttl_secs のデフォルト値（600 秒）。
fn default_jwks_cache_ttl_secs() -> u64 {
    600
}

/// jwks_refresh_cooldown_secs のデフォルト値（30 秒）。
fn default_jwks_refresh_cooldown_secs() -> u64 {
    30
}

/// jwks_fetch_timeout_secs のデフォルト値（5 秒）。
fn default_jwks_fetch_timeout_secs() -> u64 {
    5
}

/// jwks_max_stale_secs のデフォルト値（3600 秒）。
fn default_jwks_max_stale_secs() -> u64 {
    3600
}

/// UnknownSchemePolicy は Bearer 以外の Authorization スキームの扱いを表す。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownSchemePolicy {
    /// 保護対象メソッドへの呼び出しは拒否し、それ以外は素通しする。
    #[default]
    Reject,
    /// 認証を行わずにすべて素通しする（旧来の互換動作）。
    PassThrough,
}

/// AuthSettings は gRPC 認証インターセプターの設定を表す。
///
/// キーは kebab-case。YAML から serde でデシリアライズ可能。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthSettings {
    /// 期待するトークン発行者。未設定の場合、すべての検証が失敗する。
    #[serde(default)]
    pub issuer: Option<String>,

    /// PEM 形式の公開鍵、または JWK/JWKS ペイロード（base64 可）。
    #[serde(default)]
    pub public_key: Option<String>,

    /// JWKS を公開しているドメイン。`/.well-known/jwks.json` から取得する。
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Keycloak の JWKS エンドポイント URL。そのまま使用する。
    /// 例: `https://auth.example.com/realms/k1s0/protocol/openid-connect/certs`
    #[serde(default)]
    pub keycloak_jwks_uri: Option<String>,

    /// 有効期限判定の許容秒数。
    #[serde(default)]
    pub maximum_leeway: u64,

    /// resource_access からロールを取り出すリソース名。
    #[serde(default)]
    pub resource_name: Option<String>,

    /// サービス単位のリソース名。resource_name より優先する。
    #[serde(default)]
    pub resource_names: HashMap<String, String>,

    #[serde(default)]
    pub unknown_scheme: UnknownSchemePolicy,

    /// インターセプターを適用しないサービス名（例: `grpc.health.v1.Health`）。
    #[serde(default)]
    pub skip_services: Vec<String>,

    #[serde(default = "default_jwks_cache_ttl_secs")]
    pub jwks_cache_ttl_secs: u64,

    /// 未知の kid による JWKS 再取得の最小間隔。
    #[serde(default = "default_jwks_refresh_cooldown_secs")]
    pub jwks_refresh_cooldown_secs: u64,

    #[serde(default = "default_jwks_fetch_timeout_secs")]
    pub jwks_fetch_timeout_secs: u64,

    /// JWKS の取得に失敗し続けた場合に、最後に取得した鍵を使い続けてよい秒数。
    #[serde(default = "default_jwks_max_stale_secs")]
    pub jwks_max_stale_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            issuer: None,
            public_key: None,
            jwks_uri: None,
            keycloak_jwks_uri: None,
            maximum_leeway: 0,
            resource_name: None,
            resource_names: HashMap::new(),
            unknown_scheme: UnknownSchemePolicy::default(),
            skip_services: Vec::new(),
            jwks_cache_ttl_secs: default_jwks_cache_ttl_secs(),
            jwks_refresh_cooldown_secs: default_jwks_refresh_cooldown_secs(),
            jwks_fetch_timeout_secs: default_jwks_fetch_timeout_secs(),
            jwks_max_stale_secs: default_jwks_max_stale_secs(),
        }
    }
}

impl AuthSettings {
    /// 発行者を指定して AuthSettings を生成する。その他はデフォルト値。
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: Some(issuer.to_string()),
            ..Self::default()
        }
    }

    /// YAML 文字列から読み込む。
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn with_public_key(mut self, public_key: &str) -> Self {
        self.public_key = Some(public_key.to_string());
        self
    }

    pub fn with_jwks_uri(mut self, jwks_uri: &str) -> Self {
        self.jwks_uri = Some(jwks_uri.to_string());
        self
    }

    pub fn with_keycloak_jwks_uri(mut self, uri: &str) -> Self {
        self.keycloak_jwks_uri = Some(uri.to_string());
        self
    }

    pub fn with_maximum_leeway(mut self, secs: u64) -> Self {
        self.maximum_leeway = secs;
        self
    }

    pub fn with_resource_name(mut self, resource_name: &str) -> Self {
        self.resource_name = Some(resource_name.to_string());
        self
    }

    pub fn with_unknown_scheme(mut self, policy: UnknownSchemePolicy) -> Self {
        self.unknown_scheme = policy;
        self
    }

    pub fn with_skip_service(mut self, service: &str) -> Self {
        self.skip_services.push(service.to_string());
        self
    }

    /// 空文字列は未設定として扱う。
    pub(crate) fn issuer(&self) -> Option<&str> {
        non_empty(self.issuer.as_deref())
    }

    pub(crate) fn resource_name(&self) -> Option<&str> {
        non_empty(self.resource_name.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// YAML を読み込み AuthSettings を返す。env_path があればマージする。
pub fn load(base_path: &str, env_path: Option<&str>) -> Result<AuthSettings, ConfigError> {
    let base = std::fs::read_to_string(base_path)?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&base)?;

    if let Some(env) = env_path {
        let env_data = std::fs::read_to_string(env)?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(&env_data)?;
        merge_yaml(&mut value, &overlay);
    }

    Ok(serde_yaml::from_value(value)?)
}

/// base YAML Value に overlay YAML Value を再帰的にマージする。
pub fn merge_yaml(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(key) {
                    merge_yaml(base_value, value);
                } else {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// TrustSource は署名鍵の取得元を表す。有効なのは常にひとつだけ。
///
/// バリアントの並びが優先順位を表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    /// jwks-uri から組み立てた well-known エンドポイント。
    JwksUri(Url),
    /// keycloak-jwks-uri をそのまま使うエンドポイント。
    KeycloakJwksUri(Url),
    /// JWK または JWKS の JSON テキスト（base64 デコード済み）。
    InlineJwks(String),
    /// PEM 形式の RSA 公開鍵。
    PublicKeyPem(String),
}

impl TrustSource {
    /// 設定から優先順位に従って取得元を選択する。未設定の場合は None。
    pub fn select(settings: &AuthSettings) -> Result<Option<Self>, ConfigError> {
        let jwks_uri = non_empty(settings.jwks_uri.as_deref());
        let keycloak = non_empty(settings.keycloak_jwks_uri.as_deref());
        let public_key = non_empty(settings.public_key.as_deref());

        let source = if let Some(uri) = jwks_uri {
            Some(TrustSource::JwksUri(well_known_jwks_url(uri)?))
        } else if let Some(uri) = keycloak {
            Some(TrustSource::KeycloakJwksUri(parse_url(uri)?))
        } else {
            public_key.map(classify_public_key)
        };

        let configured = [jwks_uri, keycloak, public_key]
            .iter()
            .filter(|v| v.is_some())
            .count();
        if configured > 1 {
            tracing::warn!(
                selected = ?source.as_ref().map(TrustSource::kind),
                "multiple trust sources configured; only the first by precedence is used"
            );
        }

        Ok(source)
    }

    /// ログ出力用の種別名。
    pub fn kind(&self) -> &'static str {
        match self {
            TrustSource::JwksUri(_) => "jwks-uri",
            TrustSource::KeycloakJwksUri(_) => "keycloak-jwks-uri",
            TrustSource::InlineJwks(_) => "inline-jwks",
            TrustSource::PublicKeyPem(_) => "public-key-pem",
        }
    }
}

fn parse_url(uri: &str) -> Result<Url, ConfigError> {
    Url::parse(uri).map_err(|e| ConfigError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}

/// ドメインまたは URL から well-known JWKS エンドポイントを組み立てる。
/// スキームが無い場合は https とみなす。既存のパスは置き換える。
fn well_known_jwks_url(domain: &str) -> Result<Url, ConfigError> {
    let with_scheme = if domain.contains("://") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    };
    let base = parse_url(&with_scheme)?;
    base.join(WELL_KNOWN_JWKS_PATH)
        .map_err(|e| ConfigError::InvalidUri {
            uri: domain.to_string(),
            reason: e.to_string(),
        })
}

/// public-key の内容が JWK/JWKS か PEM かを判定する。
fn classify_public_key(raw: &str) -> TrustSource {
    match decode_jwk_json(raw) {
        Some(json) => TrustSource::InlineJwks(json),
        None => TrustSource::PublicKeyPem(normalize_pem(raw)),
    }
}

/// base64 でエンコードされた JSON、または JSON そのものであればテキストを返す。
fn decode_jwk_json(raw: &str) -> Option<String> {
    if let Ok(bytes) = STANDARD.decode(raw) {
        if let Ok(text) = String::from_utf8(bytes) {
            if is_json_object(&text) {
                return Some(text);
            }
        }
    }
    is_json_object(raw).then(|| raw.to_string())
}

fn is_json_object(text: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(serde_json::Value::Object(_))
    )
}

/// アーマー行のない base64 本体を SPKI の PEM に整形する。
fn normalize_pem(raw: &str) -> String {
    if raw.contains("-----BEGIN") {
        return raw.to_string();
    }
    let body: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}

/// TrustConfig は検証済みの信頼設定を表す。
#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub issuer: Option<String>,
    pub leeway: Duration,
    pub resource_name: Option<String>,
    pub source: Option<TrustSource>,
}

impl TrustConfig {
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, ConfigError> {
        let source = TrustSource::select(settings)?;
        let issuer = settings.issuer().map(str::to_string);

        if issuer.is_none() {
            tracing::warn!("issuer is not configured; every token will be rejected");
        }
        if source.is_none() {
            tracing::warn!(
                "neither jwks-uri, keycloak-jwks-uri nor public-key is configured; every token will be rejected"
            );
        }

        Ok(Self {
            issuer,
            leeway: Duration::from_secs(settings.maximum_leeway),
            resource_name: settings.resource_name().map(str::to_string),
            source,
        })
    }
}
