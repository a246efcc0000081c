//! 署名鍵の解決: JWKS エンドポイント・インライン JWK/JWKS・静的 PEM のいずれかから
//! トークンの kid に対応する公開鍵を取り出す。

use crate::config::{AuthSettings, TrustConfig, TrustSource};
use crate::error::{AuthError, ConfigError};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use url::Url;

/// ResolvedKey は kid と署名検証用の公開鍵の組。生成後は変更しない。
#[derive(Clone)]
pub struct ResolvedKey {
    pub kid: Option<String>,
    pub key: DecodingKey,
}

impl std::fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// JwkKey は JWKS ドキュメント内の個々の鍵。
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct JwkKey {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

/// JWKS（keys 配列）または単一 JWK。
#[derive(Deserialize)]
#[serde(untagged)]
enum JwkDocument {
    Set { keys: Vec<JwkKey> },
    Single(JwkKey),
}

impl JwkDocument {
    fn into_keys(self) -> Vec<JwkKey> {
        match self {
            JwkDocument::Set { keys } => keys,
            JwkDocument::Single(key) => vec![key],
        }
    }
}

/// JWK または JWKS の JSON テキストを鍵の一覧に変換する。
pub fn parse_jwk_document(json: &str) -> Result<Vec<JwkKey>, String> {
    serde_json::from_str::<JwkDocument>(json)
        .map(JwkDocument::into_keys)
        .map_err(|e| format!("failed to parse JWK/JWKS payload: {e}"))
}

/// RS256 で使用できる RSA 鍵だけを公開鍵に変換する。それ以外は読み飛ばす。
fn to_resolved_keys(keys: Vec<JwkKey>) -> Vec<ResolvedKey> {
    keys.into_iter()
        .filter_map(|k| {
            if k.kty != "RSA" || k.alg.as_deref().is_some_and(|alg| alg != "RS256") {
                tracing::debug!(kid = ?k.kid, kty = %k.kty, alg = ?k.alg, "skipping non-RS256 key");
                return None;
            }
            let (Some(n), Some(e)) = (k.n.as_deref(), k.e.as_deref()) else {
                tracing::warn!(kid = ?k.kid, "RSA key without modulus or exponent");
                return None;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => Some(ResolvedKey { kid: k.kid, key }),
                Err(err) => {
                    tracing::warn!(kid = ?k.kid, error = %err, "invalid RSA key components");
                    None
                }
            }
        })
        .collect()
}

/// kid が完全一致する鍵を探す。kid の無い鍵は kid の無いトークンにだけ一致する。
fn find_key(keys: &[ResolvedKey], kid: Option<&str>) -> Option<ResolvedKey> {
    keys.iter().find(|k| k.kid.as_deref() == kid).cloned()
}

fn unknown_kid(kid: Option<&str>) -> AuthError {
    AuthError::KeyResolutionFailure(format!("no key found for kid {kid:?}"))
}

/// JwksFetcher は JWKS エンドポイントからの鍵取得を抽象化するトレイト。
#[async_trait::async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch_keys(&self, jwks_url: &str) -> Result<Vec<JwkKey>, AuthError>;
}

/// HttpJwksFetcher は HTTP 経由で JWKS を取得するデフォルト実装。
pub struct HttpJwksFetcher {
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// タイムアウト付きの HTTP クライアントでフェッチャーを生成する。
    /// タイムアウトを設定できないクライアントは使わない。
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch_keys(&self, jwks_url: &str) -> Result<Vec<JwkKey>, AuthError> {
        let response = self
            .client
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyResolutionFailure(format!("JWKS fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::KeyResolutionFailure(format!(
                "JWKS endpoint returned non-success status: {status}"
            )));
        }

        let document: JwkDocument = response.json().await.map_err(|e| {
            AuthError::KeyResolutionFailure(format!("failed to parse JWKS response: {e}"))
        })?;

        Ok(document.into_keys())
    }
}

/// JwksOptions はリモート JWKS のキャッシュ・取得設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JwksOptions {
    pub cache_ttl: Duration,
    pub refresh_cooldown: Duration,
    pub fetch_timeout: Duration,
    /// 最後の取得成功から、取得失敗時に古い鍵を使い続けてよい期間。
    pub max_staleness: Duration,
}

impl JwksOptions {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            cache_ttl: Duration::from_secs(settings.jwks_cache_ttl_secs),
            refresh_cooldown: Duration::from_secs(settings.jwks_refresh_cooldown_secs),
            fetch_timeout: Duration::from_secs(settings.jwks_fetch_timeout_secs),
            max_staleness: Duration::from_secs(settings.jwks_max_stale_secs),
        }
    }
}

impl Default for JwksOptions {
    fn default() -> Self {
        Self::from_settings(&AuthSettings::default())
    }
}

/// 加算がオーバーフローする場合の上限（100 年）。
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `from + after` を返す。表現できない場合は FAR_FUTURE 先で打ち切る。
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

/// JWKS キャッシュ。
struct JwksCache {
    keys: Arc<Vec<ResolvedKey>>,
    fetched_at: Instant,
    expires_at: Instant,
}

/// RemoteJwks は JWKS エンドポイントから取得した鍵をキャッシュして解決する。
pub struct RemoteJwks {
    endpoint: Url,
    options: JwksOptions,
    cache: RwLock<Option<JwksCache>>,
    fetcher: Arc<dyn JwksFetcher>,
}

impl RemoteJwks {
    pub fn new(endpoint: Url, options: JwksOptions, fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self {
            endpoint,
            options,
            cache: RwLock::new(None),
            fetcher,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn resolve(&self, kid: Option<&str>) -> Result<ResolvedKey, AuthError> {
        let keys = self.get_keys().await?;
        if let Some(key) = find_key(&keys, kid) {
            return Ok(key);
        }

        // 未知の kid は鍵ローテーションの可能性があるため再取得する
        let keys = self.refresh_for_unknown_kid().await?;
        find_key(&keys, kid).ok_or_else(|| unknown_kid(kid))
    }

    /// キャッシュから鍵を取得する。期限切れの場合は再取得する。
    async fn get_keys(&self) -> Result<Arc<Vec<ResolvedKey>>, AuthError> {
        // Read lock でキャッシュを確認
        {
            let cache = self.cache.read().await;
            if let Some(ref c) = *cache {
                if Instant::now() < c.expires_at {
                    return Ok(c.keys.clone());
                }
            }
        }

        // Write lock で再取得
        let mut cache = self.cache.write().await;

        // ダブルチェック
        if let Some(ref c) = *cache {
            if Instant::now() < c.expires_at {
                return Ok(c.keys.clone());
            }
        }

        match self.fetch().await {
            Ok(keys) => Ok(Self::store(&mut cache, keys, self.options.cache_ttl)),
            Err(e) => match cache.as_mut() {
                Some(stale) if stale.fetched_at.elapsed() < self.options.max_staleness => {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "JWKS refresh failed; serving stale keys"
                    );
                    stale.expires_at = deadline(Instant::now(), self.options.refresh_cooldown);
                    Ok(stale.keys.clone())
                }
                Some(_) => {
                    tracing::error!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "JWKS refresh failed and cached keys exceeded the staleness limit"
                    );
                    Err(e)
                }
                None => Err(e),
            },
        }
    }

    /// 直近の取得からクールダウン以上経過していれば再取得する。
    async fn refresh_for_unknown_kid(&self) -> Result<Arc<Vec<ResolvedKey>>, AuthError> {
        let mut cache = self.cache.write().await;
        if let Some(ref c) = *cache {
            if c.fetched_at.elapsed() < self.options.refresh_cooldown {
                return Ok(c.keys.clone());
            }
        }

        let keys = self.fetch().await?;
        Ok(Self::store(&mut cache, keys, self.options.cache_ttl))
    }

    async fn fetch(&self) -> Result<Vec<ResolvedKey>, AuthError> {
        tracing::debug!(endpoint = %self.endpoint, "fetching JWKS");
        let keys = self.fetcher.fetch_keys(self.endpoint.as_str()).await?;
        Ok(to_resolved_keys(keys))
    }

    fn store(
        cache: &mut Option<JwksCache>,
        keys: Vec<ResolvedKey>,
        ttl: Duration,
    ) -> Arc<Vec<ResolvedKey>> {
        let keys = Arc::new(keys);
        let now = Instant::now();
        *cache = Some(JwksCache {
            keys: keys.clone(),
            fetched_at: now,
            expires_at: deadline(now, ttl),
        });
        keys
    }

    /// キャッシュを無効化する。
    pub async fn invalidate_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }
}

/// KeyResolver は設定された取得元から署名鍵を解決する。有効な取得元は常にひとつ。
pub enum KeyResolver {
    /// jwks-uri または keycloak-jwks-uri。
    Remote(RemoteJwks),
    /// 起動時に一度だけ解析したインライン JWK/JWKS。
    Inline(Vec<ResolvedKey>),
    /// kid に関係なく使用する静的な公開鍵。
    Static(ResolvedKey),
    /// 取得元が未設定。常に失敗する。
    Unconfigured,
}

impl KeyResolver {
    /// 信頼設定から HTTP フェッチャーを使う KeyResolver を生成する。
    pub fn from_config(config: &TrustConfig, options: JwksOptions) -> Result<Self, ConfigError> {
        let fetcher = Arc::new(HttpJwksFetcher::new(options.fetch_timeout)?);
        Self::with_fetcher(config.source.as_ref(), options, fetcher)
    }

    /// カスタムフェッチャーを使う KeyResolver を生成する（テスト用）。
    pub fn with_fetcher(
        source: Option<&TrustSource>,
        options: JwksOptions,
        fetcher: Arc<dyn JwksFetcher>,
    ) -> Result<Self, ConfigError> {
        match source {
            Some(TrustSource::JwksUri(url) | TrustSource::KeycloakJwksUri(url)) => Ok(
                KeyResolver::Remote(RemoteJwks::new(url.clone(), options, fetcher)),
            ),
            Some(TrustSource::InlineJwks(json)) => Self::inline(json),
            Some(TrustSource::PublicKeyPem(pem)) => Self::from_pem(pem),
            None => Ok(KeyResolver::Unconfigured),
        }
    }

    /// JWK/JWKS の JSON テキストから生成する。
    pub fn inline(json: &str) -> Result<Self, ConfigError> {
        let keys = parse_jwk_document(json).map_err(ConfigError::InvalidPublicKey)?;
        let keys = to_resolved_keys(keys);
        if keys.is_empty() {
            return Err(ConfigError::InvalidPublicKey(
                "no usable RSA key found in JWK/JWKS payload".into(),
            ));
        }
        Ok(KeyResolver::Inline(keys))
    }

    /// PEM 形式の RSA 公開鍵から生成する。
    pub fn from_pem(pem: &str) -> Result<Self, ConfigError> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))?;
        Ok(KeyResolver::Static(ResolvedKey { kid: None, key }))
    }

    /// kid に対応する公開鍵を返す。
    pub async fn resolve(&self, kid: Option<&str>) -> Result<ResolvedKey, AuthError> {
        match self {
            KeyResolver::Remote(remote) => remote.resolve(kid).await,
            KeyResolver::Inline(keys) => find_key(keys, kid).ok_or_else(|| unknown_kid(kid)),
            KeyResolver::Static(key) => Ok(key.clone()),
            KeyResolver::Unconfigured => Err(AuthError::KeyResolutionFailure(
                "no trust source configured".into(),
            )),
        }
    }

    /// リモート JWKS のキャッシュを無効化する。それ以外では何もしない。
    pub async fn invalidate_cache(&self) {
        if let KeyResolver::Remote(remote) = self {
            remote.invalidate_cache().await;
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeyResolver::Remote(_) => "remote-jwks",
            KeyResolver::Inline(_) => "inline-jwks",
            KeyResolver::Static(_) => "static-pem",
            KeyResolver::Unconfigured => "unconfigured",
        }
    }
}
