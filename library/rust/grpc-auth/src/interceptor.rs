//! 呼び出し単位の認証・認可インターセプター。
//!
//! ヘッダー確認 → スキーム確認 → トークン検証 → ポリシー参照 → 判定 の順に処理し、
//! 転送・素通し・拒否のいずれかを決定する。

use crate::access::AccessEvaluator;
use crate::claims::VerifiedToken;
use crate::config::{AuthSettings, TrustConfig, UnknownSchemePolicy};
use crate::error::{AuthError, StartupError};
use crate::key_resolver::{JwksFetcher, JwksOptions, KeyResolver};
use crate::layer::AuthLayer;
use crate::policy::{PolicyCompiler, PolicyTable, ServiceDeclaration};
use crate::verifier::TokenVerifier;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use std::collections::HashSet;
use std::sync::Arc;
use tonic::Status;

/// CallDecision はインターセプターの判定結果。
#[derive(Debug, Clone)]
pub enum CallDecision {
    /// 検証済みトークンを付与して転送する。
    Allow(VerifiedToken),
    /// 認証を行わずに転送する。
    PassThrough,
    /// 呼び出しを終了する。ハンドラーは実行されない。
    Reject(AuthError),
}

impl CallDecision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallDecision::Reject(_))
    }

    /// 転送する場合は検証済みトークン（素通しの場合は None）、拒否の場合は Status を返す。
    pub fn into_result(self) -> Result<Option<VerifiedToken>, Status> {
        match self {
            CallDecision::Allow(token) => Ok(Some(token)),
            CallDecision::PassThrough => Ok(None),
            CallDecision::Reject(e) => Err(e.into()),
        }
    }
}

/// AuthContext は起動時に一度だけ構築され、全呼び出しで共有される状態。
pub struct AuthContext {
    verifier: TokenVerifier,
    evaluator: AccessEvaluator,
    policies: PolicyTable,
    unknown_scheme: UnknownSchemePolicy,
    skip_services: HashSet<String>,
}

impl AuthContext {
    /// 設定とサービス宣言から構築する。失敗した場合はサーバーを起動してはならない。
    pub fn build(
        settings: &AuthSettings,
        declarations: &[ServiceDeclaration],
    ) -> Result<Self, StartupError> {
        let trust = TrustConfig::from_settings(settings)?;
        let resolver = KeyResolver::from_config(&trust, JwksOptions::from_settings(settings))?;
        Self::assemble(settings, &trust, resolver, declarations)
    }

    /// カスタム JWKS フェッチャーを使って構築する。
    pub fn build_with_fetcher(
        settings: &AuthSettings,
        declarations: &[ServiceDeclaration],
        fetcher: Arc<dyn JwksFetcher>,
    ) -> Result<Self, StartupError> {
        let trust = TrustConfig::from_settings(settings)?;
        let resolver = KeyResolver::with_fetcher(
            trust.source.as_ref(),
            JwksOptions::from_settings(settings),
            fetcher,
        )?;
        Self::assemble(settings, &trust, resolver, declarations)
    }

    fn assemble(
        settings: &AuthSettings,
        trust: &TrustConfig,
        resolver: KeyResolver,
        declarations: &[ServiceDeclaration],
    ) -> Result<Self, StartupError> {
        let policies = PolicyCompiler::compile(declarations)?;
        let evaluator = AccessEvaluator::new(trust.resource_name.clone())
            .with_resource_names(settings.resource_names.clone());

        tracing::info!(
            key_source = resolver.kind(),
            policies = policies.len(),
            unknown_scheme = ?settings.unknown_scheme,
            "gRPC authentication initialized"
        );

        Ok(Self {
            verifier: TokenVerifier::new(trust, resolver),
            evaluator,
            policies,
            unknown_scheme: settings.unknown_scheme,
            skip_services: settings.skip_services.iter().cloned().collect(),
        })
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }
}

/// AuthInterceptor は各 gRPC 呼び出しを認証・認可する。クローンは状態を共有する。
#[derive(Clone)]
pub struct AuthInterceptor {
    context: Arc<AuthContext>,
}

impl AuthInterceptor {
    pub fn new(context: AuthContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    pub fn context(&self) -> &AuthContext {
        &self.context
    }

    /// tonic サーバーに適用する Tower Layer を返す。
    pub fn layer(&self) -> AuthLayer {
        AuthLayer::new(self.clone())
    }

    /// 呼び出しパス（`/package.Service/Method`）とヘッダーから判定する。
    pub async fn authorize(&self, path: &str, headers: &HeaderMap) -> CallDecision {
        self.authorize_at(path, headers, jsonwebtoken::get_current_timestamp())
            .await
    }

    /// 指定時刻（Unix 秒）で判定する。
    pub async fn authorize_at(&self, path: &str, headers: &HeaderMap, now: u64) -> CallDecision {
        let (service, method) = extract_grpc_service_method(path);
        let ctx = &self.context;

        if ctx.skip_services.contains(service) {
            return CallDecision::PassThrough;
        }

        let header = match authorization_header(headers) {
            Ok(header) => header,
            Err(e) => return reject(service, method, e),
        };

        let (scheme, token) = split_scheme(header);
        if !scheme.eq_ignore_ascii_case("bearer") {
            let secured = ctx.policies.is_secured(service);
            return match ctx.unknown_scheme {
                UnknownSchemePolicy::Reject if secured => reject(
                    service,
                    method,
                    AuthError::UnsupportedScheme(scheme.to_string()),
                ),
                _ => {
                    tracing::debug!(service, method, scheme, "passing through non-Bearer call");
                    CallDecision::PassThrough
                }
            };
        }
        if token.is_empty() {
            return reject(service, method, AuthError::MissingToken);
        }

        let verified = match ctx.verifier.verify_at(token, now).await {
            Ok(verified) => verified,
            Err(e) => return reject(service, method, e),
        };

        if let Err(e) = ctx
            .evaluator
            .evaluate(&ctx.policies, service, method, &verified.claims)
        {
            return reject(service, method, e);
        }

        tracing::debug!(service, method, subject = ?verified.subject(), "call authorized");
        CallDecision::Allow(verified)
    }
}

fn reject(service: &str, method: &str, error: AuthError) -> CallDecision {
    tracing::warn!(
        service,
        method,
        code = ?error.code(),
        reason = %error,
        "gRPC call rejected"
    );
    CallDecision::Reject(error)
}

/// Authorization ヘッダーの値を返す。無い場合・空の場合は MissingToken。
fn authorization_header(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers.get(AUTHORIZATION).ok_or(AuthError::MissingToken)?;
    let value = value
        .to_str()
        .map_err(|_| AuthError::MalformedToken("authorization header is not ASCII".into()))?
        .trim();
    if value.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(value)
}

/// `Scheme credentials` をスキームとクレデンシャルに分割する。
fn split_scheme(header: &str) -> (&str, &str) {
    match header.split_once(char::is_whitespace) {
        Some((scheme, token)) => (scheme, token.trim()),
        None => (header, ""),
    }
}

/// URI パスから gRPC service 名と method 名を抽出する。
/// 入力例: `/package.ServiceName/MethodName`
/// 戻り値: `("package.ServiceName", "MethodName")`
pub(crate) fn extract_grpc_service_method(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.rsplit_once('/') {
        Some((service, method)) => (service, method),
        None => ("unknown", trimmed),
    }
}
