//! トークン検証器: 構造の解析、署名鍵の解決、署名・発行者・有効期限の検証を順に行う。

use crate::claims::{Claims, VerifiedToken};
use crate::config::TrustConfig;
use crate::error::AuthError;
use crate::key_resolver::KeyResolver;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Header, Validation};
use std::time::Duration;

/// TokenVerifier は設定済みの信頼情報で JWT を検証する。構築後は読み取り専用。
pub struct TokenVerifier {
    issuer: Option<String>,
    leeway: Duration,
    resolver: KeyResolver,
}

impl TokenVerifier {
    pub fn new(config: &TrustConfig, resolver: KeyResolver) -> Self {
        Self {
            issuer: config.issuer.clone(),
            leeway: config.leeway,
            resolver,
        }
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// 現在時刻でトークンを検証する。
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        self.verify_at(token, jsonwebtoken::get_current_timestamp())
            .await
    }

    /// 指定時刻（Unix 秒）でトークンを検証する。
    pub async fn verify_at(&self, token: &str, now: u64) -> Result<VerifiedToken, AuthError> {
        // 1. 署名を信用せずに構造を解析する
        let header = decode_unverified(token)?;

        // 2. kid から署名鍵を解決する
        let key = self.resolver.resolve(header.kid.as_deref()).await?;

        // 3. 署名検証（RS256 のみ）。iss / exp は以降で順に検証する
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::SignatureInvalid(format!(
                "algorithm {:?} is not allowed",
                header.alg
            )));
        }
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &key.key, &validation).map_err(map_jwt_error)?;
        let claims = data.claims;

        // 4. 発行者
        if self.issuer.is_none() || claims.iss != self.issuer {
            return Err(AuthError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: claims.iss,
            });
        }

        // 5. 有効期限（leeway を加味する）
        let leeway = self.leeway.as_secs();
        let exp = claims
            .exp
            .ok_or_else(|| AuthError::MalformedToken("missing exp claim".into()))?;
        if now > exp.saturating_add(leeway) {
            return Err(AuthError::ExpiredToken);
        }
        if let Some(nbf) = claims.nbf {
            if now.saturating_add(leeway) < nbf {
                return Err(AuthError::TokenNotYetValid);
            }
        }

        Ok(VerifiedToken {
            header: data.header,
            claims,
        })
    }
}

/// ヘッダーとペイロードを署名検証なしで解析する。
fn decode_unverified(token: &str) -> Result<Header, AuthError> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::MalformedToken(
            "token must have three segments".into(),
        ));
    };

    let header = decode_header(token).map_err(|e| AuthError::MalformedToken(e.to_string()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::MalformedToken(format!("invalid payload encoding: {e}")))?;
    serde_json::from_slice::<Claims>(&payload)
        .map_err(|e| AuthError::MalformedToken(format!("invalid claims: {e}")))?;

    Ok(header)
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> AuthError {
    match e.kind() {
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::MalformedToken(e.to_string()),
        _ => AuthError::SignatureInvalid(e.to_string()),
    }
}
