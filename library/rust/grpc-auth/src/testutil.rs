//! テスト用ヘルパー: RSA 鍵ペア・トークン生成・モック JWKS フェッチャー。

use crate::error::AuthError;
use crate::key_resolver::{parse_jwk_document, JwkKey, JwksFetcher};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const TEST_ISSUER: &str = "https://auth.k1s0.internal.example.com/realms/k1s0";

/// テスト用の RSA 鍵ペア。
pub(crate) struct TestKey {
    pub encoding: EncodingKey,
    pub n: String,
    pub e: String,
    pub public_pem: String,
}

fn generate_test_key() -> TestKey {
    let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
    let public_key = private_key.to_public_key();

    let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

    let pem = private_key.to_pkcs1_pem(LineEnding::LF).unwrap();
    let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();

    TestKey {
        encoding,
        n,
        e,
        public_pem,
    }
}

/// 鍵生成は重いためテスト全体で共有する。
pub(crate) fn key_a() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(generate_test_key)
}

pub(crate) fn key_b() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(generate_test_key)
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// 公開鍵を JWK 形式の JSON にする。kid が None の場合は kid を含めない。
pub(crate) fn jwk_value(key: &TestKey, kid: Option<&str>) -> serde_json::Value {
    let mut jwk = serde_json::json!({
        "kty": "RSA",
        "alg": "RS256",
        "use": "sig",
        "n": key.n,
        "e": key.e,
    });
    if let Some(kid) = kid {
        jwk["kid"] = serde_json::Value::String(kid.to_string());
    }
    jwk
}

pub(crate) fn jwks_json(keys: &[(&str, &TestKey)]) -> String {
    let keys: Vec<_> = keys
        .iter()
        .map(|&(kid, key)| jwk_value(key, Some(kid)))
        .collect();
    serde_json::json!({ "keys": keys }).to_string()
}

/// RS256 で署名したトークンを生成する。
pub(crate) fn sign(key: &TestKey, kid: Option<&str>, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_string);
    encode(&header, claims, &key.encoding).unwrap()
}

/// 発行者と有効期限だけを持つ Claims に追加の Claim をマージする。
pub(crate) fn claims_with(exp: u64, extra: serde_json::Value) -> serde_json::Value {
    let mut claims = serde_json::json!({
        "iss": TEST_ISSUER,
        "sub": "user-uuid-1234",
        "exp": exp,
        "iat": exp.saturating_sub(900),
    });
    if let (Some(base), serde_json::Value::Object(extra)) = (claims.as_object_mut(), extra) {
        base.extend(extra);
    }
    claims
}

/// フェッチ回数を記録するフェッチャー。返す鍵は差し替え可能。
pub(crate) struct CountingFetcher {
    keys: Mutex<String>,
    count: AtomicUsize,
    fail_next: AtomicBool,
}

impl CountingFetcher {
    pub fn new(keys: Vec<(&str, &TestKey)>) -> Self {
        Self {
            keys: Mutex::new(jwks_json(&keys)),
            count: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn set_keys(&self, keys: Vec<(&str, &TestKey)>) {
        *self.keys.lock().unwrap() = jwks_json(&keys);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl JwksFetcher for CountingFetcher {
    async fn fetch_keys(&self, _jwks_url: &str) -> Result<Vec<JwkKey>, AuthError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AuthError::KeyResolutionFailure("connection refused".into()));
        }
        let json = self.keys.lock().unwrap().clone();
        parse_jwk_document(&json).map_err(AuthError::KeyResolutionFailure)
    }
}

/// 常に失敗するフェッチャー。
pub(crate) struct FailingFetcher;

#[async_trait::async_trait]
impl JwksFetcher for FailingFetcher {
    async fn fetch_keys(&self, _jwks_url: &str) -> Result<Vec<JwkKey>, AuthError> {
        Err(AuthError::KeyResolutionFailure("connection refused".into()))
    }
}
