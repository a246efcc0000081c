//! 認証・認可エラー定義。

use tonic::{Code, Status};

/// AuthError は呼び出し単位の認証・認可エラーを表す。
///
/// インターセプター内で必ず回収され、gRPC ステータスとしてクライアントに返される。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingToken,

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("signing key resolution failed: {0}")]
    KeyResolutionFailure(String),

    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("issuer mismatch: expected {expected:?}, got {actual:?}")]
    IssuerMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("token expired")]
    ExpiredToken,

    #[error("token not yet valid")]
    TokenNotYetValid,

    #[error("unsupported Authorization scheme: {0}")]
    UnsupportedScheme(String),

    #[error("permission denied")]
    PermissionDenied,
}

impl AuthError {
    /// gRPC ステータスコードを返す。
    pub fn code(&self) -> Code {
        match self {
            AuthError::PermissionDenied => Code::PermissionDenied,
            _ => Code::Unauthenticated,
        }
    }

    /// クライアントに返す説明文。詳細な理由はログにのみ出力する。
    pub fn description(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "JWT token is missing",
            AuthError::UnsupportedScheme(_) => "Unsupported authorization scheme",
            AuthError::PermissionDenied => "Client has insufficient permissions",
            _ => "JWT token not valid",
        }
    }

    /// tonic::Status に変換する。
    pub fn to_status(&self) -> Status {
        Status::new(self.code(), self.description())
    }
}

impl From<AuthError> for Status {
    fn from(e: AuthError) -> Self {
        e.to_status()
    }
}

/// PolicyCompilationError は起動時のポリシーテーブル構築エラーを表す。
/// 発生した場合はサーバーを起動してはならない。
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyCompilationError {
    #[error("no security annotation (DenyAll, PermitAll, RolesAllowed) on secured method: service={service}, method={method}")]
    MissingAnnotation { service: String, method: String },

    #[error("no implementation method matches rpc method: service={service}, method={method}")]
    UnmatchedMethod { service: String, method: String },

    #[error("multiple implementation methods match rpc method: service={service}, method={method}")]
    AmbiguousMethod { service: String, method: String },

    #[error("annotated implementation method matches no rpc method: service={service}, method={method}")]
    OrphanAnnotation { service: String, method: String },

    #[error("service declared more than once: {0}")]
    DuplicateService(String),
}

/// ConfigError は認証設定の読み込み・検証エラーを表す。
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("invalid JWKS uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("failed to build JWKS HTTP client: {0}")]
    HttpClient(String),
}

/// StartupError は AuthContext 構築時の致命的エラーを表す。
#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    PolicyCompilation(#[from] PolicyCompilationError),
}
