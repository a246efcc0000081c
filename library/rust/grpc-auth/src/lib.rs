//! k1s0-grpc-auth: gRPC 呼び出し単位の JWT 認証 + メソッド単位の RBAC ライブラリ
//!
//! Authorization ヘッダーの Bearer トークンを検証し、起動時にサービス宣言から構築した
//! ポリシーテーブルに従ってロールベースの認可を行う。
//! 署名鍵は JWKS エンドポイント（Keycloak 形式を含む）、インライン JWK/JWKS、
//! または PEM 公開鍵から解決する。
//!
//! # 使い方
//!
//! ```ignore
//! use k1s0_grpc_auth::{AuthContext, AuthInterceptor, Policy, ServiceDeclaration};
//!
//! let settings = k1s0_grpc_auth::config::load("config/auth.yaml", Some("config/auth.prod.yaml"))?;
//! let declarations = [
//!     ServiceDeclaration::for_service::<OrderServiceServer<MyOrderService>>()
//!         .secured(true)
//!         .rpc_methods(["GetOrder", "CancelOrder"])
//!         .method("get_order", Policy::roles_allowed(["user", "admin"]))
//!         .method("cancel_order", Policy::roles_allowed(["admin"])),
//! ];
//!
//! let interceptor = AuthInterceptor::new(AuthContext::build(&settings, &declarations)?);
//!
//! tonic::transport::Server::builder()
//!     .layer(interceptor.layer())
//!     .add_service(OrderServiceServer::new(MyOrderService::default()))
//!     .serve(addr)
//!     .await?;
//! ```

pub mod access;
pub mod claims;
pub mod config;
pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod key_resolver;
pub mod layer;
pub mod policy;
pub mod verifier;

pub use access::AccessEvaluator;
pub use claims::{Claims, VerifiedToken};
pub use config::{AuthSettings, TrustConfig, TrustSource, UnknownSchemePolicy};
pub use credentials::BearerCredentials;
pub use error::{AuthError, ConfigError, PolicyCompilationError, StartupError};
pub use interceptor::{AuthContext, AuthInterceptor, CallDecision};
pub use key_resolver::{HttpJwksFetcher, JwksFetcher, KeyResolver, ResolvedKey};
pub use layer::{AuthLayer, AuthService};
pub use policy::{Policy, PolicyCompiler, PolicyTable, ServiceDeclaration};
pub use verifier::TokenVerifier;

#[cfg(test)]
mod testutil;
