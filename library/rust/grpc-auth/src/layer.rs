use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response};
use tower::{Layer, Service};

use crate::error::AuthError;
use crate::interceptor::{AuthInterceptor, CallDecision};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// AuthLayer は tonic::transport::Server に適用する Tower Layer で、
/// ハンドラーの実行前に呼び出しを認証・認可する。
///
/// # 使用例
///
/// ```ignore
/// use k1s0_grpc_auth::{AuthContext, AuthInterceptor, AuthSettings};
///
/// let settings = k1s0_grpc_auth::config::load("config/auth.yaml", None)?;
/// let interceptor = AuthInterceptor::new(AuthContext::build(&settings, &declarations)?);
///
/// tonic::transport::Server::builder()
///     .layer(interceptor.layer())
///     .add_service(my_service)
///     .serve(addr)
///     .await?;
/// ```
#[derive(Clone)]
pub struct AuthLayer {
    interceptor: AuthInterceptor,
}

impl AuthLayer {
    pub fn new(interceptor: AuthInterceptor) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// AuthService は AuthLayer が生成する Tower Service。
/// 許可された呼び出しには VerifiedToken をリクエストエクステンションに格納して転送し、
/// 拒否した呼び出しには trailers-only の gRPC エラーレスポンスを返す。
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    interceptor: AuthInterceptor,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AuthService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // poll_ready 済みのインスタンスを使う
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let interceptor = self.interceptor.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            match interceptor.authorize(&path, req.headers()).await {
                CallDecision::Allow(token) => {
                    req.extensions_mut().insert(token);
                    inner.call(req).await
                }
                CallDecision::PassThrough => inner.call(req).await,
                CallDecision::Reject(error) => Ok(reject_response(&error)),
            }
        })
    }
}

/// grpc-status / grpc-message をヘッダーに持つ trailers-only レスポンスを生成する。
fn reject_response<B: Default>(error: &AuthError) -> Response<B> {
    let mut response = Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(e) = error.to_status().add_header(headers) {
        tracing::error!(error = %e, "failed to encode gRPC status headers");
    }
    response
}
