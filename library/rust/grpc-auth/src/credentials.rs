//! クライアント側: 送信する全リクエストに Bearer トークンを付与する。

use tonic::metadata::errors::InvalidMetadataValue;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

/// BearerCredentials は `authorization: Bearer <token>` を付与する tonic クライアントインターセプター。
///
/// ```ignore
/// let credentials = BearerCredentials::new(&access_token)?;
/// let client = OrderServiceClient::with_interceptor(channel, credentials);
/// ```
#[derive(Clone)]
pub struct BearerCredentials {
    value: AsciiMetadataValue,
}

impl BearerCredentials {
    /// トークンに改行などメタデータとして不正な文字が含まれる場合はエラー。
    pub fn new(token: &str) -> Result<Self, InvalidMetadataValue> {
        let value = format!("Bearer {token}").parse()?;
        Ok(Self { value })
    }
}

impl std::fmt::Debug for BearerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerCredentials")
            .field("value", &"Bearer <redacted>")
            .finish()
    }
}

impl Interceptor for BearerCredentials {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.value.clone());
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attaches_bearer_header() {
        let mut credentials = BearerCredentials::new("abc.def.ghi").unwrap();
        let request = credentials.call(Request::new(())).unwrap();

        assert_eq!(
            request.metadata().get("authorization").unwrap(),
            "Bearer abc.def.ghi"
        );
    }

    #[test]
    fn test_replaces_existing_header() {
        let mut credentials = BearerCredentials::new("new").unwrap();
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("authorization", "Bearer old".parse().unwrap());

        let request = credentials.call(request).unwrap();
        assert_eq!(request.metadata().get_all("authorization").iter().count(), 1);
        assert_eq!(request.metadata().get("authorization").unwrap(), "Bearer new");
    }

    #[test]
    fn test_rejects_invalid_token() {
        assert!(BearerCredentials::new("abc\ndef").is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let credentials = BearerCredentials::new("secret-token").unwrap();
        assert!(!format!("{credentials:?}").contains("secret-token"));
    }
}
