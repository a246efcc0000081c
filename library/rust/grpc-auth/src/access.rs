//! ロールベースのアクセス判定。

use crate::claims::Claims;
use crate::error::AuthError;
use crate::policy::{Policy, PolicyTable};
use std::collections::HashMap;

/// AccessEvaluator は検証済み Claims とポリシーテーブルから許可・拒否を判定する。
#[derive(Debug, Clone, Default)]
pub struct AccessEvaluator {
    resource_name: Option<String>,
    resource_names: HashMap<String, String>,
}

impl AccessEvaluator {
    pub fn new(resource_name: Option<String>) -> Self {
        Self {
            resource_name,
            resource_names: HashMap::new(),
        }
    }

    /// サービス単位のリソース名を設定する。グローバルなリソース名より優先される。
    pub fn with_resource_names(mut self, resource_names: HashMap<String, String>) -> Self {
        self.resource_names = resource_names;
        self
    }

    /// サービスに適用するリソース名を返す。
    pub fn resource_for(&self, service: &str) -> Option<&str> {
        self.resource_names
            .get(service)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .or(self.resource_name.as_deref())
    }

    /// 呼び出し元のロール一覧を返す。
    ///
    /// `resource_access[resource]` が存在すればそのロールのみを使い、
    /// 存在しなければトップレベルの `roles` を使う。どちらも無ければ空。
    pub fn caller_roles<'a>(&self, service: &str, claims: &'a Claims) -> &'a [String] {
        self.resource_for(service)
            .and_then(|resource| claims.resource_roles(resource))
            .or_else(|| claims.flat_roles())
            .unwrap_or_default()
    }

    /// (service, method) の呼び出しを許可するか判定する。
    pub fn evaluate(
        &self,
        table: &PolicyTable,
        service: &str,
        method: &str,
        claims: &Claims,
    ) -> Result<(), AuthError> {
        match table.get(service, method) {
            // 保護対象サービスの未宣言メソッドは拒否する
            None if table.is_secured(service) => {
                tracing::debug!(service, method, "method has no policy in a secured service");
                Err(AuthError::PermissionDenied)
            }
            None | Some(Policy::PermitAll) => Ok(()),
            Some(Policy::Deny) => Err(AuthError::PermissionDenied),
            Some(Policy::RolesAllowed(allowed)) => {
                let roles = self.caller_roles(service, claims);
                if roles.iter().any(|r| allowed.contains(r)) {
                    Ok(())
                } else {
                    tracing::debug!(
                        service,
                        method,
                        caller_roles = ?roles,
                        required_roles = ?allowed,
                        "caller has none of the required roles"
                    );
                    Err(AuthError::PermissionDenied)
                }
            }
        }
    }
}
