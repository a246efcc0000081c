//! メソッド単位のアクセスポリシーと、起動時に一度だけ構築するポリシーテーブル。

use crate::error::PolicyCompilationError;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Policy は RPC メソッドに宣言されたアクセスポリシー。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// 常に拒否する。
    Deny,
    /// 有効なトークンであれば常に許可する。
    PermitAll,
    /// いずれかのロールを持つ呼び出し元だけを許可する。
    RolesAllowed(BTreeSet<String>),
}

impl Policy {
    pub fn roles_allowed<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Policy::RolesAllowed(roles.into_iter().map(Into::into).collect())
    }
}

/// MethodDeclaration はサービス実装側のメソッドと、そのセキュリティ宣言。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDeclaration {
    pub name: String,
    pub policy: Option<Policy>,
}

/// ServiceDeclaration はサービス登録時に渡される宣言。
///
/// `rpc_methods` はプロトコル上のメソッド名、`implementation` は実装側のメソッド一覧。
/// 両者はメソッド名（大文字小文字・アンダースコアを無視）で対応付ける。
///
/// ```ignore
/// let decl = ServiceDeclaration::for_service::<OrderServiceServer<MyOrderService>>()
///     .secured(true)
///     .rpc_methods(["GetOrder", "CancelOrder"])
///     .method("get_order", Policy::roles_allowed(["user", "admin"]))
///     .method("cancel_order", Policy::roles_allowed(["admin"]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDeclaration {
    /// ワイヤー上のサービス名（`package.Service`）。
    pub service: String,
    pub secured: bool,
    pub rpc_methods: Vec<String>,
    pub implementation: Vec<MethodDeclaration>,
}

impl ServiceDeclaration {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            secured: false,
            rpc_methods: Vec::new(),
            implementation: Vec::new(),
        }
    }

    /// tonic が生成したサーバー型のサービス名から宣言を生成する。
    pub fn for_service<S: tonic::server::NamedService>() -> Self {
        Self::new(S::NAME)
    }

    pub fn secured(mut self, secured: bool) -> Self {
        self.secured = secured;
        self
    }

    pub fn rpc_methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rpc_methods.extend(names.into_iter().map(Into::into));
        self
    }

    /// セキュリティ宣言付きの実装メソッドを追加する。
    pub fn method(mut self, name: &str, policy: Policy) -> Self {
        self.implementation.push(MethodDeclaration {
            name: name.to_string(),
            policy: Some(policy),
        });
        self
    }

    /// セキュリティ宣言の無い実装メソッドを追加する。
    pub fn unannotated_method(mut self, name: &str) -> Self {
        self.implementation.push(MethodDeclaration {
            name: name.to_string(),
            policy: None,
        });
        self
    }
}

/// PolicyTable は (サービス名, メソッド名) からポリシーへの不変マップ。
///
/// 起動時に PolicyCompiler が構築し、以降は全リクエストから並行に読み取られる。
/// 保護対象サービスはメソッドが無くてもエントリを持つ。
/// 保護対象外のサービスはテーブルに現れない。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTable {
    services: HashMap<String, HashMap<String, Policy>>,
}

impl PolicyTable {
    pub fn get(&self, service: &str, method: &str) -> Option<&Policy> {
        self.services.get(service).and_then(|m| m.get(method))
    }

    /// 保護対象サービスかどうか。宣言に無いメソッドも拒否の対象になる。
    pub fn is_secured(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// 登録されているポリシーの総数。
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 大文字小文字とアンダースコアを無視した比較キー。
/// `SayHello` と tonic が生成する `say_hello` は同じキーになる。
fn method_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// PolicyCompiler はサービス宣言からポリシーテーブルを構築する。
pub struct PolicyCompiler;

impl PolicyCompiler {
    /// サーバーがリクエストを受け付ける前に一度だけ呼び出す。
    /// エラーの場合はサーバーを起動してはならない。
    pub fn compile(
        declarations: &[ServiceDeclaration],
    ) -> Result<PolicyTable, PolicyCompilationError> {
        let mut seen = HashSet::new();
        let mut services = HashMap::new();

        for decl in declarations {
            if !seen.insert(decl.service.as_str()) {
                return Err(PolicyCompilationError::DuplicateService(
                    decl.service.clone(),
                ));
            }

            if !decl.secured {
                tracing::debug!(service = %decl.service, "service is not secured; skipping");
                continue;
            }

            let methods = Self::compile_service(decl)?;
            tracing::info!(
                service = %decl.service,
                methods = methods.len(),
                "compiled security policies"
            );
            services.insert(decl.service.clone(), methods);
        }

        Ok(PolicyTable { services })
    }

    fn compile_service(
        decl: &ServiceDeclaration,
    ) -> Result<HashMap<String, Policy>, PolicyCompilationError> {
        let mut methods = HashMap::new();

        for rpc in &decl.rpc_methods {
            let key = method_key(rpc);
            let mut candidates = decl
                .implementation
                .iter()
                .filter(|m| method_key(&m.name) == key);

            let Some(implementation) = candidates.next() else {
                return Err(PolicyCompilationError::UnmatchedMethod {
                    service: decl.service.clone(),
                    method: rpc.clone(),
                });
            };
            if candidates.next().is_some() {
                return Err(PolicyCompilationError::AmbiguousMethod {
                    service: decl.service.clone(),
                    method: rpc.clone(),
                });
            }

            let Some(policy) = implementation.policy.clone() else {
                return Err(PolicyCompilationError::MissingAnnotation {
                    service: decl.service.clone(),
                    method: implementation.name.clone(),
                });
            };

            if matches!(&policy, Policy::RolesAllowed(roles) if roles.is_empty()) {
                tracing::warn!(
                    service = %decl.service,
                    method = %rpc,
                    "RolesAllowed with no roles never permits a call"
                );
            }

            methods.insert(rpc.clone(), policy);
        }

        // RPC に対応しない宣言付きメソッドは rpc_methods の記載漏れとみなす
        let rpc_keys: HashSet<String> = decl.rpc_methods.iter().map(|m| method_key(m)).collect();
        if let Some(orphan) = decl
            .implementation
            .iter()
            .find(|m| m.policy.is_some() && !rpc_keys.contains(&method_key(&m.name)))
        {
            return Err(PolicyCompilationError::OrphanAnnotation {
                service: decl.service.clone(),
                method: orphan.name.clone(),
            });
        }

        Ok(methods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OrderServiceServer;

    impl tonic::server::NamedService for OrderServiceServer {
        const NAME: &'static str = "k1s0.order.v1.OrderService";
    }

    fn order_service() -> ServiceDeclaration {
        ServiceDeclaration::for_service::<OrderServiceServer>()
            .secured(true)
            .rpc_methods(["GetOrder", "CancelOrder", "Purge"])
            .method("get_order", Policy::roles_allowed(["user", "admin"]))
            .method("cancel_order", Policy::roles_allowed(["admin"]))
            .method("purge", Policy::Deny)
            .unannotated_method("to_proto")
    }

    #[test]
    fn test_compile_secured_service() {
        let table = PolicyCompiler::compile(&[order_service()]).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.get("k1s0.order.v1.OrderService", "CancelOrder"),
            Some(&Policy::roles_allowed(["admin"]))
        );
        assert_eq!(
            table.get("k1s0.order.v1.OrderService", "Purge"),
            Some(&Policy::Deny)
        );
        // ワイヤー上の名前で引く
        assert!(table.get("k1s0.order.v1.OrderService", "get_order").is_none());
    }

    #[test]
    fn test_unsecured_service_without_annotations_contributes_nothing() {
        let decl = ServiceDeclaration::new("k1s0.health.v1.Probe")
            .rpc_methods(["Check"])
            .unannotated_method("check");

        let table = PolicyCompiler::compile(&[decl]).unwrap();
        assert!(table.is_empty());
        assert!(!table.is_secured("k1s0.health.v1.Probe"));
    }

    #[test]
    fn test_secured_method_without_annotation_fails() {
        let decl = ServiceDeclaration::new("k1s0.order.v1.OrderService")
            .secured(true)
            .rpc_methods(["GetOrder", "CancelOrder"])
            .method("get_order", Policy::PermitAll)
            .unannotated_method("cancel_order");

        assert_eq!(
            PolicyCompiler::compile(&[decl]).unwrap_err(),
            PolicyCompilationError::MissingAnnotation {
                service: "k1s0.order.v1.OrderService".into(),
                method: "cancel_order".into(),
            }
        );
    }

    #[test]
    fn test_rpc_without_implementation_fails() {
        let decl = ServiceDeclaration::new("svc.A")
            .secured(true)
            .rpc_methods(["Get", "List"])
            .method("get", Policy::PermitAll);

        assert_eq!(
            PolicyCompiler::compile(&[decl]).unwrap_err(),
            PolicyCompilationError::UnmatchedMethod {
                service: "svc.A".into(),
                method: "List".into(),
            }
        );
    }

    #[test]
    fn test_ambiguous_implementation_fails() {
        let decl = ServiceDeclaration::new("svc.A")
            .secured(true)
            .rpc_methods(["GetItem"])
            .method("get_item", Policy::PermitAll)
            .method("GetItem", Policy::Deny);

        assert!(matches!(
            PolicyCompiler::compile(&[decl]),
            Err(PolicyCompilationError::AmbiguousMethod { .. })
        ));
    }

    #[test]
    fn test_annotated_method_without_rpc_fails() {
        let decl = ServiceDeclaration::new("svc.Orders")
            .secured(true)
            .rpc_methods(["GetOrder"])
            .method("get_order", Policy::PermitAll)
            .method("delete_order", Policy::Deny);

        assert_eq!(
            PolicyCompiler::compile(&[decl]).unwrap_err(),
            PolicyCompilationError::OrphanAnnotation {
                service: "svc.Orders".into(),
                method: "delete_order".into(),
            }
        );
    }

    #[test]
    fn test_secured_service_without_rpc_methods_is_recorded() {
        let decl = ServiceDeclaration::new("svc.Empty").secured(true);

        let table = PolicyCompiler::compile(&[decl]).unwrap();
        assert!(table.is_empty());
        assert!(table.is_secured("svc.Empty"));
        assert!(table.get("svc.Empty", "Anything").is_none());
    }

    #[test]
    fn test_duplicate_service_fails() {
        let decls = [ServiceDeclaration::new("svc.A"), ServiceDeclaration::new("svc.A")];
        assert_eq!(
            PolicyCompiler::compile(&decls).unwrap_err(),
            PolicyCompilationError::DuplicateService("svc.A".into())
        );
    }

    #[test]
    fn test_exact_name_match() {
        let decl = ServiceDeclaration::new("svc.A")
            .secured(true)
            .rpc_methods(["SayHello"])
            .method("SayHello", Policy::PermitAll);

        let table = PolicyCompiler::compile(&[decl]).unwrap();
        assert_eq!(table.get("svc.A", "SayHello"), Some(&Policy::PermitAll));
    }

    #[test]
    fn test_empty_roles_allowed_is_accepted() {
        let decl = ServiceDeclaration::new("svc.A")
            .secured(true)
            .rpc_methods(["Get"])
            .method("get", Policy::roles_allowed(Vec::<String>::new()));

        let table = PolicyCompiler::compile(&[decl]).unwrap();
        assert_eq!(
            table.get("svc.A", "Get"),
            Some(&Policy::RolesAllowed(BTreeSet::new()))
        );
    }

    #[test]
    fn test_method_key() {
        assert_eq!(method_key("SayHello"), method_key("say_hello"));
        assert_eq!(method_key("GetHTTPStatus"), method_key("get_http_status"));
        assert_ne!(method_key("GetOrder"), method_key("get_orders"));
    }
}
