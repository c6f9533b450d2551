//! 远程策略加载器集成测试
//!
//! 在本地随机端口上启动一个 axum 服务模拟策略 API。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use parking_lot::Mutex;

use access_guard::loaders::PolicyApiLoader;
use access_guard::{
    AccessGuardError, EnforcerState, LoaderSources, PermissionsEnforcer, PolicyLoader,
};
use access_guard_shared::config::{EnforcerConfig, PolicyLoaderType};

// ==================== 模拟策略 API ====================

#[derive(Clone)]
struct ApiState {
    status: StatusCode,
    body: Arc<Mutex<String>>,
    seen: Arc<Mutex<Vec<HeaderMap>>>,
}

struct PolicyApi {
    base_url: String,
    body: Arc<Mutex<String>>,
    seen: Arc<Mutex<Vec<HeaderMap>>>,
}

impl PolicyApi {
    fn set_body(&self, body: &str) {
        *self.body.lock() = body.to_string();
    }

    fn last_headers(&self) -> HashMap<String, String> {
        self.seen
            .lock()
            .last()
            .map(|headers| {
                headers
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            value.to_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn requests(&self) -> usize {
        self.seen.lock().len()
    }
}

async fn policies(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    state.seen.lock().push(headers);
    let body = state.body.lock().clone();
    (state.status, [(header::CONTENT_TYPE, "application/json")], body)
}

async fn spawn_policy_api(status: StatusCode, body: &str) -> PolicyApi {
    let state = ApiState {
        status,
        body: Arc::new(Mutex::new(body.to_string())),
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let api = PolicyApi {
        base_url: String::new(),
        body: state.body.clone(),
        seen: state.seen.clone(),
    };

    let app = Router::new()
        .route("/iam/policies", get(policies))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    PolicyApi {
        base_url: format!("http://{addr}"),
        ..api
    }
}

fn remote_config(base_url: &str) -> EnforcerConfig {
    EnforcerConfig {
        policy_loader_types: vec![PolicyLoaderType::Remote],
        policy_api_url: Some(base_url.to_string()),
        policy_api_client: Some("access-guard-test".to_string()),
        policy_api_secret: Some("test-secret".to_string()),
        ..Default::default()
    }
}

const TENANT_BODY: &str = r#"{
    "resource_prefix": "tenant1:",
    "policies": [
        {"ptype": "p", "subject": "reader", "object": "/docs", "action": "read"},
        {"ptype": "p", "subject": "alice", "object": "/admin/*", "action": "write", "effect": "allow"},
        {"ptype": "g", "subject": "alice", "object": "reader"}
    ]
}"#;

// ==================== 成功路径 ====================

#[tokio::test]
async fn test_remote_prefix_is_applied_to_rules_and_requests() {
    let api = spawn_policy_api(StatusCode::OK, TENANT_BODY).await;
    let enforcer = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
        .await
        .unwrap();

    assert_eq!(enforcer.state(), EnforcerState::Ready);
    assert_eq!(enforcer.resource_prefix().as_deref(), Some("tenant1:"));
    assert!(enforcer.has_permission("alice", "/docs", "read"));
    assert!(enforcer.has_permission("alice", "/admin/users", "write"));
    assert!(!enforcer.has_permission("alice", "/docs", "write"));
    // 调用方不应自行拼前缀
    assert!(!enforcer.has_permission("alice", "tenant1:/docs", "read"));
    assert!(enforcer.enforce("alice", "tenant1:/docs", "read"));

    let lines = enforcer.policy_lines();
    assert!(lines.contains(&"p, reader, tenant1:/docs, read".to_string()));
    assert!(lines.contains(&"g, alice, reader".to_string()));
}

#[tokio::test]
async fn test_bare_array_without_prefix() {
    let api = spawn_policy_api(
        StatusCode::OK,
        r#"[
            {"ptype": "p", "subject": "bob", "object": "/reports/{id}", "action": "read"},
            {"ptype": "p", "subject": "bob"},
            {"ptype": "z", "subject": "bob", "object": "/x", "action": "read"},
            {"subject": "bob"}
        ]"#,
    )
    .await;
    let enforcer = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
        .await
        .unwrap();

    assert_eq!(enforcer.resource_prefix(), None);
    assert_eq!(enforcer.load_status().rule_count, 1);
    assert!(enforcer.has_permission("bob", "/reports/17", "read"));
    assert!(!enforcer.has_permission("bob", "/x", "read"));
}

#[tokio::test]
async fn test_filter_context_is_sent_as_headers() {
    let api = spawn_policy_api(StatusCode::OK, "[]").await;
    let mut config = remote_config(&api.base_url);
    config.filter = Some(BTreeMap::from([
        ("app_id".to_string(), "7".to_string()),
        ("user_id".to_string(), "42".to_string()),
        ("scope".to_string(), "APP".to_string()),
        ("ignored".to_string(), "x".to_string()),
    ]));

    PermissionsEnforcer::new(&config, &LoaderSources::new())
        .await
        .unwrap();

    let headers = api.last_headers();
    assert_eq!(headers.get("accept").map(String::as_str), Some("application/json"));
    assert_eq!(headers.get("app_id").map(String::as_str), Some("7"));
    assert_eq!(headers.get("user_id").map(String::as_str), Some("42"));
    assert_eq!(headers.get("scope").map(String::as_str), Some("APP"));
    assert!(!headers.contains_key("ignored"));
    assert!(!headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_refresh_fetches_again() {
    let api = spawn_policy_api(StatusCode::OK, TENANT_BODY).await;
    let enforcer = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
        .await
        .unwrap();
    assert_eq!(api.requests(), 1);

    api.set_body(
        r#"{"resource_prefix": "tenant1:", "policies": [
            {"ptype": "p", "subject": "carol", "object": "/docs", "action": "read"}
        ]}"#,
    );
    enforcer.refresh().await.unwrap();

    assert_eq!(api.requests(), 2);
    assert!(enforcer.has_permission("carol", "/docs", "read"));
    assert!(!enforcer.has_permission("alice", "/docs", "read"));
}

#[tokio::test]
async fn test_malformed_refresh_keeps_previous_rules() {
    let api = spawn_policy_api(StatusCode::OK, TENANT_BODY).await;
    let enforcer = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
        .await
        .unwrap();

    api.set_body(r#"{"rules": []}"#);
    let err = enforcer.refresh().await.unwrap_err();
    assert_eq!(err.code(), "MALFORMED_RESPONSE");

    assert_eq!(enforcer.state(), EnforcerState::Ready);
    assert_eq!(enforcer.resource_prefix().as_deref(), Some("tenant1:"));
    assert!(enforcer.has_permission("alice", "/docs", "read"));
}

// ==================== 失败路径 ====================

#[tokio::test]
async fn test_error_status_is_source_unavailable() {
    let api = spawn_policy_api(StatusCode::INTERNAL_SERVER_ERROR, "[]").await;
    let err = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "SOURCE_UNAVAILABLE");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_invalid_json_is_malformed_response() {
    let api = spawn_policy_api(StatusCode::OK, "not json").await;
    let err = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AccessGuardError::MalformedResponse { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_wrong_top_level_shape_is_malformed_response() {
    for body in [r#"{"rules": []}"#, r#""policies""#, r#"{"policies": [], "resource_prefix": 1}"#] {
        let api = spawn_policy_api(StatusCode::OK, body).await;
        let err = PermissionsEnforcer::new(&remote_config(&api.base_url), &LoaderSources::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MALFORMED_RESPONSE", "body: {body}");
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_source_unavailable() {
    // 绑定后立即释放，得到一个没有服务监听的端口
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let loader = PolicyApiLoader::new(&format!("http://{addr}")).unwrap();
    assert_eq!(loader.endpoint(), format!("http://{addr}/iam/policies"));

    let err = PermissionsEnforcer::with_loader(
        &remote_config(&format!("http://{addr}")),
        Arc::new(loader) as Arc<dyn PolicyLoader>,
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), "SOURCE_UNAVAILABLE");
}
