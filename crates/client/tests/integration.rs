//! End-to-end tests against a local axum fixture app that publishes a
//! discovery manifest and an annotated OpenAPI document.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use opentools_client::{
    ApprovalPolicy, ApprovalRequest, ClientError, Connection, ConnectionConfig, ConsentHandler,
    Credential, Decision, DenialReason, FetchGuard, InvokeOutcome, OutboundPolicy, Result,
    TokenProvider,
};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

struct AppState {
    spec: Value,
    /// When set, task routes require exactly this bearer token.
    require_bearer: Option<String>,
    discovery_hits: AtomicUsize,
    spec_hits: AtomicUsize,
    list_hits: AtomicUsize,
    search_hits: AtomicUsize,
    create_hits: AtomicUsize,
    delete_hits: AtomicUsize,
}

impl AppState {
    fn new(spec: Value) -> Arc<Self> {
        Arc::new(Self {
            spec,
            require_bearer: None,
            discovery_hits: AtomicUsize::new(0),
            spec_hits: AtomicUsize::new(0),
            list_hits: AtomicUsize::new(0),
            search_hits: AtomicUsize::new(0),
            create_hits: AtomicUsize::new(0),
            delete_hits: AtomicUsize::new(0),
        })
    }

    fn with_bearer(spec: Value, token: &str) -> Arc<Self> {
        let mut state = Self::new(spec);
        Arc::get_mut(&mut state).expect("fresh state").require_bearer = Some(token.to_string());
        state
    }
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
    let Some(expected) = &state.require_bearer else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented == format!("Bearer {expected}") {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn discovery_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.discovery_hits.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"openapi": "/openapi.json", "auth": "api-key"}))
}

async fn spec_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.spec_hits.fetch_add(1, Ordering::SeqCst);
    axum::Json(state.spec.clone())
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> std::result::Result<axum::Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    state.list_hits.fetch_add(1, Ordering::SeqCst);
    let status = query.get("status").cloned().unwrap_or_default();
    Ok(axum::Json(
        json!({"tasks": [{"id": "1", "title": "write report"}], "status": status}),
    ))
}

async fn search_handler(State(state): State<Arc<AppState>>) -> axum::Json<Value> {
    state.search_hits.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"results": []}))
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<Value>,
) -> axum::Json<Value> {
    state.create_hits.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"id": "2", "title": body.get("title").cloned()}))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> axum::Json<Value> {
    state.delete_hits.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"deleted": id}))
}

async fn archive_handler(Path(id): Path<String>) -> axum::Json<Value> {
    axum::Json(json!({"archived": id}))
}

struct FixtureApp {
    base_url: Url,
    state: Arc<AppState>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Drop for FixtureApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn spawn_app(state: Arc<AppState>) -> FixtureApp {
    let app = Router::new()
        .route("/.well-known/llm.json", get(discovery_handler))
        .route("/openapi.json", get(spec_handler))
        .route("/tasks", get(list_handler).post(create_handler))
        .route("/search", get(search_handler))
        .route("/tasks/{id}", delete(delete_handler))
        .route("/tasks/{id}/archive", post(archive_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let base_url = Url::parse(&format!("http://{addr}")).expect("base url");

    let server = axum::serve(listener, app);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    FixtureApp {
        base_url,
        state,
        shutdown: Some(shutdown_tx),
    }
}

fn task_tracker_spec() -> Value {
    json!({
        "openapi": "3.0.3",
        "info": {"title": "Task Tracker", "version": "1.0.0"},
        "x-llm": {
            "version": "1",
            "name": "tasks",
            "description": "Personal task tracker",
            "defaultApproval": "auto"
        },
        "paths": {
            "/tasks": {
                "get": {
                    "operationId": "listTasks",
                    "summary": "List tasks",
                    "parameters": [
                        {
                            "name": "status",
                            "in": "query",
                            "required": false,
                            "schema": {"type": "string"}
                        }
                    ],
                    "responses": {"200": {"description": "ok"}},
                    "x-llm": {"enabled": true}
                },
                "post": {
                    "operationId": "createTask",
                    "summary": "Create a task",
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": {
                                    "type": "object",
                                    "properties": {
                                        "title": {"type": "string"},
                                        "due": {"type": "string"}
                                    },
                                    "required": ["title"]
                                }
                            }
                        }
                    },
                    "responses": {"201": {"description": "created"}},
                    "x-llm": {"enabled": true}
                }
            },
            "/search": {
                "get": {
                    "operationId": "searchTasks",
                    "responses": {"200": {"description": "ok"}},
                    "x-llm": {
                        "enabled": true,
                        "rateLimit": {"max": 2, "window": "60s"}
                    }
                }
            },
            "/tasks/{id}": {
                "delete": {
                    "operationId": "deleteTask",
                    "summary": "Delete a task",
                    "parameters": [
                        {
                            "name": "id",
                            "in": "path",
                            "required": true,
                            "schema": {"type": "string"}
                        }
                    ],
                    "responses": {"200": {"description": "deleted"}},
                    "x-llm": {
                        "enabled": true,
                        "approval": "per-call",
                        "destructive": true,
                        "blanketApprovalAllowed": true,
                        "hint": "Deleted the task."
                    }
                }
            },
            "/tasks/{id}/archive": {
                "post": {
                    "operationId": "archiveTask",
                    "parameters": [
                        {
                            "name": "id",
                            "in": "path",
                            "required": true,
                            "schema": {"type": "string"}
                        }
                    ],
                    "responses": {"200": {"description": "archived"}},
                    "x-llm": {"enabled": true, "approval": "per-call"}
                }
            }
        }
    })
}

/// Handler fed from a fixed script of decisions; counts prompts.
struct ScriptedConsent {
    decisions: parking_lot::Mutex<VecDeque<Decision>>,
    prompts: AtomicUsize,
}

impl ScriptedConsent {
    fn new(decisions: impl IntoIterator<Item = Decision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: parking_lot::Mutex::new(decisions.into_iter().collect()),
            prompts: AtomicUsize::new(0),
        })
    }

    fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConsentHandler for ScriptedConsent {
    async fn request(&self, _request: ApprovalRequest) -> Decision {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.decisions
            .lock()
            .pop_front()
            .unwrap_or(Decision::DenyOnce)
    }
}

fn connect(app: &FixtureApp, consent: Arc<dyn ConsentHandler>) -> Result<Connection> {
    connect_with(app, consent, Credential::ApiKey { key: "k-test".to_string() }, ConnectionConfig::default())
}

fn connect_with(
    app: &FixtureApp,
    consent: Arc<dyn ConsentHandler>,
    credential: Credential,
    config: ConnectionConfig,
) -> Result<Connection> {
    let guard = FetchGuard::new(OutboundPolicy::local_dev()).map_err(ClientError::Fetch)?;
    Ok(Connection::new(
        app.base_url.clone(),
        credential,
        consent,
        guard,
        config,
    ))
}

fn find_tool<'a>(
    tools: &'a opentools_client::ToolSet,
    name: &str,
) -> &'a opentools_client::Tool {
    tools
        .tools
        .iter()
        .find(|t| t.name() == name)
        .unwrap_or_else(|| panic!("missing tool {name}"))
}

#[tokio::test]
async fn tools_are_namespaced_and_carry_metadata() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let connection = connect(&app, ScriptedConsent::new([]))?;

    let tools = connection.tools().await?;
    let names: Vec<&str> = tools.tools.iter().map(|t| t.name()).collect();
    assert_eq!(
        names,
        vec![
            "tasks_listTasks",
            "tasks_createTask",
            "tasks_searchTasks",
            "tasks_deleteTask",
            "tasks_archiveTask",
        ]
    );

    let delete_meta = &tools.metadata["tasks_deleteTask"];
    assert!(delete_meta.destructive);
    assert_eq!(delete_meta.approval, ApprovalPolicy::PerCall);
    assert!(delete_meta.blanket_approval_allowed);
    assert_eq!(delete_meta.hint.as_deref(), Some("Deleted the task."));

    let list_meta = &tools.metadata["tasks_listTasks"];
    assert!(!list_meta.destructive);
    assert_eq!(list_meta.approval, ApprovalPolicy::Auto);
    Ok(())
}

#[tokio::test]
async fn auto_operation_runs_without_a_prompt() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let consent = ScriptedConsent::new([]);
    let connection = connect(&app, consent.clone())?;

    let tools = connection.tools().await?;
    let list = find_tool(&tools, "tasks_listTasks");
    let outcome = list.invoke(json!({"status": "open"}), None).await?;

    let InvokeOutcome::Completed { result, render_hint } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(result["status"], "open");
    assert_eq!(result["tasks"][0]["title"], "write report");
    assert!(render_hint.is_none());
    assert_eq!(consent.prompt_count(), 0);
    assert_eq!(app.state.list_hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn denied_call_never_reaches_the_network() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let consent = ScriptedConsent::new([Decision::DenyOnce]);
    let connection = connect(&app, consent.clone())?;

    let tools = connection.tools().await?;
    let del = find_tool(&tools, "tasks_deleteTask");
    let outcome = del.invoke(json!({"id": "42"}), None).await?;

    assert!(matches!(
        outcome,
        InvokeOutcome::Denied { reason: DenialReason::DeniedOnce }
    ));
    assert_eq!(consent.prompt_count(), 1);
    assert_eq!(app.state.delete_hits.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn approved_destructive_call_executes_and_prompts_again() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let consent = ScriptedConsent::new([Decision::ApproveOnce, Decision::ApproveOnce]);
    let connection = connect(&app, consent.clone())?;

    let tools = connection.tools().await?;
    let del = find_tool(&tools, "tasks_deleteTask");

    let outcome = del.invoke(json!({"id": "42"}), None).await?;
    let InvokeOutcome::Completed { result, render_hint } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(result["deleted"], "42");
    assert_eq!(render_hint.as_deref(), Some("Deleted the task."));

    // Approve-once does not carry over.
    let _ = del.invoke(json!({"id": "43"}), None).await?;
    assert_eq!(consent.prompt_count(), 2);
    assert_eq!(app.state.delete_hits.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn user_preference_raises_but_never_lowers_consent() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let consent = ScriptedConsent::new([Decision::ApproveOnce]);
    let config = ConnectionConfig {
        user_approval: ApprovalPolicy::PerCall,
        ..ConnectionConfig::default()
    };
    let connection = connect_with(
        &app,
        consent.clone(),
        Credential::ApiKey { key: "k-test".to_string() },
        config,
    )?;

    let tools = connection.tools().await?;
    // listTasks is auto per the document, but the user preference raises it.
    let list = find_tool(&tools, "tasks_listTasks");
    let outcome = list.invoke(json!({}), None).await?;
    assert!(matches!(outcome, InvokeOutcome::Completed { .. }));
    assert_eq!(consent.prompt_count(), 1);
    Ok(())
}

#[tokio::test]
async fn approve_always_persists_only_when_the_site_allows_it() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let consent = ScriptedConsent::new([
        Decision::ApproveAlways,
        Decision::ApproveAlways,
        Decision::ApproveAlways,
    ]);
    let connection = connect(&app, consent.clone())?;
    let tools = connection.tools().await?;

    // deleteTask allows blanket approval: one prompt, then standing.
    let del = find_tool(&tools, "tasks_deleteTask");
    let _ = del.invoke(json!({"id": "1"}), None).await?;
    let _ = del.invoke(json!({"id": "2"}), None).await?;
    assert_eq!(consent.prompt_count(), 1);

    // archiveTask does not: approve-always degrades to approve-once.
    let archive = find_tool(&tools, "tasks_archiveTask");
    let _ = archive.invoke(json!({"id": "1"}), None).await?;
    let _ = archive.invoke(json!({"id": "2"}), None).await?;
    assert_eq!(consent.prompt_count(), 3);

    let standing = connection.standing_decisions();
    assert!(standing.contains_key("deleteTask"));
    assert!(!standing.contains_key("archiveTask"));
    Ok(())
}

#[tokio::test]
async fn restored_standing_decisions_skip_the_prompt() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let consent = ScriptedConsent::new([Decision::ApproveAlways]);
    let first = connect(&app, consent.clone())?;
    let tools = first.tools().await?;
    let _ = find_tool(&tools, "tasks_deleteTask")
        .invoke(json!({"id": "1"}), None)
        .await?;
    let saved = first.standing_decisions();

    let later_consent = ScriptedConsent::new([]);
    let second = connect(&app, later_consent.clone())?;
    second.restore_standing_decisions(saved);
    let tools = second.tools().await?;
    let outcome = find_tool(&tools, "tasks_deleteTask")
        .invoke(json!({"id": "2"}), None)
        .await?;

    assert!(matches!(outcome, InvokeOutcome::Completed { .. }));
    assert_eq!(later_consent.prompt_count(), 0);
    Ok(())
}

#[tokio::test]
async fn rate_limited_call_is_refused_before_the_network() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let connection = connect(&app, ScriptedConsent::new([]))?;
    let tools = connection.tools().await?;
    let search = find_tool(&tools, "tasks_searchTasks");

    let _ = search.invoke(json!({}), None).await?;
    let _ = search.invoke(json!({}), None).await?;
    let err = search.invoke(json!({}), None).await.unwrap_err();

    let ClientError::RateLimited { retry_after } = err else {
        panic!("expected RateLimited, got {err}");
    };
    assert!(retry_after > std::time::Duration::ZERO);
    assert!(retry_after <= std::time::Duration::from_secs(60));
    assert_eq!(app.state.search_hits.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn invalid_arguments_are_rejected_before_the_network() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let connection = connect(&app, ScriptedConsent::new([]))?;
    let tools = connection.tools().await?;
    let create = find_tool(&tools, "tasks_createTask");

    let err = create.invoke(json!({"due": "tomorrow"}), None).await.unwrap_err();
    let ClientError::InvalidParams { violations } = err else {
        panic!("expected InvalidParams, got {err}");
    };
    assert!(violations.iter().any(|v| v.contains("title")), "{violations:?}");
    assert_eq!(app.state.create_hits.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_tool_generation_shares_one_spec_fetch() -> anyhow::Result<()> {
    let app = spawn_app(AppState::new(task_tracker_spec())).await;
    let connection = connect(&app, ScriptedConsent::new([]))?;

    let (a, b) = tokio::join!(connection.tools(), connection.tools());
    assert_eq!(a?.tools.len(), 5);
    assert_eq!(b?.tools.len(), 5);
    assert_eq!(app.state.discovery_hits.load(Ordering::SeqCst), 1);
    assert_eq!(app.state.spec_hits.load(Ordering::SeqCst), 1);

    connection.invalidate_spec_cache().await;
    let _ = connection.tools().await?;
    assert_eq!(app.state.spec_hits.load(Ordering::SeqCst), 2);
    Ok(())
}

struct RotatingProvider {
    token: parking_lot::Mutex<String>,
    next: String,
    refreshes: AtomicUsize,
}

#[async_trait::async_trait]
impl TokenProvider for RotatingProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.lock().clone())
    }

    async fn refresh(&self) -> Result<String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let mut token = self.token.lock();
        *token = self.next.clone();
        Ok(token.clone())
    }
}

#[tokio::test]
async fn stale_oauth_token_is_refreshed_and_retried_once() -> anyhow::Result<()> {
    let app = spawn_app(AppState::with_bearer(task_tracker_spec(), "fresh")).await;
    let provider = Arc::new(RotatingProvider {
        token: parking_lot::Mutex::new("stale".to_string()),
        next: "fresh".to_string(),
        refreshes: AtomicUsize::new(0),
    });
    let connection = connect_with(
        &app,
        ScriptedConsent::new([]),
        Credential::OAuth2 { provider: provider.clone() },
        ConnectionConfig::default(),
    )?;

    let tools = connection.tools().await?;
    let list = find_tool(&tools, "tasks_listTasks");
    let outcome = list.invoke(json!({}), None).await?;

    assert!(matches!(outcome, InvokeOutcome::Completed { .. }));
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(app.state.list_hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn second_auth_failure_surfaces_auth_expired() -> anyhow::Result<()> {
    let app = spawn_app(AppState::with_bearer(task_tracker_spec(), "unobtainable")).await;
    let provider = Arc::new(RotatingProvider {
        token: parking_lot::Mutex::new("stale".to_string()),
        next: "still-stale".to_string(),
        refreshes: AtomicUsize::new(0),
    });
    let connection = connect_with(
        &app,
        ScriptedConsent::new([]),
        Credential::OAuth2 { provider: provider.clone() },
        ConnectionConfig::default(),
    )?;

    let tools = connection.tools().await?;
    let list = find_tool(&tools, "tasks_listTasks");
    let err = list.invoke(json!({}), None).await.unwrap_err();

    assert!(matches!(err, ClientError::AuthExpired), "{err}");
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn document_without_the_extension_is_not_connectable() -> anyhow::Result<()> {
    let spec = json!({
        "openapi": "3.0.3",
        "info": {"title": "Plain API", "version": "1.0.0"},
        "paths": {
            "/things": {
                "get": {"operationId": "listThings", "responses": {"200": {"description": "ok"}}}
            }
        }
    });
    let app = spawn_app(AppState::new(spec)).await;
    let connection = connect(&app, ScriptedConsent::new([]))?;

    let err = connection.tools().await.unwrap_err();
    assert!(matches!(err, ClientError::NoLlmExtension), "{err}");
    Ok(())
}

#[tokio::test]
async fn missing_manifest_is_discovery_not_found() -> anyhow::Result<()> {
    // No discovery route at all.
    let app = Router::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let base_url = Url::parse(&format!("http://{addr}"))?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    let guard = FetchGuard::new(OutboundPolicy::local_dev())?;
    let connection = Connection::new(
        base_url,
        Credential::ApiKey { key: "k".to_string() },
        ScriptedConsent::new([]),
        guard,
        ConnectionConfig::default(),
    );

    let err = connection.tools().await.unwrap_err();
    assert!(matches!(err, ClientError::DiscoveryNotFound(_)), "{err}");
    let _ = shutdown_tx.send(());
    Ok(())
}
