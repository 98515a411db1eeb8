use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use lodestone_core::{
    Dependency, DomainProject, Framework, HealthCheck, InstanceKey, QuotaKind, RegistryError,
    RegistryStore, Rule, RuleType, Service, ServiceInstance,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::app::Registry;

pub const DOMAIN_HEADER: &str = "x-domain-name";
pub const PROJECT_HEADER: &str = "x-project-name";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        register_service,
        register_instance,
        heartbeat,
        unregister_instance,
        add_rules,
        add_dependency,
        watch,
    ),
    components(
        schemas(
            RegisterServiceRequest,
            RegisterServiceResponse,
            RegisterInstanceRequest,
            RegisterInstanceResponse,
            AddRuleRequest,
            AddRulesResponse,
            AddDependencyRequest,
            ErrorBody,
            lodestone_core::Framework,
            lodestone_core::HealthCheck,
            lodestone_core::CheckMode,
            lodestone_core::RuleType,
            lodestone_core::ServiceInstance,
            lodestone_core::InstanceStatus,
            lodestone_core::DomainProject,
        )
    )
)]
pub struct ApiDoc;

pub fn router(state: AppState, metrics: PrometheusHandle) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health_check))
        .route(
            "/metrics",
            get(move || {
                let rendered = metrics.render();
                async move { rendered }
            }),
        )
        .route("/api/services", post(register_service))
        .route("/api/services/:service_id/instances", post(register_instance))
        .route(
            "/api/services/:service_id/instances/:instance_id/heartbeat",
            put(heartbeat),
        )
        .route(
            "/api/services/:service_id/instances/:instance_id",
            delete(unregister_instance),
        )
        .route("/api/services/:service_id/rules", post(add_rules))
        .route("/api/services/:service_id/watch", get(watch))
        .route("/api/dependencies", post(add_dependency))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Tenancy of a request, `default/default` when the headers are absent.
fn tenant(headers: &HeaderMap) -> DomainProject {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let mut dp = DomainProject::default();
    if let Some(domain) = read(DOMAIN_HEADER) {
        dp.domain = domain;
    }
    if let Some(project) = read(PROJECT_HEADER) {
        dp.project = project;
    }
    dp
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    error: String,
}

pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self(err)
    }
}

pub fn status_of(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::HeartbeatTimeout | RegistryError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RegistryError::ServiceNotFound(_) | RegistryError::InstanceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RegistryError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        RegistryError::MixedRuleType => StatusCode::BAD_REQUEST,
        RegistryError::DuplicateInstance(_) => StatusCode::CONFLICT,
        RegistryError::Persistence(_)
        | RegistryError::Internal(_)
        | RegistryError::EvictionTimeout => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Loads a service, treating one from another tenant as missing.
fn service_in(store: &dyn RegistryStore, dp: &DomainProject, service_id: &str) -> ApiResult<Service> {
    let service = store.get_service(service_id)?;
    if &service.domain_project != dp {
        return Err(RegistryError::ServiceNotFound(service_id.to_string()).into());
    }
    Ok(service)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "OK"))
)]
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK").into_response()
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterServiceRequest {
    #[schema(example = "shop")]
    app_id: String,
    #[schema(example = "cart")]
    service_name: String,
    #[schema(example = "1.0.0")]
    version: String,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    framework: Option<Framework>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterServiceResponse {
    service_id: String,
}

#[utoipa::path(
    post,
    path = "/api/services",
    request_body = RegisterServiceRequest,
    responses(
        (status = 201, description = "Service registered", body = RegisterServiceResponse),
        (status = 500, description = "Store failure", body = ErrorBody)
    )
)]
async fn register_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterServiceRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut service = Service::new(
        tenant(&headers),
        payload.app_id,
        payload.service_name,
        payload.version,
    );
    service.environment = payload.environment;
    service.alias = payload.alias;
    service.level = payload.level;
    service.description = payload.description;
    service.framework = payload.framework;
    service.tags = payload.tags;

    state.registry.apply_quota(
        QuotaKind::Service,
        &service.domain_project,
        &service.service_id,
        1,
    )?;
    state.registry.store.add_service(&service)?;
    tracing::info!(
        "registered service {} [{}/{}/{}]",
        service.service_id,
        service.app_id,
        service.service_name,
        service.version
    );
    Ok((
        StatusCode::CREATED,
        Json(RegisterServiceResponse {
            service_id: service.service_id,
        }),
    ))
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterInstanceRequest {
    #[schema(example = "cart-7f9c")]
    host_name: String,
    #[schema(example = json!(["rest://10.0.0.12:8080"]))]
    endpoints: Vec<String>,
    #[serde(default)]
    health_check: Option<HealthCheck>,
    #[serde(default)]
    properties: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterInstanceResponse {
    instance_id: String,
}

#[utoipa::path(
    post,
    path = "/api/services/{service_id}/instances",
    request_body = RegisterInstanceRequest,
    responses(
        (status = 201, description = "Instance registered", body = RegisterInstanceResponse),
        (status = 404, description = "Service not found", body = ErrorBody),
        (status = 503, description = "Heartbeat queue saturated", body = ErrorBody)
    ),
    params(("service_id" = String, Path, description = "Provider service id"))
)]
async fn register_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(service_id): Path<String>,
    Json(payload): Json<RegisterInstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    let dp = tenant(&headers);
    let registry = &state.registry;
    service_in(registry.store.as_ref(), &dp, &service_id)?;

    let mut instance = ServiceInstance::new(
        dp,
        &service_id,
        payload.host_name,
        payload.endpoints,
        lodestone_core::time::now(),
    );
    if let Some(health_check) = payload.health_check {
        instance.health_check = health_check;
    }
    instance.properties = payload.properties;

    registry.register_instance(&instance).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterInstanceResponse {
            instance_id: instance.instance_id,
        }),
    ))
}

#[utoipa::path(
    put,
    path = "/api/services/{service_id}/instances/{instance_id}/heartbeat",
    responses(
        (status = 200, description = "Heartbeat accepted"),
        (status = 404, description = "Instance not found", body = ErrorBody),
        (status = 503, description = "Heartbeat queue saturated", body = ErrorBody)
    ),
    params(
        ("service_id" = String, Path, description = "Provider service id"),
        ("instance_id" = String, Path, description = "Instance id")
    )
)]
async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((service_id, instance_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = InstanceKey::new(tenant(&headers), service_id, instance_id);
    let registry = &state.registry;
    let instance = registry
        .store
        .refresh_instance(&key, lodestone_core::time::now())?;
    registry
        .liveness
        .add_task(
            key.domain_project,
            &key.service_id,
            &key.instance_id,
            instance.health_check.effective_ttl_secs(),
        )
        .await?;
    Ok(StatusCode::OK)
}

#[utoipa::path(
    delete,
    path = "/api/services/{service_id}/instances/{instance_id}",
    responses((status = 204, description = "Instance removed, or already absent")),
    params(
        ("service_id" = String, Path, description = "Provider service id"),
        ("instance_id" = String, Path, description = "Instance id")
    )
)]
async fn unregister_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((service_id, instance_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let key = InstanceKey::new(tenant(&headers), service_id, instance_id);
    let registry = &state.registry;
    if registry.store.delete_instance(&key)? {
        tracing::info!("unregistered instance {}/{}", key.service_id, key.instance_id);
    }
    registry.liveness.remove_cache_instance(&key.instance_id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AddRuleRequest {
    rule_type: RuleType,
    #[schema(example = "AppId")]
    attribute: String,
    #[schema(example = "^shop$")]
    pattern: String,
    #[serde(default)]
    description: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AddRulesResponse {
    rule_ids: Vec<String>,
}

#[utoipa::path(
    post,
    path = "/api/services/{service_id}/rules",
    request_body = Vec<AddRuleRequest>,
    responses(
        (status = 201, description = "Rules added, duplicates skipped", body = AddRulesResponse),
        (status = 400, description = "Mixed WHITE and BLACK rules", body = ErrorBody),
        (status = 404, description = "Service not found", body = ErrorBody)
    ),
    params(("service_id" = String, Path, description = "Provider service id"))
)]
async fn add_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(service_id): Path<String>,
    Json(payload): Json<Vec<AddRuleRequest>>,
) -> ApiResult<impl IntoResponse> {
    let dp = tenant(&headers);
    let store = state.registry.store.as_ref();
    service_in(store, &dp, &service_id)?;

    let now = lodestone_core::time::now();
    let rules: Vec<Rule> = payload
        .into_iter()
        .map(|r| {
            let mut rule = Rule::new(dp.clone(), &service_id, r.rule_type, r.attribute, r.pattern);
            rule.description = r.description;
            rule.timestamp = now;
            rule
        })
        .collect();
    state
        .registry
        .apply_quota(QuotaKind::Rule, &dp, &service_id, rules.len() as i64)?;
    let rule_ids = store.add_rules(&rules)?;
    Ok((StatusCode::CREATED, Json(AddRulesResponse { rule_ids })))
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AddDependencyRequest {
    consumer_id: String,
    provider_id: String,
}

#[utoipa::path(
    post,
    path = "/api/dependencies",
    request_body = AddDependencyRequest,
    responses(
        (status = 201, description = "Dependency recorded"),
        (status = 404, description = "Consumer or provider not found", body = ErrorBody)
    )
)]
async fn add_dependency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddDependencyRequest>,
) -> ApiResult<impl IntoResponse> {
    let dp = tenant(&headers);
    let store = state.registry.store.as_ref();
    service_in(store, &dp, &payload.consumer_id)?;
    service_in(store, &dp, &payload.provider_id)?;

    store.add_dependency(&Dependency {
        domain_project: dp,
        provider_id: payload.provider_id,
        consumer_id: payload.consumer_id,
    })?;
    Ok(StatusCode::CREATED)
}

#[utoipa::path(
    get,
    path = "/api/services/{service_id}/watch",
    responses(
        (status = 200, description = "Server-sent stream of instance changes visible to the consumer"),
        (status = 404, description = "Consumer not found", body = ErrorBody)
    ),
    params(("service_id" = String, Path, description = "Consumer service id"))
)]
async fn watch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(service_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let dp = tenant(&headers);
    let registry = &state.registry;
    service_in(registry.store.as_ref(), &dp, &service_id)?;

    let (_, rx) = registry.notify.subscribe(dp, service_id);
    let stream = ReceiverStream::new(rx).map(|response| {
        let event = Event::default().event(response.action.as_str());
        Ok(match event.json_data(&response) {
            Ok(event) => event,
            Err(e) => Event::default().event("error").data(e.to_string()),
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_tenant_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(tenant(&headers).is_default());

        headers.insert(DOMAIN_HEADER, HeaderValue::from_static("acme"));
        headers.insert(PROJECT_HEADER, HeaderValue::from_static(" "));
        let dp = tenant(&headers);
        assert_eq!(dp, DomainProject::new("acme", "default"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(&RegistryError::HeartbeatTimeout),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&RegistryError::InstanceNotFound("i".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&RegistryError::PermissionDenied("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_of(&RegistryError::MixedRuleType), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(&RegistryError::Persistence("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
