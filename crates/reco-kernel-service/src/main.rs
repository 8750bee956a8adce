use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use reco_kernel_api::{
    load_config, EngineRegistry, RecoKernelApi, RecommendationRequest, RedirectTarget,
    ScoreRecord, API_CONTRACT_VERSION,
};
use reco_kernel_core::RecoError;
use reco_kernel_store::SqliteKvStore;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const ITEM_KEY_HEADER: &str = "x-item-key";

#[derive(Clone)]
struct ServiceState {
    api: Arc<RecoKernelApi>,
    request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "reco-kernel-service")]
#[command(about = "HTTP service for ranked recommendations")]
struct Args {
    #[arg(long, default_value = "./reco_kernel.sqlite3")]
    db: PathBuf,
    /// Recommendation configuration (YAML or JSON).
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2_000)]
    request_timeout_ms: u64,
}

impl From<RecoError> for ServiceError {
    fn from(err: RecoError) -> Self {
        let status = match err {
            RecoError::NotFound(_) => StatusCode::NOT_FOUND,
            RecoError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RecoError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RecoError::NoData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RecoError::Malformed(_) | RecoError::Store(_) => StatusCode::BAD_GATEWAY,
            RecoError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ErrorBody { kind: err.kind(), message: err.to_string() },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::from(RecoError::InvalidRequest(message.into()))
}

impl ServiceState {
    /// Run `operation` within the request deadline. On expiry the operation is
    /// dropped together with its outstanding store calls.
    async fn bounded<T, F>(&self, operation: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, RecoError>>,
    {
        match tokio::time::timeout(self.request_timeout, operation).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => {
                tracing::warn!(timeout_ms = self.request_timeout.as_millis(), "request timed out");
                Err(ServiceError::from(RecoError::Cancelled(format!(
                    "request exceeded {} ms",
                    self.request_timeout.as_millis()
                ))))
            }
        }
    }
}

/// Query parameters of the listing and redirect endpoints.
#[derive(Debug, Default)]
struct ListingQuery {
    request: RecommendationRequest,
    target: RedirectTarget,
    url: Option<String>,
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ServiceError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid(format!("{name} must be a boolean, got {value}"))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ServiceError> {
    value.parse().map_err(|_| invalid(format!("{name} must be a non-negative integer, got {value}")))
}

/// Split reserved parameters from the external variables. Variable values
/// are read as JSON when they parse, as plain strings otherwise; repeated
/// names collect into a list.
fn parse_listing_query(params: Vec<(String, String)>) -> Result<ListingQuery, ServiceError> {
    let mut query = ListingQuery::default();
    let mut variables: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for (name, value) in params {
        match name.as_str() {
            "show_details" => query.request.show_details = parse_flag(&name, &value)?,
            "show_fallbacks" => query.request.show_fallbacks = parse_flag(&name, &value)?,
            "distribute_items" => {
                query.request.distribute_items = Some(parse_flag(&name, &value)?);
            }
            "variation_idx" => query.request.variation_idx = Some(parse_number(&name, &value)?),
            "seed" => query.request.seed = Some(parse_number(&name, &value)?),
            "item_idx" => query.target.item_idx = Some(parse_number(&name, &value)?),
            "slot_idx" => query.target.slot_idx = Some(parse_number(&name, &value)?),
            "url" => query.url = Some(value),
            _ => {
                let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
                variables.entry(name).or_default().push(parsed);
            }
        }
    }

    query.request.variables = variables
        .into_iter()
        .map(|(name, mut values)| {
            let value =
                if values.len() == 1 { values.remove(0) } else { Value::Array(values) };
            (name, value)
        })
        .collect();
    Ok(query)
}

fn parse_score_records(body: &str) -> Result<Vec<ScoreRecord>, ServiceError> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map_err(|err| invalid(format!("line {}: invalid score record: {err}", number + 1)))
        })
        .collect()
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/placements/:hash/items", get(placement_items))
        .route("/v1/placements/:hash/redirect", get(placement_redirect))
        .route("/v1/catalogs/:item_type/:store_id/reconcile", post(catalog_reconcile))
        .route("/v1/catalogs/:item_type/:store_id/filters", post(catalog_filters))
        .route("/v1/engines/:engine_id/vector", post(engine_vector).get(engine_vector_export))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let store = SqliteKvStore::open_and_migrate(&args.db)?;
    let api = RecoKernelApi::new(Arc::new(store), config, EngineRegistry::with_defaults())?;
    let state = ServiceState {
        api: Arc::new(api),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "reco kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok" })
}

async fn placement_items(
    State(state): State<ServiceState>,
    Path(hash): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ServiceError> {
    let query = parse_listing_query(params)?;
    let response = state.bounded(state.api.recommend(&hash, &query.request)).await?;
    Ok(envelope(response).into_response())
}

async fn placement_redirect(
    State(state): State<ServiceState>,
    Path(hash): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ServiceError> {
    let query = parse_listing_query(params)?;
    let item = state.bounded(state.api.redirect(&hash, &query.request, query.target)).await?;

    let Some(url) = query.url else {
        return Ok(envelope(item).into_response());
    };
    let location =
        HeaderValue::from_str(&url).map_err(|_| invalid(format!("url is not a valid location: {url}")))?;
    let mut response = (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    if let Ok(key) = HeaderValue::from_str(&item.key) {
        response.headers_mut().insert(ITEM_KEY_HEADER, key);
    }
    Ok(response)
}

async fn catalog_reconcile(
    State(state): State<ServiceState>,
    Path((item_type, store_id)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    let summary = state.api.reconcile(&item_type, &store_id).await?;
    Ok(envelope(summary).into_response())
}

async fn catalog_filters(
    State(state): State<ServiceState>,
    Path((item_type, store_id)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    let summary = state.api.rebuild_filters(&item_type, &store_id).await?;
    Ok(envelope(summary).into_response())
}

async fn engine_vector(
    State(state): State<ServiceState>,
    Path(engine_id): Path<String>,
    body: String,
) -> Result<Response, ServiceError> {
    let records = parse_score_records(&body)?;
    let summary = state.api.ingest(&engine_id, &records).await?;
    Ok(envelope(summary).into_response())
}

async fn engine_vector_export(
    State(state): State<ServiceState>,
    Path(engine_id): Path<String>,
) -> Result<Response, ServiceError> {
    let records = state.bounded(state.api.export(&engine_id)).await?;
    Ok(envelope(records).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use reco_kernel_core::RecommendationConfig;
    use reco_kernel_store::{KvStore, MemoryKvStore};
    use serde_json::json;
    use tower::ServiceExt;

    const CONFIG: &str = r"
item_types:
  - name: products
    id_fields: [sku]
    facets:
      - name: color
        shape: { type: scalar }
engines:
  - { id: best, kind: top_seller, item_type: products, store_id: '1' }
  - { id: backup, kind: top_seller, item_type: products, store_id: '1' }
slots:
  - id: main
    engine: best
    max_items: 3
    filters:
      - { facet: color }
    fallbacks: [spare]
  - { id: spare, engine: backup, max_items: 3 }
placements:
  - hash: home
    name: Home
    variations:
      - slots: [main]
  - hash: mixed
    name: Mixed
    distribute_items: true
    variations:
      - slots: [main, spare]
";

    fn object(value: Value) -> reco_kernel_core::Item {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {other}"),
        }
    }

    async fn fixture_state(timeout: Duration) -> ServiceState {
        let config: RecommendationConfig = match serde_yaml::from_str(CONFIG) {
            Ok(config) => config,
            Err(err) => panic!("fixture config did not parse: {err}"),
        };
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let api = match RecoKernelApi::new(store, config, EngineRegistry::with_defaults()) {
            Ok(api) => api,
            Err(err) => panic!("fixture api failed: {err}"),
        };

        let items = vec![
            object(json!({"sku": "a", "color": "red"})),
            object(json!({"sku": "b", "color": "blue"})),
            object(json!({"sku": "c", "color": "red"})),
        ];
        if let Err(err) = api.load_items("products", "1", items).await {
            panic!("fixture load failed: {err}");
        }
        ServiceState { api: Arc::new(api), request_timeout: timeout }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Body) -> Response {
        let request = Request::builder()
            .uri(uri)
            .method(method)
            .body(body)
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn prepared_router() -> Router {
        let router = app(fixture_state(Duration::from_secs(5)).await);
        for uri in ["/v1/catalogs/products/1/reconcile", "/v1/catalogs/products/1/filters"] {
            let response = call(&router, "POST", uri, Body::empty()).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
        let best = "{\"item\":{\"sku\":\"a\"},\"value\":5}\n{\"item\":{\"sku\":\"b\"},\"value\":9}\n\n{\"item\":{\"sku\":\"c\"},\"value\":1}\n";
        let response = call(&router, "POST", "/v1/engines/best/vector", Body::from(best)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let backup = "{\"item\":{\"sku\":\"c\"},\"value\":3}\n";
        let response = call(&router, "POST", "/v1/engines/backup/vector", Body::from(backup)).await;
        assert_eq!(response.status(), StatusCode::OK);
        router
    }

    fn skus(items: &Value) -> Vec<String> {
        items
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("sku").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(fixture_state(Duration::from_secs(5)).await);
        let response = call(&router, "GET", "/v1/health", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn placement_items_are_ranked_and_filtered() {
        let router = prepared_router().await;

        let response = call(&router, "GET", "/v1/placements/home/items?seed=3", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let data = &value["data"];
        assert_eq!(data["seed"], json!(3));
        assert_eq!(skus(&data["slots"][0]["items"]), vec!["b", "a", "c"]);

        let response =
            call(&router, "GET", "/v1/placements/home/items?color=red&show_details=true", Body::empty())
                .await;
        let value = response_json(response).await;
        let items = &value["data"]["slots"][0]["items"];
        assert_eq!(skus(items), vec!["a", "c"]);
        assert_eq!(items[0]["color"], json!("red"));
    }

    #[tokio::test]
    async fn empty_primary_is_filled_from_fallback() {
        let router = prepared_router().await;
        let response =
            call(&router, "GET", "/v1/placements/home/items?color=purple", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(skus(&value["data"]["slots"][0]["items"]), vec!["c"]);
    }

    #[tokio::test]
    async fn distributed_listing_reports_merged_items() {
        let router = prepared_router().await;
        let response =
            call(&router, "GET", "/v1/placements/mixed/items?seed=11", Body::empty()).await;
        let value = response_json(response).await;
        assert_eq!(skus(&value["data"]["items"]).len(), 4);
    }

    #[tokio::test]
    async fn redirect_points_at_the_listed_item() {
        let router = prepared_router().await;

        let response = call(
            &router,
            "GET",
            "/v1/placements/home/redirect?slot_idx=0&item_idx=1&url=https://shop.example/p",
            Body::empty(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).and_then(|value| value.to_str().ok()),
            Some("https://shop.example/p")
        );
        assert_eq!(
            response.headers().get(ITEM_KEY_HEADER).and_then(|value| value.to_str().ok()),
            Some(r#"{"sku":"a"}"#)
        );

        let response =
            call(&router, "GET", "/v1/placements/home/redirect?item_idx=1", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["error"]["kind"], json!("invalid_request"));
    }

    #[tokio::test]
    async fn error_kinds_map_to_statuses() {
        let router = prepared_router().await;

        let response = call(&router, "GET", "/v1/placements/ghost/items", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = call(&router, "GET", "/v1/placements/home/items?seed=x", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = call(&router, "POST", "/v1/engines/best/vector", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        assert_eq!(value["error"]["kind"], json!("no_data"));

        let response =
            call(&router, "POST", "/v1/engines/best/vector", Body::from("not json\n")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_returns_positive_scores() {
        let router = prepared_router().await;
        let response = call(&router, "GET", "/v1/engines/backup/vector", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["data"], json!([{"item": {"sku": "c"}, "value": 3}]));
    }

    #[tokio::test]
    async fn expired_requests_are_cancelled() {
        let state = fixture_state(Duration::from_millis(10)).await;
        let result = state
            .bounded(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, RecoError>(())
            })
            .await;
        match result {
            Err(err) => {
                assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
                assert_eq!(err.error.kind, "cancelled");
            }
            Ok(()) => panic!("expected the request to time out"),
        }
    }

    #[test]
    fn repeated_variables_collect_into_lists() {
        let params = vec![
            ("color".to_string(), "red".to_string()),
            ("color".to_string(), "blue".to_string()),
            ("related_inclusive_of".to_string(), r#"{"sku":"a"}"#.to_string()),
            ("show_fallbacks".to_string(), "1".to_string()),
        ];
        let query = match parse_listing_query(params) {
            Ok(query) => query,
            Err(err) => panic!("query did not parse: {}", err.error.message),
        };
        assert!(query.request.show_fallbacks);
        assert_eq!(query.request.variables.get("color"), Some(&json!(["red", "blue"])));
        assert_eq!(query.request.variables.get("related_inclusive_of"), Some(&json!({"sku": "a"})));
    }
}
