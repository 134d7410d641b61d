//! # Remote Backend
//!
//! Persists the cart to an HTTP cart API with reqwest.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  save(state) ──► cache ──► writer ──► POST|PUT|PATCH {endpoint}/{id}    │
//! │                                        body = request_transform(state)  │
//! │                                                                         │
//! │  clear()     ──► cache ──► writer ──► DELETE {endpoint}/{id}            │
//! │                                                                         │
//! │  load()      ──► cache loaded? ── yes ──► cached value                  │
//! │                        │                                                │
//! │                        no ──► spawn ONE background GET, return None     │
//! │                                                                         │
//! │  load_async() ─────────────────────► GET {endpoint}/{id}                │
//! │                                        404      → Ok(None)              │
//! │                                        non-2xx  → RemoteBackendFailure  │
//! │                                        2xx      → response_transform    │
//! │                                                                         │
//! │  Every request: Authorization: Bearer <token_provider()> (if any)       │
//! │  Failures: error callback, no retry                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use url::Url;

use cartkit_core::CartState;

use super::deferred::{current_runtime, lock_cache, SharedCache};
use super::{AsyncCache, Backend, BackendKind, ErrorCallback, ErrorSlot, RecordSink, WriteQueue};
use crate::error::{StoreError, StoreResult};

/// Supplies a bearer token per request; `None` sends no Authorization header.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Shapes the outgoing body.
pub type RequestTransform = Arc<dyn Fn(&CartState) -> Value + Send + Sync>;

/// Reads a cart out of the response body.
pub type ResponseTransform = Arc<dyn Fn(Value) -> StoreResult<CartState> + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// HTTP method used for saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SaveMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl SaveMethod {
    fn as_method(&self) -> Method {
        match self {
            SaveMethod::Post => Method::POST,
            SaveMethod::Put => Method::PUT,
            SaveMethod::Patch => Method::PATCH,
        }
    }
}

impl std::fmt::Display for SaveMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_method())
    }
}

impl std::str::FromStr for SaveMethod {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "POST" => Ok(SaveMethod::Post),
            "PUT" => Ok(SaveMethod::Put),
            "PATCH" => Ok(SaveMethod::Patch),
            other => Err(StoreError::InvalidConfig(format!(
                "Unsupported save method: '{}'. Valid options: POST, PUT, PATCH",
                other
            ))),
        }
    }
}

/// Where and how to reach the cart API.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Collection URL, e.g. `https://api.example.com/carts`.
    pub endpoint: Url,

    /// Appended as the last path segment when set.
    pub cart_id: Option<String>,

    pub save_method: SaveMethod,

    /// Per-request timeout. Default: 10 seconds
    pub timeout: Duration,
}

impl RemoteConfig {
    /// Parses and checks the endpoint (http or https only).
    pub fn new(endpoint: &str) -> StoreResult<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(StoreError::InvalidConfig(format!(
                "Remote endpoint must be http:// or https://, got: {}",
                endpoint
            )));
        }
        Ok(RemoteConfig {
            endpoint,
            cart_id: None,
            save_method: SaveMethod::default(),
            timeout: Duration::from_secs(10),
        })
    }

    pub fn cart_id(mut self, id: impl Into<String>) -> Self {
        self.cart_id = Some(id.into());
        self
    }

    pub fn save_method(mut self, method: SaveMethod) -> Self {
        self.save_method = method;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The URL every request goes to.
    pub fn resource_url(&self) -> StoreResult<Url> {
        let mut url = self.endpoint.clone();
        if let Some(id) = &self.cart_id {
            url.path_segments_mut()
                .map_err(|_| StoreError::InvalidConfig(format!("{} cannot take a path", self.endpoint)))?
                .pop_if_empty()
                .push(id);
        }
        Ok(url)
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

struct RemoteClient {
    http: reqwest::Client,
    url: Url,
    save_method: SaveMethod,
    token: Option<TokenProvider>,
    request_transform: Option<RequestTransform>,
    response_transform: Option<ResponseTransform>,
}

impl RemoteClient {
    fn request(&self, method: Method) -> RequestBuilder {
        let request = self.http.request(method, self.url.clone());
        match self.token.as_ref().and_then(|provider| provider()) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch(&self) -> StoreResult<Option<CartState>> {
        let response = self.request(Method::GET).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            debug!(url = %self.url, "No remote cart yet");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(failure(status, response).await);
        }

        let body: Value = response.json().await?;
        let state = match &self.response_transform {
            Some(transform) => transform(body)?,
            None => serde_json::from_value(body)?,
        };
        Ok(Some(state))
    }
}

async fn failure(status: StatusCode, response: reqwest::Response) -> StoreError {
    let message = response.text().await.unwrap_or_default();
    StoreError::RemoteBackendFailure {
        status: Some(status.as_u16()),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    }
}

#[async_trait]
impl RecordSink for RemoteClient {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn write(&self, state: &CartState) -> StoreResult<()> {
        let body = match &self.request_transform {
            Some(transform) => transform(state),
            None => serde_json::to_value(state)?,
        };

        let response = self
            .request(self.save_method.as_method())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(failure(status, response).await);
        }

        debug!(url = %self.url, items = state.len(), "Remote cart saved");
        Ok(())
    }

    async fn erase(&self) -> StoreResult<()> {
        let response = self.request(Method::DELETE).send().await?;
        let status = response.status();
        // Deleting a cart that was never created is fine.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(failure(status, response).await);
        }

        debug!(url = %self.url, "Remote cart deleted");
        Ok(())
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`RemoteBackend`] with optional hooks.
///
/// ## Example
/// ```rust,ignore
/// let backend = RemoteBackend::builder(RemoteConfig::new("https://api.example.com/carts")?.cart_id("42"))
///     .auth_token(|| std::env::var("CART_TOKEN").ok())
///     .build()?;
/// ```
pub struct RemoteBackendBuilder {
    config: RemoteConfig,
    token: Option<TokenProvider>,
    request_transform: Option<RequestTransform>,
    response_transform: Option<ResponseTransform>,
}

impl RemoteBackendBuilder {
    pub fn auth_token<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.token = Some(Arc::new(provider));
        self
    }

    pub fn request_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&CartState) -> Value + Send + Sync + 'static,
    {
        self.request_transform = Some(Arc::new(transform));
        self
    }

    pub fn response_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> StoreResult<CartState> + Send + Sync + 'static,
    {
        self.response_transform = Some(Arc::new(transform));
        self
    }

    /// Builds the client and starts the writer. Must run inside a tokio runtime.
    pub fn build(self) -> StoreResult<RemoteBackend> {
        let runtime = current_runtime()?;
        let http = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .build()?;

        let client = Arc::new(RemoteClient {
            http,
            url: self.config.resource_url()?,
            save_method: self.config.save_method,
            token: self.token,
            request_transform: self.request_transform,
            response_transform: self.response_transform,
        });

        let errors = ErrorSlot::default();
        let queue = WriteQueue::start(&runtime, Arc::clone(&client), errors.clone());

        info!(url = %client.url, method = %client.save_method, "Remote cart backend ready");

        Ok(RemoteBackend {
            client,
            runtime,
            cache: Arc::new(Mutex::new(AsyncCache::default())),
            errors,
            queue,
            fetch_in_flight: Arc::new(AtomicBool::new(false)),
        })
    }
}

// =============================================================================
// Remote Backend
// =============================================================================

/// Asynchronous backend talking to an HTTP cart API.
pub struct RemoteBackend {
    client: Arc<RemoteClient>,
    runtime: Handle,
    cache: SharedCache,
    errors: ErrorSlot,
    queue: WriteQueue,
    fetch_in_flight: Arc<AtomicBool>,
}

impl RemoteBackend {
    /// Backend with no hooks.
    pub fn new(config: RemoteConfig) -> StoreResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: RemoteConfig) -> RemoteBackendBuilder {
        RemoteBackendBuilder {
            config,
            token: None,
            request_transform: None,
            response_transform: None,
        }
    }

    /// Performs a real GET and refreshes the cache.
    pub async fn load_async(&self) -> StoreResult<Option<CartState>> {
        let record = self.client.fetch().await?;
        lock_cache(&self.cache).fill(record.clone());
        Ok(record)
    }

    /// Waits for every queued request to complete.
    pub async fn flush(&self) -> StoreResult<()> {
        self.queue.flush().await
    }

    pub fn url(&self) -> &Url {
        &self.client.url
    }

    fn spawn_initial_fetch(&self) {
        if self.fetch_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = Arc::clone(&self.client);
        let cache = Arc::clone(&self.cache);
        let errors = self.errors.clone();
        let in_flight = Arc::clone(&self.fetch_in_flight);

        self.runtime.spawn(async move {
            match client.fetch().await {
                Ok(record) => {
                    let mut cache = lock_cache(&cache);
                    // A local write that landed first is newer than what we fetched.
                    if !cache.is_loaded() {
                        cache.fill(record);
                    }
                }
                Err(e) => {
                    warn!(url = %client.url, error = %e, "Initial remote cart fetch failed");
                    errors.report(&e);
                    in_flight.store(false, Ordering::SeqCst);
                }
            }
        });
    }
}

impl Backend for RemoteBackend {
    fn save(&self, state: &CartState) -> StoreResult<()> {
        lock_cache(&self.cache).store(state.clone());
        self.queue.enqueue_save(state.clone())
    }

    fn load(&self) -> StoreResult<Option<CartState>> {
        {
            let cache = lock_cache(&self.cache);
            if cache.is_loaded() {
                return Ok(cache.value());
            }
        }
        self.spawn_initial_fetch();
        Ok(None)
    }

    fn clear(&self) -> StoreResult<()> {
        lock_cache(&self.cache).clear();
        self.queue.enqueue_clear()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.errors.set(callback);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use cartkit_core::{CartItem, Money, Product};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// In-process stand-in for the cart API.
    #[derive(Default)]
    struct FakeApi {
        carts: HashMap<String, Value>,
        auth: Vec<Option<String>>,
        methods: Vec<String>,
    }

    type Shared = Arc<Mutex<FakeApi>>;

    fn record(api: &Shared, method: &str, headers: &HeaderMap) {
        let mut api = api.lock().unwrap();
        api.methods.push(method.to_string());
        api.auth.push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
    }

    async fn get_cart(
        State(api): State<Shared>,
        Path(id): Path<String>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, StatusCode> {
        record(&api, "GET", &headers);
        if id == "broken" {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        let api = api.lock().unwrap();
        api.carts.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
    }

    async fn save_cart(
        State(api): State<Shared>,
        Path(id): Path<String>,
        headers: HeaderMap,
        method: axum::http::Method,
        Json(body): Json<Value>,
    ) -> StatusCode {
        record(&api, method.as_str(), &headers);
        if id == "broken" {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        api.lock().unwrap().carts.insert(id, body);
        StatusCode::OK
    }

    async fn delete_cart(
        State(api): State<Shared>,
        Path(id): Path<String>,
        headers: HeaderMap,
    ) -> StatusCode {
        record(&api, "DELETE", &headers);
        api.lock().unwrap().carts.remove(&id);
        StatusCode::NO_CONTENT
    }

    async fn spawn_api() -> (String, Shared) {
        let api = Shared::default();
        let app = Router::new()
            .route(
                "/carts/{id}",
                get(get_cart).post(save_cart).put(save_cart).delete(delete_cart),
            )
            .with_state(Arc::clone(&api));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/carts", addr), api)
    }

    fn sample_state() -> CartState {
        CartState::from_items(vec![CartItem::new(
            Product::new("1", "Widget", Money::from_cents(10)),
            2,
            Utc::now(),
        )])
    }

    #[test]
    fn test_config_validation() {
        assert!(RemoteConfig::new("https://api.example.com/carts").is_ok());
        assert!(RemoteConfig::new("ftp://api.example.com/carts").is_err());
        assert!(RemoteConfig::new("not a url").is_err());

        let config = RemoteConfig::new("https://api.example.com/carts/")
            .unwrap()
            .cart_id("abc");
        assert_eq!(
            config.resource_url().unwrap().as_str(),
            "https://api.example.com/carts/abc"
        );
        assert_eq!("put".parse::<SaveMethod>().unwrap(), SaveMethod::Put);
    }

    #[tokio::test]
    async fn test_missing_cart_is_none() {
        let (endpoint, _api) = spawn_api().await;
        let backend = RemoteBackend::new(RemoteConfig::new(&endpoint).unwrap().cart_id("c1")).unwrap();

        assert!(backend.load_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (endpoint, api) = spawn_api().await;
        let backend = RemoteBackend::new(RemoteConfig::new(&endpoint).unwrap().cart_id("c1")).unwrap();

        backend.save(&CartState::empty()).unwrap();
        backend.flush().await.unwrap();
        assert_eq!(backend.load_async().await.unwrap(), Some(CartState::empty()));

        let state = sample_state();
        backend.save(&state).unwrap();
        assert_eq!(backend.load().unwrap(), Some(state.clone()));
        backend.flush().await.unwrap();
        assert_eq!(backend.load_async().await.unwrap(), Some(state));

        backend.clear().unwrap();
        backend.flush().await.unwrap();
        assert!(api.lock().unwrap().carts.is_empty());
        assert!(backend.load_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_is_cache_first() {
        let (endpoint, api) = spawn_api().await;
        let state = sample_state();
        api.lock()
            .unwrap()
            .carts
            .insert("c1".into(), serde_json::to_value(&state).unwrap());

        let backend = RemoteBackend::new(RemoteConfig::new(&endpoint).unwrap().cart_id("c1")).unwrap();

        // Nothing cached yet: None now, fetch happens in the background.
        assert!(backend.load().unwrap().is_none());

        let loaded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(state) = backend.load().unwrap() {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(loaded, state);

        let gets = api.lock().unwrap().methods.iter().filter(|m| *m == "GET").count();
        assert_eq!(gets, 1);
    }

    #[tokio::test]
    async fn test_auth_and_save_method() {
        let (endpoint, api) = spawn_api().await;
        let config = RemoteConfig::new(&endpoint)
            .unwrap()
            .cart_id("c1")
            .save_method(SaveMethod::Put);
        let backend = RemoteBackend::builder(config)
            .auth_token(|| Some("secret".to_string()))
            .build()
            .unwrap();

        backend.save(&sample_state()).unwrap();
        backend.flush().await.unwrap();

        let api = api.lock().unwrap();
        assert_eq!(api.methods, vec!["PUT"]);
        assert_eq!(api.auth, vec![Some("Bearer secret".to_string())]);
    }

    #[tokio::test]
    async fn test_transforms() {
        let (endpoint, api) = spawn_api().await;
        let backend = RemoteBackend::builder(RemoteConfig::new(&endpoint).unwrap().cart_id("c1"))
            .request_transform(|state| serde_json::json!({ "cart": state }))
            .response_transform(|body| {
                serde_json::from_value(body["cart"].clone()).map_err(StoreError::from)
            })
            .build()
            .unwrap();

        let state = sample_state();
        backend.save(&state).unwrap();
        backend.flush().await.unwrap();

        assert!(api.lock().unwrap().carts["c1"].get("cart").is_some());
        assert_eq!(backend.load_async().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_server_errors() {
        let (endpoint, _api) = spawn_api().await;
        let backend =
            RemoteBackend::new(RemoteConfig::new(&endpoint).unwrap().cart_id("broken")).unwrap();

        let err = backend.load_async().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RemoteBackendFailure { status: Some(500), .. }
        ));

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        backend.set_error_callback(Some(Arc::new(move |_e: &StoreError| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        // The save itself is accepted; the failure arrives via the callback.
        backend.save(&sample_state()).unwrap();
        backend.flush().await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
