//! Outbound feed requests.
//!
//! [`RequestOptions`] describes one GET (validators, credentials, proxy and
//! transport flags). [`RequestBuilder`] turns it into exactly one network
//! round trip, holding a host slot from the [`HostConcurrencyLimiter`] for
//! as long as the response lives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::header::{
    ACCEPT, COOKIE, HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, USER_AGENT,
};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Proxy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_ACCEPT_HEADER, POOL_MAX_IDLE_PER_HOST};
use super::host_limiter::HostConcurrencyLimiter;
use super::proxy::ProxyRotator;
use super::semaphore::ResponseSemaphore;
use crate::config::Config;
use crate::error::RefreshError;
use crate::model::Feed;
use crate::user_agent;

/// Per-request settings.
///
/// Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub username: String,
    pub password: String,
    pub cookie: String,
    /// Overrides the configured User-Agent when non-empty.
    pub user_agent: String,
    /// Sent as `If-None-Match`.
    pub etag: String,
    /// Sent as `If-Modified-Since`.
    pub last_modified: String,
    /// Explicit proxy, wins over every other proxy source.
    pub proxy_url: String,
    /// Use the configured application proxy.
    pub use_app_proxy: bool,
    pub allow_self_signed: bool,
    pub disable_http2: bool,
    /// Return the first redirect response instead of following it.
    pub without_redirects: bool,
}

impl RequestOptions {
    /// Options for fetching `feed`.
    ///
    /// Cache validators are only sent when the feed honors the HTTP cache and
    /// the refresh is not forced.
    #[must_use]
    pub fn for_feed(feed: &Feed, force: bool) -> Self {
        let mut options = Self {
            username: feed.username.clone(),
            password: feed.password.clone(),
            cookie: feed.cookie.clone(),
            user_agent: feed.user_agent.clone(),
            proxy_url: feed.proxy_url.clone(),
            use_app_proxy: feed.fetch_via_proxy,
            allow_self_signed: feed.allow_self_signed_certificates,
            disable_http2: feed.disable_http2,
            ..Self::default()
        };
        if !feed.ignore_http_cache && !force {
            options = options.with_validators(&feed.etag_header, &feed.last_modified_header);
        }
        options
    }

    #[must_use]
    pub fn with_validators(mut self, etag: &str, last_modified: &str) -> Self {
        self.etag = etag.to_string();
        self.last_modified = last_modified.to_string();
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    #[must_use]
    pub fn without_redirects(mut self) -> Self {
        self.without_redirects = true;
        self
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Client settings that cannot vary per request in reqwest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    allow_self_signed: bool,
    disable_http2: bool,
    follow_redirects: bool,
}

/// Issues feed requests under the per-host connection cap.
///
/// One reqwest client is built lazily per distinct transport setup (proxy,
/// TLS, HTTP/2, redirects) and reused, so connections are pooled across
/// refreshes.
#[derive(Debug)]
pub struct RequestBuilder {
    config: Arc<Config>,
    limiter: Arc<HostConcurrencyLimiter>,
    rotator: Option<ProxyRotator>,
    clients: DashMap<ClientKey, Client>,
}

impl RequestBuilder {
    #[must_use]
    pub fn new(config: Arc<Config>, limiter: Arc<HostConcurrencyLimiter>) -> Self {
        let rotator = ProxyRotator::new(&config.http_client_proxies);
        if let Some(rotator) = &rotator {
            debug!(proxies = rotator.len(), "proxy rotation enabled");
        }
        Self {
            config,
            limiter,
            rotator,
            clients: DashMap::new(),
        }
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<HostConcurrencyLimiter> {
        &self.limiter
    }

    /// Sends one GET to `url`.
    ///
    /// Waits for a host slot first; the slot stays held by the returned
    /// [`ResponseSemaphore`] until it is closed or dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`RefreshError`] of kind `Transport` for invalid URLs,
    /// client setup failures and network errors, and `Cancelled` when
    /// `cancel` fires while waiting for a slot or for the response.
    #[instrument(skip(self, options, cancel), fields(url = %url))]
    pub async fn execute(
        &self,
        url: &str,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<ResponseSemaphore, RefreshError> {
        let parsed = Url::parse(url)
            .map_err(|e| RefreshError::client(format!("invalid URL {url}: {e}")))?;
        let hostname = parsed
            .host_str()
            .ok_or_else(|| RefreshError::client(format!("URL has no host: {url}")))?
            .to_string();

        let permit = self
            .limiter
            .acquire(&hostname, cancel)
            .await
            .map_err(|_| RefreshError::cancelled())?;

        let key = ClientKey {
            proxy: self.select_proxy(options),
            allow_self_signed: options.allow_self_signed,
            disable_http2: options.disable_http2,
            follow_redirects: !options.without_redirects,
        };
        let client = self.client(&key)?;

        let mut request = client.get(parsed).headers(self.headers(options));
        if options.has_credentials() {
            request = request.basic_auth(&options.username, Some(&options.password));
        }

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RefreshError::cancelled()),
            result = request.send() => result.map_err(RefreshError::transport)?,
        };

        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            status = response.status().as_u16(),
            effective_url = %response.url(),
            hostname = %hostname,
            elapsed_ms,
            "response received"
        );
        Ok(ResponseSemaphore::new(response, permit))
    }

    /// Headers for one request, authentication excluded.
    #[must_use]
    pub fn headers(&self, options: &RequestOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT_HEADER));

        let agent =
            user_agent::effective_user_agent(&options.user_agent, &self.config.http_client_user_agent);
        insert_header(&mut headers, USER_AGENT, agent);

        if !options.etag.is_empty() {
            insert_header(&mut headers, IF_NONE_MATCH, &options.etag);
        }
        if !options.last_modified.is_empty() {
            insert_header(&mut headers, IF_MODIFIED_SINCE, &options.last_modified);
        }
        if !options.cookie.is_empty() {
            insert_header(&mut headers, COOKIE, &options.cookie);
        }
        headers
    }

    /// Proxy precedence: explicit proxy, then the application proxy when
    /// requested, then the rotation pool. `None` leaves it to the environment.
    fn select_proxy(&self, options: &RequestOptions) -> Option<String> {
        let explicit = options.proxy_url.trim();
        if !explicit.is_empty() {
            return Some(explicit.to_string());
        }
        if options.use_app_proxy
            && let Some(proxy) = self.config.http_client_proxy.as_deref()
        {
            return Some(proxy.to_string());
        }
        self.rotator
            .as_ref()
            .map(|rotator| rotator.next_proxy().to_string())
    }

    fn client(&self, key: &ClientKey) -> Result<Client, RefreshError> {
        if let Some(client) = self.clients.get(key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, key)?;
        debug!(
            proxied = key.proxy.is_some(),
            allow_self_signed = key.allow_self_signed,
            disable_http2 = key.disable_http2,
            follow_redirects = key.follow_redirects,
            "built HTTP client"
        );
        Ok(self.clients.entry(key.clone()).or_insert(client).clone())
    }
}

fn insert_header(headers: &mut HeaderMap, name: reqwest::header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "skipping header with invalid characters"),
    }
}

fn build_client(config: &Config, key: &ClientKey) -> Result<Client, RefreshError> {
    let timeout = config.http_client_timeout();
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS).min(timeout))
        .timeout(timeout)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .gzip(true)
        .brotli(true);

    builder = match &key.proxy {
        Some(proxy) => {
            let proxy = Proxy::all(proxy)
                .map_err(|e| RefreshError::client(format!("invalid proxy URL: {e}")))?;
            builder.proxy(proxy)
        }
        None => apply_env_proxy_fallback(builder.no_proxy()),
    };
    if key.allow_self_signed {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if key.disable_http2 {
        builder = builder.http1_only();
    }
    if !key.follow_redirects {
        builder = builder.redirect(Policy::none());
    }

    builder
        .build()
        .map_err(|e| RefreshError::client(format!("unable to build HTTP client: {e}")))
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    match scheme {
        "https" => first_env_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        "http" => first_env_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
        _ => None,
    }
}

fn first_env_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
