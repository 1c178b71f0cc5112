use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
};

use anyhow::Result;
use serde_json::Value;
use tracing::{event, Level};

use crate::{
    analytics::AnalyticsReporter,
    cache::{flatten_flag_tree, FlagCache},
    http::TongaHttpClient,
    models::{ContextAttributes, FlagValue, RequestAttributes, TongaOptions},
};

/// Tonga client resolving flags against a remote server, with a local cache
/// and asynchronous analytics reporting.
///
/// The cache is not internally synchronized: `get` and the state-mutating
/// operations take `&mut self`, so sharing one client across threads requires
/// an external wrapper. The analytics counter is the one structure touched by
/// the background reporting task and carries its own lock.
pub struct TongaClient {
    options: TongaOptions,
    http_client: TongaHttpClient,
    cache: FlagCache,
    pre_fetched: bool,
    reporter: Option<AnalyticsReporter>,
    closed: bool,
}

/// Builder for [`TongaClient`].
pub struct TongaClientBuilder {
    server_url: String,
    context_attributes: ContextAttributes,
    request_attributes: RequestAttributes,
    options: TongaOptions,
}

impl TongaClientBuilder {
    /// Adds a context attribute, scoping flag evaluation for this client.
    pub fn context_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.context_attributes.insert(key.into(), value.into());
        self
    }

    pub fn context_attributes(mut self, attributes: ContextAttributes) -> Self {
        self.context_attributes = attributes;
        self
    }

    /// Adds a request attribute, sent as an `X-Tonga-<key>` header for
    /// server-side logging.
    pub fn request_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.request_attributes.insert(key.into(), Some(value.into()));
        self
    }

    /// Replaces all request attributes. Entries with a `None` value send no
    /// header at all.
    pub fn request_attributes(mut self, attributes: RequestAttributes) -> Self {
        self.request_attributes = attributes;
        self
    }

    pub fn options(mut self, options: TongaOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<TongaClient> {
        let http_client = TongaHttpClient::new(
            self.server_url.trim_end_matches('/').to_string(),
            &self.context_attributes,
            &self.request_attributes,
            self.options.retries,
            self.options.retry_delay,
        )?;
        Ok(TongaClient {
            options: self.options,
            http_client,
            cache: FlagCache::new(),
            pre_fetched: false,
            reporter: None,
            closed: false,
        })
    }
}

impl TongaClient {
    pub fn builder(server_url: impl Into<String>) -> TongaClientBuilder {
        TongaClientBuilder {
            server_url: server_url.into(),
            context_attributes: ContextAttributes::new(),
            request_attributes: RequestAttributes::new(),
            options: TongaOptions::default(),
        }
    }

    /// Creates a client with no attributes and default options.
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        Self::builder(server_url).build()
    }

    /// Gets the value associated to the specified flag, `None` if the flag
    /// resolved to absent. In offline mode an unresolved flag is `None`; use
    /// [`get_or`](Self::get_or) to supply an offline value.
    ///
    /// Fetch failures after the configured retries propagate to the caller
    /// and leave the cache untouched, so a later call retries from scratch.
    pub async fn get(&mut self, flag: &str) -> Result<Option<FlagValue>> {
        self.get_value(flag, None).await
    }

    /// Like [`get`](Self::get), but in offline mode an unresolved flag
    /// resolves to `offline_value` instead of `None`.
    pub async fn get_or(
        &mut self,
        flag: &str,
        offline_value: impl Into<FlagValue>,
    ) -> Result<Option<FlagValue>> {
        self.get_value(flag, Some(offline_value.into())).await
    }

    async fn get_value(
        &mut self,
        flag: &str,
        offline_value: Option<FlagValue>,
    ) -> Result<Option<FlagValue>> {
        if let Some(value) = self.cache.lookup(flag).cloned() {
            if !self.options.offline_mode {
                self.record_analytics(flag, &value);
            }
            return Ok(resolved(value));
        }
        if self.options.offline_mode {
            return Ok(offline_value.filter(|value| !value.is_null()));
        }
        let value = self.resolve_miss(flag).await?;
        self.record_analytics(flag, &value);
        Ok(resolved(value))
    }

    /// Stops the analytics task and flushes any pending counts, waiting at
    /// most `timeout_on_close`. Calling it again is a no-op; `get` keeps
    /// resolving afterwards but no longer records analytics.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(mut reporter) = self.reporter.take() {
            reporter.shutdown(self.options.timeout_on_close).await;
        }
    }

    /// Deep copy of the resolved flag state, a flat JSON-serializable map.
    pub fn dump_state(&self) -> HashMap<String, FlagValue> {
        self.cache.snapshot()
    }

    /// Replaces the resolved flag state wholesale. Injected flags are served
    /// from the cache without any network call.
    pub fn set_state(&mut self, state: HashMap<String, FlagValue>) {
        self.cache.replace(state);
    }

    /// Discards all resolved flags, reverting to fetch-on-miss behavior.
    pub fn clear_state(&mut self) {
        self.cache.clear();
    }

    /// Temporarily replaces the flag state for the lifetime of the returned
    /// guard; the prior state is restored when the guard drops, on every exit
    /// path. Nested guards restore to the immediately-prior state.
    pub fn with_state(&mut self, state: HashMap<String, FlagValue>) -> ScopedState<'_> {
        let saved = self.cache.snapshot();
        self.cache.replace(state);
        ScopedState {
            client: self,
            saved,
        }
    }
}

// Private methods
impl TongaClient {
    async fn resolve_miss(&mut self, flag: &str) -> Result<FlagValue> {
        let value = if self.options.pre_fetch {
            self.pre_fetch_all().await?;
            self.cache.lookup(flag).cloned().unwrap_or(FlagValue::Null)
        } else {
            match self.http_client.get_flag_value(flag).await? {
                None => FlagValue::Null,
                Some(body) => extract_flag_value(body)?,
            }
        };
        self.cache.insert(flag.to_owned(), value.clone());
        Ok(value)
    }

    /// One-shot bulk fetch: flattens the flag tree into the cache. A failed
    /// fetch does not count as the one shot, so the next miss tries again.
    async fn pre_fetch_all(&mut self) -> Result<()> {
        if self.pre_fetched {
            return Ok(());
        }
        event!(Level::DEBUG, "Pre-fetching all flag values");
        // 404 means the server has no flags for this scope at all.
        if let Some(tree) = self.http_client.get_all_flag_values().await? {
            let flags = flatten_flag_tree(tree)?;
            self.cache.merge(flags);
        }
        self.pre_fetched = true;
        Ok(())
    }

    fn record_analytics(&mut self, flag: &str, value: &FlagValue) {
        if self.closed {
            return;
        }
        let reporter = self.reporter.get_or_insert_with(|| {
            AnalyticsReporter::spawn(
                self.http_client.clone(),
                self.options.analytics_report_interval,
            )
        });
        reporter.record(flag, value);
    }
}

/// Extracts the flag value from an on-demand response body: an object
/// contributes its `value` field (absent field means the flag has no value),
/// while a bare scalar body is itself the value.
fn extract_flag_value(body: Value) -> Result<FlagValue> {
    match body {
        Value::Object(mut map) => match map.remove("value") {
            Some(value) => FlagValue::try_from(value),
            None => Ok(FlagValue::Null),
        },
        bare => FlagValue::try_from(bare),
    }
}

fn resolved(value: FlagValue) -> Option<FlagValue> {
    match value {
        FlagValue::Null => None,
        value => Some(value),
    }
}

/// Guard returned by [`TongaClient::with_state`]. Dereferences to the client
/// so flags can be resolved against the temporary state; dropping it restores
/// the saved state.
pub struct ScopedState<'a> {
    client: &'a mut TongaClient,
    saved: HashMap<String, FlagValue>,
}

impl Deref for ScopedState<'_> {
    type Target = TongaClient;

    fn deref(&self) -> &TongaClient {
        self.client
    }
}

impl DerefMut for ScopedState<'_> {
    fn deref_mut(&mut self) -> &mut TongaClient {
        self.client
    }
}

impl Drop for ScopedState<'_> {
    fn drop(&mut self) {
        self.client.cache.replace(std::mem::take(&mut self.saved));
    }
}
