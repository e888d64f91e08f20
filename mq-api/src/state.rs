//! Application state shared across handlers.

use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use mq_auth::{AuthGate, AuthGateConfig};
use mq_core::types::{Tenant, TenantId};
use mq_core::MallConfig;
use mq_engine::{Coordinator, NotificationHub, RateLimiter};
use mq_store::{ShardedStore, Store};

use crate::error::{ApiError, ApiResult};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub service_name: String,
    pub version: String,
    pub listen_addr: String,
    pub enable_cors: bool,
    /// Tenant used when the request host matches no registry entry.
    pub default_tenant: Option<TenantId>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            service_name: "mallquest-api".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            enable_cors: true,
            default_tenant: None,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<ShardedStore>,
    pub gate: Arc<AuthGate>,
    pub rate_limiter: Arc<RateLimiter>,
    pub coordinator: Arc<Coordinator>,
    pub hub: Arc<NotificationHub>,
    pub started_at: DateTime<Utc>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the full stack from configuration. Fails fast when the
    /// signing secret is missing.
    pub fn from_config(
        mall_config: &MallConfig,
        store: Arc<ShardedStore>,
    ) -> Result<Self, String> {
        let secret = mall_config
            .auth_secret
            .clone()
            .ok_or_else(|| "MALLQUEST_AUTH_SECRET is required".to_string())?;

        let gate_config = AuthGateConfig {
            access_ttl_secs: mall_config.access_ttl_secs,
            refresh_ttl_secs: mall_config.refresh_ttl_secs,
            ..Default::default()
        };
        let dyn_store: Arc<dyn Store> = store.clone();
        let gate = Arc::new(AuthGate::new(
            dyn_store.clone(),
            gate_config,
            secret,
            mall_config.auth_secret_prev.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            dyn_store,
            mall_config.rate_limits.clone(),
        ));
        let hub = Arc::new(NotificationHub::default());
        let mut coordinator = Coordinator::new(store.clone(), rate_limiter.clone(), hub.clone());
        if mall_config.redis_enabled {
            // Second tier slot; a Redis-backed CacheTier drops in here.
            tracing::info!("second cache tier enabled");
            coordinator = coordinator
                .with_cache_tier(Arc::new(mq_engine::MemoryTier::new()));
        }

        Ok(Self {
            config: ApiConfig {
                listen_addr: mall_config.listen_addr.clone(),
                ..Default::default()
            },
            store,
            gate,
            rate_limiter,
            coordinator: Arc::new(coordinator),
            hub,
            started_at: Utc::now(),
            prometheus: None,
        })
    }

    pub fn with_api_config(mut self, config: ApiConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Resolve the tenant for a request host. Falls back to the
    /// configured default, then to a single-tenant registry.
    pub async fn resolve_tenant(&self, host: Option<&str>) -> ApiResult<Tenant> {
        if let Some(host) = host {
            let bare = host.split(':').next().unwrap_or(host);
            if let Some(tenant) = self.store.get_tenant_by_host(bare).await? {
                return Ok(tenant);
            }
        }
        if let Some(id) = &self.config.default_tenant {
            if let Some(tenant) = self.store.get_tenant(id).await? {
                return Ok(tenant);
            }
        }
        let tenants = self.store.list_tenants().await?;
        match tenants.len() {
            1 => Ok(tenants.into_iter().next().expect("length checked")),
            _ => Err(ApiError::NotFound("tenant".to_string())),
        }
    }
}
