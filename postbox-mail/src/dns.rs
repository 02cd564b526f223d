//! MX lookups for domain verification.

use std::fmt::Debug;

use ahash::AHashMap;
use async_trait::async_trait;
use hickory_resolver::{
    ResolveError, TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use tracing::{debug, warn};

/// Finds the preferred mail exchanger for a domain.
#[async_trait]
pub trait MxResolver: Send + Sync + Debug {
    /// The exchange with the lowest preference, or `None` when the domain has
    /// no MX records or the lookup failed.
    async fn lookup_mx(&self, domain: &str) -> Option<String>;
}

#[derive(Debug)]
pub struct HickoryMxResolver {
    resolver: TokioResolver,
}

impl HickoryMxResolver {
    /// Resolver using the system configuration.
    pub fn new() -> Result<Self, ResolveError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?.build();
        Ok(Self { resolver })
    }

    /// Resolver using public upstream servers, for hosts without a usable
    /// `resolv.conf`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .with_options(ResolverOpts::default())
        .build();
        Self { resolver }
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Option<String> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let exchange = lookup
                    .iter()
                    .min_by_key(|mx| mx.preference())
                    .map(|mx| mx.exchange().to_utf8().trim_end_matches('.').to_string());
                debug!("MX lookup for {domain}: {exchange:?}");
                exchange
            }
            Err(err) => {
                warn!("No MX record found for {domain}: {err}");
                None
            }
        }
    }
}

/// Fixed answers, for tests and for operators pinning a domain's exchange.
#[derive(Debug, Default, Clone)]
pub struct StaticMxResolver {
    records: AHashMap<String, String>,
}

impl StaticMxResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_record(mut self, domain: &str, exchange: impl Into<String>) -> Self {
        self.records.insert(domain.to_lowercase(), exchange.into());
        self
    }
}

#[async_trait]
impl MxResolver for StaticMxResolver {
    async fn lookup_mx(&self, domain: &str) -> Option<String> {
        self.records.get(&domain.to_lowercase()).cloned()
    }
}
