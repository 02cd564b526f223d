use std::sync::Arc;

use postbox_common::{internal, model::Domain};
use postbox_store::DomainRegistry;

use crate::{dns::MxResolver, error::MailError};

/// Registers mail domains and tracks whether they have an MX record.
///
/// `verified` only means the last MX lookup returned something.
#[derive(Debug, Clone)]
pub struct DomainService {
    registry: Arc<dyn DomainRegistry>,
    resolver: Arc<dyn MxResolver>,
}

impl DomainService {
    #[must_use]
    pub fn new(registry: Arc<dyn DomainRegistry>, resolver: Arc<dyn MxResolver>) -> Self {
        Self { registry, resolver }
    }

    /// Look up the MX for `name` and store the domain.
    ///
    /// # Errors
    /// A duplicate name is a [`postbox_store::StoreError::AlreadyExists`]
    pub async fn create_domain(&self, name: &str) -> Result<Domain, MailError> {
        let name = name.trim().to_lowercase();
        let mx_record = self.resolver.lookup_mx(&name).await;

        let domain = self
            .registry
            .insert_domain(Domain::new(&name, mx_record))
            .await?;

        internal!(
            level = INFO,
            "Domain created: {} (verified: {})",
            domain.name,
            domain.verified
        );
        Ok(domain)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Domain>, MailError> {
        Ok(self
            .registry
            .find_domain(&name.trim().to_lowercase())
            .await?)
    }

    /// Repeat the MX lookup and store the new result.
    pub async fn verify_domain(&self, name: &str) -> Result<Domain, MailError> {
        let mut domain = self
            .find_by_name(name)
            .await?
            .ok_or_else(|| MailError::DomainNotFound(name.to_string()))?;

        domain.mx_record = self.resolver.lookup_mx(&domain.name).await;
        domain.verified = domain.mx_record.is_some();
        self.registry.update_domain(&domain).await?;

        internal!(
            "Domain {} verified: {} ({:?})",
            domain.name,
            domain.verified,
            domain.mx_record
        );
        Ok(domain)
    }

    pub async fn all_domains(&self) -> Result<Vec<Domain>, MailError> {
        Ok(self.registry.all_domains().await?)
    }
}
