use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

/// Erreurs de résolution DNS
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("domain name could not be resolved: {0}")]
    ResolutionFailed(String),

    #[error("no IPv{family} address found for {name}")]
    NoAddressForFamily { name: String, family: u8 },
}

/// Interface de résolution, pour pouvoir substituer le résolveur
/// système dans les tests
pub trait Resolver: Send + Sync {
    /// Résout un nom vers ses adresses de la famille demandée (4 ou 6)
    fn resolve(&self, name: &str, family: u8) -> Result<Vec<IpAddr>, DnsError>;
}

/// Résolveur système (getaddrinfo)
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, name: &str, family: u8) -> Result<Vec<IpAddr>, DnsError> {
        let addrs = dns_lookup::lookup_host(name)
            .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?;

        debug!("Resolved {} to {} addresses", name, addrs.len());

        let filtered = filter_family(addrs, family);
        if filtered.is_empty() {
            return Err(DnsError::NoAddressForFamily {
                name: name.to_string(),
                family,
            });
        }
        Ok(filtered)
    }
}

/// Ne garde que les adresses de la famille demandée, en préservant l'ordre
pub fn filter_family(addrs: Vec<IpAddr>, family: u8) -> Vec<IpAddr> {
    addrs
        .into_iter()
        .filter(|a| match a {
            IpAddr::V4(_) => family == 4,
            IpAddr::V6(_) => family == 6,
        })
        .collect()
}
