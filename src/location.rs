/*!
Métadonnées réseau d'une adresse IP

Lookups purs sur des fichiers de données locaux :
- listes de préfixes anycast (un CIDR par ligne)
- métadonnées IP au format CSV `prefix,country,continent,lat,lon,asn`

Les fichiers sont optionnels ; en leur absence les lookups dégradent vers
None / false / les coordonnées de repli. Les lignes invalides sont
ignorées silencieusement.
*/

use crate::config::GeoConfig;
use ipnetwork::IpNetwork;
use std::fs;
use std::net::{IpAddr, UdpSocket};
use tracing::{debug, warn};

/// Coordonnées renvoyées quand la localisation est inconnue
pub const FALLBACK_COORDINATES: (f64, f64) = (25.0, -71.0);

#[derive(Debug, Clone, Default)]
struct IpMetadata {
    country: Option<String>,
    continent: Option<String>,
    coordinates: Option<(f64, f64)>,
    asn: Option<String>,
}

/// Résolveur de métadonnées IP, chargé une fois au démarrage
pub struct GeoResolver {
    anycast_v4: Vec<IpNetwork>,
    anycast_v6: Vec<IpNetwork>,
    metadata: Vec<(IpNetwork, IpMetadata)>,
}

impl GeoResolver {
    /// Charge les fichiers configurés. Un fichier absent ou illisible
    /// donne un résolveur qui répond "inconnu".
    pub fn load(config: &GeoConfig) -> Self {
        let anycast_v4 = config
            .anycast_v4_prefixes
            .as_deref()
            .map(load_prefix_list)
            .unwrap_or_default();
        let anycast_v6 = config
            .anycast_v6_prefixes
            .as_deref()
            .map(load_prefix_list)
            .unwrap_or_default();
        let metadata = config
            .ip_metadata
            .as_deref()
            .map(load_metadata_csv)
            .unwrap_or_default();

        debug!(
            "Geo data loaded: {} anycast v4 prefixes, {} anycast v6 prefixes, {} metadata rows",
            anycast_v4.len(),
            anycast_v6.len(),
            metadata.len()
        );

        GeoResolver {
            anycast_v4,
            anycast_v6,
            metadata,
        }
    }

    /// Résolveur vide (tout est inconnu)
    pub fn empty() -> Self {
        GeoResolver {
            anycast_v4: Vec::new(),
            anycast_v6: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// true si l'IP appartient à un préfixe anycast connu.
    /// Une chaîne qui n'est pas une IP retourne false.
    pub fn is_anycast(&self, ip: &str) -> bool {
        let addr: IpAddr = match ip.parse() {
            Ok(a) => a,
            Err(_) => return false,
        };
        let list = match addr {
            IpAddr::V4(_) => &self.anycast_v4,
            IpAddr::V6(_) => &self.anycast_v6,
        };
        list.iter().any(|net| net.contains(addr))
    }

    fn lookup(&self, ip: &str) -> Option<&IpMetadata> {
        let addr: IpAddr = ip.parse().ok()?;
        self.metadata
            .iter()
            .find(|(net, _)| net.contains(addr))
            .map(|(_, meta)| meta)
    }

    /// Code pays ISO de l'IP, ou None
    pub fn country_for_ip(&self, ip: &str) -> Option<String> {
        self.lookup(ip).and_then(|m| m.country.clone())
    }

    /// Code continent de l'IP, ou None
    pub fn continent_for_ip(&self, ip: &str) -> Option<String> {
        self.lookup(ip).and_then(|m| m.continent.clone())
    }

    /// ASN de l'IP, ou None
    pub fn asn_for_ip(&self, ip: &str) -> Option<String> {
        self.lookup(ip).and_then(|m| m.asn.clone())
    }

    /// Coordonnées (lat, lon) de l'IP, avec repli si inconnues
    pub fn coordinates_for_ip(&self, ip: &str) -> (f64, f64) {
        self.lookup(ip)
            .and_then(|m| m.coordinates)
            .unwrap_or(FALLBACK_COORDINATES)
    }
}

fn load_prefix_list(path: &str) -> Vec<IpNetwork> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Could not read prefix list {}: {}", path, e);
            return Vec::new();
        }
    };
    content
        .lines()
        .filter_map(|line| line.trim().parse::<IpNetwork>().ok())
        .collect()
}

fn load_metadata_csv(path: &str) -> Vec<(IpNetwork, IpMetadata)> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Could not read ip metadata file {}: {}", path, e);
            return Vec::new();
        }
    };
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().split(',').collect();
            if fields.len() < 6 {
                return None;
            }
            let net = fields[0].parse::<IpNetwork>().ok()?;
            let lat = fields[3].parse::<f64>().ok();
            let lon = fields[4].parse::<f64>().ok();
            let meta = IpMetadata {
                country: non_empty(fields[1]),
                continent: non_empty(fields[2]),
                coordinates: match (lat, lon) {
                    (Some(a), Some(b)) => Some((a, b)),
                    _ => None,
                },
                asn: non_empty(fields[5]),
            };
            Some((net, meta))
        })
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Zone RIPE Atlas à utiliser pour choisir des sondes proches d'un pays.
/// "WW" (monde entier) quand la localisation est inconnue.
pub fn area_of_ip(country: Option<&str>, continent: Option<&str>) -> &'static str {
    let continent = match continent {
        Some(c) => c,
        None => return "WW",
    };
    match continent {
        "EU" => "North-Central",
        "NA" => "West",
        "SA" => "West",
        "AF" => "South-Central",
        "AS" => {
            // L'Asie est coupée en deux zones RIPE
            match country {
                Some("RU") | Some("KZ") | Some("MN") | Some("UZ") | Some("KG") | Some("TJ")
                | Some("TM") => "North-East",
                _ => "South-East",
            }
        }
        "OC" => "South-East",
        _ => "WW",
    }
}

/// IP sortante de cette machine pour la famille demandée, déterminée en
/// connectant (sans trafic) un socket UDP vers une adresse publique
pub fn vantage_point_ip(family: u8) -> Option<IpAddr> {
    let (bind, target) = if family == 6 {
        ("[::]:0", "[2001:4860:4860::8888]:53")
    } else {
        ("0.0.0.0:0", "8.8.8.8:53")
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// IP sortante dans la famille demandée si possible, sinon l'autre famille
pub fn vantage_point_ip_if_possible(family: u8) -> Option<IpAddr> {
    vantage_point_ip(family).or_else(|| vantage_point_ip(if family == 4 { 6 } else { 4 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn resolver_with_files(
        v4: Option<&str>,
        v6: Option<&str>,
        metadata: Option<&str>,
    ) -> (GeoResolver, Vec<tempfile::NamedTempFile>) {
        let mut keep = Vec::new();
        let mut write = |content: Option<&str>| -> Option<String> {
            content.map(|c| {
                let mut f = tempfile::NamedTempFile::new().unwrap();
                f.write_all(c.as_bytes()).unwrap();
                let path = f.path().to_string_lossy().to_string();
                keep.push(f);
                path
            })
        };
        let config = GeoConfig {
            anycast_v4_prefixes: write(v4),
            anycast_v6_prefixes: write(v6),
            ip_metadata: write(metadata),
        };
        (GeoResolver::load(&config), keep)
    }

    #[test]
    fn test_anycast_v4() {
        let (geo, _files) =
            resolver_with_files(Some("1.0.0.0/24\ninvalid\n1.3.1.0/16\n"), None, None);
        assert!(geo.is_anycast("1.3.0.0"));
        assert!(geo.is_anycast("1.0.0.7"));
        assert!(!geo.is_anycast("1.7.0.0"));
    }

    #[test]
    fn test_anycast_v6() {
        let (geo, _files) = resolver_with_files(
            None,
            Some("2001:4998:170::/48\ninvalid\n2400:44a0:1::/48\n"),
            None,
        );
        assert!(geo.is_anycast("2400:44a0:1::"));
        assert!(!geo.is_anycast("3001:4998::"));
    }

    #[test]
    fn test_anycast_input_errors() {
        let geo = GeoResolver::empty();
        assert!(!geo.is_anycast("blabla"));
        assert!(!geo.is_anycast(""));
    }

    #[test]
    fn test_metadata_lookup() {
        let (geo, _files) = resolver_with_files(
            None,
            None,
            Some("94.198.0.0/16,NL,EU,52.37,4.89,1140\nbad line\n8.8.8.0/24,US,NA,37.4,-122.0,15169\n"),
        );
        assert_eq!(geo.country_for_ip("94.198.159.14").as_deref(), Some("NL"));
        assert_eq!(geo.continent_for_ip("94.198.159.14").as_deref(), Some("EU"));
        assert_eq!(geo.asn_for_ip("8.8.8.8").as_deref(), Some("15169"));
        assert_eq!(geo.coordinates_for_ip("8.8.8.8"), (37.4, -122.0));
        // Inconnu: repli
        assert_eq!(geo.country_for_ip("203.0.113.9"), None);
        assert_eq!(geo.coordinates_for_ip("203.0.113.9"), FALLBACK_COORDINATES);
    }

    #[test]
    fn test_area_of_ip() {
        assert_eq!(area_of_ip(Some("NL"), None), "WW");
        assert_eq!(area_of_ip(Some("NL"), Some("EU")), "North-Central");
        assert_eq!(area_of_ip(Some("US"), Some("NA")), "West");
        assert_eq!(area_of_ip(Some("BR"), Some("SA")), "West");
        assert_eq!(area_of_ip(Some("ZA"), Some("AF")), "South-Central");
        assert_eq!(area_of_ip(Some("RU"), Some("AS")), "North-East");
        assert_eq!(area_of_ip(Some("KZ"), Some("AS")), "North-East");
        assert_eq!(area_of_ip(Some("MN"), Some("AS")), "North-East");
        assert_eq!(area_of_ip(Some("CN"), Some("AS")), "South-East");
    }

    #[test]
    fn test_vantage_point_family() {
        // Selon la machine, la famille peut ne pas être disponible:
        // on vérifie seulement la cohérence de la famille retournée
        if let Some(ip) = vantage_point_ip(4) {
            assert!(ip.is_ipv4());
        }
        if let Some(ip) = vantage_point_ip(6) {
            assert!(ip.is_ipv6());
        }
    }
}
