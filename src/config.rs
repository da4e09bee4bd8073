use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration du service de mesure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Configuration du serveur HTTP
    pub server: ServerConfig,

    /// Configuration de la base de données
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Configuration de l'outil de sonde NTP/NTS
    pub probe: ProbeConfig,

    /// Configuration du client RIPE Atlas
    #[serde(default)]
    pub ripe: RipeConfig,

    /// Configuration du pool de workers
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Configuration de sécurité
    #[serde(default)]
    pub security: SecurityConfig,

    /// Configuration des logs
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Configuration des données de géolocalisation
    #[serde(default)]
    pub geo: GeoConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Adresse d'écoute de l'API HTTP (ex: "0.0.0.0:8000")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Chemin du fichier SQLite
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeConfig {
    /// Chemin du binaire de sonde NTP/NTS
    pub binary_path: String,

    /// Délai maximum par sonde, en secondes
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Pause entre deux sondes successives vers le même serveur, en
    /// millisecondes. Les serveurs NTP publics blacklistent les clients
    /// trop insistants : minimum 1200 ms.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Nombre de mesures historiques utilisées pour le calcul du jitter
    #[serde(default = "default_jitter_measurements")]
    pub jitter_measurements: usize,

    /// Identifiant de draft NTPv5 par défaut (vide = aucun)
    #[serde(default)]
    pub ntpv5_draft: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RipeConfig {
    /// URL de base de l'API RIPE Atlas
    #[serde(default = "default_ripe_api_base")]
    pub api_base: String,

    /// Clé d'API RIPE Atlas (vide = planification refusée)
    #[serde(default)]
    pub api_key: String,

    /// Nombre de sondes demandées par mesure
    #[serde(default = "default_requested_probes")]
    pub requested_probes: u32,

    /// Délai maximum par appel HTTP vers RIPE, en secondes
    #[serde(default = "default_ripe_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkersConfig {
    /// Nombre de threads exécutant les mesures en arrière-plan
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Taille de la file de jobs en attente
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    /// Activer le rate limiting
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,

    /// Nombre maximum de requêtes par seconde par IP cliente
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Niveau de log: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Activer les logs de chaque requête HTTP
    #[serde(default = "default_false")]
    pub log_requests: bool,

    /// Fichier de log (vide = stdout uniquement)
    pub log_file: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct GeoConfig {
    /// Fichier de préfixes anycast IPv4 (un préfixe CIDR par ligne)
    pub anycast_v4_prefixes: Option<String>,

    /// Fichier de préfixes anycast IPv6
    pub anycast_v6_prefixes: Option<String>,

    /// Fichier CSV de métadonnées IP: prefix,country,continent,lat,lon,asn
    pub ip_metadata: Option<String>,
}

// Fonctions par défaut pour serde
fn default_bind_address() -> String { "0.0.0.0:8000".to_string() }
fn default_database_path() -> String { "carillon.db".to_string() }
fn default_probe_timeout() -> u64 { 8 }
fn default_pacing_ms() -> u64 { 1200 }
fn default_jitter_measurements() -> usize { 7 }
fn default_ripe_api_base() -> String { "https://atlas.ripe.net/api/v2".to_string() }
fn default_requested_probes() -> u32 { 3 }
fn default_ripe_timeout() -> u64 { 15 }
fn default_worker_count() -> usize { 4 }
fn default_queue_size() -> usize { 64 }
fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_max_requests_per_second() -> u32 { 5 }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_database_path(),
        }
    }
}

impl Default for RipeConfig {
    fn default() -> Self {
        RipeConfig {
            api_base: default_ripe_api_base(),
            api_key: String::new(),
            requested_probes: default_requested_probes(),
            timeout_secs: default_ripe_timeout(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        WorkersConfig {
            count: default_worker_count(),
            queue_size: default_queue_size(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            enable_rate_limiting: true,
            max_requests_per_second: default_max_requests_per_second(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_requests: false,
            log_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            probe: ProbeConfig {
                binary_path: "tools/ntsprobe".to_string(),
                timeout_secs: default_probe_timeout(),
                pacing_ms: default_pacing_ms(),
                jitter_measurements: default_jitter_measurements(),
                ntpv5_draft: String::new(),
            },
            ripe: RipeConfig::default(),
            workers: WorkersConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
            geo: GeoConfig::default(),
        }
    }
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Valide la configuration
    fn validate(&self) -> Result<()> {
        if self.probe.binary_path.is_empty() {
            anyhow::bail!("Invalid probe.binary_path: must not be empty");
        }

        if self.probe.timeout_secs == 0 {
            anyhow::bail!("Invalid probe.timeout_secs: must be at least 1");
        }

        // En dessous de 1.2 s les serveurs NTP publics blacklistent
        if self.probe.pacing_ms < 1200 {
            anyhow::bail!("Invalid probe.pacing_ms: must be at least 1200");
        }

        if self.workers.count == 0 {
            anyhow::bail!("Invalid workers.count: must be at least 1");
        }

        if self.workers.queue_size == 0 {
            anyhow::bail!("Invalid workers.queue_size: must be at least 1");
        }

        if self.security.max_requests_per_second == 0 {
            anyhow::bail!("Invalid security.max_requests_per_second: must be at least 1");
        }

        if self.ripe.requested_probes == 0 {
            anyhow::bail!("Invalid ripe.requested_probes: must be at least 1");
        }

        Ok(())
    }

    /// Crée un fichier de configuration exemple
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        #[cfg(target_os = "windows")]
        let (default_tool, default_log) = (
            "tools/ntsprobe_windows_amd64.exe".to_string(),
            Some("carillon.log".to_string()),
        );

        #[cfg(not(target_os = "windows"))]
        let (default_tool, default_log) = (
            "tools/ntsprobe_linux_amd64".to_string(),
            Some("/var/log/carillon.log".to_string()),
        );

        let example_config = Config {
            server: ServerConfig {
                bind_address: "0.0.0.0:8000".to_string(),
            },
            database: DatabaseConfig {
                path: "carillon.db".to_string(),
            },
            probe: ProbeConfig {
                binary_path: default_tool,
                timeout_secs: 8,
                pacing_ms: 1200,
                jitter_measurements: 7,
                ntpv5_draft: "draft-ietf-ntp-ntpv5-05".to_string(),
            },
            ripe: RipeConfig {
                api_base: "https://atlas.ripe.net/api/v2".to_string(),
                api_key: "".to_string(),
                requested_probes: 3,
                timeout_secs: 15,
            },
            workers: WorkersConfig {
                count: 4,
                queue_size: 64,
            },
            security: SecurityConfig {
                enable_rate_limiting: true,
                max_requests_per_second: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_requests: true,
                log_file: default_log,
            },
            geo: GeoConfig {
                anycast_v4_prefixes: Some("data/anycast-v4-prefixes.txt".to_string()),
                anycast_v6_prefixes: Some("data/anycast-v6-prefixes.txt".to_string()),
                ip_metadata: Some("data/ip-metadata.csv".to_string()),
            },
        };

        example_config.to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8000");
        assert_eq!(config.probe.pacing_ms, 1200);
        assert_eq!(config.workers.count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Pacing trop court
        config.probe.pacing_ms = 500;
        assert!(config.validate().is_err());
        config.probe.pacing_ms = 1200;
        assert!(config.validate().is_ok());

        // Pool de workers vide
        config.workers.count = 0;
        assert!(config.validate().is_err());
        config.workers.count = 2;
        assert!(config.validate().is_ok());

        // Binaire de sonde manquant
        config.probe.binary_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [server]
            bind_address = "127.0.0.1:9000"

            [probe]
            binary_path = "/usr/local/bin/ntsprobe"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.probe.timeout_secs, 8);
        assert_eq!(config.security.max_requests_per_second, 5);
        assert!(config.validate().is_ok());
    }
}
