mod analyzer;
mod calc;
mod config;
mod dns;
mod location;
mod orchestrator;
mod probe;
mod ripe;
mod security;
mod settings;
mod store;
mod timestamp;
mod web_server;
mod worker;

use anyhow::{Context, Result};
use config::Config;
use dns::SystemResolver;
use location::GeoResolver;
use orchestrator::Orchestrator;
use probe::ToolProber;
use ripe::RipeClient;
use security::RateLimiter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use web_server::{AppState, WebServer};

fn main() -> Result<()> {
    // Charger la configuration
    let config_path = get_config_path();
    let config = load_or_create_config(&config_path)?;

    // Initialiser les logs (niveau depuis la config, surchargé par l'env)
    init_logging(&config.logging.level)?;

    info!("Carillon measurement service v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  HTTP bind address: {}", config.server.bind_address);
    info!("  Database: {}", config.database.path);
    info!("  Probe tool: {}", config.probe.binary_path);
    info!("  Workers: {}", config.workers.count);
    info!("  Rate limiting: {}", config.security.enable_rate_limiting);

    // Ouvrir le stockage
    let store = Store::open(&config.database.path)
        .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;

    // Données de géolocalisation (fichiers optionnels)
    let geo = Arc::new(GeoResolver::load(&config.geo));

    // Les collaborateurs externes du pipeline
    let prober = Arc::new(ToolProber::new(
        config.probe.binary_path.clone(),
        Duration::from_secs(config.probe.timeout_secs),
    ));
    let ripe = Arc::new(RipeClient::new(
        config.ripe.api_base.clone(),
        config.ripe.api_key.clone(),
        config.ripe.requested_probes,
        Duration::from_secs(config.ripe.timeout_secs),
        Arc::clone(&geo),
    ));
    if config.ripe.api_key.is_empty() {
        warn!("No RIPE Atlas API key configured, RIPE scheduling will be skipped");
    }
    let resolver = Arc::new(SystemResolver);

    // L'orchestrateur et son pool de workers
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        prober.clone(),
        ripe.clone(),
        resolver.clone(),
        Arc::clone(&geo),
        Duration::from_millis(config.probe.pacing_ms),
    ));
    let (jobs, job_receiver) = worker::job_queue(config.workers.queue_size);
    let _workers = worker::spawn_workers(config.workers.count, job_receiver, orchestrator);

    // Le rate limiter de la passerelle
    let limiter = if config.security.enable_rate_limiting {
        Some(Arc::new(RateLimiter::new(
            config.security.max_requests_per_second,
        )))
    } else {
        None
    };

    // Démarrer le serveur web
    let state = AppState {
        store,
        jobs,
        prober,
        ripe,
        resolver,
        geo,
        limiter,
        config: Arc::new(config.clone()),
    };
    let web_server = WebServer::new(config.server.bind_address.clone(), state);
    let _web_thread = web_server.start();

    // Gérer Ctrl+C avec confirmation à double pression
    let shutdown_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ctrl_c_count = Arc::new(std::sync::atomic::AtomicU8::new(0));

    let shutdown_clone = Arc::clone(&shutdown_requested);
    let count_clone = Arc::clone(&ctrl_c_count);

    ctrlc::set_handler(move || {
        let count = count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if count == 0 {
            // Première pression
            warn!("Ctrl+C détecté. Appuyez à nouveau dans les 5 secondes pour arrêter le service.");

            // Thread qui désamorce après 5 secondes
            let count_disarm = Arc::clone(&count_clone);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_secs(5));
                let current = count_disarm.load(std::sync::atomic::Ordering::SeqCst);
                if current == 1 {
                    // Pas de deuxième pression, désamorcer
                    count_disarm.store(0, std::sync::atomic::Ordering::SeqCst);
                    info!("Arrêt annulé. Le service continue.");
                }
            });
        } else {
            // Deuxième pression (ou plus)
            warn!("Arrêt confirmé. Fermeture du service...");
            shutdown_clone.store(true, std::sync::atomic::Ordering::SeqCst);
            // Forcer la sortie si le service ne répond pas après 2 secondes
            std::thread::spawn(|| {
                std::thread::sleep(Duration::from_secs(2));
                error!("Arrêt forcé (timeout)");
                std::process::exit(0);
            });
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("Service started. Press Ctrl+C twice (within 5 seconds) to stop");

    // Les mesures en cours tournent dans les workers ; la boucle
    // principale ne fait qu'attendre la demande d'arrêt
    loop {
        if shutdown_requested.load(std::sync::atomic::Ordering::Relaxed) {
            info!("Shutdown signal received, stopping service...");
            break;
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    info!("Service stopped");
    Ok(())
}

/// Initialise le système de logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Obtient le chemin du fichier de configuration
fn get_config_path() -> PathBuf {
    // Vérifier les arguments de ligne de commande
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        return PathBuf::from(&args[1]);
    }

    // Sinon, utiliser le chemin par défaut
    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/carillon/config.toml");

    #[cfg(not(target_os = "linux"))]
    return PathBuf::from("config.toml");
}

/// Charge la configuration ou crée un fichier exemple
fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::from_file(path)
    } else {
        // Créer le répertoire parent si nécessaire
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        // Créer une config exemple
        Config::create_example_config(path).context("Failed to create example config")?;

        eprintln!("Example configuration created at {}", path.display());
        eprintln!("Please edit the configuration file and restart the service.");

        // Charger la config créée
        Config::from_file(path)
    }
}
