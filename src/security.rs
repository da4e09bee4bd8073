use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Gestionnaire de rate limiting par IP cliente
pub struct RateLimiter {
    /// Map: IP -> état du rate limiting
    limits: Arc<RwLock<HashMap<IpAddr, RateLimitState>>>,

    /// Nombre maximum de requêtes par seconde
    max_requests_per_second: u32,

    /// Fenêtre de temps pour le nettoyage des anciennes entrées
    cleanup_interval: Duration,

    /// Dernier nettoyage
    last_cleanup: Arc<RwLock<Instant>>,
}

#[derive(Debug, Clone)]
struct RateLimitState {
    /// Nombre de requêtes dans la fenêtre actuelle
    request_count: u32,

    /// Début de la fenêtre actuelle
    window_start: Instant,

    /// Dernière requête vue
    last_request: Instant,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: u32) -> Self {
        RateLimiter {
            limits: Arc::new(RwLock::new(HashMap::new())),
            max_requests_per_second,
            cleanup_interval: Duration::from_secs(60),
            last_cleanup: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Vérifie si une requête depuis cette IP est autorisée
    /// Retourne true si autorisé, false si rate limited
    pub fn check_rate_limit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();

        // Nettoyage périodique des anciennes entrées
        self.cleanup_old_entries(now);

        let mut limits = match self.limits.write() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Failed to acquire rate limiter write lock");
                return true; // Fail open en cas d'erreur de lock
            }
        };

        let state = limits.entry(ip).or_insert_with(|| RateLimitState {
            request_count: 0,
            window_start: now,
            last_request: now,
        });

        // Si plus d'une seconde s'est écoulée, réinitialiser la fenêtre
        if now.duration_since(state.window_start) >= Duration::from_secs(1) {
            state.request_count = 1;
            state.window_start = now;
            state.last_request = now;
            return true;
        }

        // Incrémenter le compteur
        state.request_count += 1;
        state.last_request = now;

        if state.request_count > self.max_requests_per_second {
            debug!(
                "Rate limit exceeded for IP {}: {} requests/sec",
                ip, state.request_count
            );
            return false;
        }

        true
    }

    /// Nettoie les entrées inactives depuis plus de 60 secondes
    fn cleanup_old_entries(&self, now: Instant) {
        let mut last_cleanup = match self.last_cleanup.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        // Nettoyer seulement toutes les 60 secondes
        if now.duration_since(*last_cleanup) < self.cleanup_interval {
            return;
        }

        if let Ok(mut limits) = self.limits.write() {
            let inactive_threshold = Duration::from_secs(60);
            limits.retain(|_, state| {
                now.duration_since(state.last_request) < inactive_threshold
            });

            debug!("Cleaned up rate limiter, {} IPs tracked", limits.len());
        }

        *last_cleanup = now;
    }
}

/// Nettoie une chaîne fournie par un client ou par la sortie d'un outil
/// externe : suppression des caractères de contrôle, trim des extrémités
pub fn sanitize_string(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Vérifie si une IP (texte) est privée, link-local ou loopback.
/// Une chaîne qui n'est pas une IP retourne false.
pub fn is_private_ip(input: &str) -> bool {
    match input.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                // 192.0.0.0/24 (assignations protocolaires IETF)
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
                // 100.64.0.0/10 (CGNAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 0x40)
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 (unique local) et fe80::/10 (link-local)
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Détermine l'IP cliente à utiliser comme indice de localité pour les
/// sondes RIPE. Ordre de préférence :
/// 1. l'en-tête x-forwarded-for (premier saut, IP publique valide)
/// 2. l'adresse du pair de la connexion (si publique)
/// 3. l'IP de repli fournie (l'adresse sortante de ce serveur)
pub fn derive_client_ip(
    forwarded_for: Option<&str>,
    peer: Option<IpAddr>,
    fallback: Option<IpAddr>,
) -> Option<IpAddr> {
    if let Some(header) = forwarded_for {
        let first_hop = header.split(',').next().unwrap_or("").trim();
        if let Ok(ip) = first_hop.parse::<IpAddr>() {
            if !is_private_ip(first_hop) {
                return Some(ip);
            }
            debug!("Forwarded-for IP {} is private, ignoring", ip);
        }
    }

    if let Some(ip) = peer {
        if !is_private_ip(&ip.to_string()) {
            return Some(ip);
        }
        debug!("Peer IP {} is private, ignoring", ip);
    }

    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_rate_limiter() {
        let limiter = RateLimiter::new(10);
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

        // Devrait autoriser les 10 premières requêtes
        for _ in 0..10 {
            assert!(limiter.check_rate_limit(ip));
        }

        // La 11ème doit être bloquée
        assert!(!limiter.check_rate_limit(ip));
    }

    #[test]
    fn test_rate_limiter_separate_ips() {
        let limiter = RateLimiter::new(1);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check_rate_limit(a));
        assert!(!limiter.check_rate_limit(a));
        // Une autre IP a sa propre fenêtre
        assert!(limiter.check_rate_limit(b));
    }

    #[test]
    fn test_sanitize_string() {
        assert_eq!(sanitize_string("  KE failed  "), "KE failed");
        assert_eq!(sanitize_string("abc\0def\r\n"), "abcdef");
        assert_eq!(sanitize_string("ok"), "ok");
    }

    #[test]
    fn test_is_private_ip() {
        assert!(!is_private_ip("blabla"));
        assert!(!is_private_ip("84.96.120.251"));
        assert!(is_private_ip("192.0.0.1"));
        assert!(is_private_ip("192.168.1.10"));
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("100.64.0.1"));
        assert!(is_private_ip("fe80::1"));
        assert!(is_private_ip("fc00::1"));
        assert!(!is_private_ip("2606:4700:f1::1"));
    }

    #[test]
    fn test_derive_client_ip_prefers_forwarded() {
        let peer: IpAddr = "84.96.120.251".parse().unwrap();
        let got = derive_client_ip(Some("9.9.9.9, 10.0.0.1"), Some(peer), None);
        assert_eq!(got, Some("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_derive_client_ip_falls_back() {
        let fallback: IpAddr = "3.4.5.6".parse().unwrap();
        // En-tête invalide et pair privé: repli sur l'IP du serveur
        let got = derive_client_ip(
            Some("something"),
            Some("192.168.0.1".parse().unwrap()),
            Some(fallback),
        );
        assert_eq!(got, Some(fallback));

        // Pair public accepté
        let got = derive_client_ip(None, Some("84.96.120.251".parse().unwrap()), Some(fallback));
        assert_eq!(got, Some("84.96.120.251".parse().unwrap()));

        // Rien d'utilisable
        assert_eq!(derive_client_ip(None, None, None), None);
    }
}
