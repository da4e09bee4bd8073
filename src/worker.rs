/*!
File de jobs et pool de workers

La passerelle HTTP pousse un job par mesure déclenchée sur un canal
borné ; un pool de threads le draine et exécute les orchestrations.
Un canal plein signifie que le service est saturé : la passerelle
répond alors 503 plutôt que d'accumuler sans limite.
*/

use crate::orchestrator::Orchestrator;
use crate::settings::AdvancedSettings;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// La cible d'un job : une mesure racine déjà créée à l'état pending
#[derive(Debug, Clone)]
pub enum JobTarget {
    Dn { id: i64, server: String },
    Ip { id: i64, server_ip: String },
}

/// Un job d'orchestration complet
#[derive(Debug, Clone)]
pub struct Job {
    pub target: JobTarget,
    pub settings: AdvancedSettings,
}

/// Crée la file bornée reliant la passerelle au pool
pub fn job_queue(capacity: usize) -> (Sender<Job>, Receiver<Job>) {
    bounded(capacity)
}

/// Démarre `count` workers. Chaque worker boucle sur la file jusqu'à la
/// fermeture du canal (tous les émetteurs abandonnés).
pub fn spawn_workers(
    count: usize,
    receiver: Receiver<Job>,
    orchestrator: Arc<Orchestrator>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let receiver = receiver.clone();
            let orchestrator = Arc::clone(&orchestrator);
            std::thread::spawn(move || {
                info!("Measurement worker {} started", i);
                while let Ok(job) = receiver.recv() {
                    orchestrator.run(job);
                }
                info!("Measurement worker {} stopped", i);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsError, Resolver};
    use crate::location::GeoResolver;
    use crate::probe::{AllVersionsProbe, NtpProbeOutput, NtsProbeResult, ProbeError, Prober};
    use crate::ripe::{RipeError, RipeSchedule};
    use crate::store::{MeasurementKind, MeasurementStatus, Store};
    use std::net::IpAddr;
    use std::time::Duration;

    struct DeadProber;

    impl Prober for DeadProber {
        fn probe_ntp(&self, _: &str, _: &str, _: &str) -> Result<NtpProbeOutput, ProbeError> {
            Err(ProbeError::Unavailable("none".to_string()))
        }
        fn probe_all_ntp_versions(&self, _: &str, _: &str) -> Result<AllVersionsProbe, ProbeError> {
            Err(ProbeError::Unavailable("none".to_string()))
        }
        fn probe_nts(&self, _: &str, _: Option<u8>) -> Result<NtsProbeResult, ProbeError> {
            Err(ProbeError::Unavailable("none".to_string()))
        }
        fn probe_nts_on_ip(&self, _: &str) -> Result<NtsProbeResult, ProbeError> {
            Err(ProbeError::Unavailable("none".to_string()))
        }
    }

    struct DeadRipe;

    impl RipeSchedule for DeadRipe {
        fn schedule(
            &self,
            _: &str,
            _: Option<&str>,
            _: &crate::settings::AdvancedSettings,
        ) -> Result<i64, RipeError> {
            Err(RipeError::MissingApiKey)
        }
    }

    struct DeadResolver;

    impl Resolver for DeadResolver {
        fn resolve(&self, name: &str, _: u8) -> Result<Vec<IpAddr>, DnsError> {
            Err(DnsError::ResolutionFailed(name.to_string()))
        }
    }

    #[test]
    fn test_workers_drain_queue_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(DeadProber),
            Arc::new(DeadRipe),
            Arc::new(DeadResolver),
            Arc::new(GeoResolver::empty()),
            Duration::ZERO,
        ));

        let (sender, receiver) = job_queue(8);
        let handles = spawn_workers(2, receiver, orchestrator);

        let a = store.create_ip("1.1.1.1").unwrap();
        let b = store.create_ip("2.2.2.2").unwrap();
        sender
            .send(Job {
                target: JobTarget::Ip {
                    id: a,
                    server_ip: "1.1.1.1".to_string(),
                },
                settings: AdvancedSettings::default(),
            })
            .unwrap();
        sender
            .send(Job {
                target: JobTarget::Ip {
                    id: b,
                    server_ip: "2.2.2.2".to_string(),
                },
                settings: AdvancedSettings::default(),
            })
            .unwrap();

        // La fermeture du canal arrête les workers une fois la file vidée
        drop(sender);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            store.status_of(MeasurementKind::Ip, a).unwrap(),
            Some(MeasurementStatus::Finished)
        );
        assert_eq!(
            store.status_of(MeasurementKind::Ip, b).unwrap(),
            Some(MeasurementStatus::Finished)
        );
    }

    #[test]
    fn test_queue_is_bounded() {
        let (sender, _receiver) = job_queue(1);
        let job = Job {
            target: JobTarget::Ip {
                id: 1,
                server_ip: "1.1.1.1".to_string(),
            },
            settings: AdvancedSettings::default(),
        };
        assert!(sender.try_send(job.clone()).is_ok());
        // File pleine, personne ne consomme
        assert!(sender.try_send(job).is_err());
    }
}
