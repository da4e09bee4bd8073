/*!
Orchestrateur de mesures composites

La machine à états du service : une mesure racine (nom de domaine ou IP)
est décomposée en sous-mesures version/protocole, chaque étape est
persistée au fur et à mesure pour que le polling observe une progression
monotone le long du treillis de statuts.

Pipeline nom de domaine :
résolution → RIPE → une mesure IP fille par adresse (avec pacing) →
NTS → balayage de versions → finished

Pipeline IP (racine ou fille) :
RIPE (racine seulement) → NTP principale → NTS (selon réglages) →
balayage de versions (selon réglages) → finished

Les échecs de sonde sont absorbés dans l'enregistrement ; seules les
erreurs de stockage (ou un défaut de programmation) font basculer la
mesure en `failed`.
*/

use crate::analyzer::{analyze_version, ProbeOutcome, VersionVerdict};
use crate::dns::Resolver;
use crate::location::{vantage_point_ip, GeoResolver};
use crate::probe::{NtpProbeOutput, NtsProbeResult, ProbeError, Prober};
use crate::ripe::{RipeError, RipeSchedule};
use crate::settings::{wants_version_analysis, AdvancedSettings};
use crate::store::{
    ClassifiedRecord, MeasurementKind, MeasurementStatus, NtpRecordData, NtpV5Extras,
    NtsRecordData, ServerInfoData, Store, StoreError, VersionSlotInsert,
};
use crate::timestamp::NtpTimestamp;
use crate::worker::{Job, JobTarget};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Message enregistré quand le binaire de sonde est introuvable
pub const TOOL_UNAVAILABLE_ERROR: &str =
    "Measurement could not be performed (binary tool not available).";

/// Message enregistré quand un nom de domaine ne se résout pas
pub const DNS_FAILED_ERROR: &str = "Domain name is invalid or cannot be resolved";

pub struct Orchestrator {
    store: Store,
    prober: Arc<dyn Prober>,
    ripe: Arc<dyn RipeSchedule>,
    resolver: Arc<dyn Resolver>,
    geo: Arc<GeoResolver>,
    pacing: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        prober: Arc<dyn Prober>,
        ripe: Arc<dyn RipeSchedule>,
        resolver: Arc<dyn Resolver>,
        geo: Arc<GeoResolver>,
        pacing: Duration,
    ) -> Self {
        Orchestrator {
            store,
            prober,
            ripe,
            resolver,
            geo,
            pacing,
        }
    }

    /// Exécute un job jusqu'au bout. Toute erreur inattendue bascule la
    /// mesure en `failed` avec la cause ; le job ne remonte jamais d'erreur.
    pub fn run(&self, job: Job) {
        let (kind, id) = match &job.target {
            JobTarget::Dn { id, .. } => (MeasurementKind::Dn, *id),
            JobTarget::Ip { id, .. } => (MeasurementKind::Ip, *id),
        };

        let result = match job.target {
            JobTarget::Dn { id, server } => self.run_dn(id, &server, job.settings),
            JobTarget::Ip { id, server_ip } => {
                self.run_ip(id, &server_ip, job.settings, false, None)
            }
        };

        if let Err(e) = result {
            warn!("Measurement {}{} failed: {}", kind.prefix(), id, e);
            let message = format!(
                "(surprising) error when completing the measurement: {}",
                error_kind(&e)
            );
            if let Err(inner) = self.store.mark_failed(kind, id, &message) {
                warn!("Error while marking {}{} failed: {}", kind.prefix(), id, inner);
            }
        }
    }

    /// Pipeline complet d'une mesure sur nom de domaine
    fn run_dn(&self, dn_id: i64, server: &str, mut settings: AdvancedSettings)
        -> Result<(), StoreError>
    {
        info!("Starting dn{} for {}", dn_id, server);

        // Résolution en arrière-plan : un nom invalide termine la mesure
        let addresses = match self.resolver.resolve(server, settings.wanted_ip_type) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("DNS resolution failed for {}: {}", server, e);
                return self.store.mark_failed(MeasurementKind::Dn, dn_id, DNS_FAILED_ERROR);
            }
        };

        // RIPE : une seule planification par racine
        self.store
            .set_status(MeasurementKind::Dn, dn_id, MeasurementStatus::RunningRipe)?;
        self.schedule_ripe(MeasurementKind::Dn, dn_id, server, &settings)?;
        settings.custom_client_ip.clear();

        // Une mesure fille par adresse résolue, avec pacing entre deux
        self.store
            .set_status(MeasurementKind::Dn, dn_id, MeasurementStatus::RunningNtpPerIp)?;
        for (i, address) in addresses.iter().enumerate() {
            info!("dn{}: child measurement {}/{}", dn_id, i + 1, addresses.len());
            let child_ip = address.to_string();
            let child_id = self.store.create_ip(&child_ip)?;
            self.store.link_dn_ip(dn_id, child_id)?;

            std::thread::sleep(self.pacing);
            if let Err(e) =
                self.run_ip(child_id, &child_ip, settings.clone(), true, Some(server))
            {
                warn!("Child ip{} of dn{} failed: {}", child_id, dn_id, e);
                let message = format!(
                    "(surprising) error when completing the measurement: {}",
                    error_kind(&e)
                );
                self.store.mark_failed(MeasurementKind::Ip, child_id, &message)?;
            }
        }

        // NTS au niveau du nom, toujours
        self.store
            .set_status(MeasurementKind::Dn, dn_id, MeasurementStatus::RunningNts)?;
        std::thread::sleep(self.pacing);
        self.run_nts_stage(MeasurementKind::Dn, dn_id, server, Some(settings.wanted_ip_type), false)?;

        // Balayage de versions au niveau du nom, selon réglages
        if wants_version_analysis(&settings) {
            self.store
                .set_status(MeasurementKind::Dn, dn_id, MeasurementStatus::RunningVersions)?;
            std::thread::sleep(self.pacing);
            self.run_versions_stage(MeasurementKind::Dn, dn_id, server, server, None, &settings)?;
        }

        self.store.finish(MeasurementKind::Dn, dn_id, &settings)?;
        info!("dn{} finished", dn_id);
        Ok(())
    }

    /// Pipeline d'une mesure IP, racine ou fille d'un nom de domaine
    fn run_ip(
        &self,
        ip_id: i64,
        server_ip: &str,
        mut settings: AdvancedSettings,
        part_of_dn: bool,
        from_dn: Option<&str>,
    ) -> Result<(), StoreError> {
        info!("Starting ip{} for {}", ip_id, server_ip);

        // RIPE seulement pour une racine : la fille est couverte par le parent
        if !part_of_dn {
            self.store
                .set_status(MeasurementKind::Ip, ip_id, MeasurementStatus::RunningRipe)?;
            self.schedule_ripe(MeasurementKind::Ip, ip_id, server_ip, &settings)?;
            settings.custom_client_ip.clear();
        }

        // Mesure NTP principale
        self.store
            .set_status(MeasurementKind::Ip, ip_id, MeasurementStatus::RunningNtpPerIp)?;
        self.run_primary_ntp(ip_id, server_ip, from_dn, &settings)?;

        // NTS par IP : toujours pour une racine, sur demande pour une fille
        if !part_of_dn || settings.nts_analysis_on_each_ip {
            self.store
                .set_status(MeasurementKind::Ip, ip_id, MeasurementStatus::RunningNts)?;
            std::thread::sleep(self.pacing);
            self.run_nts_stage(MeasurementKind::Ip, ip_id, server_ip, None, true)?;
        }

        // Balayage de versions par IP, même règle
        if (!part_of_dn || settings.ntp_versions_analysis_on_each_ip)
            && wants_version_analysis(&settings)
        {
            self.store
                .set_status(MeasurementKind::Ip, ip_id, MeasurementStatus::RunningVersions)?;
            std::thread::sleep(self.pacing);
            let host = from_dn.unwrap_or(server_ip);
            self.run_versions_stage(
                MeasurementKind::Ip,
                ip_id,
                server_ip,
                host,
                Some(server_ip),
                &settings,
            )?;
        }

        self.store.finish(MeasurementKind::Ip, ip_id, &settings)?;
        info!("ip{} finished", ip_id);
        Ok(())
    }

    /// Planifie la mesure RIPE ; un échec alimente `ripe_error` et le
    /// pipeline continue
    fn schedule_ripe(
        &self,
        kind: MeasurementKind,
        id: i64,
        target: &str,
        settings: &AdvancedSettings,
    ) -> Result<(), StoreError> {
        let client_ip = if settings.custom_client_ip.is_empty() {
            None
        } else {
            Some(settings.custom_client_ip.as_str())
        };

        match self.ripe.schedule(target, client_ip, settings) {
            Ok(ripe_id) => self.store.set_ripe_id(kind, id, ripe_id),
            Err(RipeError::Schedule(msg)) => {
                warn!("RIPE measurement initiated, but it failed: {}", msg);
                self.store.set_ripe_error(
                    kind,
                    id,
                    &format!("RIPE measurement initiated, but it failed: {}", msg),
                )
            }
            Err(e) => {
                warn!("Failed to initiate RIPE measurement: {}", e);
                self.store
                    .set_ripe_error(kind, id, "Failed to initiate RIPE measurement")
            }
        }
    }

    /// La mesure NTP principale d'une mesure IP. La réponse est persistée
    /// dans la table correspondant à la version *annoncée*, pas à la
    /// version demandée.
    fn run_primary_ntp(
        &self,
        ip_id: i64,
        server_ip: &str,
        from_dn: Option<&str>,
        settings: &AdvancedSettings,
    ) -> Result<(), StoreError> {
        let output = match self.prober.probe_ntp(
            server_ip,
            &settings.measurement_type,
            &settings.ntpv5_draft,
        ) {
            Ok(output) => output,
            Err(ProbeError::Unavailable(e)) => {
                warn!("Probe tool unavailable: {}", e);
                return self
                    .store
                    .set_response_error(MeasurementKind::Ip, ip_id, TOOL_UNAVAILABLE_ERROR);
            }
            Err(ProbeError::MeasurementFailed(msg)) => {
                return self.store.set_response_error(MeasurementKind::Ip, ip_id, &msg);
            }
            Err(ProbeError::OutputInvalid(e)) => {
                warn!("Probe output invalid for {}: {}", server_ip, e);
                return self.store.set_response_error(
                    MeasurementKind::Ip,
                    ip_id,
                    "Received something, but could not parse the response.",
                );
            }
        };

        // Une réponse sans champ version n'est classable que pour NTPv1,
        // qui n'en a jamais eu
        let response_version = match output.version_str() {
            Some(v) => normalize_response_version(&v),
            None if settings.measurement_type == "ntpv1" => "ntpv1".to_string(),
            None => {
                return self.store.set_response_error(
                    MeasurementKind::Ip,
                    ip_id,
                    "Received an NTP response without a version field.",
                );
            }
        };

        let family = ip_family(server_ip);
        let requested_version = version_number(&settings.measurement_type);
        let verdict = analyze_version(requested_version, &ProbeOutcome::Parsed(&output), family);

        let host = from_dn.unwrap_or(server_ip);
        let record = classify_record(host, Some(server_ip), &output, &verdict, settings);
        let info = self.build_server_info(Some(server_ip));

        self.store
            .record_primary_ntp(ip_id, &record, &info, &response_version)?;
        Ok(())
    }

    /// L'étape NTS : une mesure sur le nom (certificat vérifié) ou sur
    /// l'IP (sans validation du nom). L'absence de l'outil laisse
    /// l'identifiant NTS à null.
    fn run_nts_stage(
        &self,
        kind: MeasurementKind,
        id: i64,
        target: &str,
        family_preference: Option<u8>,
        on_ip: bool,
    ) -> Result<(), StoreError> {
        let outcome = if on_ip {
            self.prober.probe_nts_on_ip(target)
        } else {
            self.prober.probe_nts(target, family_preference)
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!("NTS stage skipped for {}: {}", target, e);
                return Ok(());
            }
        };

        let nts = build_nts_record(target, &result, on_ip);
        self.store.record_nts(kind, id, &nts)?;
        Ok(())
    }

    /// Le balayage de versions : un appel de sonde, cinq analyses, un
    /// résumé persisté. Un échec de l'outil laisse le résumé à null.
    fn run_versions_stage(
        &self,
        kind: MeasurementKind,
        id: i64,
        target: &str,
        host: &str,
        server_ip: Option<&str>,
        settings: &AdvancedSettings,
    ) -> Result<(), StoreError> {
        let all = match self
            .prober
            .probe_all_ntp_versions(target, &settings.ntpv5_draft)
        {
            Ok(all) => all,
            Err(e) => {
                warn!("Version sweep skipped for {}: {}", target, e);
                return Ok(());
            }
        };

        let family = server_ip.map(ip_family).unwrap_or(settings.wanted_ip_type);
        let mut slots: [VersionSlotInsert; 5] = Default::default();

        for n in 1u8..=5 {
            let key = format!("ntpv{}", n);
            if !settings.analyse_all_ntp_versions
                && !settings.ntp_versions_to_analyze.contains(&key)
            {
                continue;
            }

            let slot = &mut slots[n as usize - 1];
            match all.get(n) {
                Some(Ok(output)) => {
                    let verdict = analyze_version(n, &ProbeOutcome::Parsed(output), family);
                    slot.confidence = Some(verdict.confidence.clone());
                    slot.analysis = Some(verdict.analysis.clone());

                    // Seule une réponse classable est persistée ; la règle
                    // NTPv1 (pas de champ version) vaut aussi ici
                    let response_version = match output.version_str() {
                        Some(v) => Some(normalize_response_version(&v)),
                        None if n == 1 => Some("ntpv1".to_string()),
                        None => None,
                    };
                    if let Some(response_version) = response_version {
                        let record =
                            classify_record(host, server_ip, output, &verdict, settings);
                        slot.record = Some((record, self.build_server_info(server_ip)));
                        slot.response_version = Some(response_version);
                    }
                }
                Some(Err(message)) => {
                    let verdict = analyze_version(n, &ProbeOutcome::Failed(message), family);
                    slot.confidence = Some(verdict.confidence);
                    slot.analysis = Some(verdict.analysis);
                }
                None => {
                    let verdict = analyze_version(n, &ProbeOutcome::Invalid, family);
                    slot.confidence = Some(verdict.confidence);
                    slot.analysis = Some(verdict.analysis);
                }
            }
        }

        self.store.record_versions(kind, id, &slots)?;
        Ok(())
    }

    fn build_server_info(&self, server_ip: Option<&str>) -> ServerInfoData {
        let vantage = vantage_point_ip(4).map(|ip| ip.to_string());
        match server_ip {
            Some(ip) => ServerInfoData {
                ip_is_anycast: self.geo.is_anycast(ip),
                asn: self.geo.asn_for_ip(ip),
                country_code: self.geo.country_for_ip(ip),
                coordinates: self.geo.coordinates_for_ip(ip),
                vantage_point_ip: vantage,
            },
            None => ServerInfoData {
                vantage_point_ip: vantage,
                ..ServerInfoData::default()
            },
        }
    }
}

/// "4" → "ntpv4", "5"/"ntpv5" → "ntpv5"
fn normalize_response_version(advertised: &str) -> String {
    if advertised.starts_with("ntpv") {
        advertised.to_string()
    } else {
        format!("ntpv{}", advertised)
    }
}

/// "ntpv4" → 4 ; repli sur 4 pour une valeur inattendue (validée en amont)
fn version_number(measurement_type: &str) -> u8 {
    measurement_type
        .strip_prefix("ntpv")
        .and_then(|v| v.parse().ok())
        .unwrap_or(4)
}

fn ip_family(ip: &str) -> u8 {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => 6,
        _ => 4,
    }
}

fn error_kind(e: &StoreError) -> &'static str {
    match e {
        StoreError::Insert(_) => "StoreInsert",
        StoreError::Query(_) => "StoreQuery",
        StoreError::Pool(_) => "StorePool",
    }
}

/// Construit l'enregistrement persistable à partir de la sortie de sonde,
/// classé V4 ou V5 selon la version annoncée
fn classify_record(
    host: &str,
    server_ip: Option<&str>,
    output: &NtpProbeOutput,
    verdict: &VersionVerdict,
    settings: &AdvancedSettings,
) -> ClassifiedRecord {
    // Le ref_id déjà traduit par l'outil (forme pointée) est conservé si
    // l'analyseur n'a rien produit
    let ref_name = verdict.ref_name.clone().or_else(|| match &output.ref_id {
        Some(serde_json::Value::String(s)) if s.parse::<IpAddr>().is_ok() => Some(s.clone()),
        _ => None,
    });

    let data = NtpRecordData {
        host: host.to_string(),
        measured_server_ip: server_ip.map(|s| s.to_string()),
        version: if output.is_v5_response() {
            Some(5)
        } else {
            output.version_str().and_then(|v| v.parse().ok())
        },
        leap: output.leap,
        mode: output.mode,
        stratum: output.stratum,
        poll: output.poll,
        precision: output.precision,
        root_delay: output.root_delay,
        root_disp: output.root_disp,
        offset: output.offset,
        rtt: output.rtt,
        ref_name,
        ref_id_raw: output.ref_id_raw().map(|r| r as i64),
        client_sent: output.client_sent(),
        server_recv: output.server_recv(),
        server_sent: output.server_sent(),
        client_recv: output.client_recv(),
        ref_time: output.ref_timestamp(),
        extensions: if output.extensions.is_empty() {
            None
        } else {
            Some(json!(output.extensions))
        },
    };

    if output.is_v5_response() {
        let extras = NtpV5Extras {
            draft_name: if settings.ntpv5_draft.is_empty() {
                None
            } else {
                Some(settings.ntpv5_draft.clone())
            },
            analysis: Some(verdict.analysis.clone()),
            era: output.era,
            timescale: output.timescale,
            flags_raw: output.flags_raw,
            flags_decoded: output
                .flags_decoded
                .as_ref()
                .map(|v| v.to_string()),
            client_cookie: output.client_cookie.map(|c| c.to_string()),
            server_cookie: output.server_cookie.as_ref().map(|v| v.to_string()),
        };
        ClassifiedRecord::V5(data, extras)
    } else {
        ClassifiedRecord::V4(data)
    }
}

/// Convertit le résultat de la sonde NTS en enregistrement persistable.
/// Sur IP, l'analyse rappelle que le certificat TLS n'a pas pu être
/// vérifié.
fn build_nts_record(target: &str, result: &NtsProbeResult, on_ip: bool) -> NtsRecordData {
    let mut analysis = result.analysis.clone();
    if on_ip {
        analysis.push_str(" NTS measurements on IPs cannot check TLS certificate.");
    }

    let mut nts = NtsRecordData {
        succeeded: result.succeeded,
        analysis: Some(analysis),
        host: Some(target.to_string()),
        // NTS n'est pour l'instant porté que par NTPv4
        measurement_type: Some("ntpv4".to_string()),
        ..NtsRecordData::default()
    };

    if let Some(data) = &result.data {
        nts.host = data.host.clone().or(nts.host);
        nts.measured_server_ip = data.measured_server_ip.clone();
        nts.measured_server_port = data.port().map(|p| p as i64);
        nts.offset = data.offset;
        nts.rtt = data.rtt;
        nts.kiss_code = data.kiss_code.clone();
        nts.stratum = data.stratum;
        nts.poll = data.poll;
        nts.client_sent = data.client_sent_time.map(NtpTimestamp);
        nts.server_recv = data.server_recv_time.map(NtpTimestamp);
        nts.server_sent = data.server_sent_time.map(NtpTimestamp);
        nts.client_recv = data.client_recv_time.map(NtpTimestamp);
        nts.ref_time = data.ref_time.map(NtpTimestamp);
        nts.leap = data.leap;
        nts.mode = data.mode;
        nts.version = data.version;
        nts.min_error = data.min_error;
        nts.precision = data.precision;
        nts.root_delay = data.root_delay;
        nts.root_disp = data.root_disp;
        nts.root_dist = data.root_dist;
        nts.ref_id = data.ref_id.clone();
        nts.ref_id_raw = data.ref_id_raw.clone();
    }
    nts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsError;
    use crate::probe::{AllVersionsProbe, NtsProbeOutput};
    use crate::store::MeasurementStatus;

    struct StubResolver(Vec<IpAddr>);

    impl Resolver for StubResolver {
        fn resolve(&self, name: &str, _family: u8) -> Result<Vec<IpAddr>, DnsError> {
            if self.0.is_empty() {
                Err(DnsError::ResolutionFailed(name.to_string()))
            } else {
                Ok(self.0.clone())
            }
        }
    }

    struct NoRipe;

    impl RipeSchedule for NoRipe {
        fn schedule(
            &self,
            _target: &str,
            _client_ip: Option<&str>,
            _settings: &AdvancedSettings,
        ) -> Result<i64, RipeError> {
            Err(RipeError::MissingApiKey)
        }
    }

    struct OkRipe(i64);

    impl RipeSchedule for OkRipe {
        fn schedule(
            &self,
            _target: &str,
            _client_ip: Option<&str>,
            _settings: &AdvancedSettings,
        ) -> Result<i64, RipeError> {
            Ok(self.0)
        }
    }

    /// Sonde dont le binaire est introuvable
    struct MissingToolProber;

    impl Prober for MissingToolProber {
        fn probe_ntp(&self, _: &str, _: &str, _: &str) -> Result<NtpProbeOutput, ProbeError> {
            Err(ProbeError::Unavailable("no such file".to_string()))
        }
        fn probe_all_ntp_versions(&self, _: &str, _: &str) -> Result<AllVersionsProbe, ProbeError> {
            Err(ProbeError::Unavailable("no such file".to_string()))
        }
        fn probe_nts(&self, _: &str, _: Option<u8>) -> Result<NtsProbeResult, ProbeError> {
            Err(ProbeError::Unavailable("no such file".to_string()))
        }
        fn probe_nts_on_ip(&self, _: &str) -> Result<NtsProbeResult, ProbeError> {
            Err(ProbeError::Unavailable("no such file".to_string()))
        }
    }

    /// Sonde de fixture : réponses plausibles sans réseau
    struct FixtureProber;

    fn fixture_output(version: u8) -> NtpProbeOutput {
        let json = format!(
            r#"{{
                "version": {},
                "offset": 0.001,
                "rtt": 0.02,
                "stratum": 2,
                "poll": 6,
                "leap": 0,
                "mode": 4,
                "ref_id": 1590075150,
                "orig_timestamp": 17040536884552151449,
                "recv_timestamp": 17040536877914520677,
                "tx_timestamp": 17040536882532335742,
                "client_recv_time": 17040536884840854228
                {}
            }}"#,
            version,
            if version == 5 {
                r#", "era": 0, "timescale": 0, "client_cookie": 99"#
            } else {
                ""
            }
        );
        serde_json::from_str(&json).unwrap()
    }

    impl Prober for FixtureProber {
        fn probe_ntp(&self, _: &str, version: &str, _: &str) -> Result<NtpProbeOutput, ProbeError> {
            Ok(fixture_output(version_number(version)))
        }

        fn probe_all_ntp_versions(&self, _: &str, _: &str) -> Result<AllVersionsProbe, ProbeError> {
            let mut all = AllVersionsProbe::default();
            for n in 1u8..=5 {
                all.results[n as usize - 1] = Some(if n == 3 {
                    Err("server did not respond".to_string())
                } else {
                    Ok(fixture_output(n))
                });
            }
            Ok(all)
        }

        fn probe_nts(&self, target: &str, _: Option<u8>) -> Result<NtsProbeResult, ProbeError> {
            Ok(NtsProbeResult {
                succeeded: true,
                analysis: "It is NTS. One NTS IP is 1.2.3.4".to_string(),
                data: Some(NtsProbeOutput {
                    host: Some(target.to_string()),
                    measured_server_ip: Some("1.2.3.4".to_string()),
                    stratum: Some(3),
                    ..NtsProbeOutput::default()
                }),
            })
        }

        fn probe_nts_on_ip(&self, ip: &str) -> Result<NtsProbeResult, ProbeError> {
            Ok(NtsProbeResult {
                succeeded: true,
                analysis: "NTS measurement succeeded on this IP".to_string(),
                data: Some(NtsProbeOutput {
                    host: Some(ip.to_string()),
                    measured_server_ip: Some(ip.to_string()),
                    ..NtsProbeOutput::default()
                }),
            })
        }
    }

    fn orchestrator(
        prober: Arc<dyn Prober>,
        ripe: Arc<dyn RipeSchedule>,
        resolver: Arc<dyn Resolver>,
    ) -> (Orchestrator, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        let orch = Orchestrator::new(
            store.clone(),
            prober,
            ripe,
            resolver,
            Arc::new(GeoResolver::empty()),
            Duration::ZERO,
        );
        (orch, store, dir)
    }

    #[test]
    fn test_unresolvable_name_fails_measurement() {
        let (orch, store, _dir) = orchestrator(
            Arc::new(FixtureProber),
            Arc::new(OkRipe(42)),
            Arc::new(StubResolver(vec![])),
        );
        let dn_id = store.create_dn("not.a.real.name").unwrap();
        orch.run(Job {
            target: JobTarget::Dn {
                id: dn_id,
                server: "not.a.real.name".to_string(),
            },
            settings: AdvancedSettings::default(),
        });

        assert_eq!(
            store.status_of(MeasurementKind::Dn, dn_id).unwrap(),
            Some(MeasurementStatus::Failed)
        );
        let view = store.full_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();
        assert!(view["response_error"]
            .as_str()
            .unwrap()
            .contains("cannot be resolved"));
    }

    #[test]
    fn test_missing_tool_finishes_with_error_and_null_parts() {
        let (orch, store, _dir) = orchestrator(
            Arc::new(MissingToolProber),
            Arc::new(NoRipe),
            Arc::new(StubResolver(vec![])),
        );
        let ip_id = store.create_ip("1.2.3.4").unwrap();
        orch.run(Job {
            target: JobTarget::Ip {
                id: ip_id,
                server_ip: "1.2.3.4".to_string(),
            },
            settings: AdvancedSettings::default(),
        });

        assert_eq!(
            store.status_of(MeasurementKind::Ip, ip_id).unwrap(),
            Some(MeasurementStatus::Finished)
        );
        let view = store.full_view(MeasurementKind::Ip, ip_id).unwrap().unwrap();
        assert_eq!(view["response_error"], TOOL_UNAVAILABLE_ERROR);
        assert_eq!(view["main_measurement"], serde_json::Value::Null);
        assert_eq!(view["nts"], serde_json::Value::Null);
        assert_eq!(view["ntp_versions"], serde_json::Value::Null);
    }

    #[test]
    fn test_dn_fanout_shape() {
        let (orch, store, _dir) = orchestrator(
            Arc::new(FixtureProber),
            Arc::new(OkRipe(4242)),
            Arc::new(StubResolver(vec![
                "94.198.159.10".parse().unwrap(),
                "94.198.159.11".parse().unwrap(),
            ])),
        );
        let dn_id = store.create_dn("example.org").unwrap();
        orch.run(Job {
            target: JobTarget::Dn {
                id: dn_id,
                server: "example.org".to_string(),
            },
            settings: AdvancedSettings::default(),
        });

        assert_eq!(
            store.status_of(MeasurementKind::Dn, dn_id).unwrap(),
            Some(MeasurementStatus::Finished)
        );
        let view = store.full_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();

        // Un seul id RIPE, sur la racine
        assert_eq!(view["id_ripe"], 4242);

        // Deux filles, chacune finie, avec leur mesure principale classée
        // selon la version de la réponse
        let children = view["ip_measurements"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        for child in children {
            assert_eq!(child["status"], "finished");
            assert_eq!(child["response_version"], "ntpv4");
            assert_eq!(child["main_measurement"]["version"], 4);
            // Les champs redondants avec le parent sont omis
            assert!(child.get("id_ripe").is_none());
        }

        // NTS lié à la racine
        assert_eq!(view["nts"]["nts_succeeded"], true);

        // Résumé de versions complet, avec l'échec v3 absorbé
        let versions = &view["ntp_versions"];
        assert_eq!(versions["ntpv2_supported_conf"], "100");
        assert_eq!(versions["ntpv3_supported_conf"], "0");
        assert_eq!(versions["ntpv3_data"], serde_json::Value::Null);
        assert_eq!(versions["ntpv5_response_version"], "ntpv5");
        assert_eq!(versions["ntpv5_data"]["era"], 0);

        // Les réglages effectifs sont persistés
        assert_eq!(view["settings"]["measurement_type"], "ntpv4");
    }

    #[test]
    fn test_standalone_ip_gets_nts_and_versions() {
        let (orch, store, _dir) = orchestrator(
            Arc::new(FixtureProber),
            Arc::new(OkRipe(7)),
            Arc::new(StubResolver(vec![])),
        );
        let ip_id = store.create_ip("94.198.159.10").unwrap();
        orch.run(Job {
            target: JobTarget::Ip {
                id: ip_id,
                server_ip: "94.198.159.10".to_string(),
            },
            settings: AdvancedSettings::default(),
        });

        let view = store.full_view(MeasurementKind::Ip, ip_id).unwrap().unwrap();
        assert_eq!(view["status"], "finished");
        assert_eq!(view["id_ripe"], 7);
        assert!(view["nts"]["nts_analysis"]
            .as_str()
            .unwrap()
            .contains("cannot check TLS certificate"));
        assert!(view["ntp_versions"].is_object());
    }

    #[test]
    fn test_child_skips_nts_and_versions_by_default() {
        let (orch, store, _dir) = orchestrator(
            Arc::new(FixtureProber),
            Arc::new(OkRipe(7)),
            Arc::new(StubResolver(vec!["94.198.159.10".parse().unwrap()])),
        );
        let dn_id = store.create_dn("example.org").unwrap();
        let mut settings = AdvancedSettings::default();
        settings.nts_analysis_on_each_ip = false;
        settings.ntp_versions_analysis_on_each_ip = false;
        orch.run(Job {
            target: JobTarget::Dn {
                id: dn_id,
                server: "example.org".to_string(),
            },
            settings,
        });

        let view = store.full_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();
        let child = &view["ip_measurements"][0];
        assert_eq!(child["status"], "finished");
        // La fille a sa mesure principale mais ni NTS ni versions
        assert!(child["main_measurement"].is_object());
        assert_eq!(child["nts"], serde_json::Value::Null);
        assert_eq!(child["ntp_versions"], serde_json::Value::Null);
    }

    #[test]
    fn test_concurrent_measurements_are_isolated() {
        let (orch, store, _dir) = orchestrator(
            Arc::new(FixtureProber),
            Arc::new(OkRipe(7)),
            Arc::new(StubResolver(vec![])),
        );
        let orch = Arc::new(orch);
        let a = store.create_ip("1.1.1.1").unwrap();
        let b = store.create_ip("2.2.2.2").unwrap();
        assert_ne!(a, b);

        let oa = Arc::clone(&orch);
        let ta = std::thread::spawn(move || {
            oa.run(Job {
                target: JobTarget::Ip {
                    id: a,
                    server_ip: "1.1.1.1".to_string(),
                },
                settings: AdvancedSettings::default(),
            });
        });
        let ob = Arc::clone(&orch);
        let tb = std::thread::spawn(move || {
            ob.run(Job {
                target: JobTarget::Ip {
                    id: b,
                    server_ip: "2.2.2.2".to_string(),
                },
                settings: AdvancedSettings::default(),
            });
        });
        ta.join().unwrap();
        tb.join().unwrap();

        let va = store.full_view(MeasurementKind::Ip, a).unwrap().unwrap();
        let vb = store.full_view(MeasurementKind::Ip, b).unwrap().unwrap();
        assert_eq!(va["status"], "finished");
        assert_eq!(vb["status"], "finished");
        assert_eq!(va["server"], "1.1.1.1");
        assert_eq!(vb["server"], "2.2.2.2");
    }
}
