use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

/// Versions NTP reconnues par le service
pub const KNOWN_NTP_VERSIONS: [&str; 5] = ["ntpv1", "ntpv2", "ntpv3", "ntpv4", "ntpv5"];

/// Erreur de validation des paramètres client
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InputError(pub String);

/// Requête de mesure telle que reçue du client
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MeasurementRequest {
    /// IP (v4/v6) ou nom de domaine du serveur à mesurer (obligatoire)
    #[serde(default)]
    pub server: String,

    /// true si on veut mesurer les adresses IPv6 du serveur
    #[serde(default)]
    pub ipv6_measurement: bool,

    /// Version NTP de la mesure principale (ex: "ntpv4")
    pub measurement_type: Option<String>,

    /// Sous-ensemble de versions à analyser
    pub ntp_versions_to_analyze: Option<Vec<String>>,

    /// Analyser toutes les versions 1..5 (prioritaire sur la liste)
    pub analyse_all_ntp_versions: Option<bool>,

    /// Appliquer l'analyse de versions à chaque IP d'un nom de domaine
    pub ntp_versions_analysis_on_each_ip: Option<bool>,

    /// Appliquer la mesure NTS à chaque IP d'un nom de domaine
    pub nts_analysis_on_each_ip: Option<bool>,

    /// Identifiant de draft passé à la sonde NTPv5
    pub ntpv5_draft: Option<String>,

    /// Contrainte ASN pour les sondes RIPE
    pub custom_probes_asn: Option<String>,

    /// Contrainte pays pour les sondes RIPE
    pub custom_probes_country: Option<String>,

    /// Point de vue client imposé (IP valide ou vide)
    pub custom_client_ip: Option<String>,
}

/// Paramètres effectifs d'une mesure, après validation.
/// C'est cette forme qui circule dans le pipeline et qui est persistée.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvancedSettings {
    pub wanted_ip_type: u8,
    pub measurement_type: String,
    pub ntp_versions_to_analyze: Vec<String>,
    pub analyse_all_ntp_versions: bool,
    pub ntp_versions_analysis_on_each_ip: bool,
    pub nts_analysis_on_each_ip: bool,
    pub ntpv5_draft: String,
    pub custom_probes_asn: String,
    pub custom_probes_country: String,
    pub custom_client_ip: String,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        AdvancedSettings {
            wanted_ip_type: 4,
            measurement_type: "ntpv4".to_string(),
            ntp_versions_to_analyze: Vec::new(),
            analyse_all_ntp_versions: true,
            ntp_versions_analysis_on_each_ip: false,
            // NTS est toujours mesuré sur la cible elle-même,
            // ce flag ne concerne que les IP filles d'un nom de domaine
            nts_analysis_on_each_ip: false,
            ntpv5_draft: String::new(),
            custom_probes_asn: String::new(),
            custom_probes_country: String::new(),
            custom_client_ip: String::new(),
        }
    }
}

/// Si la cible est une IP littérale, son type prime sur le type demandé.
/// Pour un nom de domaine, le type demandé est conservé.
pub fn override_ip_type_if_target_is_ip(target: &str, wanted_ip_type: u8) -> u8 {
    match target.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => 4,
        Ok(IpAddr::V6(_)) => 6,
        Err(_) => wanted_ip_type,
    }
}

/// Construit les paramètres effectifs à partir de la requête du client,
/// en validant chaque champ
pub fn check_and_get_settings(request: &MeasurementRequest) -> Result<AdvancedSettings, InputError> {
    let wanted_ip_type = if request.ipv6_measurement { 6 } else { 4 };
    let mut settings = AdvancedSettings {
        wanted_ip_type: override_ip_type_if_target_is_ip(&request.server, wanted_ip_type),
        ..AdvancedSettings::default()
    };

    if let Some(ref t) = request.measurement_type {
        settings.measurement_type = t.clone();
    }
    if let Some(ref versions) = request.ntp_versions_to_analyze {
        settings.ntp_versions_to_analyze = versions.clone();
    }
    if let Some(all) = request.analyse_all_ntp_versions {
        settings.analyse_all_ntp_versions = all;
    }
    if let Some(per_ip) = request.ntp_versions_analysis_on_each_ip {
        settings.ntp_versions_analysis_on_each_ip = per_ip;
    }
    if let Some(per_ip) = request.nts_analysis_on_each_ip {
        settings.nts_analysis_on_each_ip = per_ip;
    }
    if let Some(ref draft) = request.ntpv5_draft {
        settings.ntpv5_draft = draft.clone();
    }
    if let Some(ref asn) = request.custom_probes_asn {
        settings.custom_probes_asn = asn.clone();
    }
    if let Some(ref country) = request.custom_probes_country {
        settings.custom_probes_country = country.clone();
    }
    if let Some(ref ip) = request.custom_client_ip {
        settings.custom_client_ip = ip.clone();
    }

    check_settings(settings)
}

/// Valide les paramètres effectifs
pub fn check_settings(mut settings: AdvancedSettings) -> Result<AdvancedSettings, InputError> {
    if settings.wanted_ip_type != 4 && settings.wanted_ip_type != 6 {
        return Err(InputError("wanted_ip_type must be 4 or 6".to_string()));
    }

    if !KNOWN_NTP_VERSIONS.contains(&settings.measurement_type.as_str()) {
        return Err(InputError(
            "measurement_type must be ntpv1 or ntpv2 or ntpv3 or ntpv4 or ntpv5".to_string(),
        ));
    }

    // Déduplication en conservant l'ordre d'apparition
    let mut seen = Vec::new();
    for v in settings.ntp_versions_to_analyze.drain(..) {
        if !KNOWN_NTP_VERSIONS.contains(&v.as_str()) {
            return Err(InputError(format!(
                "the version {} must be either ntpv1 or ntpv2 or ntpv3 or ntpv4 or ntpv5",
                v
            )));
        }
        if !seen.contains(&v) {
            seen.push(v);
        }
    }
    settings.ntp_versions_to_analyze = seen;

    // La demande globale écrase la liste
    if settings.analyse_all_ntp_versions {
        settings.ntp_versions_to_analyze =
            KNOWN_NTP_VERSIONS.iter().map(|s| s.to_string()).collect();
    }

    if !settings.custom_client_ip.is_empty()
        && settings.custom_client_ip.parse::<IpAddr>().is_err()
    {
        return Err(InputError(
            "custom_client_ip must be either null/empty or a valid IP address".to_string(),
        ));
    }

    Ok(settings)
}

/// true si l'analyse de versions est demandée par ces paramètres
pub fn wants_version_analysis(settings: &AdvancedSettings) -> bool {
    settings.analyse_all_ntp_versions || !settings.ntp_versions_to_analyze.is_empty()
}
