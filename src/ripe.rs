/*!
Client RIPE Atlas

Planifie une mesure NTP distribuée (par nom ou par IP) et relit les
résultats des sondes. La sélection des sondes suit les contraintes du
client (ASN, pays) ou, à défaut, la zone géographique de son IP.

Trois états au moment de la relecture :
- Complete : toutes les sondes demandées ont répondu, ou RIPE a arrêté
  la mesure
- Ongoing : une partie des sondes a répondu
- Pending : aucun résultat pour l'instant
*/

use crate::location::{area_of_ip, GeoResolver};
use crate::settings::AdvancedSettings;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Erreurs du client RIPE Atlas
#[derive(Debug, Error)]
pub enum RipeError {
    /// L'appel HTTP vers l'API a échoué
    #[error("RIPE API call failed: {0}")]
    Api(String),

    /// L'API a refusé la planification
    #[error("RIPE measurement could not be scheduled: {0}")]
    Schedule(String),

    /// La réponse de l'API n'a pas pu être décodée
    #[error("RIPE response could not be decoded: {0}")]
    Decode(String),

    /// Aucune clé d'API configurée
    #[error("no RIPE API key configured")]
    MissingApiKey,
}

/// État d'une mesure au moment du poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RipeFetchState {
    Complete,
    Ongoing,
    Pending,
}

/// Un échange NTP rapporté par une sonde (timestamps flottants RIPE)
#[derive(Debug, Clone, Serialize, Default)]
pub struct RipeNtpSample {
    #[serde(rename = "origin-ts")]
    pub origin_ts: Option<f64>,
    #[serde(rename = "receive-ts")]
    pub receive_ts: Option<f64>,
    #[serde(rename = "transmit-ts")]
    pub transmit_ts: Option<f64>,
    #[serde(rename = "final-ts")]
    pub final_ts: Option<f64>,
    pub offset: Option<f64>,
    pub rtt: Option<f64>,
}

/// Résultat d'une sonde : identité et position de la sonde, délai
/// d'obtention, et le sous-enregistrement NTP mesuré
#[derive(Debug, Clone, Serialize, Default)]
pub struct RipeProbeResult {
    pub probe_id: i64,
    pub probe_addr: RipeProbeAddr,
    pub probe_location: RipeProbeLocation,
    pub time_to_result: Option<f64>,

    pub ntp_version: Option<i64>,
    pub stratum: Option<i64>,
    pub poll: Option<i64>,
    pub precision: Option<f64>,
    pub root_delay: Option<f64>,
    pub root_dispersion: Option<f64>,
    pub leap: Option<i64>,
    pub mode: Option<i64>,
    pub ref_id: Option<String>,

    pub result: Vec<RipeNtpSample>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RipeProbeAddr {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RipeProbeLocation {
    pub country_code: Option<String>,
    pub coordinates: Option<(f64, f64)>,
}

/// Interface de planification, pour substituer le service distant
/// dans les tests de l'orchestrateur
pub trait RipeSchedule: Send + Sync {
    /// Planifie une mesure et retourne son identifiant RIPE
    fn schedule(
        &self,
        target: &str,
        client_ip: Option<&str>,
        settings: &AdvancedSettings,
    ) -> Result<i64, RipeError>;
}

/// Client HTTP vers l'API RIPE Atlas
pub struct RipeClient {
    http: reqwest::blocking::Client,
    api_base: String,
    api_key: String,
    requested_probes: u32,
    geo: Arc<GeoResolver>,
}

impl RipeClient {
    pub fn new(
        api_base: String,
        api_key: String,
        requested_probes: u32,
        timeout: Duration,
        geo: Arc<GeoResolver>,
    ) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        RipeClient {
            http,
            api_base,
            api_key,
            requested_probes,
            geo,
        }
    }

    /// Relit une mesure : résultats décodés + état
    pub fn fetch(&self, measurement_id: i64)
        -> Result<(Vec<RipeProbeResult>, RipeFetchState), RipeError>
    {
        let meta_url = format!("{}/measurements/{}/", self.api_base, measurement_id);
        let meta: Value = self.get_json(&meta_url)?;
        let status_name = meta
            .pointer("/status/name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let probes_requested = meta
            .get("probes_requested")
            .and_then(Value::as_i64)
            .unwrap_or(self.requested_probes as i64);

        let results_url = format!("{}/measurements/{}/results/", self.api_base, measurement_id);
        let raw_results: Value = self.get_json(&results_url)?;
        let mut results = decode_results(&raw_results)?;

        // Identité et position de chaque sonde : meilleur effort
        for r in &mut results {
            match self.fetch_probe_details(r.probe_id) {
                Ok((addr, location)) => {
                    r.probe_addr = addr;
                    r.probe_location = location;
                }
                Err(e) => warn!("Could not fetch probe {} details: {}", r.probe_id, e),
            }
        }

        let state = determine_state(results.len(), probes_requested, &status_name);
        Ok((results, state))
    }

    fn fetch_probe_details(&self, probe_id: i64)
        -> Result<(RipeProbeAddr, RipeProbeLocation), RipeError>
    {
        let url = format!("{}/probes/{}/", self.api_base, probe_id);
        let value: Value = self.get_json(&url)?;
        Ok(decode_probe_details(&value))
    }

    fn get_json(&self, url: &str) -> Result<Value, RipeError> {
        let mut request = self.http.get(url);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Key {}", self.api_key));
        }
        let response = request.send().map_err(|e| RipeError::Api(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RipeError::Api(format!("{} returned {}", url, response.status())));
        }
        response.json().map_err(|e| RipeError::Decode(e.to_string()))
    }
}

impl RipeSchedule for RipeClient {
    fn schedule(
        &self,
        target: &str,
        client_ip: Option<&str>,
        settings: &AdvancedSettings,
    ) -> Result<i64, RipeError> {
        if self.api_key.is_empty() {
            return Err(RipeError::MissingApiKey);
        }

        let body = json!({
            "definitions": [measurement_definition(target, settings)],
            "probes": [probe_selector(settings, client_ip, &self.geo, self.requested_probes)],
            "is_oneoff": true,
        });

        debug!("Scheduling RIPE measurement for {}", target);

        let url = format!("{}/measurements/", self.api_base);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&body)
            .send()
            .map_err(|e| RipeError::Api(e.to_string()))?;

        let status = response.status();
        let value: Value = response.json().map_err(|e| RipeError::Decode(e.to_string()))?;
        if !status.is_success() {
            return Err(RipeError::Schedule(format!(
                "HTTP {}: {}",
                status,
                value.to_string()
            )));
        }

        value
            .pointer("/measurements/0")
            .and_then(Value::as_i64)
            .ok_or_else(|| RipeError::Decode("no measurement id in response".to_string()))
    }
}

/// La définition d'une mesure NTP pour l'API : un nom de domaine est
/// résolu sur chaque sonde, une IP littérale est utilisée telle quelle
fn measurement_definition(target: &str, settings: &AdvancedSettings) -> Value {
    let is_name = target.parse::<IpAddr>().is_err();
    json!({
        "type": "ntp",
        "af": settings.wanted_ip_type,
        "target": target,
        "description": format!("NTP measurement for {}", target),
        "resolve_on_probe": is_name,
        "packets": 3,
    })
}

/// La contrainte de sélection des sondes : ASN et pays du client priment,
/// sinon la zone géographique de son IP
fn probe_selector(
    settings: &AdvancedSettings,
    client_ip: Option<&str>,
    geo: &GeoResolver,
    requested: u32,
) -> Value {
    if !settings.custom_probes_asn.is_empty() {
        return json!({
            "requested": requested,
            "type": "asn",
            "value": settings.custom_probes_asn,
        });
    }
    if !settings.custom_probes_country.is_empty() {
        return json!({
            "requested": requested,
            "type": "country",
            "value": settings.custom_probes_country,
        });
    }

    let area = match client_ip {
        Some(ip) => {
            let country = geo.country_for_ip(ip);
            let continent = geo.continent_for_ip(ip);
            area_of_ip(country.as_deref(), continent.as_deref())
        }
        None => "WW",
    };
    json!({
        "requested": requested,
        "type": "area",
        "value": area,
    })
}

/// Décode le tableau de résultats de l'API
fn decode_results(value: &Value) -> Result<Vec<RipeProbeResult>, RipeError> {
    let entries = value
        .as_array()
        .ok_or_else(|| RipeError::Decode("results are not an array".to_string()))?;

    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut probe = RipeProbeResult {
            probe_id: entry.get("prb_id").and_then(Value::as_i64).unwrap_or(-1),
            time_to_result: entry.get("ttr").and_then(Value::as_f64),
            ntp_version: entry.get("version").and_then(Value::as_i64),
            stratum: entry.get("stratum").and_then(Value::as_i64),
            poll: entry.get("poll").and_then(Value::as_i64),
            precision: entry.get("precision").and_then(Value::as_f64),
            root_delay: entry.get("root-delay").and_then(Value::as_f64),
            root_dispersion: entry.get("root-dispersion").and_then(Value::as_f64),
            leap: entry.get("li").and_then(Value::as_i64),
            mode: entry.get("mode").and_then(Value::as_i64),
            ref_id: entry
                .get("ref-id")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            ..RipeProbeResult::default()
        };

        if let Some(samples) = entry.get("result").and_then(Value::as_array) {
            for sample in samples {
                // Les échanges sans réponse ne portent que "x": on les saute
                if sample.get("offset").is_none() && sample.get("rtt").is_none() {
                    continue;
                }
                probe.result.push(RipeNtpSample {
                    origin_ts: sample.get("origin-ts").and_then(Value::as_f64),
                    receive_ts: sample.get("receive-ts").and_then(Value::as_f64),
                    transmit_ts: sample.get("transmit-ts").and_then(Value::as_f64),
                    final_ts: sample.get("final-ts").and_then(Value::as_f64),
                    offset: sample.get("offset").and_then(Value::as_f64),
                    rtt: sample.get("rtt").and_then(Value::as_f64),
                });
            }
        }
        results.push(probe);
    }
    Ok(results)
}

fn decode_probe_details(value: &Value) -> (RipeProbeAddr, RipeProbeLocation) {
    let addr = RipeProbeAddr {
        ipv4: value
            .get("address_v4")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        ipv6: value
            .get("address_v6")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    };
    // geometry.coordinates est au format GeoJSON: [lon, lat]
    let coordinates = value
        .pointer("/geometry/coordinates")
        .and_then(Value::as_array)
        .and_then(|c| {
            let lon = c.first().and_then(Value::as_f64)?;
            let lat = c.get(1).and_then(Value::as_f64)?;
            Some((lat, lon))
        });
    let location = RipeProbeLocation {
        country_code: value
            .get("country_code")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        coordinates,
    };
    (addr, location)
}

/// Détermine l'état d'une mesure à partir du nombre de résultats, du
/// nombre de sondes demandées et du statut rapporté par l'API
fn determine_state(result_count: usize, probes_requested: i64, status_name: &str) -> RipeFetchState {
    if status_name == "Stopped" {
        return RipeFetchState::Complete;
    }
    if probes_requested > 0 && result_count as i64 >= probes_requested {
        return RipeFetchState::Complete;
    }
    if result_count > 0 {
        return RipeFetchState::Ongoing;
    }
    RipeFetchState::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_JSON: &str = r#"[
        {
            "prb_id": 1001,
            "ttr": 2.35,
            "version": 4,
            "stratum": 2,
            "poll": 64,
            "precision": 9.5e-7,
            "root-delay": 0.011,
            "root-dispersion": 0.004,
            "li": 0,
            "mode": 4,
            "ref-id": "94.198.159.14",
            "result": [
                {
                    "origin-ts": 3960000000.25,
                    "receive-ts": 3960000000.5,
                    "transmit-ts": 3960000000.5,
                    "final-ts": 3960000000.75,
                    "offset": 0.0,
                    "rtt": 0.5
                },
                { "x": "*" }
            ]
        }
    ]"#;

    #[test]
    fn test_decode_results() {
        let value: Value = serde_json::from_str(RESULTS_JSON).unwrap();
        let results = decode_results(&value).unwrap();
        assert_eq!(results.len(), 1);
        let probe = &results[0];
        assert_eq!(probe.probe_id, 1001);
        assert_eq!(probe.stratum, Some(2));
        assert_eq!(probe.ref_id.as_deref(), Some("94.198.159.14"));
        // L'échange sans réponse a été ignoré
        assert_eq!(probe.result.len(), 1);
        assert_eq!(probe.result[0].rtt, Some(0.5));
    }

    #[test]
    fn test_decode_results_not_array() {
        let value: Value = serde_json::from_str(r#"{"detail": "error"}"#).unwrap();
        assert!(decode_results(&value).is_err());
    }

    #[test]
    fn test_decode_probe_details() {
        let value: Value = serde_json::from_str(
            r#"{
                "address_v4": "83.163.0.1",
                "address_v6": null,
                "country_code": "NL",
                "geometry": { "type": "Point", "coordinates": [4.89, 52.37] }
            }"#,
        )
        .unwrap();
        let (addr, location) = decode_probe_details(&value);
        assert_eq!(addr.ipv4.as_deref(), Some("83.163.0.1"));
        assert!(addr.ipv6.is_none());
        assert_eq!(location.country_code.as_deref(), Some("NL"));
        // GeoJSON inverse lat/lon
        assert_eq!(location.coordinates, Some((52.37, 4.89)));
    }

    #[test]
    fn test_determine_state() {
        assert_eq!(determine_state(3, 3, "Ongoing"), RipeFetchState::Complete);
        assert_eq!(determine_state(5, 3, "Ongoing"), RipeFetchState::Complete);
        assert_eq!(determine_state(1, 3, "Stopped"), RipeFetchState::Complete);
        assert_eq!(determine_state(1, 3, "Ongoing"), RipeFetchState::Ongoing);
        assert_eq!(determine_state(0, 3, "Ongoing"), RipeFetchState::Pending);
    }

    #[test]
    fn test_probe_selector_priorities() {
        let geo = GeoResolver::empty();
        let mut settings = AdvancedSettings::default();

        settings.custom_probes_asn = "1140".to_string();
        let v = probe_selector(&settings, None, &geo, 3);
        assert_eq!(v["type"], "asn");
        assert_eq!(v["value"], "1140");

        settings.custom_probes_asn.clear();
        settings.custom_probes_country = "NL".to_string();
        let v = probe_selector(&settings, None, &geo, 3);
        assert_eq!(v["type"], "country");

        settings.custom_probes_country.clear();
        let v = probe_selector(&settings, Some("203.0.113.9"), &geo, 3);
        assert_eq!(v["type"], "area");
        // Localisation inconnue: monde entier
        assert_eq!(v["value"], "WW");
    }

    #[test]
    fn test_measurement_definition() {
        let settings = AdvancedSettings::default();
        let by_name = measurement_definition("example.org", &settings);
        assert_eq!(by_name["resolve_on_probe"], true);
        assert_eq!(by_name["af"], 4);

        let by_ip = measurement_definition("1.2.3.4", &settings);
        assert_eq!(by_ip["resolve_on_probe"], false);
    }
}
