/*!
Adaptateur de l'outil de sonde NTP/NTS

L'outil externe parle le protocole sur le réseau et écrit un objet JSON
sur sa sortie standard. Ce module l'invoque en sous-processus avec un
délai maximum, parse sa sortie et normalise les noms de champs.

Codes de retour de l'outil :
- 0 : mesure réussie
- 6 : mesure NTS réussie, mais seulement sur l'autre famille d'adresses
- autre : échec, le diagnostic (une ligne) est sur stdout
*/

use crate::security::sanitize_string;
use crate::timestamp::NtpTimestamp;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Erreurs de l'adaptateur de sonde
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Le binaire de l'outil n'a pas pu être lancé
    #[error("probe tool unavailable: {0}")]
    Unavailable(String),

    /// La sortie de l'outil n'a pas pu être parsée
    #[error("probe output invalid: {0}")]
    OutputInvalid(String),

    /// L'outil a rapporté un échec de mesure (serveur injoignable, timeout…)
    #[error("probe measurement failed: {0}")]
    MeasurementFailed(String),
}

/// Réponse NTP parsée depuis la sortie JSON de l'outil.
/// Les noms de timestamps sont normalisés vers le vocabulaire interne :
/// orig/recv/tx deviennent client_sent/server_recv/server_sent.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NtpProbeOutput {
    /// Version annoncée par la réponse (nombre ou chaîne, absente en NTPv1)
    pub version: Option<Value>,

    pub offset: Option<f64>,
    pub rtt: Option<f64>,
    pub stratum: Option<i64>,
    pub poll: Option<i64>,
    pub precision: Option<f64>,
    pub root_delay: Option<f64>,
    pub root_disp: Option<f64>,
    pub leap: Option<i64>,
    pub mode: Option<i64>,

    /// Identifiant de référence brut (32 bits) ou déjà traduit
    pub ref_id: Option<Value>,

    #[serde(rename = "orig_timestamp")]
    pub client_sent_time: Option<u64>,
    #[serde(rename = "recv_timestamp")]
    pub server_recv_time: Option<u64>,
    #[serde(rename = "tx_timestamp")]
    pub server_sent_time: Option<u64>,
    pub client_recv_time: Option<u64>,
    #[serde(rename = "ref_timestamp")]
    pub ref_time: Option<u64>,

    /// Champs d'extension bruts rapportés par l'outil
    #[serde(default)]
    pub extensions: BTreeMap<String, Value>,

    // Champs spécifiques NTPv5
    pub era: Option<i64>,
    pub timescale: Option<i64>,
    pub flags_raw: Option<i64>,
    pub flags_decoded: Option<Value>,
    pub client_cookie: Option<u64>,
    pub server_cookie: Option<Value>,

    /// Message d'erreur par version (sous-enregistrement du mode allversions)
    pub error: Option<String>,
}

impl NtpProbeOutput {
    /// La version annoncée, sous forme de chaîne ("4", "5", "ntpv5"…)
    pub fn version_str(&self) -> Option<String> {
        match &self.version {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Règle de classement : une réponse va dans la table NTPv5 si et
    /// seulement si elle annonce la version 5. Tout le reste (1/2/3/4,
    /// ou version absente) est stocké au format NTPv4.
    pub fn is_v5_response(&self) -> bool {
        matches!(self.version_str().as_deref(), Some("5") | Some("ntpv5"))
    }

    /// L'identifiant de référence brut en u32, si l'outil l'a donné
    /// sous forme numérique ou hexadécimale ("0x…")
    pub fn ref_id_raw(&self) -> Option<u32> {
        match &self.ref_id {
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if let Some(hex) = trimmed.strip_prefix("0x") {
                    u32::from_str_radix(hex, 16).ok()
                } else {
                    trimmed.parse::<u32>().ok()
                }
            }
            _ => None,
        }
    }

    pub fn client_sent(&self) -> Option<NtpTimestamp> {
        self.client_sent_time.map(NtpTimestamp)
    }

    pub fn server_recv(&self) -> Option<NtpTimestamp> {
        self.server_recv_time.map(NtpTimestamp)
    }

    pub fn server_sent(&self) -> Option<NtpTimestamp> {
        self.server_sent_time.map(NtpTimestamp)
    }

    pub fn client_recv(&self) -> Option<NtpTimestamp> {
        self.client_recv_time.map(NtpTimestamp)
    }

    pub fn ref_timestamp(&self) -> Option<NtpTimestamp> {
        self.ref_time.map(NtpTimestamp)
    }
}

/// Résultat du balayage de versions : une entrée par version 1..5,
/// soit une réponse parsée, soit le message d'échec de cette version
#[derive(Debug, Default)]
pub struct AllVersionsProbe {
    /// Indice 0 = ntpv1 … indice 4 = ntpv5
    pub results: [Option<Result<NtpProbeOutput, String>>; 5],
}

impl AllVersionsProbe {
    pub fn get(&self, version: u8) -> Option<&Result<NtpProbeOutput, String>> {
        self.results.get(version as usize - 1).and_then(|r| r.as_ref())
    }
}

/// Sortie JSON de l'outil NTS (les noms de champs sont ceux de l'outil)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NtsProbeOutput {
    #[serde(rename = "Host")]
    pub host: Option<String>,
    #[serde(rename = "Measured server IP")]
    pub measured_server_ip: Option<String>,
    #[serde(rename = "Measured server port")]
    pub measured_server_port: Option<Value>,

    pub client_sent_time: Option<u64>,
    pub server_recv_time: Option<u64>,
    pub server_sent_time: Option<u64>,
    pub client_recv_time: Option<u64>,
    pub ref_time: Option<u64>,

    #[serde(rename = "kissCode")]
    pub kiss_code: Option<String>,
    pub leap: Option<i64>,
    #[serde(rename = "minError")]
    pub min_error: Option<f64>,
    pub mode: Option<i64>,
    pub offset: Option<f64>,
    pub poll: Option<i64>,
    pub precision: Option<f64>,
    pub ref_id: Option<String>,
    pub ref_id_raw: Option<String>,
    pub root_delay: Option<f64>,
    pub root_disp: Option<f64>,
    pub root_dist: Option<f64>,
    pub rtt: Option<f64>,
    pub stratum: Option<i64>,
    pub version: Option<i64>,
}

impl NtsProbeOutput {
    pub fn port(&self) -> Option<u16> {
        match &self.measured_server_port {
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        }
    }
}

/// Résultat d'une mesure NTS : l'échec de la mesure elle-même n'est pas
/// une erreur de l'adaptateur, il est porté par `succeeded`/`analysis`
#[derive(Debug, Default)]
pub struct NtsProbeResult {
    pub succeeded: bool,
    pub analysis: String,
    pub data: Option<NtsProbeOutput>,
}

/// Interface de la sonde, pour pouvoir substituer l'outil dans les tests
pub trait Prober: Send + Sync {
    /// Mesure NTP dans la version demandée ("ntpv1".."ntpv5")
    fn probe_ntp(&self, target: &str, version: &str, draft: &str)
        -> Result<NtpProbeOutput, ProbeError>;

    /// Balayage des versions 1..5 en un appel
    fn probe_all_ntp_versions(&self, target: &str, draft: &str)
        -> Result<AllVersionsProbe, ProbeError>;

    /// Mesure NTS sur un nom de domaine (vérifie le certificat TLS).
    /// `family_preference` = Some(4|6) pour exiger une famille d'adresses.
    fn probe_nts(&self, target: &str, family_preference: Option<u8>)
        -> Result<NtsProbeResult, ProbeError>;

    /// Mesure NTS sur une IP (sans validation du nom de certificat)
    fn probe_nts_on_ip(&self, ip: &str) -> Result<NtsProbeResult, ProbeError>;
}

/// Implémentation réelle : invoque le binaire configuré
pub struct ToolProber {
    binary_path: PathBuf,
    timeout: Duration,
}

impl ToolProber {
    pub fn new(binary_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        ToolProber {
            binary_path: binary_path.into(),
            timeout,
        }
    }

    /// Lance l'outil et attend sa fin dans la limite du délai configuré.
    /// Retourne le code de sortie et stdout.
    fn run_tool(&self, args: &[&str]) -> Result<(i32, String), ProbeError> {
        debug!("Running probe tool {:?} {:?}", self.binary_path, args);

        let mut child = Command::new(&self.binary_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ProbeError::MeasurementFailed(format!(
                            "probe timed out after {} s",
                            self.timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(ProbeError::Unavailable(e.to_string()));
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ProbeError::Unavailable(e.to_string()))?;

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((code, stdout))
    }

    /// Le diagnostic d'échec de l'outil tient sur une ligne, nettoyée
    /// des caractères de contrôle
    fn failure_message(stdout: &str) -> String {
        let line = stdout.lines().next().unwrap_or("");
        let cleaned = sanitize_string(line);
        if cleaned.is_empty() {
            "probe tool reported a failure without diagnostic".to_string()
        } else {
            cleaned
        }
    }
}

/// Parse un objet JSON émis par l'outil
fn parse_json(stdout: &str) -> Result<Value, ProbeError> {
    serde_json::from_str(stdout).map_err(|e| ProbeError::OutputInvalid(e.to_string()))
}

fn parse_ntp_output(value: Value) -> Result<NtpProbeOutput, ProbeError> {
    serde_json::from_value(value).map_err(|e| ProbeError::OutputInvalid(e.to_string()))
}

impl Prober for ToolProber {
    fn probe_ntp(&self, target: &str, version: &str, draft: &str)
        -> Result<NtpProbeOutput, ProbeError>
    {
        let mut args = vec![version, target];
        if version == "ntpv5" && !draft.is_empty() {
            args.push(draft);
        }

        let (code, stdout) = self.run_tool(&args)?;
        if code != 0 {
            return Err(ProbeError::MeasurementFailed(Self::failure_message(&stdout)));
        }
        parse_ntp_output(parse_json(&stdout)?)
    }

    fn probe_all_ntp_versions(&self, target: &str, draft: &str)
        -> Result<AllVersionsProbe, ProbeError>
    {
        let mut args = vec!["allversions", target];
        if !draft.is_empty() {
            args.push(draft);
        }

        let (code, stdout) = self.run_tool(&args)?;
        if code != 0 {
            return Err(ProbeError::MeasurementFailed(Self::failure_message(&stdout)));
        }

        let value = parse_json(&stdout)?;
        // Erreur de l'outil lui-même (à distinguer d'un échec par version)
        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(ProbeError::MeasurementFailed(sanitize_string(err)));
        }

        let mut probe = AllVersionsProbe::default();
        for (i, key) in ["ntpv1", "ntpv2", "ntpv3", "ntpv4", "ntpv5"].iter().enumerate() {
            let entry = match value.get(*key) {
                Some(sub) => {
                    if let Some(err) = sub.get("error").and_then(Value::as_str) {
                        Err(sanitize_string(err))
                    } else {
                        match parse_ntp_output(sub.clone()) {
                            Ok(record) => Ok(record),
                            Err(e) => {
                                warn!("Unparseable {} sub-record: {}", key, e);
                                Err("Received something, but could not parse the response.".to_string())
                            }
                        }
                    }
                }
                None => Err("No data for this version.".to_string()),
            };
            probe.results[i] = Some(entry);
        }
        Ok(probe)
    }

    fn probe_nts(&self, target: &str, family_preference: Option<u8>)
        -> Result<NtsProbeResult, ProbeError>
    {
        let family_arg;
        let args: Vec<&str> = match family_preference {
            Some(family) => {
                family_arg = format!("ipv{}", family);
                vec![target, &family_arg]
            }
            None => vec![target],
        };

        let (code, stdout) = self.run_tool(&args)?;
        let data = parse_json(&stdout).ok().and_then(|v| serde_json::from_value(v).ok());
        Ok(interpret_nts_outcome(code, &stdout, family_preference, data))
    }

    fn probe_nts_on_ip(&self, ip: &str) -> Result<NtsProbeResult, ProbeError> {
        // Le second argument fixe l'adresse de connexion : l'outil saute
        // alors la validation du nom dans le certificat
        let (code, stdout) = self.run_tool(&[ip, ip])?;
        let data: Option<NtsProbeOutput> =
            parse_json(&stdout).ok().and_then(|v| serde_json::from_value(v).ok());
        Ok(interpret_nts_on_ip_outcome(code, &stdout, ip, data))
    }
}

/// Interprète le code de retour d'une mesure NTS sur nom de domaine
fn interpret_nts_outcome(
    code: i32,
    stdout: &str,
    family_preference: Option<u8>,
    data: Option<NtsProbeOutput>,
) -> NtsProbeResult {
    let measured_ip = data
        .as_ref()
        .and_then(|d| d.measured_server_ip.clone())
        .unwrap_or_default();

    match code {
        0 => {
            let analysis = if measured_ip.is_empty() {
                "NTS measurement succeeded, but could not retrieve data".to_string()
            } else {
                format!("It is NTS. One NTS IP is {}", measured_ip)
            };
            NtsProbeResult { succeeded: true, analysis, data }
        }
        6 => {
            let family = family_preference.unwrap_or(4);
            let analysis = if measured_ip.is_empty() {
                format!(
                    "Measurement failed on ipv{}, but succeeded on the other type. Could not retrieve more data",
                    family
                )
            } else {
                format!(
                    "It is NTS, but failed on ipv{}. One working NTS IP is {}",
                    family, measured_ip
                )
            };
            NtsProbeResult { succeeded: true, analysis, data }
        }
        _ => {
            let cleaned = sanitize_string(stdout);
            let analysis = if cleaned.is_empty() {
                "NTS measurement failed, but could not retrieve more data".to_string()
            } else {
                cleaned
            };
            NtsProbeResult { succeeded: false, analysis, data: None }
        }
    }
}

/// Interprète le code de retour d'une mesure NTS sur IP : détecte en plus
/// une redirection imposée par le Key Establishment
fn interpret_nts_on_ip_outcome(
    code: i32,
    stdout: &str,
    original_ip: &str,
    data: Option<NtsProbeOutput>,
) -> NtsProbeResult {
    if code != 0 {
        let cleaned = sanitize_string(stdout);
        let analysis = if cleaned.is_empty() {
            "NTS measurement failed, but could not retrieve more data".to_string()
        } else {
            cleaned
        };
        return NtsProbeResult { succeeded: false, analysis, data: None };
    }

    let measured_ip = data
        .as_ref()
        .and_then(|d| d.measured_server_ip.clone())
        .unwrap_or_default();

    let analysis = if measured_ip.is_empty() {
        "NTS measurement succeeded, but could not retrieve data".to_string()
    } else if measured_ip != original_ip {
        format!(
            "Measurement succeeded, but Key Exchange forced it to be performed on {}",
            measured_ip
        )
    } else {
        "NTS measurement succeeded on this IP".to_string()
    };
    NtsProbeResult { succeeded: true, analysis, data }
}
