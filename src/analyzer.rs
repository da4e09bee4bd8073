/*!
Analyse de conformité des réponses NTP par version

Pour chaque version 1..5, compare la réponse reçue à la forme attendue de
cette version et produit un score de confiance ("0", "25", "50", "75",
"75 or 100", "100") accompagné d'un texte d'analyse.

Le score mesure la fidélité de l'implémentation annoncée, pas la qualité
du temps servi : une réponse NTPv4 qui se prétend NTPv5 reste classée
NTPv5 ailleurs, et c'est précisément ce genre d'écart qui est détecté ici.
*/

use crate::probe::NtpProbeOutput;
use std::net::Ipv4Addr;

/// Issue d'une sonde par version, vue par l'analyseur
pub enum ProbeOutcome<'a> {
    /// Réponse parsée
    Parsed(&'a NtpProbeOutput),
    /// L'outil a rapporté un échec de mesure (diagnostic verbatim)
    Failed(&'a str),
    /// Une réponse est arrivée mais n'a pas pu être parsée
    Invalid,
}

/// Verdict de l'analyse d'une version
#[derive(Debug, Clone, PartialEq)]
pub struct VersionVerdict {
    pub confidence: String,
    pub analysis: String,
    /// Identifiant de référence traduit (IP, kiss code ou hash),
    /// à substituer dans l'enregistrement persisté
    pub ref_name: Option<String>,
}

impl VersionVerdict {
    fn new(confidence: &str, analysis: String) -> Self {
        VersionVerdict {
            confidence: confidence.to_string(),
            analysis,
            ref_name: None,
        }
    }
}

/// Traduit un identifiant de référence 32 bits.
/// - stratum 0 ou 1 : kiss code ASCII de 4 octets
/// - stratum 2..15, famille 4 : adresse IPv4 du parent
/// - stratum 2..15, famille 6 : les 4 premiers octets du hash MD5 de
///   l'adresse du parent
/// - stratum hors plage : pas de traduction
pub fn ref_id_to_ip_or_name(raw: u32, stratum: i64, family: u8) -> (Option<Ipv4Addr>, Option<String>) {
    match stratum {
        0..=1 => (None, kiss_code(raw)),
        2..=15 => {
            if family == 6 {
                (None, Some(format!("IPv6 MD5 hash: 0x{:08x}", raw)))
            } else {
                (Some(Ipv4Addr::from(raw)), None)
            }
        }
        _ => (None, None),
    }
}

/// Le kiss code, si les 4 octets sont de l'ASCII imprimable
fn kiss_code(raw: u32) -> Option<String> {
    let bytes = raw.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic()) {
        Some(String::from_utf8_lossy(&bytes).to_string())
    } else {
        None
    }
}

/// Analyse la réponse obtenue en sondant la version `version` (1..=5).
/// `family` est la famille d'adresses de la cible mesurée (4 ou 6).
pub fn analyze_version(version: u8, outcome: &ProbeOutcome, family: u8) -> VersionVerdict {
    match outcome {
        ProbeOutcome::Failed(msg) => VersionVerdict::new("0", msg.to_string()),
        ProbeOutcome::Invalid => VersionVerdict::new(
            "0",
            "Received something, but could not parse the response.".to_string(),
        ),
        ProbeOutcome::Parsed(record) => match version {
            1 => analyze_v1(record),
            2..=4 => analyze_v2_to_v4(version, record, family),
            5 => analyze_v5(record),
            _ => VersionVerdict::new("0", format!("Unknown NTP version {}", version)),
        },
    }
}

/// NTPv1 n'a pas de champ version : sa présence trahit une autre version
fn analyze_v1(record: &NtpProbeOutput) -> VersionVerdict {
    match record.version_str() {
        Some(v) => VersionVerdict::new(
            "25",
            format!("The received result is not NTPv1. The version is: {}", v),
        ),
        None => VersionVerdict::new("100", "It supports NTPv1.".to_string()),
    }
}

fn analyze_v2_to_v4(version: u8, record: &NtpProbeOutput, family: u8) -> VersionVerdict {
    let advertised = record.version_str().unwrap_or_else(|| "None".to_string());
    if advertised != version.to_string() {
        return VersionVerdict::new(
            "50",
            format!(
                "Received an NTP response, but with a different NTP version: version {}",
                advertised
            ),
        );
    }

    // NTPv2 est identifiable sans ambiguïté; pour v3/v4 le format seul
    // ne permet pas de trancher entre les deux
    let confidence = if version == 2 { "100" } else { "75 or 100" };
    let mut verdict =
        VersionVerdict::new(confidence, format!("It supports NTPv{}.", version));

    let translated = record.ref_id_raw().and_then(|raw| {
        let stratum = record.stratum.unwrap_or(-1);
        let (ip, name) = ref_id_to_ip_or_name(raw, stratum, family);
        ip.map(|i| i.to_string()).or(name)
    });

    match translated {
        Some(name) => verdict.ref_name = Some(name),
        None => {
            verdict.analysis.push_str(" Could not translate ref id.");
            if version == 3 {
                verdict.confidence = "75".to_string();
            }
        }
    }
    verdict
}

/// NTPv5 expose des invariants vérifiables : era, timescale, cookie client
fn analyze_v5(record: &NtpProbeOutput) -> VersionVerdict {
    let advertised = record.version_str().unwrap_or_else(|| "None".to_string());
    if advertised != "5" && advertised != "ntpv5" {
        return VersionVerdict::new(
            "50",
            format!(
                "Received an NTP response, but with a different NTP version: version {}",
                advertised
            ),
        );
    }

    let (era, timescale, client_cookie) =
        match (record.era, record.timescale, record.client_cookie) {
            (Some(e), Some(t), Some(c)) => (e, t, c),
            _ => {
                return VersionVerdict::new(
                    "25",
                    "Could not inspect the NTPv5 response.".to_string(),
                )
            }
        };

    if era > 1 {
        return VersionVerdict::new("75", format!("It claims NTPv5, but the era is invalid: {}", era));
    }
    if timescale > 4 {
        return VersionVerdict::new(
            "75",
            format!("It claims NTPv5, but the timescale is invalid: {}", timescale),
        );
    }
    if client_cookie == 0 {
        return VersionVerdict::new(
            "75",
            "It claims NTPv5, but the client cookie is invalid (zero).".to_string(),
        );
    }

    VersionVerdict::new("100", "It supports NTPv5.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: &str) -> NtpProbeOutput {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_ref_id_kiss_code_stratum01() {
        let (ip, name) = ref_id_to_ip_or_name(0x4e54534e, 0, 4);
        assert!(ip.is_none());
        assert_eq!(name.as_deref(), Some("NTSN"));

        let (ip, name) = ref_id_to_ip_or_name(0x4e54534e, 1, 6);
        assert!(ip.is_none());
        assert_eq!(name.as_deref(), Some("NTSN"));
    }

    #[test]
    fn test_ref_id_parent_ip() {
        let (ip, name) = ref_id_to_ip_or_name(1590075150, 2, 4);
        assert_eq!(ip, Some("94.198.159.14".parse().unwrap()));
        assert!(name.is_none());

        let (ip, name) = ref_id_to_ip_or_name(1590075150, 2000, 4);
        assert!(ip.is_none());
        assert!(name.is_none());
    }

    #[test]
    fn test_ref_id_ipv6_hash() {
        let (ip, name) = ref_id_to_ip_or_name(1590075150, 2, 6);
        assert!(ip.is_none());
        assert_eq!(name.as_deref(), Some("IPv6 MD5 hash: 0x5ec69f0e"));

        let (ip, name) = ref_id_to_ip_or_name(1590075150, 2000, 6);
        assert!(ip.is_none());
        assert!(name.is_none());
    }

    #[test]
    fn test_v1_without_version_field_is_supported() {
        let r = record(r#"{"stratum": 2}"#);
        let v = analyze_version(1, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "100");
        assert!(v.analysis.contains("supports NTPv1"));
    }

    #[test]
    fn test_v1_with_version_field_is_not_v1() {
        let r = record(r#"{"version": 4}"#);
        let v = analyze_version(1, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "25");
        assert!(v.analysis.contains("not NTPv1"));
        assert!(v.analysis.contains('4'));
    }

    #[test]
    fn test_v2_match_translates_ref_id() {
        let r = record(r#"{"version": 2, "stratum": 2, "ref_id": 1590075150}"#);
        let v = analyze_version(2, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "100");
        assert!(v.analysis.contains("supports NTPv2"));
        assert_eq!(v.ref_name.as_deref(), Some("94.198.159.14"));
    }

    #[test]
    fn test_v4_kiss_code() {
        let r = record(r#"{"version": 4, "stratum": 0, "ref_id": 1314149198}"#);
        // 1314149198 = 0x4e54534e
        let v = analyze_version(4, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "75 or 100");
        assert!(v.analysis.contains("supports NTPv4"));
        assert_eq!(v.ref_name.as_deref(), Some("NTSN"));
    }

    #[test]
    fn test_v3_downgrades_on_untranslatable_ref_id() {
        // Stratum hors plage: traduction impossible
        let r = record(r#"{"version": 3, "stratum": 20, "ref_id": 1590075150}"#);
        let v = analyze_version(3, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "75");
        assert!(v.analysis.contains("Could not translate ref id"));

        // Même cas en v4: pas de déclassement
        let r = record(r#"{"version": 4, "stratum": 20, "ref_id": 1590075150}"#);
        let v = analyze_version(4, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "75 or 100");
        assert!(v.analysis.contains("Could not translate ref id"));
    }

    #[test]
    fn test_version_mismatch() {
        let r = record(r#"{"version": 4}"#);
        let v = analyze_version(2, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "50");
        assert!(v.analysis.contains("different NTP version"));
        assert!(v.analysis.contains('4'));
    }

    #[test]
    fn test_v5_valid() {
        let r = record(r#"{"version": 5, "era": 0, "timescale": 0, "client_cookie": 123}"#);
        let v = analyze_version(5, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "100");
        assert!(v.analysis.contains("supports NTPv5"));
    }

    #[test]
    fn test_v5_invalid_era() {
        let r = record(r#"{"version": 5, "era": 3, "timescale": 0, "client_cookie": 123}"#);
        let v = analyze_version(5, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "75");
        assert!(v.analysis.contains("era is invalid"));
    }

    #[test]
    fn test_v5_invalid_timescale_and_cookie() {
        let r = record(r#"{"version": 5, "era": 0, "timescale": 9, "client_cookie": 123}"#);
        let v = analyze_version(5, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "75");
        assert!(v.analysis.contains("timescale is invalid"));

        let r = record(r#"{"version": 5, "era": 0, "timescale": 0, "client_cookie": 0}"#);
        let v = analyze_version(5, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "75");
        assert!(v.analysis.contains("client cookie is invalid"));
    }

    #[test]
    fn test_v5_wrong_version() {
        let r = record(r#"{"version": 4}"#);
        let v = analyze_version(5, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "50");
        assert!(v.analysis.contains("different NTP version"));
    }

    #[test]
    fn test_v5_uninspectable() {
        let r = record(r#"{"version": 5}"#);
        let v = analyze_version(5, &ProbeOutcome::Parsed(&r), 4);
        assert_eq!(v.confidence, "25");
    }

    #[test]
    fn test_failed_and_invalid_outcomes() {
        let v = analyze_version(2, &ProbeOutcome::Failed("server did not respond"), 4);
        assert_eq!(v.confidence, "0");
        assert_eq!(v.analysis, "server did not respond");

        let v = analyze_version(3, &ProbeOutcome::Invalid, 4);
        assert_eq!(v.confidence, "0");
        assert!(v.analysis.contains("could not parse"));
    }
}
