use chrono::{DateTime, TimeZone, Utc};

/// Différence entre l'epoch NTP (1900-01-01) et l'epoch Unix (1970-01-01) en secondes
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Structure représentant un timestamp NTP (64 bits)
/// Format: 32 bits de secondes + 32 bits de fraction (epoch 1900-01-01 UTC)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Crée un timestamp NTP à partir des parties secondes et fraction
    pub fn from_parts(seconds: u32, fraction: u32) -> Self {
        NtpTimestamp(((seconds as u64) << 32) | fraction as u64)
    }

    /// Crée un timestamp NTP à partir de secondes et nanosecondes depuis l'epoch NTP
    pub fn from_seconds_and_nanos(seconds: u64, nanos: u32) -> Self {
        let fraction = ((nanos as u64) << 32) / 1_000_000_000;
        NtpTimestamp((seconds << 32) | fraction)
    }

    /// Convertit une date UTC en timestamp NTP (ajout de l'offset 1900→1970)
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let unix_seconds = dt.timestamp();
        let nanos = dt.timestamp_subsec_nanos();
        // Les dates antérieures à 1900 n'ont pas de représentation NTP era-1
        let ntp_seconds = (unix_seconds + NTP_UNIX_OFFSET as i64).max(0) as u64;
        Self::from_seconds_and_nanos(ntp_seconds, nanos)
    }

    /// Convertit le timestamp en date UTC (None si hors de l'ère Unix)
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let unix_seconds = (self.seconds() as i64) - NTP_UNIX_OFFSET as i64;
        let nanos = ((self.fraction() as u64 * 1_000_000_000) >> 32) as u32;
        Utc.timestamp_opt(unix_seconds, nanos).single()
    }

    /// Retourne la partie secondes du timestamp
    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Retourne la partie fraction du timestamp
    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }

    /// Valeur flottante en secondes depuis l'epoch NTP
    pub fn as_seconds_f64(&self) -> f64 {
        self.seconds() as f64 + self.fraction() as f64 / 2f64.powi(32)
    }
}
