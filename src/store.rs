/*!
Persistance des mesures

Schéma SQLite derrière un pool de connexions. Chaque étape du pipeline
écrit dans une transaction courte ; en cas d'erreur la transaction est
annulée et l'erreur remonte à l'orchestrateur.

Deux vues de lecture :
- la vue complète inline tous les enfants (enregistrements par version
  compris)
- la vue partielle ne donne que les identifiants des enfants lourds
  (résumé de versions, mesures IP filles), que le client re-demande
  séparément

Les colonnes id_v4_1..id_v4_4/id_v5 du résumé de versions sont des
références polymorphes : la table visée dépend de la version de la
réponse, elles ne portent donc pas de clause REFERENCES. L'invariant de
classement (table NTPv5 ssi version annoncée 5) est garanti à l'écriture.
*/

use crate::settings::AdvancedSettings;
use crate::timestamp::NtpTimestamp;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

/// Erreurs d'accès au stockage
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database insert failed: {0}")]
    Insert(String),

    #[error("database query failed: {0}")]
    Query(String),

    #[error("connection pool exhausted: {0}")]
    Pool(String),
}

type StoreResult<T> = Result<T, StoreError>;

/// Statut d'une mesure. La progression est monotone le long du treillis,
/// `finished` et `failed` sont absorbants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementStatus {
    Pending,
    RunningRipe,
    RunningNtpPerIp,
    RunningNts,
    RunningVersions,
    Finished,
    Failed,
}

impl MeasurementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementStatus::Pending => "pending",
            MeasurementStatus::RunningRipe => "running-ripe",
            MeasurementStatus::RunningNtpPerIp => "running-ntp-per-ip",
            MeasurementStatus::RunningNts => "running-nts",
            MeasurementStatus::RunningVersions => "running-versions",
            MeasurementStatus::Finished => "finished",
            MeasurementStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MeasurementStatus::Pending),
            "running-ripe" => Some(MeasurementStatus::RunningRipe),
            "running-ntp-per-ip" => Some(MeasurementStatus::RunningNtpPerIp),
            "running-nts" => Some(MeasurementStatus::RunningNts),
            "running-versions" => Some(MeasurementStatus::RunningVersions),
            "finished" => Some(MeasurementStatus::Finished),
            "failed" => Some(MeasurementStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MeasurementStatus::Finished | MeasurementStatus::Failed)
    }
}

/// Les deux familles de mesures racines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Dn,
    Ip,
}

impl MeasurementKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            MeasurementKind::Dn => "dn",
            MeasurementKind::Ip => "ip",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            MeasurementKind::Dn => "full_ntp_measurement_dn",
            MeasurementKind::Ip => "full_ntp_measurement_ip",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            MeasurementKind::Dn => "id_m_dn",
            MeasurementKind::Ip => "id_m_ip",
        }
    }
}

/// Données d'un enregistrement NTP au format V4 (les versions 1 à 4
/// partagent ce format)
#[derive(Debug, Clone, Default)]
pub struct NtpRecordData {
    pub host: String,
    pub measured_server_ip: Option<String>,
    pub version: Option<i64>,
    pub leap: Option<i64>,
    pub mode: Option<i64>,
    pub stratum: Option<i64>,
    pub poll: Option<i64>,
    pub precision: Option<f64>,
    pub root_delay: Option<f64>,
    pub root_disp: Option<f64>,
    pub offset: Option<f64>,
    pub rtt: Option<f64>,
    /// Identifiant de référence traduit (IP parente, kiss code, hash)
    pub ref_name: Option<String>,
    /// Identifiant de référence brut (32 bits)
    pub ref_id_raw: Option<i64>,
    pub client_sent: Option<NtpTimestamp>,
    pub server_recv: Option<NtpTimestamp>,
    pub server_sent: Option<NtpTimestamp>,
    pub client_recv: Option<NtpTimestamp>,
    pub ref_time: Option<NtpTimestamp>,
    pub extensions: Option<Value>,
}

/// Champs additionnels d'un enregistrement NTPv5
#[derive(Debug, Clone, Default)]
pub struct NtpV5Extras {
    pub draft_name: Option<String>,
    pub analysis: Option<String>,
    pub era: Option<i64>,
    pub timescale: Option<i64>,
    pub flags_raw: Option<i64>,
    pub flags_decoded: Option<String>,
    pub client_cookie: Option<String>,
    pub server_cookie: Option<String>,
}

/// Un enregistrement classé : la table de destination suit la version
/// annoncée par la réponse
#[derive(Debug, Clone)]
pub enum ClassifiedRecord {
    V4(NtpRecordData),
    V5(NtpRecordData, NtpV5Extras),
}

impl ClassifiedRecord {
    pub fn is_v5(&self) -> bool {
        matches!(self, ClassifiedRecord::V5(..))
    }
}

/// Métadonnées réseau du serveur mesuré, stockées à côté de chaque
/// enregistrement V4/V5
#[derive(Debug, Clone, Default)]
pub struct ServerInfoData {
    pub ip_is_anycast: bool,
    pub asn: Option<String>,
    pub country_code: Option<String>,
    pub coordinates: (f64, f64),
    pub vantage_point_ip: Option<String>,
}

/// Données d'une mesure NTS
#[derive(Debug, Clone, Default)]
pub struct NtsRecordData {
    pub succeeded: bool,
    pub analysis: Option<String>,
    pub host: Option<String>,
    pub measured_server_ip: Option<String>,
    pub measured_server_port: Option<i64>,
    pub offset: Option<f64>,
    pub rtt: Option<f64>,
    pub kiss_code: Option<String>,
    pub stratum: Option<i64>,
    pub poll: Option<i64>,
    pub measurement_type: Option<String>,
    pub client_sent: Option<NtpTimestamp>,
    pub server_recv: Option<NtpTimestamp>,
    pub server_sent: Option<NtpTimestamp>,
    pub client_recv: Option<NtpTimestamp>,
    pub ref_time: Option<NtpTimestamp>,
    pub leap: Option<i64>,
    pub mode: Option<i64>,
    pub version: Option<i64>,
    pub min_error: Option<f64>,
    pub precision: Option<f64>,
    pub root_delay: Option<f64>,
    pub root_disp: Option<f64>,
    pub root_dist: Option<f64>,
    pub ref_id: Option<String>,
    pub ref_id_raw: Option<String>,
}

/// Une entrée du résumé de versions (version N du balayage).
/// Une version non demandée garde tous ses champs à None.
#[derive(Debug, Clone, Default)]
pub struct VersionSlotInsert {
    pub confidence: Option<String>,
    pub analysis: Option<String>,
    pub response_version: Option<String>,
    pub record: Option<(ClassifiedRecord, ServerInfoData)>,
}

/// Le stockage partagé du service
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ntpv4_measurement (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    measured_server_ip TEXT,
    version INTEGER,
    leap INTEGER,
    mode INTEGER,
    stratum INTEGER,
    poll INTEGER,
    precision REAL,
    root_delay REAL,
    root_disp REAL,
    offset REAL,
    rtt REAL,
    ref_id TEXT,
    ref_id_raw INTEGER,
    client_sent_seconds INTEGER,
    client_sent_fraction INTEGER,
    server_recv_seconds INTEGER,
    server_recv_fraction INTEGER,
    server_sent_seconds INTEGER,
    server_sent_fraction INTEGER,
    client_recv_seconds INTEGER,
    client_recv_fraction INTEGER,
    ref_time_seconds INTEGER,
    ref_time_fraction INTEGER,
    extensions TEXT
);
CREATE INDEX IF NOT EXISTS idx_ntpv4_host ON ntpv4_measurement(host);
CREATE INDEX IF NOT EXISTS idx_ntpv4_ip ON ntpv4_measurement(measured_server_ip);
CREATE INDEX IF NOT EXISTS idx_ntpv4_client_sent ON ntpv4_measurement(client_sent_seconds);

CREATE TABLE IF NOT EXISTS ntpv5_measurement (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    measured_server_ip TEXT,
    version INTEGER,
    leap INTEGER,
    mode INTEGER,
    stratum INTEGER,
    poll INTEGER,
    precision REAL,
    root_delay REAL,
    root_disp REAL,
    offset REAL,
    rtt REAL,
    ref_id TEXT,
    ref_id_raw INTEGER,
    client_sent_seconds INTEGER,
    client_sent_fraction INTEGER,
    server_recv_seconds INTEGER,
    server_recv_fraction INTEGER,
    server_sent_seconds INTEGER,
    server_sent_fraction INTEGER,
    client_recv_seconds INTEGER,
    client_recv_fraction INTEGER,
    ref_time_seconds INTEGER,
    ref_time_fraction INTEGER,
    extensions TEXT,
    draft_name TEXT,
    analysis TEXT,
    era INTEGER,
    timescale INTEGER,
    flags_raw INTEGER,
    flags_decoded TEXT,
    client_cookie TEXT,
    server_cookie TEXT
);

CREATE TABLE IF NOT EXISTS server_info_v4 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    m_id INTEGER NOT NULL REFERENCES ntpv4_measurement(id),
    ip_is_anycast INTEGER NOT NULL DEFAULT 0,
    asn TEXT,
    country_code TEXT,
    coordinates_x REAL,
    coordinates_y REAL,
    vantage_point_ip TEXT
);

CREATE TABLE IF NOT EXISTS server_info_v5 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    m_id INTEGER NOT NULL REFERENCES ntpv5_measurement(id),
    ip_is_anycast INTEGER NOT NULL DEFAULT 0,
    asn TEXT,
    country_code TEXT,
    coordinates_x REAL,
    coordinates_y REAL,
    vantage_point_ip TEXT
);

CREATE TABLE IF NOT EXISTS nts_measurement (
    id_nts INTEGER PRIMARY KEY AUTOINCREMENT,
    succeeded INTEGER NOT NULL DEFAULT 0,
    analysis TEXT,
    host TEXT,
    measured_server_ip TEXT,
    measured_server_port INTEGER,
    offset REAL,
    rtt REAL,
    kiss_code TEXT,
    stratum INTEGER,
    poll INTEGER,
    measurement_type TEXT,
    client_sent_seconds INTEGER,
    client_sent_fraction INTEGER,
    server_recv_seconds INTEGER,
    server_recv_fraction INTEGER,
    server_sent_seconds INTEGER,
    server_sent_fraction INTEGER,
    client_recv_seconds INTEGER,
    client_recv_fraction INTEGER,
    ref_time_seconds INTEGER,
    ref_time_fraction INTEGER,
    leap INTEGER,
    mode INTEGER,
    version INTEGER,
    min_error REAL,
    precision REAL,
    root_delay REAL,
    root_disp REAL,
    root_dist REAL,
    ref_id TEXT,
    ref_id_raw TEXT
);

CREATE TABLE IF NOT EXISTS ntp_versions (
    id_vs INTEGER PRIMARY KEY AUTOINCREMENT,
    id_v4_1 INTEGER,
    id_v4_2 INTEGER,
    id_v4_3 INTEGER,
    id_v4_4 INTEGER,
    id_v5 INTEGER,
    ntpv1_response_version TEXT,
    ntpv2_response_version TEXT,
    ntpv3_response_version TEXT,
    ntpv4_response_version TEXT,
    ntpv5_response_version TEXT,
    ntpv1_supported_conf TEXT,
    ntpv2_supported_conf TEXT,
    ntpv3_supported_conf TEXT,
    ntpv4_supported_conf TEXT,
    ntpv5_supported_conf TEXT,
    ntpv1_analysis TEXT,
    ntpv2_analysis TEXT,
    ntpv3_analysis TEXT,
    ntpv4_analysis TEXT,
    ntpv5_analysis TEXT
);

CREATE TABLE IF NOT EXISTS full_ntp_measurement_ip (
    id_m_ip INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL,
    server_ip TEXT NOT NULL,
    created_at_time TEXT NOT NULL,
    id_nts INTEGER REFERENCES nts_measurement(id_nts),
    id_vs INTEGER REFERENCES ntp_versions(id_vs),
    id_ripe INTEGER,
    response_version TEXT,
    ripe_error TEXT,
    response_error TEXT,
    id_main_measurement INTEGER,
    settings TEXT
);

CREATE TABLE IF NOT EXISTS full_ntp_measurement_dn (
    id_m_dn INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL,
    server TEXT NOT NULL,
    created_at_time TEXT NOT NULL,
    id_nts INTEGER REFERENCES nts_measurement(id_nts),
    id_vs INTEGER REFERENCES ntp_versions(id_vs),
    id_ripe INTEGER,
    ripe_error TEXT,
    response_error TEXT,
    settings TEXT
);

CREATE TABLE IF NOT EXISTS dn_ip_link (
    id_dn INTEGER NOT NULL REFERENCES full_ntp_measurement_dn(id_m_dn),
    id_ip INTEGER NOT NULL REFERENCES full_ntp_measurement_ip(id_m_ip),
    PRIMARY KEY (id_dn, id_ip)
);
"#;

impl Store {
    /// Ouvre (ou crée) la base et initialise le schéma
    pub fn open(path: &str) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(Store { pool })
    }

    fn conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Crée une mesure racine `dn` à l'état pending
    pub fn create_dn(&self, server: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO full_ntp_measurement_dn (status, server, created_at_time) VALUES (?1, ?2, ?3)",
            params![MeasurementStatus::Pending.as_str(), server, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Crée une mesure racine ou fille `ip` à l'état pending
    pub fn create_ip(&self, server_ip: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO full_ntp_measurement_ip (status, server_ip, created_at_time) VALUES (?1, ?2, ?3)",
            params![MeasurementStatus::Pending.as_str(), server_ip, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Lie une mesure `ip` fille à sa racine `dn` (l'ordre d'insertion
    /// est l'ordre de lecture)
    pub fn link_dn_ip(&self, dn_id: i64, ip_id: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO dn_ip_link (id_dn, id_ip) VALUES (?1, ?2)",
            params![dn_id, ip_id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(())
    }

    /// Statut actuel d'une mesure
    pub fn status_of(&self, kind: MeasurementKind, id: i64) -> StoreResult<Option<MeasurementStatus>> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                &format!("SELECT status FROM {} WHERE {} = ?1", kind.table(), kind.id_column()),
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(status.and_then(|s| MeasurementStatus::parse(&s)))
    }

    /// Avance le statut d'une mesure. Les états terminaux sont absorbants :
    /// une mesure finie ou échouée n'est jamais modifiée.
    pub fn set_status(&self, kind: MeasurementKind, id: i64, status: MeasurementStatus) -> StoreResult<()> {
        if let Some(current) = self.status_of(kind, id)? {
            if current.is_terminal() {
                warn!(
                    "Refusing to move {}{} from terminal state {}",
                    kind.prefix(),
                    id,
                    current.as_str()
                );
                return Ok(());
            }
        }
        let conn = self.conn()?;
        conn.execute(
            &format!("UPDATE {} SET status = ?1 WHERE {} = ?2", kind.table(), kind.id_column()),
            params![status.as_str(), id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(())
    }

    /// Marque une mesure comme échouée avec sa cause, sauf si elle a déjà
    /// atteint un état terminal
    pub fn mark_failed(&self, kind: MeasurementKind, id: i64, error: &str) -> StoreResult<()> {
        if let Some(current) = self.status_of(kind, id)? {
            if current.is_terminal() {
                return Ok(());
            }
        }
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, response_error = ?2 WHERE {} = ?3",
                kind.table(),
                kind.id_column()
            ),
            params![MeasurementStatus::Failed.as_str(), error, id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(())
    }

    pub fn set_ripe_id(&self, kind: MeasurementKind, id: i64, ripe_id: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("UPDATE {} SET id_ripe = ?1 WHERE {} = ?2", kind.table(), kind.id_column()),
            params![ripe_id, id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(())
    }

    pub fn set_ripe_error(&self, kind: MeasurementKind, id: i64, message: &str) -> StoreResult<()> {
        self.update_text_field(kind, id, "ripe_error", message)
    }

    pub fn set_response_error(&self, kind: MeasurementKind, id: i64, message: &str) -> StoreResult<()> {
        self.update_text_field(kind, id, "response_error", message)
    }

    fn update_text_field(
        &self,
        kind: MeasurementKind,
        id: i64,
        column: &str,
        value: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                kind.table(),
                column,
                kind.id_column()
            ),
            params![value, id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(())
    }

    /// Persiste la mesure NTP principale d'une mesure `ip` : insertion de
    /// l'enregistrement classé, de ses métadonnées serveur, et rattachement
    /// au parent, le tout dans une transaction
    pub fn record_primary_ntp(
        &self,
        ip_id: i64,
        record: &ClassifiedRecord,
        info: &ServerInfoData,
        response_version: &str,
    ) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Insert(e.to_string()))?;

        let record_id = insert_classified_record(&tx, record)?;
        insert_server_info(&tx, record_id, record.is_v5(), info)?;
        tx.execute(
            "UPDATE full_ntp_measurement_ip SET id_main_measurement = ?1, response_version = ?2 WHERE id_m_ip = ?3",
            params![record_id, response_version, ip_id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;

        tx.commit().map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(record_id)
    }

    /// Persiste une mesure NTS et la rattache à sa mesure parente
    pub fn record_nts(&self, kind: MeasurementKind, id: i64, nts: &NtsRecordData) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Insert(e.to_string()))?;

        let nts_id = insert_nts_record(&tx, nts)?;
        tx.execute(
            &format!("UPDATE {} SET id_nts = ?1 WHERE {} = ?2", kind.table(), kind.id_column()),
            params![nts_id, id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;

        tx.commit().map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(nts_id)
    }

    /// Persiste un résumé de versions complet (5 entrées, enregistrements
    /// classés compris) et le rattache à sa mesure parente
    pub fn record_versions(
        &self,
        kind: MeasurementKind,
        id: i64,
        slots: &[VersionSlotInsert; 5],
    ) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Insert(e.to_string()))?;

        let mut record_ids: [Option<i64>; 5] = [None; 5];
        for (i, slot) in slots.iter().enumerate() {
            if let Some((record, info)) = &slot.record {
                let record_id = insert_classified_record(&tx, record)?;
                insert_server_info(&tx, record_id, record.is_v5(), info)?;
                record_ids[i] = Some(record_id);
            }
        }

        tx.execute(
            "INSERT INTO ntp_versions (
                id_v4_1, id_v4_2, id_v4_3, id_v4_4, id_v5,
                ntpv1_response_version, ntpv2_response_version, ntpv3_response_version,
                ntpv4_response_version, ntpv5_response_version,
                ntpv1_supported_conf, ntpv2_supported_conf, ntpv3_supported_conf,
                ntpv4_supported_conf, ntpv5_supported_conf,
                ntpv1_analysis, ntpv2_analysis, ntpv3_analysis, ntpv4_analysis, ntpv5_analysis
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                record_ids[0],
                record_ids[1],
                record_ids[2],
                record_ids[3],
                record_ids[4],
                slots[0].response_version,
                slots[1].response_version,
                slots[2].response_version,
                slots[3].response_version,
                slots[4].response_version,
                slots[0].confidence,
                slots[1].confidence,
                slots[2].confidence,
                slots[3].confidence,
                slots[4].confidence,
                slots[0].analysis,
                slots[1].analysis,
                slots[2].analysis,
                slots[3].analysis,
                slots[4].analysis,
            ],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        let vs_id = tx.last_insert_rowid();

        tx.execute(
            &format!("UPDATE {} SET id_vs = ?1 WHERE {} = ?2", kind.table(), kind.id_column()),
            params![vs_id, id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;

        tx.commit().map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(vs_id)
    }

    /// Clôture une mesure : paramètres effectifs + statut finished
    pub fn finish(&self, kind: MeasurementKind, id: i64, settings: &AdvancedSettings) -> StoreResult<()> {
        if let Some(current) = self.status_of(kind, id)? {
            if current.is_terminal() {
                return Ok(());
            }
        }
        let settings_json =
            serde_json::to_string(settings).map_err(|e| StoreError::Insert(e.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "UPDATE {} SET settings = ?1, status = ?2 WHERE {} = ?3",
                kind.table(),
                kind.id_column()
            ),
            params![settings_json, MeasurementStatus::Finished.as_str(), id],
        )
        .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(())
    }

    /// Insère un enregistrement V4 isolé (mesure synchrone, historique)
    pub fn insert_history_record(&self, record: &NtpRecordData) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Insert(e.to_string()))?;
        let id = insert_v4_record(&tx, record)?;
        tx.commit().map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(id)
    }

    /// Les N derniers offsets mesurés vers cette IP (entrée du jitter)
    pub fn last_offsets(&self, ip: &str, n: usize) -> StoreResult<Vec<f64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT offset FROM ntpv4_measurement
                 WHERE measured_server_ip = ?1 AND offset IS NOT NULL
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let rows = stmt
            .query_map(params![ip, n as i64], |row| row.get::<_, f64>(0))
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let mut offsets = Vec::new();
        for row in rows {
            offsets.push(row.map_err(|e| StoreError::Query(e.to_string()))?);
        }
        Ok(offsets)
    }

    /// Enregistrements V4 historiques d'une cible (nom ou IP) dont l'envoi
    /// client tombe dans la plage NTP donnée
    pub fn history(
        &self,
        target: &str,
        start: NtpTimestamp,
        end: NtpTimestamp,
    ) -> StoreResult<Vec<Value>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM ntpv4_measurement
                 WHERE (host = ?1 OR measured_server_ip = ?1)
                   AND client_sent_seconds >= ?2 AND client_sent_seconds <= ?3
                 ORDER BY id",
            )
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let ids = stmt
            .query_map(
                params![target, start.seconds() as i64, end.seconds() as i64],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut records = Vec::new();
        for id in ids {
            let id = id.map_err(|e| StoreError::Query(e.to_string()))?;
            if let Some(value) = ntp_record_json(&conn, id, false)? {
                records.push(value);
            }
        }
        Ok(records)
    }

    /// Vue complète : l'entité et tous ses enfants inline
    pub fn full_view(&self, kind: MeasurementKind, id: i64) -> StoreResult<Option<Value>> {
        let conn = self.conn()?;
        match kind {
            MeasurementKind::Ip => ip_view(&conn, id, false, true),
            MeasurementKind::Dn => dn_view(&conn, id, true),
        }
    }

    /// Vue partielle : l'entité et les identifiants de ses enfants lourds
    pub fn partial_view(&self, kind: MeasurementKind, id: i64) -> StoreResult<Option<Value>> {
        let conn = self.conn()?;
        match kind {
            MeasurementKind::Ip => ip_view(&conn, id, false, false),
            MeasurementKind::Dn => dn_view(&conn, id, false),
        }
    }

    /// Vue du résumé de versions seul, par identifiant numérique
    pub fn versions_view(&self, vs_id: i64) -> StoreResult<Option<Value>> {
        let conn = self.conn()?;
        versions_json(&conn, vs_id)
    }
}

// ---------------------------------------------------------------------------
// Écriture des enregistrements

fn insert_classified_record(tx: &Transaction, record: &ClassifiedRecord) -> StoreResult<i64> {
    match record {
        ClassifiedRecord::V4(data) => insert_v4_record(tx, data),
        ClassifiedRecord::V5(data, extras) => insert_v5_record(tx, data, extras),
    }
}

fn ts_parts(ts: &Option<NtpTimestamp>) -> (Option<i64>, Option<i64>) {
    match ts {
        Some(t) => (Some(t.seconds() as i64), Some(t.fraction() as i64)),
        None => (None, None),
    }
}

fn insert_v4_record(conn: &Connection, data: &NtpRecordData) -> StoreResult<i64> {
    let (cs_s, cs_f) = ts_parts(&data.client_sent);
    let (sr_s, sr_f) = ts_parts(&data.server_recv);
    let (ss_s, ss_f) = ts_parts(&data.server_sent);
    let (cr_s, cr_f) = ts_parts(&data.client_recv);
    let (rt_s, rt_f) = ts_parts(&data.ref_time);
    conn.execute(
        "INSERT INTO ntpv4_measurement (
            host, measured_server_ip, version, leap, mode, stratum, poll,
            precision, root_delay, root_disp, offset, rtt, ref_id, ref_id_raw,
            client_sent_seconds, client_sent_fraction,
            server_recv_seconds, server_recv_fraction,
            server_sent_seconds, server_sent_fraction,
            client_recv_seconds, client_recv_fraction,
            ref_time_seconds, ref_time_fraction,
            extensions
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        params![
            data.host,
            data.measured_server_ip,
            data.version,
            data.leap,
            data.mode,
            data.stratum,
            data.poll,
            data.precision,
            data.root_delay,
            data.root_disp,
            data.offset,
            data.rtt,
            data.ref_name,
            data.ref_id_raw,
            cs_s,
            cs_f,
            sr_s,
            sr_f,
            ss_s,
            ss_f,
            cr_s,
            cr_f,
            rt_s,
            rt_f,
            data.extensions.as_ref().map(|v| v.to_string()),
        ],
    )
    .map_err(|e| StoreError::Insert(e.to_string()))?;
    Ok(conn.last_insert_rowid())
}

fn insert_v5_record(conn: &Connection, data: &NtpRecordData, extras: &NtpV5Extras) -> StoreResult<i64> {
    let (cs_s, cs_f) = ts_parts(&data.client_sent);
    let (sr_s, sr_f) = ts_parts(&data.server_recv);
    let (ss_s, ss_f) = ts_parts(&data.server_sent);
    let (cr_s, cr_f) = ts_parts(&data.client_recv);
    let (rt_s, rt_f) = ts_parts(&data.ref_time);
    conn.execute(
        "INSERT INTO ntpv5_measurement (
            host, measured_server_ip, version, leap, mode, stratum, poll,
            precision, root_delay, root_disp, offset, rtt, ref_id, ref_id_raw,
            client_sent_seconds, client_sent_fraction,
            server_recv_seconds, server_recv_fraction,
            server_sent_seconds, server_sent_fraction,
            client_recv_seconds, client_recv_fraction,
            ref_time_seconds, ref_time_fraction,
            extensions, draft_name, analysis, era, timescale, flags_raw,
            flags_decoded, client_cookie, server_cookie
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                  ?27, ?28, ?29, ?30, ?31, ?32, ?33)",
        params![
            data.host,
            data.measured_server_ip,
            data.version,
            data.leap,
            data.mode,
            data.stratum,
            data.poll,
            data.precision,
            data.root_delay,
            data.root_disp,
            data.offset,
            data.rtt,
            data.ref_name,
            data.ref_id_raw,
            cs_s,
            cs_f,
            sr_s,
            sr_f,
            ss_s,
            ss_f,
            cr_s,
            cr_f,
            rt_s,
            rt_f,
            data.extensions.as_ref().map(|v| v.to_string()),
            extras.draft_name,
            extras.analysis,
            extras.era,
            extras.timescale,
            extras.flags_raw,
            extras.flags_decoded,
            extras.client_cookie,
            extras.server_cookie,
        ],
    )
    .map_err(|e| StoreError::Insert(e.to_string()))?;
    Ok(conn.last_insert_rowid())
}

fn insert_server_info(
    conn: &Connection,
    m_id: i64,
    is_v5: bool,
    info: &ServerInfoData,
) -> StoreResult<()> {
    let table = if is_v5 { "server_info_v5" } else { "server_info_v4" };
    conn.execute(
        &format!(
            "INSERT INTO {} (m_id, ip_is_anycast, asn, country_code, coordinates_x, coordinates_y, vantage_point_ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            table
        ),
        params![
            m_id,
            info.ip_is_anycast,
            info.asn,
            info.country_code,
            info.coordinates.0,
            info.coordinates.1,
            info.vantage_point_ip,
        ],
    )
    .map_err(|e| StoreError::Insert(e.to_string()))?;
    Ok(())
}

fn insert_nts_record(conn: &Connection, nts: &NtsRecordData) -> StoreResult<i64> {
    let (cs_s, cs_f) = ts_parts(&nts.client_sent);
    let (sr_s, sr_f) = ts_parts(&nts.server_recv);
    let (ss_s, ss_f) = ts_parts(&nts.server_sent);
    let (cr_s, cr_f) = ts_parts(&nts.client_recv);
    let (rt_s, rt_f) = ts_parts(&nts.ref_time);
    conn.execute(
        "INSERT INTO nts_measurement (
            succeeded, analysis, host, measured_server_ip, measured_server_port,
            offset, rtt, kiss_code, stratum, poll, measurement_type,
            client_sent_seconds, client_sent_fraction,
            server_recv_seconds, server_recv_fraction,
            server_sent_seconds, server_sent_fraction,
            client_recv_seconds, client_recv_fraction,
            ref_time_seconds, ref_time_fraction,
            leap, mode, version, min_error, precision,
            root_delay, root_disp, root_dist, ref_id, ref_id_raw
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                  ?27, ?28, ?29, ?30, ?31)",
        params![
            nts.succeeded,
            nts.analysis,
            nts.host,
            nts.measured_server_ip,
            nts.measured_server_port,
            nts.offset,
            nts.rtt,
            nts.kiss_code,
            nts.stratum,
            nts.poll,
            nts.measurement_type,
            cs_s,
            cs_f,
            sr_s,
            sr_f,
            ss_s,
            ss_f,
            cr_s,
            cr_f,
            rt_s,
            rt_f,
            nts.leap,
            nts.mode,
            nts.version,
            nts.min_error,
            nts.precision,
            nts.root_delay,
            nts.root_disp,
            nts.root_dist,
            nts.ref_id,
            nts.ref_id_raw,
        ],
    )
    .map_err(|e| StoreError::Insert(e.to_string()))?;
    Ok(conn.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Assemblage des vues JSON

fn ts_json(seconds: Option<i64>, fraction: Option<i64>) -> Value {
    match (seconds, fraction) {
        (Some(s), Some(f)) => json!({ "seconds": s, "fraction": f }),
        _ => Value::Null,
    }
}

fn parse_json_column(text: Option<String>) -> Value {
    text.and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or(Value::Null)
}

/// JSON d'un enregistrement V4 ou V5, avec ses métadonnées serveur
fn ntp_record_json(conn: &Connection, id: i64, is_v5: bool) -> StoreResult<Option<Value>> {
    let table = if is_v5 { "ntpv5_measurement" } else { "ntpv4_measurement" };
    let extra_cols = if is_v5 {
        ", draft_name, analysis, era, timescale, flags_raw, flags_decoded, client_cookie, server_cookie"
    } else {
        ""
    };
    let sql = format!(
        "SELECT host, measured_server_ip, version, leap, mode, stratum, poll,
                precision, root_delay, root_disp, offset, rtt, ref_id, ref_id_raw,
                client_sent_seconds, client_sent_fraction,
                server_recv_seconds, server_recv_fraction,
                server_sent_seconds, server_sent_fraction,
                client_recv_seconds, client_recv_fraction,
                ref_time_seconds, ref_time_fraction,
                extensions{} FROM {} WHERE id = ?1",
        extra_cols, table
    );

    let record = conn
        .query_row(&sql, params![id], |row| {
            let mut value = json!({
                "id": id,
                "host": row.get::<_, Option<String>>(0)?,
                "measured_server_ip": row.get::<_, Option<String>>(1)?,
                "version": row.get::<_, Option<i64>>(2)?,
                "leap": row.get::<_, Option<i64>>(3)?,
                "mode": row.get::<_, Option<i64>>(4)?,
                "stratum": row.get::<_, Option<i64>>(5)?,
                "poll": row.get::<_, Option<i64>>(6)?,
                "precision": row.get::<_, Option<f64>>(7)?,
                "root_delay": row.get::<_, Option<f64>>(8)?,
                "root_disp": row.get::<_, Option<f64>>(9)?,
                "offset": row.get::<_, Option<f64>>(10)?,
                "rtt": row.get::<_, Option<f64>>(11)?,
                "ref_id": row.get::<_, Option<String>>(12)?,
                "ref_id_raw": row.get::<_, Option<i64>>(13)?,
                "client_sent_time": ts_json(row.get(14)?, row.get(15)?),
                "server_recv_time": ts_json(row.get(16)?, row.get(17)?),
                "server_sent_time": ts_json(row.get(18)?, row.get(19)?),
                "client_recv_time": ts_json(row.get(20)?, row.get(21)?),
                "ref_time": ts_json(row.get(22)?, row.get(23)?),
                "extensions": parse_json_column(row.get::<_, Option<String>>(24)?),
            });
            if is_v5 {
                value["draft_name"] = json!(row.get::<_, Option<String>>(25)?);
                value["analysis"] = json!(row.get::<_, Option<String>>(26)?);
                value["era"] = json!(row.get::<_, Option<i64>>(27)?);
                value["timescale"] = json!(row.get::<_, Option<i64>>(28)?);
                value["flags_raw"] = json!(row.get::<_, Option<i64>>(29)?);
                value["flags_decoded"] = json!(row.get::<_, Option<String>>(30)?);
                value["client_cookie"] = json!(row.get::<_, Option<String>>(31)?);
                value["server_cookie"] = json!(row.get::<_, Option<String>>(32)?);
            }
            Ok(value)
        })
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;

    let mut record = match record {
        Some(r) => r,
        None => return Ok(None),
    };

    let info_table = if is_v5 { "server_info_v5" } else { "server_info_v4" };
    let info = conn
        .query_row(
            &format!(
                "SELECT ip_is_anycast, asn, country_code, coordinates_x, coordinates_y, vantage_point_ip
                 FROM {} WHERE m_id = ?1",
                info_table
            ),
            params![id],
            |row| {
                Ok(json!({
                    "ip_is_anycast": row.get::<_, bool>(0)?,
                    "asn": row.get::<_, Option<String>>(1)?,
                    "country_code": row.get::<_, Option<String>>(2)?,
                    "coordinates": [row.get::<_, Option<f64>>(3)?, row.get::<_, Option<f64>>(4)?],
                    "vantage_point_ip": row.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;
    record["server_info"] = info.unwrap_or(Value::Null);

    Ok(Some(record))
}

/// JSON d'un enregistrement référencé par un résumé ou une mesure ip,
/// la table étant choisie par la version de la réponse
fn record_by_response_version(
    conn: &Connection,
    record_id: Option<i64>,
    response_version: Option<&str>,
) -> StoreResult<Value> {
    match (record_id, response_version) {
        (Some(id), Some(version)) => {
            Ok(ntp_record_json(conn, id, version == "ntpv5")?.unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    }
}

fn nts_json(conn: &Connection, nts_id: Option<i64>) -> StoreResult<Value> {
    let id = match nts_id {
        Some(id) => id,
        None => return Ok(Value::Null),
    };
    let value = conn
        .query_row(
            "SELECT succeeded, analysis, host, measured_server_ip, measured_server_port,
                    offset, rtt, kiss_code, stratum, poll, measurement_type,
                    client_sent_seconds, client_sent_fraction,
                    server_recv_seconds, server_recv_fraction,
                    server_sent_seconds, server_sent_fraction,
                    client_recv_seconds, client_recv_fraction,
                    ref_time_seconds, ref_time_fraction,
                    leap, mode, version, min_error, precision,
                    root_delay, root_disp, root_dist, ref_id, ref_id_raw
             FROM nts_measurement WHERE id_nts = ?1",
            params![id],
            |row| {
                Ok(json!({
                    "nts_id": id,
                    "nts_succeeded": row.get::<_, bool>(0)?,
                    "nts_analysis": row.get::<_, Option<String>>(1)?,
                    "host": row.get::<_, Option<String>>(2)?,
                    "measured_server_ip": row.get::<_, Option<String>>(3)?,
                    "measured_server_port": row.get::<_, Option<i64>>(4)?,
                    "offset": row.get::<_, Option<f64>>(5)?,
                    "rtt": row.get::<_, Option<f64>>(6)?,
                    "kiss_code": row.get::<_, Option<String>>(7)?,
                    "stratum": row.get::<_, Option<i64>>(8)?,
                    "poll": row.get::<_, Option<i64>>(9)?,
                    "nts_measurement_version": row.get::<_, Option<String>>(10)?,
                    "client_sent_time": ts_json(row.get(11)?, row.get(12)?),
                    "server_recv_time": ts_json(row.get(13)?, row.get(14)?),
                    "server_sent_time": ts_json(row.get(15)?, row.get(16)?),
                    "client_recv_time": ts_json(row.get(17)?, row.get(18)?),
                    "ref_time": ts_json(row.get(19)?, row.get(20)?),
                    "leap": row.get::<_, Option<i64>>(21)?,
                    "mode": row.get::<_, Option<i64>>(22)?,
                    "version": row.get::<_, Option<i64>>(23)?,
                    "min_error": row.get::<_, Option<f64>>(24)?,
                    "precision": row.get::<_, Option<f64>>(25)?,
                    "root_delay": row.get::<_, Option<f64>>(26)?,
                    "root_disp": row.get::<_, Option<f64>>(27)?,
                    "root_dist": row.get::<_, Option<f64>>(28)?,
                    "ref_id": row.get::<_, Option<String>>(29)?,
                    "ref_id_raw": row.get::<_, Option<String>>(30)?,
                }))
            },
        )
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;
    Ok(value.unwrap_or(Value::Null))
}

fn versions_json(conn: &Connection, vs_id: i64) -> StoreResult<Option<Value>> {
    let row = conn
        .query_row(
            "SELECT id_v4_1, id_v4_2, id_v4_3, id_v4_4, id_v5,
                    ntpv1_response_version, ntpv2_response_version, ntpv3_response_version,
                    ntpv4_response_version, ntpv5_response_version,
                    ntpv1_supported_conf, ntpv2_supported_conf, ntpv3_supported_conf,
                    ntpv4_supported_conf, ntpv5_supported_conf,
                    ntpv1_analysis, ntpv2_analysis, ntpv3_analysis, ntpv4_analysis, ntpv5_analysis
             FROM ntp_versions WHERE id_vs = ?1",
            params![vs_id],
            |row| {
                let mut ids = Vec::new();
                let mut versions = Vec::new();
                let mut confs = Vec::new();
                let mut analyses = Vec::new();
                for i in 0..5 {
                    ids.push(row.get::<_, Option<i64>>(i)?);
                    versions.push(row.get::<_, Option<String>>(5 + i)?);
                    confs.push(row.get::<_, Option<String>>(10 + i)?);
                    analyses.push(row.get::<_, Option<String>>(15 + i)?);
                }
                Ok((ids, versions, confs, analyses))
            },
        )
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;

    let (ids, versions, confs, analyses) = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let mut value = json!({ "id_vs": vs_id });
    for i in 0..5 {
        let n = i + 1;
        value[format!("ntpv{}_supported_conf", n)] = json!(confs[i]);
        value[format!("ntpv{}_analysis", n)] = json!(analyses[i]);
        value[format!("ntpv{}_response_version", n)] = json!(versions[i]);
        value[format!("ntpv{}_data", n)] =
            record_by_response_version(conn, ids[i], versions[i].as_deref())?;
    }
    Ok(Some(value))
}

struct IpRow {
    id: i64,
    status: String,
    server_ip: String,
    created_at: String,
    id_nts: Option<i64>,
    id_vs: Option<i64>,
    id_ripe: Option<i64>,
    response_version: Option<String>,
    ripe_error: Option<String>,
    response_error: Option<String>,
    id_main_measurement: Option<i64>,
    settings: Option<String>,
}

fn fetch_ip_row(conn: &Connection, id: i64) -> StoreResult<Option<IpRow>> {
    conn.query_row(
        "SELECT id_m_ip, status, server_ip, created_at_time, id_nts, id_vs, id_ripe,
                response_version, ripe_error, response_error, id_main_measurement, settings
         FROM full_ntp_measurement_ip WHERE id_m_ip = ?1",
        params![id],
        |row| {
            Ok(IpRow {
                id: row.get(0)?,
                status: row.get(1)?,
                server_ip: row.get(2)?,
                created_at: row.get(3)?,
                id_nts: row.get(4)?,
                id_vs: row.get(5)?,
                id_ripe: row.get(6)?,
                response_version: row.get(7)?,
                ripe_error: row.get(8)?,
                response_error: row.get(9)?,
                id_main_measurement: row.get(10)?,
                settings: row.get(11)?,
            })
        },
    )
    .optional()
    .map_err(|e| StoreError::Query(e.to_string()))
}

/// Vue d'une mesure ip. `part_of_dn` omet les champs redondants avec le
/// parent (settings, id_ripe) ; `full` inline le résumé de versions.
fn ip_view(conn: &Connection, id: i64, part_of_dn: bool, full: bool) -> StoreResult<Option<Value>> {
    let row = match fetch_ip_row(conn, id)? {
        Some(r) => r,
        None => return Ok(None),
    };

    let mut value = json!({
        "search_id": format!("ip{}", row.id),
        "status": row.status,
        "server": row.server_ip,
        "created_at_time": row.created_at,
        "main_measurement": record_by_response_version(
            conn,
            row.id_main_measurement,
            row.response_version.as_deref()
        )?,
        "nts": nts_json(conn, row.id_nts)?,
        "response_version": row.response_version,
        "response_error": row.response_error,
    });

    if full {
        value["ntp_versions"] = match row.id_vs {
            Some(vs) => versions_json(conn, vs)?.unwrap_or(Value::Null),
            None => Value::Null,
        };
    } else {
        value["ntp_versions_id"] = json!(row.id_vs);
    }

    if !part_of_dn {
        value["id_ripe"] = json!(row.id_ripe);
        value["ripe_error"] = json!(row.ripe_error);
        value["settings"] = parse_json_column(row.settings);
    }

    Ok(Some(value))
}

fn dn_view(conn: &Connection, id: i64, full: bool) -> StoreResult<Option<Value>> {
    let row = conn
        .query_row(
            "SELECT id_m_dn, status, server, created_at_time, id_nts, id_vs, id_ripe,
                    ripe_error, response_error, settings
             FROM full_ntp_measurement_dn WHERE id_m_dn = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;

    let (dn_id, status, server, created_at, id_nts, id_vs, id_ripe, ripe_error, response_error, settings) =
        match row {
            Some(r) => r,
            None => return Ok(None),
        };

    // Les IP filles, dans l'ordre d'insertion des liens
    let mut stmt = conn
        .prepare("SELECT id_ip FROM dn_ip_link WHERE id_dn = ?1 ORDER BY rowid")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let child_ids: Vec<i64> = stmt
        .query_map(params![dn_id], |row| row.get(0))
        .map_err(|e| StoreError::Query(e.to_string()))?
        .filter_map(|r| r.ok())
        .collect();

    let mut value = json!({
        "search_id": format!("dn{}", dn_id),
        "status": status,
        "server": server,
        "created_at_time": created_at,
        "nts": nts_json(conn, id_nts)?,
        "id_ripe": id_ripe,
        "ripe_error": ripe_error,
        "response_error": response_error,
        "settings": parse_json_column(settings),
    });

    if full {
        value["ntp_versions"] = match id_vs {
            Some(vs) => versions_json(conn, vs)?.unwrap_or(Value::Null),
            None => Value::Null,
        };
        let mut children = Vec::new();
        for child_id in &child_ids {
            if let Some(child) = ip_view(conn, *child_id, true, true)? {
                children.push(child);
            }
        }
        value["ip_measurements"] = json!(children);
    } else {
        value["ntp_versions_id"] = json!(id_vs);
        value["ip_measurements_ids"] = json!(child_ids
            .iter()
            .map(|id| format!("ip{}", id))
            .collect::<Vec<_>>());
    }

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    fn sample_record(host: &str, ip: &str, version: i64) -> NtpRecordData {
        NtpRecordData {
            host: host.to_string(),
            measured_server_ip: Some(ip.to_string()),
            version: Some(version),
            stratum: Some(2),
            offset: Some(0.001),
            rtt: Some(0.02),
            client_sent: Some(NtpTimestamp::from_parts(3_900_000_100, 7)),
            server_recv: Some(NtpTimestamp::from_parts(3_900_000_100, 9)),
            ..NtpRecordData::default()
        }
    }

    #[test]
    fn test_create_and_status_lattice() {
        let (store, _dir) = open_store();
        let id = store.create_ip("1.2.3.4").unwrap();
        assert_eq!(
            store.status_of(MeasurementKind::Ip, id).unwrap(),
            Some(MeasurementStatus::Pending)
        );

        store
            .set_status(MeasurementKind::Ip, id, MeasurementStatus::RunningNts)
            .unwrap();
        assert_eq!(
            store.status_of(MeasurementKind::Ip, id).unwrap(),
            Some(MeasurementStatus::RunningNts)
        );
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let (store, _dir) = open_store();
        let id = store.create_ip("1.2.3.4").unwrap();

        store.mark_failed(MeasurementKind::Ip, id, "boom").unwrap();
        assert_eq!(
            store.status_of(MeasurementKind::Ip, id).unwrap(),
            Some(MeasurementStatus::Failed)
        );

        // Ni set_status ni finish ne peuvent quitter failed
        store
            .set_status(MeasurementKind::Ip, id, MeasurementStatus::RunningNts)
            .unwrap();
        assert_eq!(
            store.status_of(MeasurementKind::Ip, id).unwrap(),
            Some(MeasurementStatus::Failed)
        );
        store
            .finish(MeasurementKind::Ip, id, &AdvancedSettings::default())
            .unwrap();
        assert_eq!(
            store.status_of(MeasurementKind::Ip, id).unwrap(),
            Some(MeasurementStatus::Failed)
        );

        // Et un finished ne devient pas failed
        let id2 = store.create_ip("5.6.7.8").unwrap();
        store
            .finish(MeasurementKind::Ip, id2, &AdvancedSettings::default())
            .unwrap();
        store.mark_failed(MeasurementKind::Ip, id2, "late error").unwrap();
        assert_eq!(
            store.status_of(MeasurementKind::Ip, id2).unwrap(),
            Some(MeasurementStatus::Finished)
        );
    }

    #[test]
    fn test_classification_on_write() {
        let (store, _dir) = open_store();
        let ip_id = store.create_ip("1.2.3.4").unwrap();

        let record = ClassifiedRecord::V4(sample_record("1.2.3.4", "1.2.3.4", 4));
        let info = ServerInfoData {
            ip_is_anycast: false,
            coordinates: (52.0, 4.0),
            ..ServerInfoData::default()
        };
        store
            .record_primary_ntp(ip_id, &record, &info, "ntpv4")
            .unwrap();

        let view = store.full_view(MeasurementKind::Ip, ip_id).unwrap().unwrap();
        assert_eq!(view["response_version"], "ntpv4");
        assert_eq!(view["main_measurement"]["version"], 4);
        assert_eq!(view["main_measurement"]["server_info"]["coordinates"][0], 52.0);

        // Un enregistrement v5 atterrit dans l'autre table, avec ses extras
        let ip_id5 = store.create_ip("9.9.9.9").unwrap();
        let record5 = ClassifiedRecord::V5(
            sample_record("9.9.9.9", "9.9.9.9", 5),
            NtpV5Extras {
                era: Some(0),
                timescale: Some(0),
                client_cookie: Some("123".to_string()),
                ..NtpV5Extras::default()
            },
        );
        store
            .record_primary_ntp(ip_id5, &record5, &info, "ntpv5")
            .unwrap();
        let view5 = store.full_view(MeasurementKind::Ip, ip_id5).unwrap().unwrap();
        assert_eq!(view5["response_version"], "ntpv5");
        assert_eq!(view5["main_measurement"]["era"], 0);
    }

    #[test]
    fn test_nts_and_versions_attachment() {
        let (store, _dir) = open_store();
        let dn_id = store.create_dn("example.org").unwrap();

        let nts = NtsRecordData {
            succeeded: true,
            analysis: Some("It is NTS. One NTS IP is 1.2.3.4".to_string()),
            host: Some("example.org".to_string()),
            measured_server_ip: Some("1.2.3.4".to_string()),
            measured_server_port: Some(123),
            ..NtsRecordData::default()
        };
        store.record_nts(MeasurementKind::Dn, dn_id, &nts).unwrap();

        let info = ServerInfoData::default();
        let slots = [
            VersionSlotInsert {
                confidence: Some("100".to_string()),
                analysis: Some("It supports NTPv1.".to_string()),
                response_version: Some("ntpv1".to_string()),
                record: Some((ClassifiedRecord::V4(sample_record("example.org", "1.2.3.4", 1)), info.clone())),
            },
            VersionSlotInsert {
                confidence: Some("0".to_string()),
                analysis: Some("no response".to_string()),
                response_version: None,
                record: None,
            },
            // Version non demandée: tout reste null
            VersionSlotInsert::default(),
            VersionSlotInsert {
                confidence: Some("75 or 100".to_string()),
                analysis: Some("It supports NTPv4.".to_string()),
                response_version: Some("ntpv4".to_string()),
                record: Some((ClassifiedRecord::V4(sample_record("example.org", "1.2.3.4", 4)), info.clone())),
            },
            VersionSlotInsert {
                confidence: Some("100".to_string()),
                analysis: Some("It supports NTPv5.".to_string()),
                response_version: Some("ntpv5".to_string()),
                record: Some((
                    ClassifiedRecord::V5(
                        sample_record("example.org", "1.2.3.4", 5),
                        NtpV5Extras::default(),
                    ),
                    info.clone(),
                )),
            },
        ];
        let vs_id = store.record_versions(MeasurementKind::Dn, dn_id, &slots).unwrap();

        let versions = store.versions_view(vs_id).unwrap().unwrap();
        assert_eq!(versions["ntpv1_supported_conf"], "100");
        assert_eq!(versions["ntpv1_data"]["version"], 1);
        assert_eq!(versions["ntpv2_data"], Value::Null);
        assert_eq!(versions["ntpv5_response_version"], "ntpv5");
        assert_eq!(versions["ntpv5_data"]["version"], 5);

        let view = store.full_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();
        assert_eq!(view["nts"]["nts_succeeded"], true);
        assert_eq!(view["ntp_versions"]["id_vs"], vs_id);
    }

    #[test]
    fn test_partial_and_full_views_agree_on_ids() {
        let (store, _dir) = open_store();
        let dn_id = store.create_dn("example.org").unwrap();
        let child_a = store.create_ip("1.2.3.4").unwrap();
        let child_b = store.create_ip("5.6.7.8").unwrap();
        store.link_dn_ip(dn_id, child_a).unwrap();
        store.link_dn_ip(dn_id, child_b).unwrap();

        let full = store.full_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();
        let partial = store.partial_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();

        let full_ids: Vec<String> = full["ip_measurements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["search_id"].as_str().unwrap().to_string())
            .collect();
        let partial_ids: Vec<String> = partial["ip_measurements_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m.as_str().unwrap().to_string())
            .collect();

        assert_eq!(full_ids, partial_ids);
        // Ordre d'insertion préservé
        assert_eq!(partial_ids, vec![format!("ip{}", child_a), format!("ip{}", child_b)]);
    }

    #[test]
    fn test_child_view_drops_settings_and_ripe() {
        let (store, _dir) = open_store();
        let dn_id = store.create_dn("example.org").unwrap();
        let child = store.create_ip("1.2.3.4").unwrap();
        store.link_dn_ip(dn_id, child).unwrap();
        store
            .finish(MeasurementKind::Ip, child, &AdvancedSettings::default())
            .unwrap();

        let full = store.full_view(MeasurementKind::Dn, dn_id).unwrap().unwrap();
        let child_view = &full["ip_measurements"][0];
        assert!(child_view.get("settings").is_none());
        assert!(child_view.get("id_ripe").is_none());

        // La même mesure vue en racine garde ses champs
        let standalone = store.full_view(MeasurementKind::Ip, child).unwrap().unwrap();
        assert!(standalone.get("settings").is_some());
        assert!(standalone.get("id_ripe").is_some());
    }

    #[test]
    fn test_history_and_offsets() {
        let (store, _dir) = open_store();
        let mut record = sample_record("example.org", "1.2.3.4", 4);
        store.insert_history_record(&record).unwrap();
        record.offset = Some(0.003);
        store.insert_history_record(&record).unwrap();

        // Un enregistrement hors plage
        record.client_sent = Some(NtpTimestamp::from_parts(3_800_000_000, 0));
        record.offset = Some(9.0);
        store.insert_history_record(&record).unwrap();

        let start = NtpTimestamp::from_parts(3_900_000_000, 0);
        let end = NtpTimestamp::from_parts(3_900_000_200, 0);
        let by_name = store.history("example.org", start, end).unwrap();
        assert_eq!(by_name.len(), 2);
        let by_ip = store.history("1.2.3.4", start, end).unwrap();
        assert_eq!(by_ip.len(), 2);

        let offsets = store.last_offsets("1.2.3.4", 2).unwrap();
        assert_eq!(offsets.len(), 2);
        // Les plus récents d'abord
        assert_eq!(offsets[0], 9.0);
    }

    #[test]
    fn test_unknown_measurement_views_are_none() {
        let (store, _dir) = open_store();
        assert!(store.full_view(MeasurementKind::Ip, 999).unwrap().is_none());
        assert!(store.partial_view(MeasurementKind::Dn, 999).unwrap().is_none());
        assert!(store.versions_view(999).unwrap().is_none());
    }
}
