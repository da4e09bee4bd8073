/*!
Passerelle HTTP du service de mesure

Fournit :
- le déclenchement d'une mesure composite (réponse immédiate, travail en
  arrière-plan via la file de jobs)
- les vues complètes et partielles pour le polling
- la mesure NTP synchrone, l'historique, la mesure NTS isolée
- le déclenchement et la relecture des mesures RIPE Atlas

Chaque endpoint est limité en débit par IP cliente.
*/

use crate::analyzer::{analyze_version, ProbeOutcome};
use crate::calc;
use crate::config::Config;
use crate::dns::Resolver;
use crate::location::{vantage_point_ip, vantage_point_ip_if_possible, GeoResolver};
use crate::probe::{NtpProbeOutput, ProbeError, Prober};
use crate::ripe::{RipeClient, RipeError, RipeFetchState, RipeSchedule};
use crate::security::{derive_client_ip, sanitize_string, RateLimiter};
use crate::settings::{check_and_get_settings, MeasurementRequest};
use crate::store::{MeasurementKind, NtpRecordData, Store};
use crate::timestamp::NtpTimestamp;
use crate::worker::{Job, JobTarget};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// État partagé de la passerelle
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub jobs: crossbeam_channel::Sender<Job>,
    pub prober: Arc<dyn Prober>,
    pub ripe: Arc<RipeClient>,
    pub resolver: Arc<dyn Resolver>,
    pub geo: Arc<GeoResolver>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub config: Arc<Config>,
}

/// Erreur d'API : code HTTP + détail JSON
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        ApiError {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

pub struct WebServer {
    bind_addr: String,
    state: AppState,
}

impl WebServer {
    pub fn new(bind_addr: String, state: AppState) -> Self {
        WebServer { bind_addr, state }
    }

    /// Démarre le serveur web dans un thread Tokio séparé
    pub fn start(self) -> std::thread::JoinHandle<()> {
        info!("Starting web server on {}", self.bind_addr);

        std::thread::spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Could not create web server runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                if let Err(e) = self.run().await {
                    error!("Web server error: {:#}", e);
                }
            });
        })
    }

    async fn run(self) -> anyhow::Result<()> {
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!("Web server listening on {}", self.bind_addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

/// Routes de l'API
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/measurements/", post(sync_measurement_handler))
        .route("/measurements/history/", get(history_handler))
        .route("/measurements/trigger/", post(trigger_handler))
        .route("/measurements/results/:m_id", get(full_results_handler))
        .route("/measurements/partial-results/:m_id", get(partial_results_handler))
        .route("/measurements/ntp_versions/:m_id", get(ntp_versions_handler))
        .route("/measurements/ntpinfo-server-details/:ip_type", get(server_details_handler))
        .route("/measurements/nts/", post(nts_handler))
        .route("/measurements/ripe/trigger/", post(ripe_trigger_handler))
        .route("/measurements/ripe/:measurement_id", get(ripe_result_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Page d'accueil : vérification basique que le service répond
async fn index_handler() -> Html<&'static str> {
    Html(
        "<html>\
           <head><title>Carillon</title></head>\
           <body>\
             <h1>Carillon</h1>\
             <p>Measurement orchestration service for NTP/NTS time servers.</p>\
             <p>Trigger a composite measurement at POST /measurements/trigger/ \
                and poll it at /measurements/partial-results/{id}.</p>\
           </body>\
         </html>",
    )
}

fn check_rate(state: &AppState, addr: &SocketAddr) -> Result<(), ApiError> {
    if let Some(limiter) = &state.limiter {
        if !limiter.check_rate_limit(addr.ip()) {
            return Err(ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Slow down.",
            ));
        }
    }
    Ok(())
}

/// Découpe un identifiant "ip<N>" / "dn<N>"
fn parse_measurement_id(raw: &str) -> Result<(MeasurementKind, i64), ApiError> {
    let cleaned = sanitize_string(raw);
    if cleaned.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid measurement ID."));
    }
    let (kind, digits) = if let Some(rest) = cleaned.strip_prefix("ip") {
        (MeasurementKind::Ip, rest)
    } else if let Some(rest) = cleaned.strip_prefix("dn") {
        (MeasurementKind::Dn, rest)
    } else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Invalid measurement ID. It should start with \"ip\" or \"dn\"",
        ));
    };
    let id: i64 = digits
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid measurement ID."))?;
    Ok((kind, id))
}

/// Détermine l'IP cliente à utiliser comme indice de localité RIPE
fn client_ip_from_request(
    headers: &HeaderMap,
    addr: &SocketAddr,
    wanted_ip_type: u8,
) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    derive_client_ip(
        forwarded,
        Some(addr.ip()),
        vantage_point_ip_if_possible(wanted_ip_type),
    )
}

// ---------------------------------------------------------------------------
// Mesure synchrone et historique

async fn sync_measurement_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<MeasurementRequest>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;

    if payload.server.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Either 'ip' or 'dn' must be provided.",
        ));
    }

    let wanted_ip_type = crate::settings::override_ip_type_if_target_is_ip(
        &payload.server,
        if payload.ipv6_measurement { 6 } else { 4 },
    );

    // Pour mesurer en IPv6 il faut pouvoir parler IPv6 depuis ce serveur
    if vantage_point_ip(wanted_ip_type).is_none() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "Our server cannot perform IPv{} measurements currently. Try the other IP type.",
                wanted_ip_type
            ),
        ));
    }

    let server = payload.server.clone();
    let entries = tokio::task::spawn_blocking(move || {
        measure_sync(&state, &server, wanted_ip_type)
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {}.", e)))??;

    Ok(Json(json!({ "measurement": entries })))
}

/// Mesure synchrone : une sonde par adresse de la cible, insertion dans
/// l'historique et calcul du jitter sur les derniers offsets connus
fn measure_sync(
    state: &AppState,
    server: &str,
    wanted_ip_type: u8,
) -> Result<Vec<Value>, ApiError> {
    let addresses: Vec<String> = if server.parse::<IpAddr>().is_ok() {
        vec![server.to_string()]
    } else {
        state
            .resolver
            .resolve(server, wanted_ip_type)
            .map_err(|_| {
                ApiError::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "Domain name is invalid or cannot be resolved.",
                )
            })?
            .iter()
            .map(|a| a.to_string())
            .collect()
    };

    let mut entries = Vec::new();
    for address in &addresses {
        match state.prober.probe_ntp(address, "ntpv4", "") {
            Ok(output) => {
                let entry = persist_and_format(state, server, address, &output);
                match entry {
                    Ok(value) => entries.push(value),
                    Err(e) => debug!("Could not persist measurement for {}: {}", address, e),
                }
            }
            Err(e) => {
                debug!("The ntp server {} is not responding: {}", address, e);
            }
        }
    }

    if entries.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Server is not reachable."));
    }
    Ok(entries)
}

fn persist_and_format(
    state: &AppState,
    server: &str,
    address: &str,
    output: &NtpProbeOutput,
) -> Result<Value, crate::store::StoreError> {
    let family = if address.parse::<IpAddr>().map(|a| a.is_ipv6()).unwrap_or(false) {
        6
    } else {
        4
    };
    let verdict = analyze_version(4, &ProbeOutcome::Parsed(output), family);

    let record = NtpRecordData {
        host: server.to_string(),
        measured_server_ip: Some(address.to_string()),
        version: output.version_str().and_then(|v| v.parse().ok()),
        leap: output.leap,
        mode: output.mode,
        stratum: output.stratum,
        poll: output.poll,
        precision: output.precision,
        root_delay: output.root_delay,
        root_disp: output.root_disp,
        offset: output.offset,
        rtt: output.rtt,
        ref_name: verdict.ref_name.clone(),
        ref_id_raw: output.ref_id_raw().map(|r| r as i64),
        client_sent: output.client_sent(),
        server_recv: output.server_recv(),
        server_sent: output.server_sent(),
        client_recv: output.client_recv(),
        ref_time: output.ref_timestamp(),
        extensions: None,
    };
    state.store.insert_history_record(&record)?;

    let offsets = state
        .store
        .last_offsets(address, state.config.probe.jitter_measurements)?;
    let jitter = calc::jitter(&offsets);

    let ts = |t: &Option<NtpTimestamp>| match t {
        Some(t) => json!({ "seconds": t.seconds(), "fraction": t.fraction() }),
        None => Value::Null,
    };

    Ok(json!({
        "ntp_version": record.version,
        "vantage_point_ip": vantage_point_ip(family).map(|ip| ip.to_string()),
        "ntp_server_ip": address,
        "ntp_server_name": server,
        "ntp_server_location": {
            "ip_is_anycast": state.geo.is_anycast(address),
            "country_code": state.geo.country_for_ip(address),
            "coordinates": state.geo.coordinates_for_ip(address),
        },
        "ref_name": record.ref_name,
        "client_sent_time": ts(&record.client_sent),
        "server_recv_time": ts(&record.server_recv),
        "server_sent_time": ts(&record.server_sent),
        "client_recv_time": ts(&record.client_recv),
        "offset": record.offset,
        "rtt": record.rtt,
        "stratum": record.stratum,
        "precision": record.precision,
        "root_delay": record.root_delay,
        "poll": record.poll,
        "root_dispersion": record.root_disp,
        "asn_ntp_server": state.geo.asn_for_ip(address),
        "ntp_last_sync_time": ts(&record.ref_time),
        "leap": record.leap,
        "jitter": jitter,
        "nr_measurements_jitter": offsets.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    server: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Valide la plage temporelle d'une requête d'historique
fn validate_history_range(
    server: &str,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
) -> Result<(), ApiError> {
    if server.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Either 'ip' or 'domain name' must be provided",
        ));
    }
    if start >= end {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "'start' must be earlier than 'end'",
        ));
    }
    if *end > Utc::now() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "'end' cannot be in the future",
        ));
    }
    Ok(())
}

async fn history_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;
    validate_history_range(&query.server, &query.start, &query.end)?;

    let measurements = state
        .store
        .history(
            &query.server,
            NtpTimestamp::from_datetime(query.start),
            NtpTimestamp::from_datetime(query.end),
        )
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("There was an error with accessing the database: {}.", e),
            )
        })?;

    Ok(Json(json!({ "measurements": measurements })))
}

// ---------------------------------------------------------------------------
// Mesure composite : déclenchement et polling

async fn trigger_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<MeasurementRequest>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;

    let server = sanitize_string(&payload.server);
    if server.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Either an 'ip' or a 'dn' must be provided.",
        ));
    }

    let mut settings = check_and_get_settings(&payload)
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    // Le draft NTPv5 configuré sert de défaut quand le client n'en
    // demande pas un en particulier
    if settings.ntpv5_draft.is_empty() {
        settings.ntpv5_draft = state.config.probe.ntpv5_draft.clone();
    }

    // Le point de vue client : imposé par le client, sinon dérivé de la
    // requête (en-tête de proxy, pair de connexion, IP de ce serveur)
    if settings.custom_client_ip.is_empty() {
        let client_ip = client_ip_from_request(&headers, &addr, settings.wanted_ip_type)
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Could not retrieve the client IP address.",
                )
            })?;
        settings.custom_client_ip = client_ip.to_string();
    }

    let (prefix, id, target) = if server.parse::<IpAddr>().is_ok() {
        let id = state.store.create_ip(&server).map_err(store_error)?;
        ("ip", id, JobTarget::Ip { id, server_ip: server.clone() })
    } else {
        let id = state.store.create_dn(&server).map_err(store_error)?;
        ("dn", id, JobTarget::Dn { id, server: server.clone() })
    };

    state
        .jobs
        .try_send(Job { target, settings })
        .map_err(|_| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "Measurement queue is full. Try again later.",
            )
        })?;

    info!("Triggered measurement {}{} for {}", prefix, id, server);
    Ok(Json(json!({
        "id": format!("{}{}", prefix, id),
        "status": "pending",
    })))
}

fn store_error(e: crate::store::StoreError) -> ApiError {
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("There was an error with accessing the database: {}.", e),
    )
}

async fn full_results_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(m_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;
    let (kind, id) = parse_measurement_id(&m_id)?;
    let view = state
        .store
        .full_view(kind, id)
        .map_err(store_error)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Measurement not found"))?;
    Ok(Json(view))
}

async fn partial_results_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(m_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;
    let (kind, id) = parse_measurement_id(&m_id)?;
    let view = state
        .store
        .partial_view(kind, id)
        .map_err(store_error)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Measurement not found"))?;
    Ok(Json(view))
}

async fn ntp_versions_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(m_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;
    let id: i64 = m_id
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid measurement ID."))?;
    let view = state
        .store
        .versions_view(id)
        .map_err(store_error)?
        .ok_or_else(|| {
            ApiError::new(StatusCode::NOT_FOUND, "NTP versions measurement not found")
        })?;
    Ok(Json(view))
}

async fn server_details_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(ip_type): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;
    let ip_type: u8 = ip_type.parse().unwrap_or(4);
    let this_server_ip = vantage_point_ip_if_possible(ip_type).map(|ip| ip.to_string());
    let location = this_server_ip.as_deref().map(|ip| {
        json!({
            "country_code": state.geo.country_for_ip(ip),
            "coordinates": state.geo.coordinates_for_ip(ip),
        })
    });

    Ok(Json(json!({
        "vantage_point_ip": this_server_ip,
        "vantage_point_location": location,
        "ripe_message": "You can fetch ripe results at /measurements/ripe/{measurement_id}",
        "ntpv_message": "You can fetch ntp versions analysis results at /measurements/ntp_versions/{m_id}",
        "full_ntp_message": "You can fetch full ntp results at /measurements/results/{id}",
    })))
}

// ---------------------------------------------------------------------------
// NTS isolé

async fn nts_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<MeasurementRequest>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;

    if payload.server.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Either 'ip' or 'dn' must be provided.",
        ));
    }

    let server = payload.server.clone();
    let wanted_ip_type = crate::settings::override_ip_type_if_target_is_ip(
        &server,
        if payload.ipv6_measurement { 6 } else { 4 },
    );

    let answer = tokio::task::spawn_blocking(move || {
        let is_ip = server.parse::<IpAddr>().is_ok();
        let outcome = if is_ip {
            state.prober.probe_nts_on_ip(&server)
        } else {
            state.prober.probe_nts(&server, Some(wanted_ip_type))
        };

        let mut answer = match outcome {
            Ok(result) => {
                let mut value = json!({
                    "NTS succeeded": result.succeeded,
                    "NTS analysis": result.analysis,
                });
                if let Some(data) = &result.data {
                    value["Host"] = json!(data.host);
                    value["Measured server IP"] = json!(data.measured_server_ip);
                    value["Measured server port"] = json!(data.port());
                    value["offset"] = json!(data.offset);
                    value["rtt"] = json!(data.rtt);
                    value["stratum"] = json!(data.stratum);
                    value["version"] = json!(data.version);
                    value["kissCode"] = json!(data.kiss_code);
                    value["ref_id"] = json!(data.ref_id);
                    value["minError"] = json!(data.min_error);
                    value["root_dist"] = json!(data.root_dist);
                }
                value
            }
            Err(ProbeError::Unavailable(_)) => json!({
                "NTS succeeded": false,
                "NTS analysis": "NTS test could not be performed (binary tool not available)",
            }),
            Err(e) => json!({
                "NTS succeeded": false,
                "NTS analysis": e.to_string(),
            }),
        };

        if is_ip {
            answer["warning_ip"] = json!("NTS measurements on IPs cannot check TLS certificate.");
        }
        answer
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {}.", e)))?;

    Ok(Json(answer))
}

// ---------------------------------------------------------------------------
// RIPE Atlas

async fn ripe_trigger_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<MeasurementRequest>,
) -> Result<Json<Value>, ApiError> {
    check_rate(&state, &addr)?;

    let server = payload.server.clone();
    if server.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Either 'ip' or 'dn' must be provided",
        ));
    }

    let settings = check_and_get_settings(&payload)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let wanted_ip_type = settings.wanted_ip_type;

    let client_ip = client_ip_from_request(&headers, &addr, wanted_ip_type)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "Could not retrieve the client IP address.",
            )
        })?;

    let ripe = Arc::clone(&state.ripe);
    let target = server.clone();
    let measurement_id = tokio::task::spawn_blocking(move || {
        ripe.schedule(&target, Some(&client_ip.to_string()), &settings)
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {}.", e)))?
    .map_err(|e| match e {
        RipeError::Schedule(msg) => ApiError::new(
            StatusCode::BAD_GATEWAY,
            format!("Ripe measurement initiated, but it failed: {}", msg),
        ),
        RipeError::MissingApiKey => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "RIPE Atlas scheduling is not configured on this server.",
        ),
        other => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to initiate measurement: {}", other),
        ),
    })?;

    let this_server_ip = vantage_point_ip_if_possible(wanted_ip_type).map(|ip| ip.to_string());
    let location = this_server_ip.as_deref().map(|ip| {
        json!({
            "country_code": state.geo.country_for_ip(ip),
            "coordinates": state.geo.coordinates_for_ip(ip),
        })
    });

    Ok(Json(json!({
        "measurement_id": measurement_id.to_string(),
        "vantage_point_ip": this_server_ip,
        "vantage_point_location": location,
        "status": "started",
        "message": "You can fetch the result at /measurements/ripe/{measurement_id}",
    })))
}

async fn ripe_result_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(measurement_id): Path<String>,
) -> Result<Response, ApiError> {
    check_rate(&state, &addr)?;

    let id: i64 = measurement_id
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid RIPE measurement ID."))?;

    let ripe = Arc::clone(&state.ripe);
    let (results, fetch_state) = tokio::task::spawn_blocking(move || ripe.fetch(id))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {}.", e)))?
        .map_err(|e| match e {
            RipeError::Api(msg) => ApiError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("RIPE call failed: {}. Try again later!", msg),
            ),
            other => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Server error: {}.", other),
            ),
        })?;

    if results.is_empty() && fetch_state == RipeFetchState::Pending {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!("Measurement is still being processed.")),
        )
            .into_response());
    }

    let response = match fetch_state {
        RipeFetchState::Complete => (
            StatusCode::OK,
            Json(json!({
                "status": "complete",
                "message": "Measurement has been completed.",
                "results": results,
            })),
        ),
        RipeFetchState::Ongoing => (
            StatusCode::PARTIAL_CONTENT,
            Json(json!({
                "status": "partial_results",
                "message": "Measurement is still in progress. These are partial results.",
                "results": results,
            })),
        ),
        RipeFetchState::Pending => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "status": "timeout",
                "message": "RIPE data likely completed but incomplete probe responses.",
            })),
        ),
    };
    Ok(response.into_response())
}
