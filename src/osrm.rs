//! OSRM HTTP adapter for pairwise travel measurements.
//!
//! Several servers can be configured. They are checked with a short route
//! request, ranked by response time, and tried fastest first. The ranking is
//! refreshed once it is older than `rank_interval_secs`.

use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{Coordinates, Measurement, TravelMode};
use crate::polyline::Polyline;
use crate::traits::{ProviderError, TravelProvider};

/// Encoded polyline precision used by OSRM.
const POLYLINE_PRECISION: u32 = 5;

/// Zero-length route in central Warsaw used to check a server.
const CHECK_POINT: Coordinates = Coordinates {
    lat: 52.237049,
    lon: 21.017532,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsrmConfig {
    /// Servers tried in order until one answers.
    pub base_urls: Vec<String>,
    pub timeout_secs: u64,
    /// Request the leg geometry for map rendering.
    pub with_geometry: bool,
    /// Reorder `base_urls` by measured response time before use.
    pub rank_servers: bool,
    pub rank_interval_secs: u64,
    /// Timeout of a single server check.
    pub check_timeout_secs: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_urls: vec![
                "https://routing.openstreetmap.de".to_string(),
                "https://router.project-osrm.org".to_string(),
            ],
            timeout_secs: 45,
            with_geometry: true,
            rank_servers: true,
            rank_interval_secs: 300,
            check_timeout_secs: 20,
        }
    }
}

/// Result of checking one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHealth {
    pub base_url: String,
    /// Round trip of the check request; `None` when the server failed it.
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ServerHealth {
    pub fn is_up(&self) -> bool {
        self.latency_ms.is_some()
    }
}

/// Responding servers by ascending latency, then the failing ones in their
/// configured order so they still serve as a last resort.
pub fn rank_servers(health: &[ServerHealth]) -> Vec<String> {
    let mut up: Vec<&ServerHealth> = health.iter().filter(|server| server.is_up()).collect();
    up.sort_by_key(|server| server.latency_ms);
    up.into_iter()
        .chain(health.iter().filter(|server| !server.is_up()))
        .map(|server| server.base_url.clone())
        .collect()
}

#[derive(Debug, Default)]
struct Ranking {
    order: Vec<String>,
    checked_at: Option<Instant>,
}

#[derive(Debug)]
pub struct OsrmClient {
    config: OsrmConfig,
    client: reqwest::blocking::Client,
    check_client: reqwest::blocking::Client,
    ranking: RwLock<Ranking>,
    refresh: Mutex<()>,
}

impl OsrmClient {
    pub fn new(config: OsrmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let check_client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.check_timeout_secs))
            .build()?;

        Ok(Self {
            config,
            client,
            check_client,
            ranking: RwLock::new(Ranking::default()),
            refresh: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &OsrmConfig {
        &self.config
    }

    fn route_url(
        &self,
        base_url: &str,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> String {
        route_url(base_url, from, to, mode, self.config.with_geometry)
    }

    fn query(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
    ) -> Result<Measurement, ProviderError> {
        let response = client.get(url).send().map_err(classify_transport)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify_transport)?;
        parse_route_response(status, &body)
    }

    /// Checks every configured server in parallel and remembers the
    /// resulting order.
    pub fn check_servers(&self) -> Vec<ServerHealth> {
        // Scoped threads, not rayon: callers may be rayon workers holding the
        // refresh lock.
        let health: Vec<ServerHealth> = thread::scope(|scope| {
            let checks: Vec<_> = self
                .config
                .base_urls
                .iter()
                .map(|base_url| scope.spawn(move || self.check_server(base_url)))
                .collect();
            checks
                .into_iter()
                .zip(&self.config.base_urls)
                .map(|(check, base_url)| {
                    check.join().unwrap_or_else(|_| ServerHealth {
                        base_url: base_url.clone(),
                        latency_ms: None,
                        error: Some("server check panicked".to_string()),
                    })
                })
                .collect()
        });

        let order = rank_servers(&health);
        let up = health.iter().filter(|server| server.is_up()).count();
        if up == 0 {
            warn!(servers = health.len(), "no OSRM server passed the check");
        } else {
            info!(servers = health.len(), up, fastest = %order[0], "OSRM servers ranked");
        }

        let mut ranking = self.ranking.write().unwrap_or_else(PoisonError::into_inner);
        ranking.order = order;
        ranking.checked_at = Some(Instant::now());
        health
    }

    fn check_server(&self, base_url: &str) -> ServerHealth {
        let url = route_url(base_url, CHECK_POINT, CHECK_POINT, TravelMode::Driving, false);

        let started = Instant::now();
        match self.query(&self.check_client, &url) {
            Ok(_) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                debug!(server = %base_url, latency_ms, "OSRM server up");
                ServerHealth {
                    base_url: base_url.to_string(),
                    latency_ms: Some(latency_ms),
                    error: None,
                }
            }
            Err(err) => {
                warn!(server = %base_url, error = %err, "OSRM server check failed");
                ServerHealth {
                    base_url: base_url.to_string(),
                    latency_ms: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Servers in the order they should be tried, re-ranked when the last
    /// check is older than `rank_interval_secs`.
    pub fn servers(&self) -> Vec<String> {
        if !self.config.rank_servers || self.config.base_urls.len() < 2 {
            return self.config.base_urls.clone();
        }

        let interval = Duration::from_secs(self.config.rank_interval_secs);
        let fresh =
            |ranking: &Ranking| ranking.checked_at.is_some_and(|at| at.elapsed() < interval);
        {
            let ranking = self.ranking.read().unwrap_or_else(PoisonError::into_inner);
            if fresh(&ranking) {
                return ranking.order.clone();
            }
        }

        // One caller re-ranks; the others wait for its result.
        let _refreshing = self.refresh.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let ranking = self.ranking.read().unwrap_or_else(PoisonError::into_inner);
            if fresh(&ranking) {
                return ranking.order.clone();
            }
        }
        self.check_servers();
        self.ranking
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }
}

impl TravelProvider for OsrmClient {
    fn measure(
        &self,
        from: Coordinates,
        to: Coordinates,
        mode: TravelMode,
    ) -> Result<Measurement, ProviderError> {
        first_answer(&self.servers(), |base_url| {
            self.query(&self.client, &self.route_url(base_url, from, to, mode))
        })
    }
}

/// Asks each server in turn until one answers.
///
/// Only `NotFound` ends the search early: no server can route a pair that
/// one has declared unroutable. Any other failure, including a rejected
/// request, moves on to the next server.
fn first_answer<F>(servers: &[String], mut query: F) -> Result<Measurement, ProviderError>
where
    F: FnMut(&str) -> Result<Measurement, ProviderError>,
{
    let mut last_error = ProviderError::Transport("no OSRM servers configured".to_string());

    for base_url in servers {
        match query(base_url) {
            Ok(measurement) => return Ok(measurement),
            Err(err @ ProviderError::NotFound(_)) => return Err(err),
            Err(err) => {
                debug!(server = %base_url, error = %err, "OSRM server failed, trying next");
                last_error = err;
            }
        }
    }

    Err(last_error)
}

fn route_url(
    base_url: &str,
    from: Coordinates,
    to: Coordinates,
    mode: TravelMode,
    geometry: bool,
) -> String {
    let overview = if geometry {
        "overview=full&geometries=polyline"
    } else {
        "overview=false"
    };
    format!(
        "{}/route/v1/{}/{:.6},{:.6};{:.6},{:.6}?{}",
        base_url.trim_end_matches('/'),
        profile(mode),
        from.lon,
        from.lat,
        to.lon,
        to.lat,
        overview
    )
}

fn profile(mode: TravelMode) -> &'static str {
    match mode {
        TravelMode::Driving => "driving",
        TravelMode::Walking => "foot",
        TravelMode::Cycling => "bike",
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), err.to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn classify_status(status: u16, message: String) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited,
        408 => ProviderError::Timeout,
        500..=599 => ProviderError::Server { status, message },
        _ => ProviderError::InvalidRequest(format!("HTTP {}: {}", status, message)),
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    message: Option<String>,
    routes: Option<Vec<OsrmRoute>>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    /// Meters.
    distance: f64,
    /// Seconds.
    duration: f64,
    geometry: Option<String>,
}

/// Interprets an OSRM `/route` response.
pub(crate) fn parse_route_response(status: u16, body: &str) -> Result<Measurement, ProviderError> {
    let parsed: Result<OsrmRouteResponse, _> = serde_json::from_str(body);

    let response = match parsed {
        Ok(response) => response,
        Err(err) if (200..300).contains(&status) => {
            return Err(ProviderError::Transport(format!("malformed OSRM response: {}", err)));
        }
        Err(_) => return Err(classify_status(status, body.chars().take(200).collect())),
    };

    match response.code.as_str() {
        "Ok" => {}
        "NoRoute" | "NoSegment" => {
            return Err(ProviderError::NotFound(
                response.message.unwrap_or_else(|| response.code.clone()),
            ));
        }
        _ => {
            let message = response.message.unwrap_or_else(|| response.code.clone());
            return Err(if (200..300).contains(&status) {
                ProviderError::InvalidRequest(message)
            } else {
                classify_status(status, message)
            });
        }
    }

    let route = response
        .routes
        .and_then(|routes| routes.into_iter().next())
        .ok_or_else(|| ProviderError::NotFound("OSRM returned no routes".to_string()))?;

    let mut measurement = Measurement::new(route.distance / 1000.0, route.duration);
    if let Some(encoded) = route.geometry {
        if let Some(polyline) = Polyline::decode(&encoded, POLYLINE_PRECISION) {
            measurement = measurement.with_geometry(polyline);
        }
    }
    Ok(measurement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok_response() {
        let body = r#"{"code":"Ok","routes":[{"distance":430100.0,"duration":16200.5,"geometry":"_p~iF~ps|U_ulLnnqC"}]}"#;
        let measurement = parse_route_response(200, body).unwrap();

        assert!((measurement.distance_km - 430.1).abs() < 1e-9);
        assert_eq!(measurement.duration_secs, 16200.5);
        assert_eq!(measurement.geometry.map(|g| g.points().len()), Some(2));
    }

    #[test]
    fn test_parse_no_route_is_permanent() {
        let body = r#"{"code":"NoRoute","message":"Impossible route between points"}"#;
        let err = parse_route_response(200, body).unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_rate_limited() {
        let err = parse_route_response(429, "Too Many Requests").unwrap_err();
        assert_eq!(err, ProviderError::RateLimited);
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_server_error_is_transient() {
        let err = parse_route_response(503, "<html>Service Unavailable</html>").unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_invalid_query() {
        let body = r#"{"code":"InvalidQuery","message":"Query string malformed"}"#;
        let err = parse_route_response(400, body).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[test]
    fn test_route_url_uses_lon_lat_order() {
        let client = OsrmClient::new(OsrmConfig {
            with_geometry: false,
            ..OsrmConfig::default()
        })
        .unwrap();
        let url = client.route_url(
            "http://localhost:5000/",
            Coordinates::new(52.1, 20.8),
            Coordinates::new(50.4, 16.5),
            TravelMode::Driving,
        );
        assert_eq!(
            url,
            "http://localhost:5000/route/v1/driving/20.800000,52.100000;16.500000,50.400000?overview=false"
        );
    }

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_rejected_request_fails_over_to_next_server() {
        let mut asked = Vec::new();
        let result = first_answer(&servers(&["a", "b"]), |server| {
            asked.push(server.to_string());
            match server {
                "a" => Err(ProviderError::InvalidRequest("HTTP 400: bad request".to_string())),
                _ => Ok(Measurement::new(12.0, 900.0)),
            }
        });

        assert_eq!(result.unwrap().distance_km, 12.0);
        assert_eq!(asked, servers(&["a", "b"]));
    }

    #[test]
    fn test_unroutable_pair_stops_failover() {
        let mut asked = 0;
        let err = first_answer(&servers(&["a", "b"]), |_| {
            asked += 1;
            Err(ProviderError::NotFound("NoRoute".to_string()))
        })
        .unwrap_err();

        assert!(matches!(err, ProviderError::NotFound(_)));
        assert_eq!(asked, 1);
    }

    #[test]
    fn test_last_failure_is_reported() {
        let err = first_answer(&servers(&["a", "b"]), |server| match server {
            "a" => Err(ProviderError::InvalidRequest("rejected".to_string())),
            _ => Err(ProviderError::Timeout),
        })
        .unwrap_err();
        assert_eq!(err, ProviderError::Timeout);

        let none = first_answer(&[], |_| Ok(Measurement::zero())).unwrap_err();
        assert!(matches!(none, ProviderError::Transport(_)));
    }

    #[test]
    fn test_rank_servers_by_latency_with_failures_last() {
        let health = vec![
            ServerHealth {
                base_url: "down".to_string(),
                latency_ms: None,
                error: Some("timeout".to_string()),
            },
            ServerHealth {
                base_url: "slow".to_string(),
                latency_ms: Some(900),
                error: None,
            },
            ServerHealth {
                base_url: "fast".to_string(),
                latency_ms: Some(40),
                error: None,
            },
        ];
        assert_eq!(rank_servers(&health), servers(&["fast", "slow", "down"]));
    }

    #[test]
    fn test_unranked_client_keeps_configured_order() {
        let client = OsrmClient::new(OsrmConfig {
            rank_servers: false,
            ..OsrmConfig::default()
        })
        .unwrap();
        assert_eq!(client.servers(), OsrmConfig::default().base_urls);
    }
}
