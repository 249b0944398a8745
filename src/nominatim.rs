//! Nominatim (OpenStreetMap) geocoding adapter.

use serde::{Deserialize, Serialize};

use crate::model::Coordinates;
use crate::traits::{Geocoder, ProviderError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NominatimConfig {
    pub base_url: String,
    /// Nominatim's usage policy requires an identifying user agent.
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Appended to every query, e.g. "Polska".
    pub country: Option<String>,
    /// Comma-separated ISO 3166-1 alpha-2 codes restricting results.
    pub country_codes: Option<String>,
}

impl Default for NominatimConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: "tour-planner".to_string(),
            timeout_secs: 20,
            country: None,
            country_codes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NominatimClient {
    config: NominatimConfig,
    client: reqwest::blocking::Client,
}

impl NominatimClient {
    pub fn new(config: NominatimConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { config, client })
    }

    fn query_text(&self, address: &str) -> String {
        match &self.config.country {
            Some(country) if !address.to_lowercase().contains(&country.to_lowercase()) => {
                format!("{}, {}", address, country)
            }
            _ => address.to_string(),
        }
    }
}

impl Geocoder for NominatimClient {
    fn resolve(&self, address: &str) -> Result<Coordinates, ProviderError> {
        let query = self.query_text(address);
        let mut params = vec![
            ("q", query.as_str()),
            ("format", "json"),
            ("limit", "1"),
        ];
        if let Some(codes) = &self.config.country_codes {
            params.push(("countrycodes", codes.as_str()));
        }

        let url = format!("{}/search", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .map_err(classify_transport)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify_transport)?;
        parse_search_response(status, &body, address)
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    lat: String,
    lon: String,
}

pub(crate) fn parse_search_response(
    status: u16,
    body: &str,
    address: &str,
) -> Result<Coordinates, ProviderError> {
    match status {
        200..=299 => {}
        429 => return Err(ProviderError::RateLimited),
        500..=599 => {
            return Err(ProviderError::Server {
                status,
                message: body.chars().take(200).collect(),
            });
        }
        _ => return Err(ProviderError::InvalidRequest(format!("HTTP {} for '{}'", status, address))),
    }

    let results: Vec<SearchResult> = serde_json::from_str(body)
        .map_err(|err| ProviderError::Transport(format!("malformed Nominatim response: {}", err)))?;
    let first = results
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::NotFound(format!("no match for '{}'", address)))?;

    let lat = first.lat.parse::<f64>();
    let lon = first.lon.parse::<f64>();
    match (lat, lon) {
        (Ok(lat), Ok(lon)) if Coordinates::new(lat, lon).is_valid() => Ok(Coordinates::new(lat, lon)),
        _ => Err(ProviderError::NotFound(format!(
            "unusable coordinates for '{}': {}, {}",
            address, first.lat, first.lon
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_result() {
        let body = r#"[{"lat":"52.1472","lon":"20.8034","display_name":"Nadarzyn"}]"#;
        let coords = parse_search_response(200, body, "Nadarzyn").unwrap();
        assert_eq!(coords, Coordinates::new(52.1472, 20.8034));
    }

    #[test]
    fn test_empty_result_is_not_found() {
        let err = parse_search_response(200, "[]", "Atlantis").unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let err = parse_search_response(429, "", "Nadarzyn").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_country_suffix() {
        let client = NominatimClient::new(NominatimConfig {
            country: Some("Polska".to_string()),
            ..NominatimConfig::default()
        })
        .unwrap();
        assert_eq!(client.query_text("Nowa Ruda"), "Nowa Ruda, Polska");
        assert_eq!(client.query_text("Kłodzko, Polska"), "Kłodzko, Polska");
    }
}
