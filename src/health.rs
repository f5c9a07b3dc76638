//! Aggregate health endpoint: typed payload and client.
use std::{collections::BTreeMap, time::Duration};

use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    constants::{HEALTH_PATH, HEALTHY_STATUS},
    error::HealthError,
};

/// Body of `GET <server>/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub components: Vec<HealthComponent>,
    /// Seed entries have no stable shape and are kept verbatim.
    #[serde(default)]
    pub seeds: Vec<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl HealthPayload {
    pub fn component(&self, name: &str) -> Option<&HealthComponent> {
        self.components.iter().find(|component| component.name == name)
    }

    /// `true` when the named component exists and reports healthy.
    pub fn component_healthy(&self, name: &str) -> bool {
        self.component(name).is_some_and(HealthComponent::is_healthy)
    }

    pub fn is_healthy(&self) -> bool {
        is_healthy_status(&self.status)
    }
}

/// One named entry of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthComponent {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub latency_ms: Option<f64>,
    #[serde(default, deserialize_with = "lenient_details")]
    pub details: ComponentDetails,
}

impl HealthComponent {
    pub fn is_healthy(&self) -> bool {
        is_healthy_status(&self.status)
    }
}

/// Detail fields workers report. The stable ones are typed; anything else is
/// kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentDetails {
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    #[serde(default, alias = "log_file", skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn is_healthy_status(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case(HEALTHY_STATUS)
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_details<'de, D>(deserializer: D) -> Result<ComponentDetails, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => {
            serde_json::from_value(value).map_err(serde::de::Error::custom)
        }
        _ => Ok(ComponentDetails::default()),
    }
}

/// Anything that can produce the aggregate health payload.
pub trait HealthSource: Send + Sync {
    /// One full round-trip. `Ok` only for a 2xx, well-formed, healthy payload;
    /// an unhealthy payload is returned inside [`HealthError::Unhealthy`].
    fn fetch(&self) -> Result<HealthPayload, HealthError>;

    /// Checks whether `component` reports healthy, inspecting the payload even
    /// when the overall status is unhealthy.
    fn component_ready(&self, component: &str) -> Result<(), HealthError> {
        let payload = match self.fetch() {
            Ok(payload) => Box::new(payload),
            Err(HealthError::Unhealthy {
                status_code,
                status,
                payload: Some(payload),
            }) => {
                if payload.component_healthy(component) {
                    return Ok(());
                }
                if payload.component(component).is_none() {
                    return Err(HealthError::Unhealthy {
                        status_code,
                        status,
                        payload: Some(payload),
                    });
                }
                payload
            }
            Err(err) => return Err(err),
        };

        match payload.component(component) {
            Some(entry) if entry.is_healthy() => Ok(()),
            Some(entry) => Err(HealthError::ComponentUnhealthy {
                component: component.to_string(),
                status: entry.status.clone(),
                payload,
            }),
            None => Err(HealthError::ComponentUnhealthy {
                component: component.to_string(),
                status: "missing".to_string(),
                payload,
            }),
        }
    }
}

/// Blocking HTTP client for `<server-url>/health`.
#[derive(Debug, Clone)]
pub struct HttpHealthClient {
    client: Client,
    url: String,
}

impl HttpHealthClient {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, HealthError> {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|err| HealthError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{HEALTH_PATH}", server_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HealthSource for HttpHealthClient {
    fn fetch(&self) -> Result<HealthPayload, HealthError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|err| HealthError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| HealthError::Transport(err.to_string()))?;
        debug!("Health check {} returned HTTP {}", self.url, status.as_u16());

        parse_response(status.as_u16(), status.canonical_reason(), &body)
    }
}

/// Classifies a health response by HTTP status and body.
pub fn parse_response(
    status_code: u16,
    reason: Option<&str>,
    body: &str,
) -> Result<HealthPayload, HealthError> {
    let parsed = serde_json::from_str::<HealthPayload>(body);
    let success = (200..300).contains(&status_code);

    match parsed {
        Ok(payload) if success && payload.is_healthy() => Ok(payload),
        Ok(payload) => Err(HealthError::Unhealthy {
            status_code,
            status: payload.status.clone(),
            payload: Some(Box::new(payload)),
        }),
        Err(err) if success => Err(HealthError::Malformed(err.to_string())),
        Err(_) => Err(HealthError::Unhealthy {
            status_code,
            status: reason.unwrap_or("error").to_string(),
            payload: None,
        }),
    }
}
