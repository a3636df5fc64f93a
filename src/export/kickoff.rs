//! Kick-off request

use chrono::DateTime;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_LOCATION, CONTENT_TYPE, LOCATION};
use serde_json::{Value, json};
use url::Url;

use super::BulkDataClient;
use crate::config::ExportConfig;
use crate::error::{Error, ErrorReport, ResponseDetails, Result};
use crate::types::Event;

const FHIR_JSON: &str = "application/fhir+json";

/// Kick-off URL for the configured export level
pub(crate) fn export_endpoint(config: &ExportConfig, base: &Url) -> Result<Url> {
    let path = if config.global {
        "$export".to_string()
    } else if let Some(group) = &config.group {
        format!("Group/{}/$export", urlencoding::encode(group))
    } else {
        "Patient/$export".to_string()
    };

    base.join(&path)
        .map_err(|e| Error::config("fhir_url", format!("cannot build kick-off URL: {e}")))
}

/// Kick-off parameters in the order they are sent
pub(crate) fn kick_off_params(config: &ExportConfig) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut push = |name: &str, value: &Option<String>| {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            params.push((name.to_string(), value.to_string()));
        }
    };

    push("_outputFormat", &config.output_format);
    push("_since", &config.since);
    push("_type", &config.types);
    push("_elements", &config.elements);
    push("includeAssociatedData", &config.include_associated_data);
    push("organizeOutputBy", &config.organize_output_by);

    for filter in config.type_filter.iter().filter(|f| !f.is_empty()) {
        params.push(("_typeFilter".to_string(), filter.clone()));
    }
    if config.allow_partial_manifests {
        params.push(("allowPartialManifests".to_string(), "true".to_string()));
    }
    for (name, value) in &config.custom_params {
        params.push((name.clone(), value.clone()));
    }

    params
}

/// Patient ids, splitting comma-separated entries
fn patient_ids(config: &ExportConfig) -> Vec<String> {
    config
        .patient
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// FHIR `Parameters` resource for a POST kick-off
pub(crate) fn parameters_resource(params: &[(String, String)], patients: &[String]) -> Value {
    let mut parameter: Vec<Value> = params
        .iter()
        .map(|(name, value)| {
            let (key, typed) = typed_value(value);
            let mut entry = serde_json::Map::new();
            entry.insert("name".into(), Value::String(name.clone()));
            entry.insert(key.into(), typed);
            Value::Object(entry)
        })
        .collect();

    parameter.extend(patients.iter().map(|id| {
        json!({
            "name": "patient",
            "valueReference": { "reference": format!("Patient/{id}") }
        })
    }));

    json!({
        "resourceType": "Parameters",
        "parameter": parameter,
    })
}

/// Pick the `value[x]` type of a parameter by looking at its text
fn typed_value(value: &str) -> (&'static str, Value) {
    match value {
        "true" => return ("valueBoolean", Value::Bool(true)),
        "false" => return ("valueBoolean", Value::Bool(false)),
        _ => {}
    }

    if let Ok(integer) = value.parse::<i32>() {
        return ("valueInteger", Value::from(integer));
    }

    let numeric = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'));
    if numeric {
        if let Some(decimal) = value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return ("valueDecimal", Value::Number(decimal));
        }
    }

    if DateTime::parse_from_rfc3339(value).is_ok() {
        return ("valueInstant", Value::String(value.to_string()));
    }

    ("valueString", Value::String(value.to_string()))
}

impl BulkDataClient {
    /// URL the kick-off request is sent to
    pub fn kick_off_url(&self) -> Result<Url> {
        export_endpoint(&self.config.export, &self.base_url)
    }

    /// Start an export and return its status URL
    ///
    /// Uses a POST with a `Parameters` body when configured or when patient
    /// ids are given, a GET with query parameters otherwise.
    pub async fn kick_off(&self) -> Result<String> {
        match self.send_kick_off().await {
            Ok(status_url) => Ok(status_url),
            Err(Error::Cancelled) => {
                tracing::debug!("Export kick-off cancelled");
                Err(Error::Cancelled)
            }
            Err(e) => {
                tracing::error!(error = %e, "Export kick-off failed");
                self.emit(Event::StatusError {
                    status_url: None,
                    error: ErrorReport::from(&e),
                });
                Err(e)
            }
        }
    }

    async fn send_kick_off(&self) -> Result<String> {
        let export = &self.config.export;
        let mut url = self.kick_off_url()?;
        let params = kick_off_params(export);
        let patients = patient_ids(export);
        let use_post = export.post || !patients.is_empty();

        let prefer = if export.lenient {
            "respond-async, handling=lenient"
        } else {
            "respond-async"
        };

        let (method, body) = if use_post {
            (
                Method::POST,
                Some(serde_json::to_vec(&parameters_resource(&params, &patients))?),
            )
        } else {
            if !params.is_empty() {
                url.query_pairs_mut().extend_pairs(params.iter());
            }
            (Method::GET, None)
        };

        tracing::info!(url = %url, method = %method, "Kicking off export");

        let response = self
            .http
            .send(method.clone(), url.as_str(), true, &self.cancel, |request| {
                let request = request.header(ACCEPT, FHIR_JSON).header("prefer", prefer);
                match &body {
                    Some(body) => request.header(CONTENT_TYPE, FHIR_JSON).body(body.clone()),
                    None => request,
                }
            })
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let details = ResponseDetails::capture(response).await;
            return Err(Error::protocol_with_response(
                format!("kick-off request failed with status {status}"),
                details,
            ));
        }

        let location = response
            .headers()
            .get(CONTENT_LOCATION)
            .or_else(|| response.headers().get(LOCATION))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let Some(location) = location else {
            let details = ResponseDetails::capture(response).await;
            return Err(Error::protocol_with_response(
                "the kick-off response did not include a content-location header",
                details,
            ));
        };

        // Relative locations resolve against the kick-off URL
        let status_url = url
            .join(&location)
            .map(|u| u.to_string())
            .unwrap_or(location);

        tracing::info!(status_url = %status_url, "Export accepted");
        *self.status_url.write().await = Some(status_url.clone());
        self.emit(Event::KickOff {
            url: url.to_string(),
            status_url: status_url.clone(),
            method: method.to_string(),
        });

        Ok(status_url)
    }
}
