//! HTTP client for the analysis host's REST API.
//!
//! Endpoints used:
//! - `PUT /db/PTNS` assigns pretensions
//! - `GET /db/PTNS` reads pretensions back
//! - `POST /doc/Anal` runs the analysis
//! - `GET /db/STAG` lists construction stages
//! - `POST /POST/TABLE` exports a truss force table

use std::path::Path;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::adapter::{
    force_response_to_table, host_format_to_table, table_to_host_format, value_as_text,
    FlatTable, TRUSS_FORCE_KEY,
};
use crate::config::HostConfig;
use crate::errors::{ConfigError, DataIntegrityError, HostError};
use crate::host::{AnalysisHost, ForceQuery, StageRecord};
use crate::records::TensionTable;

/// Header carrying the API key (`MAPI-Key`; header names are case-insensitive).
const API_KEY_HEADER: &str = "mapi-key";

/// Columns requested in every force table export.
const FORCE_COMPONENTS: [&str; 6] = ["Elem", "Load", "Stage", "Step", "Force-I", "Force-J"];

/// Blocking client bound to one host session.
#[derive(Debug, Clone)]
pub struct CivilClient {
    /// Underlying HTTP client with the key header installed.
    client: Client,
    /// Connection settings.
    config: HostConfig,
}

impl CivilClient {
    /// Create a client from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Connection`] when the URL or key is missing or the
    /// HTTP client cannot be built.
    pub fn new(config: HostConfig) -> Result<Self, ConfigError> {
        if !config.is_complete() {
            return Err(ConfigError::Connection(
                "host URL and API key are required".to_owned(),
            ));
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|err| ConfigError::Connection(format!("invalid API key: {err}")))?;
        headers.insert(API_KEY_HEADER, key);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|err| ConfigError::Connection(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Connection settings in use.
    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Read the pretensions currently assigned in the model.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] when the request fails or the payload is malformed.
    pub fn fetch_tensions(&self) -> Result<TensionTable, HostError> {
        let body = self.request(Method::GET, "/db/PTNS", None, HostError::Request)?;
        Ok(host_format_to_table(&body)?)
    }

    /// Send a request and decode its JSON body.
    ///
    /// Transport failures are always [`HostError::Request`]; a non-success
    /// status is reported through `on_status`.
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        on_status: fn(String) -> HostError,
    ) -> Result<Value, HostError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send()?;
        let status = response.status();
        debug!(%method, path, status = status.as_u16(), "host request");

        let text = response.text()?;
        if !status.is_success() {
            return Err(on_status(format!("{method} {path} returned {status}: {text}")));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| {
            HostError::Data(DataIntegrityError::MalformedExport(format!(
                "{method} {path}: {err}"
            )))
        })
    }
}

impl AnalysisHost for CivilClient {
    fn set_tensions(&mut self, tensions: &TensionTable) -> Result<(), HostError> {
        let body = table_to_host_format(tensions);
        self.request(Method::PUT, "/db/PTNS", Some(&body), HostError::Request)?;
        Ok(())
    }

    fn run_analysis(&mut self) -> Result<(), HostError> {
        self.request(Method::POST, "/doc/Anal", Some(&json!({})), HostError::Analysis)?;
        Ok(())
    }

    fn list_stages(&mut self) -> Result<Vec<StageRecord>, HostError> {
        let body = self.request(Method::GET, "/db/STAG", None, HostError::Request)?;
        Ok(stages_from_response(&body)?)
    }

    fn query_force_table(&mut self, query: &ForceQuery) -> Result<FlatTable, HostError> {
        let export_path = self.config.export_path();
        remove_stale_export(&export_path)?;

        let argument = force_table_argument(query, &export_path);
        let body = self.request(Method::POST, "/POST/TABLE", Some(&argument), HostError::Request)?;
        if body.get(TRUSS_FORCE_KEY).is_some() {
            return Ok(force_response_to_table(&body)?);
        }

        let bytes = std::fs::read(&export_path).map_err(|err| {
            DataIntegrityError::MalformedExport(format!(
                "cannot read export {}: {err}",
                export_path.display()
            ))
        })?;
        let payload = parse_force_export(&bytes)?;
        Ok(force_response_to_table(&payload)?)
    }
}

/// Build the `POST /POST/TABLE` body for a truss force export.
#[must_use]
pub fn force_table_argument(query: &ForceQuery, export_path: &Path) -> Value {
    let mut argument = json!({
        "TABLE_NAME": "TrussForce",
        "TABLE_TYPE": "TRUSSFORCE",
        "EXPORT_PATH": export_path.display().to_string(),
        "UNIT": {"FORCE": query.force_unit, "DIST": "m"},
        "STYLES": {"FORMAT": "Fixed", "PLACE": 12},
        "COMPONENTS": FORCE_COMPONENTS,
        "NODE_ELEMS": {"KEYS": query.elements},
        "LOAD_CASE_NAMES": [query.load_case],
        "OPT_CS": true,
    });
    if let (Some(label), Some(fields)) = (&query.stage_step, argument.as_object_mut()) {
        fields.insert("STAGE_STEP".to_owned(), json!([label.to_string()]));
    }
    json!({ "Argument": argument })
}

/// Read construction stages, in host order, from a `GET /db/STAG` response.
///
/// # Errors
///
/// Returns [`DataIntegrityError`] when the `STAG` object or a stage name is missing.
pub fn stages_from_response(body: &Value) -> Result<Vec<StageRecord>, DataIntegrityError> {
    let stages = body
        .get("STAG")
        .and_then(Value::as_object)
        .ok_or_else(|| DataIntegrityError::MalformedExport("response has no STAG object".into()))?;
    stages
        .iter()
        .map(|(key, stage)| {
            let name = stage.get("NAME").ok_or_else(|| {
                DataIntegrityError::MalformedExport(format!("stage {key} has no NAME"))
            })?;
            Ok(StageRecord::new(key.clone(), value_as_text(name)))
        })
        .collect()
}

/// Parse a force table export the host wrote to disk.
///
/// The host does not always emit valid JSON. When strict parsing fails, the
/// `"TrussForce": ... }` fragment is cut out of the text and wrapped in braces.
///
/// # Errors
///
/// Returns [`DataIntegrityError::MalformedExport`] when neither strict parsing
/// nor the repair yields a force table.
pub fn parse_force_export(bytes: &[u8]) -> Result<Value, DataIntegrityError> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => std::borrow::Cow::Borrowed(text),
        Err(_) => {
            warn!("force export is not UTF-8, decoding lossily");
            String::from_utf8_lossy(bytes)
        }
    };
    let text = text.trim_start_matches('\u{feff}');

    if let Ok(payload) = serde_json::from_str::<Value>(text) {
        if payload.get(TRUSS_FORCE_KEY).is_some() {
            return Ok(payload);
        }
    }

    let fragment = Regex::new(r#"(?s)"TrussForce"\s*:+.+\}"#)
        .map_err(|err| DataIntegrityError::MalformedExport(err.to_string()))?
        .find(text)
        .ok_or_else(|| {
            DataIntegrityError::MalformedExport("export has no TrussForce table".to_owned())
        })?;
    debug!("repairing force export");
    serde_json::from_str(&format!("{{{}", fragment.as_str()))
        .map_err(|err| DataIntegrityError::MalformedExport(err.to_string()))
}

/// Delete an export left by an earlier query so it cannot be mistaken for a fresh one.
fn remove_stale_export(path: &Path) -> Result<(), DataIntegrityError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|err| {
            DataIntegrityError::MalformedExport(format!(
                "cannot remove stale export {}: {err}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageStep;

    fn query(stage_step: Option<StageStep>) -> ForceQuery {
        ForceQuery {
            elements: vec![2001, 2002],
            stage_step,
            load_case: "合计(CS)".into(),
            force_unit: "N".into(),
        }
    }

    #[test]
    fn calibration_argument_has_no_stage_step() {
        let body = force_table_argument(&query(None), Path::new("out/force.json"));
        let argument = &body["Argument"];
        assert_eq!(argument["TABLE_TYPE"], "TRUSSFORCE");
        assert_eq!(argument["NODE_ELEMS"]["KEYS"], json!([2001, 2002]));
        assert_eq!(argument["LOAD_CASE_NAMES"], json!(["合计(CS)"]));
        assert_eq!(argument["OPT_CS"], json!(true));
        assert!(argument.get("STAGE_STEP").is_none());
    }

    #[test]
    fn scoped_argument_carries_the_label() {
        let label = StageStep::new("CS12", "003(last)");
        let body = force_table_argument(&query(Some(label)), Path::new("force.json"));
        assert_eq!(body["Argument"]["STAGE_STEP"], json!(["CS12:003(last)"]));
        assert_eq!(body["Argument"]["UNIT"]["FORCE"], "N");
    }

    #[test]
    fn stages_keep_host_order() {
        let body = json!({"STAG": {
            "3": {"NAME": "CS3"},
            "1": {"NAME": "CS1"},
            "10": {"NAME": "Final"}
        }});
        let stages = stages_from_response(&body).expect("valid stages");
        let names: Vec<_> = stages.iter().map(|stage| stage.name.as_str()).collect();
        assert_eq!(names, vec!["CS3", "CS1", "Final"]);
    }

    #[test]
    fn valid_export_parses_directly() {
        let bytes = br#"{"TrussForce": {"HEAD": ["Elem"], "DATA": [["2001"]]}}"#;
        let payload = parse_force_export(bytes).expect("valid JSON");
        assert_eq!(payload["TrussForce"]["DATA"][0][0], "2001");
    }

    #[test]
    fn broken_export_is_repaired() {
        let bytes = "\u{feff}TABLE EXPORT v2\n{\"TrussForce\":{\"HEAD\":[\"Elem\",\"Step\",\"Force-I\"],\
                     \"DATA\":[[\"2001\",\"003(last)\",\"12.5\"]]}}"
            .as_bytes();
        let payload = parse_force_export(bytes).expect("repairable");
        let table = force_response_to_table(&payload).expect("well formed table");
        let forces = table
            .forces_at(&StageStep::new("CS9", "003(last)"))
            .expect("numeric");
        assert_eq!(forces[&2001], 12.5);
    }

    #[test]
    fn export_without_table_is_rejected() {
        assert!(matches!(
            parse_force_export(b"{\"Other\": 1}"),
            Err(DataIntegrityError::MalformedExport(_))
        ));
    }

    #[test]
    fn incomplete_configuration_is_rejected() {
        let error = CivilClient::new(HostConfig::default()).expect_err("missing key");
        assert!(matches!(error, ConfigError::Connection(_)));
    }
}
