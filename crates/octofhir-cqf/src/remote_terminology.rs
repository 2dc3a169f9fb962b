//! Terminology provider backed by an external FHIR terminology server.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use url::Url;

use crate::error::{CqfError, CqfResult};
use crate::terminology_provider::{Code, TerminologyProvider, codes_from_value_set};

/// Endpoint and optional basic-auth credentials of a terminology server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminologyEndpoint {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl TerminologyEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

pub struct RemoteTerminologyProvider {
    client: Client,
    base: String,
    /// Basic auth is sent only when both user and password are configured.
    credentials: Option<(String, String)>,
}

impl RemoteTerminologyProvider {
    pub fn new(endpoint: &TerminologyEndpoint) -> CqfResult<Self> {
        Url::parse(&endpoint.url).map_err(|e| {
            CqfError::InvalidArgument(format!(
                "Invalid terminology endpoint '{}': {e}",
                endpoint.url
            ))
        })?;
        Ok(Self {
            client: Client::new(),
            base: endpoint.url.trim_end_matches('/').to_string(),
            credentials: endpoint
                .username
                .clone()
                .zip(endpoint.password.clone()),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self
            .client
            .get(format!("{}/{path}", self.base))
            .header("Accept", "application/fhir+json");
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    /// Sends the request; `Ok(None)` on 404.
    async fn fetch(&self, request: RequestBuilder, operation: &str) -> CqfResult<Option<Value>> {
        let response = request.send().await.map_err(|e| {
            CqfError::InternalError(format!("Terminology server {operation} failed: {e}"))
        })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CqfError::InternalError(format!(
                "Terminology server returned {status} for {operation}"
            )));
        }
        let body = response.json::<Value>().await.map_err(|e| {
            CqfError::InternalError(format!("Invalid {operation} response: {e}"))
        })?;
        Ok(Some(body))
    }
}

#[async_trait]
impl TerminologyProvider for RemoteTerminologyProvider {
    async fn expand(&self, value_set: &str) -> CqfResult<Vec<Code>> {
        let request = if Url::parse(value_set).is_ok() {
            self.get("ValueSet/$expand").query(&[("url", value_set)])
        } else {
            self.get(&format!("ValueSet/{value_set}/$expand"))
        };
        tracing::debug!(value_set, endpoint = %self.base, "Expanding value set remotely");

        Ok(self
            .fetch(request, "ValueSet/$expand")
            .await?
            .map(|expanded| codes_from_value_set(&expanded))
            .unwrap_or_default())
    }

    async fn lookup(&self, code: &Code, code_system: &str) -> CqfResult<Code> {
        let request = self
            .get("CodeSystem/$lookup")
            .query(&[("system", code_system), ("code", code.code.as_str())]);
        let Some(parameters) = self.fetch(request, "CodeSystem/$lookup").await? else {
            return Ok(code.clone());
        };

        let mut found = code.clone();
        found.system = Some(code_system.to_string());
        let params = parameters
            .get("parameter")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for param in params {
            let value = param
                .get("valueString")
                .and_then(Value::as_str)
                .map(str::to_string);
            match param.get("name").and_then(Value::as_str) {
                Some("display") => found.display = value.or(found.display),
                Some("version") => found.version = value.or(found.version),
                _ => {}
            }
        }
        Ok(found)
    }
}
