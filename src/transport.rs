//! Request transport: the seam between the engine and the wire.
//!
//! The engine only ever issues requests through [`RequestTransport`], so tests
//! swap in scripted transports and the production [`HttpTransport`] owns all
//! URL/body/header assembly. Session state lives in a per-run
//! [`SessionContext`] plus the transport's own cookie store, never in
//! process-wide shared state.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::payload::{ContentKind, RequestSpec};

/// Errors surfaced by a transport. A failed request is recorded against its
/// iteration; it never aborts the run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),
}

/// Read-only session state shared by every iteration of one run.
///
/// Created once per run: anonymous when no authentication call is configured,
/// otherwise from the authentication call's response. Cookie state rides in
/// the transport's cookie store, so the session key stays local to the
/// process and is never sent on the wire.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Opaque identifier for this run's session. Empty for anonymous runs.
    pub session_key: String,

    /// Authentication parameters merged into each request.
    pub auth_params: HashMap<String, String>,
}

impl SessionContext {
    /// A session with no key and no authentication parameters.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A keyed session with no authentication parameters yet.
    pub fn with_key(session_key: String) -> Self {
        Self {
            session_key,
            auth_params: HashMap::new(),
        }
    }

    /// A fresh random session key.
    pub fn generate_key() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }

    /// Builds the session from an authentication response body.
    ///
    /// Top-level scalar fields of a JSON object body become authentication
    /// parameters; any other body is kept whole under the `content` key.
    pub fn from_auth_response(session_key: String, body: &[u8]) -> Self {
        let mut auth_params = HashMap::new();

        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Object(fields)) => {
                for (key, value) in fields {
                    let text = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => continue,
                    };
                    auth_params.insert(key, text);
                }
            }
            _ => {
                let text = String::from_utf8_lossy(body).into_owned();
                if !text.is_empty() {
                    auth_params.insert("content".to_string(), text);
                }
            }
        }

        debug!(
            params = auth_params.len(),
            "Parsed authentication response"
        );
        Self {
            session_key,
            auth_params,
        }
    }
}

/// Capability to issue one HTTP exchange described by a [`RequestSpec`].
///
/// Returns the response body bytes; the engine records their length and the
/// authentication flow parses them.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn issue(
        &self,
        spec: &RequestSpec,
        session: &SessionContext,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Production transport over reqwest.
///
/// Each instance owns its cookie store, so constructing one per run keeps
/// session cookies isolated between trials.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Raw body for `Json`/`Xml` requests, with `##key##` tokens substituted
    /// from the session's authentication parameters when the request merges
    /// auth into the body.
    fn raw_body(spec: &RequestSpec, session: &SessionContext) -> String {
        let mut body = spec.content().unwrap_or_default().to_string();
        if spec.body_transport {
            for (key, value) in &session.auth_params {
                body = body.replace(&format!("##{}##", key), value);
            }
        }
        body
    }

    /// Key/value pairs for `None`/`Form` requests, with authentication
    /// parameters appended when the request merges auth into the body.
    fn form_pairs(spec: &RequestSpec, session: &SessionContext) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = spec
            .parameters
            .iter()
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect();
        if spec.body_transport {
            for (key, value) in &session.auth_params {
                pairs.push((key.clone(), value.clone()));
            }
        }
        pairs
    }

    fn build(&self, spec: &RequestSpec, session: &SessionContext) -> reqwest::RequestBuilder {
        let mut builder = if spec.is_post {
            let builder = self.client.post(&spec.url);
            match spec.content_kind {
                ContentKind::Json => builder
                    .header("Content-Type", "application/json")
                    .body(Self::raw_body(spec, session)),
                ContentKind::Xml => builder
                    .header("Content-Type", "text/xml;charset=\"utf-8\"")
                    .body(Self::raw_body(spec, session)),
                ContentKind::Form | ContentKind::None => {
                    builder.form(&Self::form_pairs(spec, session))
                }
            }
        } else {
            self.client
                .get(&spec.url)
                .query(&Self::form_pairs(spec, session))
        };

        match spec.accept_kind {
            ContentKind::Json => builder = builder.header("Accept", "application/json"),
            ContentKind::Xml => builder = builder.header("Accept", "text/xml"),
            _ => {}
        }

        // Auth as headers when the request does not merge it into the body.
        if !spec.body_transport {
            for (key, value) in &session.auth_params {
                builder = builder.header(key, value);
            }
        }

        builder
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn issue(
        &self,
        spec: &RequestSpec,
        session: &SessionContext,
    ) -> Result<Vec<u8>, TransportError> {
        let response = self.build(spec, session).send().await?;
        let status = response.status();

        if !(status.is_success() || status.is_redirection()) {
            warn!(url = %spec.url, status = status.as_u16(), "Request rejected");
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        debug!(url = %spec.url, status = status.as_u16(), bytes = body.len(), "Request completed");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Parameter;

    #[test]
    fn session_key_is_random_alphanumeric() {
        let a = SessionContext::generate_key();
        let b = SessionContext::generate_key();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn auth_response_object_becomes_params() {
        let body = br#"{"token":"abc123","expires":3600,"admin":true,"nested":{"x":1}}"#;
        let session = SessionContext::from_auth_response("key".to_string(), body);

        assert_eq!(session.session_key, "key");
        assert_eq!(session.auth_params.get("token").unwrap(), "abc123");
        assert_eq!(session.auth_params.get("expires").unwrap(), "3600");
        assert_eq!(session.auth_params.get("admin").unwrap(), "true");
        // Non-scalar fields are not lifted.
        assert!(!session.auth_params.contains_key("nested"));
    }

    #[test]
    fn auth_response_non_json_kept_whole() {
        let session = SessionContext::from_auth_response("key".to_string(), b"session=xyz");
        assert_eq!(session.auth_params.get("content").unwrap(), "session=xyz");

        let empty = SessionContext::from_auth_response("key".to_string(), b"");
        assert!(empty.auth_params.is_empty());
    }

    #[test]
    fn raw_body_substitutes_auth_tokens() {
        let mut spec = RequestSpec::get("http://localhost/api");
        spec.parameters
            .push(Parameter::new("content", r###"{"token":"##token##"}"###));
        spec.body_transport = true;

        let mut session = SessionContext::with_key("k".to_string());
        session
            .auth_params
            .insert("token".to_string(), "abc".to_string());

        assert_eq!(
            HttpTransport::raw_body(&spec, &session),
            r#"{"token":"abc"}"#
        );
    }

    #[test]
    fn form_pairs_append_auth_only_for_body_transport() {
        let mut spec = RequestSpec::get("http://localhost/api");
        spec.parameters.push(Parameter::new("q", "1"));

        let mut session = SessionContext::anonymous();
        session
            .auth_params
            .insert("token".to_string(), "abc".to_string());

        let pairs = HttpTransport::form_pairs(&spec, &session);
        assert_eq!(pairs, vec![("q".to_string(), "1".to_string())]);

        spec.body_transport = true;
        let pairs = HttpTransport::form_pairs(&spec, &session);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&("token".to_string(), "abc".to_string())));
    }
}
