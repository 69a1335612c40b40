//! Load and batch descriptions.
//!
//! These are the read-only inputs to the engine and the control channel: a
//! request template, a single-trial load specification, and the named batch
//! submitted between cooperating instances. All of them are plain data,
//! created at parse time and shared read-only across concurrent iterations.

use serde::{Deserialize, Serialize};

/// Body/response content kind for a templated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentKind {
    /// No structured content.
    #[default]
    None,
    /// `application/x-www-form-urlencoded` key/value pairs.
    Form,
    /// Raw JSON body taken from the `content` parameter.
    #[serde(rename = "JSON")]
    Json,
    /// Raw XML body taken from the `content` parameter.
    #[serde(rename = "XML")]
    Xml,
}

/// One ordered request parameter.
///
/// For `Form`/`None` requests parameters become `key=value` pairs; for
/// `Json`/`Xml` requests the parameter named [`Parameter::CONTENT_KEY`]
/// carries the raw body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl Parameter {
    /// Parameter key whose value is used verbatim as the request body for
    /// `Json`/`Xml` content kinds.
    pub const CONTENT_KEY: &'static str = "content";

    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Immutable description of one HTTP call to issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Target URL.
    #[serde(rename = "Url")]
    pub url: String,

    /// Ordered parameter list.
    #[serde(rename = "Parameter", default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,

    /// Text encoding name for the request body (e.g. "utf-8").
    #[serde(rename = "Encoding", default = "default_encoding")]
    pub encoding: String,

    /// Content kind of the request body.
    #[serde(rename = "ContentKind", default)]
    pub content_kind: ContentKind,

    /// Content kind accepted in the response.
    #[serde(rename = "AcceptKind", default)]
    pub accept_kind: ContentKind,

    /// POST when true, GET otherwise.
    #[serde(rename = "IsPost", default)]
    pub is_post: bool,

    /// When true, authentication parameters are merged into the body;
    /// otherwise they are sent as request headers.
    #[serde(rename = "BodyTransport", default)]
    pub body_transport: bool,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl RequestSpec {
    /// A GET request for `url` with no parameters.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parameters: Vec::new(),
            encoding: default_encoding(),
            content_kind: ContentKind::None,
            accept_kind: ContentKind::None,
            is_post: false,
            body_transport: false,
        }
    }

    /// The raw body content for `Json`/`Xml` requests, if declared.
    pub fn content(&self) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == Parameter::CONTENT_KEY)
            .map(|p| p.value.as_str())
    }
}

/// One concurrency trial: the ordered request list run `load_size` times with
/// at most `concurrent_size` iterations in flight.
#[derive(Debug, Clone, Default)]
pub struct LoadSpec {
    /// Requests executed in order within each iteration.
    pub requests: Vec<RequestSpec>,

    /// Optional authentication call issued once before the run.
    pub auth: Option<RequestSpec>,

    /// Number of iterations to run. Zero means the run is a no-op.
    pub load_size: u64,

    /// Maximum number of iterations in flight at once.
    pub concurrent_size: u32,

    /// Iterations per windowed throughput sample. Zero disables sampling.
    pub throughput_size: u64,
}

impl LoadSpec {
    /// True when the run would perform no work.
    pub fn is_empty(&self) -> bool {
        self.load_size == 0 || self.requests.is_empty()
    }
}

/// A named batch: one request set trialled at several concurrency levels.
/// This is the unit submitted across the distributed control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "BatchSpec")]
pub struct BatchSpec {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "LoadSize")]
    pub load_size: u64,

    #[serde(rename = "ThroughputSize", default)]
    pub throughput_size: u64,

    /// Concurrency levels trialled sequentially.
    #[serde(
        rename = "ConcurrencyLevel",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub concurrency_levels: Vec<u32>,

    #[serde(rename = "Request", default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<RequestSpec>,

    #[serde(rename = "Auth", default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RequestSpec>,
}

impl BatchSpec {
    /// The single-trial spec for one concurrency level of this batch.
    pub fn load_spec(&self, concurrent_size: u32) -> LoadSpec {
        LoadSpec {
            requests: self.requests.clone(),
            auth: self.auth.clone(),
            load_size: self.load_size,
            concurrent_size,
            throughput_size: self.throughput_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_load_specs() {
        let spec = LoadSpec::default();
        assert!(spec.is_empty());

        let spec = LoadSpec {
            requests: vec![RequestSpec::get("http://localhost/")],
            load_size: 0,
            ..Default::default()
        };
        assert!(spec.is_empty());

        let spec = LoadSpec {
            requests: vec![RequestSpec::get("http://localhost/")],
            load_size: 1,
            ..Default::default()
        };
        assert!(!spec.is_empty());
    }

    #[test]
    fn content_parameter_lookup() {
        let mut spec = RequestSpec::get("http://localhost/api");
        assert_eq!(spec.content(), None);

        spec.parameters
            .push(Parameter::new("content", r#"{"a":1}"#));
        assert_eq!(spec.content(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn batch_expands_to_load_spec() {
        let batch = BatchSpec {
            name: "checkout".to_string(),
            load_size: 50,
            throughput_size: 5,
            concurrency_levels: vec![1, 10],
            requests: vec![RequestSpec::get("http://localhost/cart")],
            auth: None,
        };

        let spec = batch.load_spec(10);
        assert_eq!(spec.load_size, 50);
        assert_eq!(spec.concurrent_size, 10);
        assert_eq!(spec.throughput_size, 5);
        assert_eq!(spec.requests.len(), 1);
        assert!(spec.auth.is_none());
    }
}
