//! Render request parsing and normalization.
//!
//! Callers send a loosely shaped JSON body. [`RenderRequest::normalize`]
//! turns it into either a status query or a fully validated [`Submission`];
//! nothing downstream looks at the raw request again.

use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::job::{Engine, JobHandle};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Provide exactly one of \"html\" or \"markdown\" in the request body.")]
    ContentChoice,

    #[error("Invalid Renderer Option passed, valid options are \"weasyprint\", \"pagedjs\", and \"vivliostyle\"")]
    InvalidRenderer,

    #[error("Invalid Sync Option passed, valid options are \"true\", and \"false\"")]
    InvalidSync,

    #[error("Invalid Renderer Option passed, as the renderer does not support JavaScript use \"pagedjs\", or \"vivliostyle\" as renderer")]
    JavascriptUnsupported,

    #[error("The data key needs to contain an array")]
    DataNotArray,

    #[error("Each entry of the data key needs to be an object")]
    DataRowNotObject,

    #[error("Can not base64 decode the assets zip file")]
    AssetsNotBase64,

    #[error("Failed to convert markdown to HTML")]
    Markdown,

    #[error("Malformed request body: {0}")]
    Malformed(String),
}

/// Nested `options` object of a request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub renderer: Option<Value>,
    #[serde(default)]
    pub sync: Option<Value>,
}

/// Raw request body as sent by the caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub markdown: Option<String>,
    #[serde(default)]
    pub css: Option<String>,
    #[serde(default)]
    pub javascript: Option<String>,
    #[serde(default)]
    pub renderer: Option<Value>,
    #[serde(default)]
    pub sync: Option<Value>,
    #[serde(default)]
    pub assets: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub options: Option<RequestOptions>,
    #[serde(default)]
    pub pdfid: Option<String>,
}

/// Document body of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Html(String),
    Markdown(String),
}

/// A validated render submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub content: Content,
    pub css: String,
    pub javascript: String,
    pub engine: Engine,
    pub sync: bool,
    /// Base64 encoded zip bundle, already checked to decode.
    pub assets: Option<String>,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Status(JobHandle),
    Submit(Submission),
}

impl RenderRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(body).map_err(|err| ValidationError::Malformed(err.to_string()))
    }

    /// Validates the request. A non-empty `pdfid` wins over every other field.
    pub fn normalize(self) -> Result<Normalized, ValidationError> {
        if let Some(pdfid) = non_blank(self.pdfid.as_deref()) {
            return Ok(Normalized::Status(JobHandle::from(pdfid)));
        }

        let content = match (
            non_blank(self.html.as_deref()),
            non_blank(self.markdown.as_deref()),
        ) {
            (Some(html), None) => Content::Html(html.to_string()),
            (None, Some(markdown)) => Content::Markdown(markdown.to_string()),
            _ => return Err(ValidationError::ContentChoice),
        };

        let options = self.options.unwrap_or_default();
        let javascript = self.javascript.unwrap_or_default();
        let has_javascript = !javascript.trim().is_empty();

        let chosen = match options.renderer.or(self.renderer) {
            Some(value) => parse_renderer(&value)?,
            None => None,
        };
        let engine = match chosen {
            Some(engine) if has_javascript && !engine.supports_javascript() => {
                return Err(ValidationError::JavascriptUnsupported)
            }
            Some(engine) => engine,
            None if has_javascript => Engine::PagedJs,
            None => Engine::default(),
        };

        let sync = match options.sync.or(self.sync) {
            Some(value) => parse_sync(&value)?,
            None => true,
        };

        let data = match self.data {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(rows)) => {
                if !rows.iter().all(Value::is_object) {
                    return Err(ValidationError::DataRowNotObject);
                }
                rows
            }
            Some(row @ Value::Object(_)) => vec![row],
            Some(_) => return Err(ValidationError::DataNotArray),
        };

        let assets = match non_blank(self.assets.as_deref()) {
            Some(encoded) => {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| ValidationError::AssetsNotBase64)?;
                Some(encoded.to_string())
            }
            None => None,
        };

        Ok(Normalized::Submit(Submission {
            content,
            css: self.css.unwrap_or_default(),
            javascript,
            engine,
            sync,
            assets,
            data,
        }))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_renderer(value: &Value) -> Result<Option<Engine>, ValidationError> {
    match value {
        Value::Null => Ok(None),
        Value::String(name) if name.is_empty() => Ok(None),
        Value::String(name) => name
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::InvalidRenderer),
        _ => Err(ValidationError::InvalidRenderer),
    }
}

fn parse_sync(value: &Value) -> Result<bool, ValidationError> {
    match value {
        Value::Bool(sync) => Ok(*sync),
        Value::String(flag) if flag == "true" => Ok(true),
        Value::String(flag) if flag == "false" => Ok(false),
        _ => Err(ValidationError::InvalidSync),
    }
}
