//! Request/response values exchanged with a [`Transport`](crate::traits::Transport),
//! plus the per-page template data the collector renders requests from.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// HTTP method of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An outbound REST or GraphQL call.
///
/// `url` may be relative to the client endpoint until the
/// [`AsyncClient`](crate::client::AsyncClient) resolves it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// A GraphQL call is a POST of `{query, variables}`.
    pub fn graphql(url: impl Into<String>, query: &str, variables: serde_json::Value) -> Self {
        Self::post(
            url,
            serde_json::json!({ "query": query, "variables": variables }),
        )
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set a header, replacing any existing value (case-insensitive name).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub url: String,
    /// Header names are stored lowercase.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            url: url.into(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Build a response carrying a JSON body.
    pub fn json(status: u16, url: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(status, url, value.to_string()).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text, lossy, truncated to `max` bytes for error messages.
    pub fn text_snippet(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.body);
        match text.char_indices().nth(max) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.into_owned(),
        }
    }
}

/// Pagination position of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pager {
    /// 1-based page number.
    pub page: usize,
    pub size: usize,
    /// Number of items before this page.
    pub skip: usize,
}

impl Pager {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size,
            skip: size * page.saturating_sub(1),
        }
    }
}

/// Everything a request template may reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestData {
    pub pager: Pager,
    pub params: serde_json::Value,
    pub input: Option<serde_json::Value>,
    pub cursor: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Page,
    Size,
    Skip,
    Cursor,
    Since,
    Param(Vec<String>),
    Input(Vec<String>),
}

/// A string with `{placeholder}` slots rendered from [`RequestData`].
///
/// Supported placeholders: `{page}`, `{size}`, `{skip}`, `{cursor}`,
/// `{since}`, `{params.<path>}` and `{input.<path>}`, where `<path>` is a
/// dot-separated walk into the JSON value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                AppError::InvalidInput(format!("Unclosed placeholder in template '{raw}'"))
            })?;
            segments.push(Self::placeholder(raw, after[..close].trim())?);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    fn placeholder(raw: &str, name: &str) -> Result<Segment, AppError> {
        let path = |prefix: &str| -> Option<Vec<String>> {
            name.strip_prefix(prefix)
                .filter(|p| !p.is_empty())
                .map(|p| p.split('.').map(str::to_string).collect())
        };
        match name {
            "page" => Ok(Segment::Page),
            "size" => Ok(Segment::Size),
            "skip" => Ok(Segment::Skip),
            "cursor" => Ok(Segment::Cursor),
            "since" => Ok(Segment::Since),
            _ => {
                if let Some(p) = path("params.") {
                    Ok(Segment::Param(p))
                } else if let Some(p) = path("input.") {
                    Ok(Segment::Input(p))
                } else {
                    Err(AppError::InvalidInput(format!(
                        "Unknown placeholder '{{{name}}}' in template '{raw}'"
                    )))
                }
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if rendering needs a pagination cursor.
    pub fn uses_cursor(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Cursor))
    }

    /// True if rendering needs a watermark.
    pub fn uses_since(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Since))
    }

    pub fn render(&self, data: &RequestData) -> Result<String, AppError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Page => out.push_str(&data.pager.page.to_string()),
                Segment::Size => out.push_str(&data.pager.size.to_string()),
                Segment::Skip => out.push_str(&data.pager.skip.to_string()),
                Segment::Cursor => {
                    let cursor = data
                        .cursor
                        .as_deref()
                        .ok_or_else(|| AppError::MissingField("cursor".into()))?;
                    out.push_str(cursor);
                }
                Segment::Since => {
                    let since = data
                        .since
                        .ok_or_else(|| AppError::MissingField("since".into()))?;
                    out.push_str(&since.to_rfc3339_opts(SecondsFormat::Secs, true));
                }
                Segment::Param(path) => {
                    out.push_str(&lookup(&data.params, path, "params")?);
                }
                Segment::Input(path) => {
                    let input = data
                        .input
                        .as_ref()
                        .ok_or_else(|| AppError::MissingField("input".into()))?;
                    out.push_str(&lookup(input, path, "input")?);
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for UrlTemplate {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn lookup(root: &serde_json::Value, path: &[String], prefix: &str) -> Result<String, AppError> {
    let missing = || AppError::MissingField(format!("{prefix}.{}", path.join(".")));
    let value = path
        .iter()
        .try_fold(root, |value, key| value.get(key.as_str()))
        .ok_or_else(missing)?;
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(missing()),
    }
}
