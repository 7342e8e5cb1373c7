//! Helpers for collecting GraphQL connections with cursor pagination.
//!
//! A connection query takes `$first` and `$after` variables and exposes
//! `nodes` plus `pageInfo { hasNextPage endCursor }` at a known path.

use std::sync::Arc;

use sluice_core::collector::{NextCursorFn, Pagination, Resource, ResponseParser};
use sluice_core::error::AppError;
use sluice_core::request::ApiResponse;

/// Body of a GraphQL response, failing on a non-empty `errors` array.
fn data_of(response: &ApiResponse) -> Result<serde_json::Value, AppError> {
    let body: serde_json::Value = response.json_body()?;
    if let Some(errors) = body.get("errors").and_then(serde_json::Value::as_array)
        && !errors.is_empty()
    {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(serde_json::Value::as_str))
            .collect();
        return Err(AppError::InvalidInput(format!(
            "GraphQL errors from {}: {}",
            response.url,
            messages.join("; ")
        )));
    }
    Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null))
}

/// Parser returning the `nodes` of the connection at `connection` (a JSON
/// pointer relative to `data`, e.g. `/project/issues`).
pub fn nodes_at(connection: &str) -> ResponseParser {
    let pointer = format!("{connection}/nodes");
    Arc::new(move |response| {
        let data = data_of(response)?;
        match data.pointer(&pointer) {
            Some(serde_json::Value::Array(nodes)) => Ok(nodes.clone()),
            Some(serde_json::Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(AppError::InvalidInput(format!(
                "Expected a node list at '{pointer}'"
            ))),
        }
    })
}

/// Next cursor from the connection's `pageInfo`.
pub fn page_info_at(connection: &str) -> NextCursorFn {
    let pointer = format!("{connection}/pageInfo");
    Arc::new(move |response| {
        let data = data_of(response)?;
        let Some(info) = data.pointer(&pointer) else {
            return Ok(None);
        };
        let has_next = info
            .get("hasNextPage")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !has_next {
            return Ok(None);
        }
        Ok(info
            .get("endCursor")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string))
    })
}

/// A POST resource walking a GraphQL connection page by page.
///
/// `variables` may reference scope params; `first` and `after` are filled
/// in per page from the page size and the current cursor.
pub fn connection(
    name: &str,
    url: &str,
    query: &str,
    connection: &str,
    variables: serde_json::Value,
) -> Result<Resource, AppError> {
    let query = query.to_string();
    let body = Arc::new(move |data: &sluice_core::request::RequestData| {
        let mut vars = match &variables {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(AppError::InvalidInput(
                    "GraphQL variables must be a JSON object".into(),
                ));
            }
        };
        vars.insert("first".into(), data.pager.size.into());
        vars.insert(
            "after".into(),
            data.cursor
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::String),
        );
        Ok(serde_json::json!({ "query": query, "variables": vars }))
    });

    Ok(Resource::post(name, url, body)?
        .with_parser(nodes_at(connection))
        .with_pagination(Pagination::Cursor(page_info_at(connection))))
}
