use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::PipelineError;

/// Header carrying raw init data (preferred transport)
pub const INIT_DATA_HEADER: &str = "X-Telegram-Init-Data";
/// `Authorization: tma <init data>` form used by some WebApp clients
const AUTHORIZATION_SCHEME: &str = "tma ";
/// Query parameter fallback for clients that cannot set headers (e.g. <video src>)
const INIT_DATA_QUERY_PARAM: &str = "initData";

/// Raw, unverified identity token pulled off the request.
/// Absence rejects the request before any other work happens.
#[derive(Debug, Clone)]
pub struct InitData(pub String);

impl<S> FromRequestParts<S> for InitData
where
    S: Send + Sync,
{
    type Rejection = PipelineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        find_init_data(parts)
            .map(InitData)
            .ok_or(PipelineError::Unauthenticated)
    }
}

fn find_init_data(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(INIT_DATA_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }

    if let Some(value) = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(AUTHORIZATION_SCHEME))
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }

    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, value)| name == INIT_DATA_QUERY_PARAM && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}
