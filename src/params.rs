use axum::{
    body::Bytes,
    extract::{FromRequest, Request},
    http::header::CONTENT_TYPE,
};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::convert::Infallible;
use tracing::debug;

use crate::ApiError;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Request parameters decoded from a form-encoded or JSON body.
///
/// Never rejects: an unreadable or malformed body yields `T::default()`, so
/// handlers see it exactly like a body with every field missing.
#[derive(Debug)]
pub struct Params<T>(pub T);

impl<S, T> FromRequest<S> for Params<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default + Send,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let form_encoded = req
            .headers()
            .get(CONTENT_TYPE)
            .is_some_and(|value| value.as_bytes() == FORM_URLENCODED.as_bytes());

        match Bytes::from_request(req, state).await {
            Ok(body) => Ok(Self(decode_params(&body, form_encoded))),
            Err(rejection) => {
                debug!("Request body could not be read, using empty parameters: {rejection}");
                Ok(Self(T::default()))
            }
        }
    }
}

fn decode_params<T: DeserializeOwned + Default>(body: &[u8], form_encoded: bool) -> T {
    let text = String::from_utf8_lossy(body);

    let value = if form_encoded {
        let fields: Map<String, Value> = url::form_urlencoded::parse(text.as_bytes())
            .map(|(key, value)| (key.into_owned(), Value::String(value.into_owned())))
            .collect();
        Value::Object(fields)
    } else {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(error) => {
                debug!("Request body is not valid JSON, using empty parameters: {error}");
                return T::default();
            }
        }
    };

    serde_json::from_value(value).unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct FormatsParams {
    #[serde(default, deserialize_with = "lenient_text")]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    #[serde(default, deserialize_with = "lenient_text")]
    url: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    format_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    start_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub format_id: Option<String>,
    pub start_time: String,
    pub end_time: String,
}

impl FormatsParams {
    pub fn validate(self) -> Result<String, ApiError> {
        present(self.url).ok_or_else(|| ApiError::missing_parameter("URL is required"))
    }
}

impl DownloadParams {
    pub fn validate(self) -> Result<DownloadRequest, ApiError> {
        let (Some(url), Some(start_time), Some(end_time)) = (
            present(self.url),
            present(self.start_time),
            present(self.end_time),
        ) else {
            return Err(ApiError::missing_parameter("Missing parameters"));
        };

        Ok(DownloadRequest {
            url,
            format_id: present(self.format_id),
            start_time,
            end_time,
        })
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

// Numbers are kept as their text; other non-string values count as missing.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}
