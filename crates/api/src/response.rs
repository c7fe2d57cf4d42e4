//! 请求体解码、内容协商与列表响应

use axum::{
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Multipart, Request},
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use taskhub_core::models::{ListQuery, Page};
use taskhub_core::HubError;

use crate::error::{ApiError, ApiResult};

pub const X_TOTAL: &str = "x-total";
/// 未分页时允许返回的最大条数
pub const UNPAGED_MAX: i64 = 500;
/// X-Total 的上限
pub const TOTAL_CAP: i64 = 50_000;

const YAML_TYPES: [&str; 3] = ["application/x-yaml", "application/yaml", "text/yaml"];

/// 响应格式，由 Accept 头决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if YAML_TYPES.iter().any(|t| accept.contains(t)) {
            Format::Yaml
        } else {
            Format::Json
        }
    }
}

impl<S> FromRequestParts<S> for Format
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Format::from_headers(&parts.headers))
    }
}

pub fn render<T: Serialize>(format: Format, status: StatusCode, value: &T) -> ApiResult<Response> {
    match format {
        Format::Json => Ok((status, Json(value)).into_response()),
        Format::Yaml => {
            let body = serde_yaml::to_string(value)
                .map_err(|e| HubError::Serialization(e.to_string()))?;
            Ok((status, [(header::CONTENT_TYPE, YAML_TYPES[0])], body).into_response())
        }
    }
}

/// 列表响应：设置 X-Total，未分页且超过上限时拒绝
pub fn render_page<T: Serialize>(
    format: Format,
    query: &ListQuery,
    page: Page<T>,
) -> ApiResult<Response> {
    let total = total_header(query, page.total);
    if !query.is_paged() && page.total > UNPAGED_MAX {
        return Err(ApiError::LimitRequired { total });
    }
    let mut response = render(format, StatusCode::OK, &page.items)?;
    if let Ok(value) = HeaderValue::from_str(&total) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(X_TOTAL), value);
    }
    Ok(response)
}

pub fn total_header(query: &ListQuery, total: i64) -> String {
    if !query.is_paged() && total > TOTAL_CAP {
        format!(">{TOTAL_CAP}")
    } else {
        total.to_string()
    }
}

/// 按 Content-Type 解码请求体（JSON 或 YAML）
pub fn decode<T: DeserializeOwned>(content_type: Option<&str>, body: &[u8]) -> ApiResult<T> {
    let mime = content_type
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .unwrap_or("application/json");
    if mime.is_empty() || mime == "application/json" {
        serde_json::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))
    } else if YAML_TYPES.contains(&mime) {
        serde_yaml::from_slice(body).map_err(|e| ApiError::bad_request(e.to_string()))
    } else {
        Err(ApiError::UnsupportedMedia(mime.to_string()))
    }
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// JSON 或 YAML 请求体
pub struct Payload<T>(pub T);

impl<T, S> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mime = content_type(req.headers()).map(str::to_string);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        decode(mime.as_deref(), &body).map(Payload)
    }
}

/// 可为空的请求体
pub struct OptionalPayload<T>(pub Option<T>);

impl<T, S> FromRequest<S> for OptionalPayload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mime = content_type(req.headers()).map(str::to_string);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(OptionalPayload(None));
        }
        decode(mime.as_deref(), &body).map(|v| OptionalPayload(Some(v)))
    }
}

/// 上传内容：multipart 取第一个字段，否则取原始请求体
pub struct Upload {
    pub content: Bytes,
    pub content_type: Option<String>,
}

impl<S> FromRequest<S> for Upload
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mime = content_type(req.headers()).map(str::to_string);
        if mime
            .as_deref()
            .is_some_and(|m| m.starts_with("multipart/form-data"))
        {
            let mut multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            let field = multipart
                .next_field()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?
                .ok_or_else(|| ApiError::bad_request("multipart 请求缺少文件字段"))?;
            let content_type = field.content_type().map(str::to_string);
            let content = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            return Ok(Upload {
                content,
                content_type,
            });
        }

        let content = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(Upload {
            content,
            content_type: mime,
        })
    }
}

/// 原始内容响应
pub fn raw(content_type: &str, body: Vec<u8>) -> Response {
    let content_type = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.to_string())],
        body,
    )
        .into_response()
}
