use axum::{
    Json,
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request metadata echoed in every success and error body.
#[derive(Clone, Debug, Serialize)]
pub struct RequestMeta {
    pub request_id: String,
    pub request_at: String, // RFC3339
    pub timestamp: i64,     // unix seconds
}

impl RequestMeta {
    fn new(request_id: Option<String>) -> Self {
        let now: DateTime<Utc> = Utc::now();
        RequestMeta {
            request_id: request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            request_at: now.to_rfc3339(),
            timestamp: now.timestamp(),
        }
    }
}

// Middleware: attaches RequestMeta into request extensions. A caller-supplied
// x-request-id is kept; the id is echoed on the response either way.
pub async fn meta_middleware(mut req: Request<Body>, next: Next) -> Response {
    let supplied = req
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_owned);
    let meta = RequestMeta::new(supplied);
    let echo = HeaderValue::from_str(&meta.request_id).ok();
    req.extensions_mut().insert(meta);

    let mut response = next.run(req).await;
    if let Some(value) = echo {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl Pagination {
    pub fn new(page: u32, per_page: u32, total: u64) -> Self {
        let total_pages = if per_page == 0 {
            0
        } else {
            total.div_ceil(per_page as u64) as u32
        };
        Self {
            page,
            per_page,
            total,
            total_pages,
        }
    }
}

#[derive(Serialize)]
pub struct SuccessEnvelope<T> {
    pub message: String,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    pub meta: RequestMeta,
}

pub struct ApiOk<T> {
    status: StatusCode,
    body: SuccessEnvelope<T>,
}

impl<T> ApiOk<T> {
    fn with_status(status: StatusCode, message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self {
            status,
            body: SuccessEnvelope {
                message: message.into(),
                data,
                pagination: None,
                meta,
            },
        }
    }

    pub fn ok(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::with_status(StatusCode::OK, message, data, meta)
    }

    pub fn created(message: impl Into<String>, data: T, meta: RequestMeta) -> Self {
        Self::with_status(StatusCode::CREATED, message, data, meta)
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.body.pagination = Some(pagination);
        self
    }
}

impl<T: Serialize> IntoResponse for ApiOk<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_rounds_pages_up() {
        let p = Pagination::new(1, 20, 41);
        assert_eq!(p.total_pages, 3);
        assert_eq!(Pagination::new(1, 20, 0).total_pages, 0);
        assert_eq!(Pagination::new(1, 0, 5).total_pages, 0);
    }

    #[test]
    fn supplied_request_id_is_kept() {
        let meta = RequestMeta::new(Some("req-42".into()));
        assert_eq!(meta.request_id, "req-42");
        assert!(Uuid::parse_str(&RequestMeta::new(None).request_id).is_ok());
    }

    #[test]
    fn envelope_omits_missing_pagination() {
        let meta = RequestMeta::new(Some("r".into()));
        let ok = ApiOk::created("done", 5, meta);
        assert_eq!(ok.status, StatusCode::CREATED);
        let json = serde_json::to_value(&ok.body).unwrap();
        assert!(json.get("pagination").is_none());
        assert_eq!(json["data"], 5);

        let paged = ok.with_pagination(Pagination::new(2, 10, 15));
        let json = serde_json::to_value(&paged.body).unwrap();
        assert_eq!(json["pagination"]["total_pages"], 2);
    }
}
