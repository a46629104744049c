//! HTTP 辅助工具：请求方案识别、客户端 IP、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::CSRF_HEADER_NAME;

#[derive(Clone, Copy, Debug)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    pub fn is_https(self) -> bool {
        matches!(self, RequestScheme::Https)
    }
}

/// 构建 CORS Layer（逗号分隔的来源列表）。允许携带凭据，因此方法与请求头需显式列出。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::list([Method::GET, Method::POST, Method::DELETE]))
            .allow_headers(AllowHeaders::list([
                header::CONTENT_TYPE,
                header::RANGE,
                header::IF_RANGE,
                HeaderName::from_static(CSRF_HEADER_NAME),
            ]))
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 可通过转发头代表客户端的代理地址。为空时连接对端即客户端。
#[derive(Clone, Debug, Default)]
pub struct TrustedProxies(Arc<[IpAddr]>);

impl TrustedProxies {
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self(addrs.into())
    }

    fn trusts(&self, peer: IpAddr) -> bool {
        self.0.contains(&peer)
    }

    /// 对端为可信代理时取 `x-forwarded-for`，否则取对端地址。
    pub fn client_ip(&self, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
        if self.trusts(peer) {
            extract_forwarded_ip(headers).unwrap_or(peer)
        } else {
            peer
        }
    }

    /// 判断请求是否为 HTTPS（含可信反向代理头）。
    pub fn is_https(&self, headers: &HeaderMap, peer: IpAddr, scheme: RequestScheme) -> bool {
        if self.trusts(peer)
            && let Some(value) = headers
                .get("x-forwarded-proto")
                .and_then(|value| value.to_str().ok())
        {
            return value.eq_ignore_ascii_case("https");
        }
        scheme.is_https()
    }
}

pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    Ok(response)
}
