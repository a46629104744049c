//! 会话网关：登录、CSRF token 与 `/api` 认证中间件。

use async_trait::async_trait;
use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::{CookieJar, cookie::Cookie};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AUTH_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::{RequestScheme, TrustedProxies};
use crate::rate_limit::RateLimiter;

/// 业务服务使用的鉴权接口：会话是否有效、CSRF token 是否匹配。
#[async_trait]
pub trait AuthGate: Send + Sync {
    async fn authorize(&self, session: Option<&str>) -> bool;
    async fn verify_csrf(&self, session: Option<&str>, csrf_token: &str) -> bool;
}

#[derive(Debug)]
struct SessionEntry {
    expires_at: Instant,
    csrf_token: String,
}

pub struct SessionGate {
    username: String,
    password: String,
    session_ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    limiter: Arc<dyn RateLimiter>,
    lockout: Duration,
}

impl SessionGate {
    pub fn new(
        username: String,
        password: String,
        session_ttl: Duration,
        limiter: Arc<dyn RateLimiter>,
        lockout: Duration,
    ) -> Self {
        Self {
            username,
            password,
            session_ttl,
            sessions: Mutex::new(HashMap::new()),
            limiter,
            lockout,
        }
    }

    fn credentials_match(&self, username: &str, password: &str) -> bool {
        let user_ok = self.username.as_bytes().ct_eq(username.as_bytes());
        let pass_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        (user_ok & pass_ok).into()
    }

    /// 返回 `(会话 token, csrf token)`。
    async fn create_session(&self) -> (String, String) {
        let token = Uuid::new_v4().simple().to_string();
        let csrf_token = Uuid::new_v4().simple().to_string();
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            token.clone(),
            SessionEntry {
                expires_at: Instant::now() + self.session_ttl,
                csrf_token: csrf_token.clone(),
            },
        );
        (token, csrf_token)
    }

    /// 返回有效会话的 CSRF token，并顺延过期时间。
    async fn touch(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        match sessions.get_mut(token) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.session_ttl;
                Some(entry.csrf_token.clone())
            }
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    async fn remove_session(&self, token: &str) {
        self.sessions.lock().await.remove(token);
    }

    /// 清理过期会话。
    pub async fn prune_expired(&self) {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        sessions.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl AuthGate for SessionGate {
    async fn authorize(&self, session: Option<&str>) -> bool {
        match session {
            Some(token) => self.touch(token).await.is_some(),
            None => false,
        }
    }

    async fn verify_csrf(&self, session: Option<&str>, csrf_token: &str) -> bool {
        let Some(token) = session else {
            return false;
        };
        let Some(expected) = self.touch(token).await else {
            return false;
        };
        !csrf_token.is_empty() && bool::from(expected.as_bytes().ct_eq(csrf_token.as_bytes()))
    }
}

/// 从 Cookie 中读取会话 token。
pub fn session_token(jar: &CookieJar) -> Option<String> {
    jar.get(AUTH_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string())
}

/// 认证中间件：`/api` 下除登录与媒体接口外都需要有效会话。
pub async fn auth_middleware(
    Extension(gate): Extension<Arc<SessionGate>>,
    jar: CookieJar,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }
    if gate.authorize(session_token(&jar).as_deref()).await {
        return Ok(next.run(req).await);
    }
    warn!(op = "auth", method = %req.method(), path = req.uri().path(), "request without session");
    Err(ApiError::Unauthorized)
}

fn is_auth_exempt_path(path: &str) -> bool {
    if path == "/api/auth/login" || path == "/api/auth/logout" || path == "/api/auth/status" {
        return true;
    }
    // 媒体接口自行检查相册可见性。
    if path.starts_with("/api/media/") {
        return true;
    }
    !path.starts_with("/api/")
}

#[derive(Deserialize)]
pub(crate) struct AuthLoginRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub csrf_token: String,
}

/// 登录接口：校验限流与凭据，创建会话并写入 Cookie。
pub async fn auth_login(
    Extension(gate): Extension<Arc<SessionGate>>,
    Extension(scheme): Extension<RequestScheme>,
    Extension(proxies): Extension<TrustedProxies>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, Json<SessionInfo>), ApiError> {
    // 仅信任已配置代理发来的转发头。
    let client_ip = proxies.client_ip(&headers, addr.ip());
    let limiter_key = client_ip.to_string();

    if gate.limiter.locked(&limiter_key).await? {
        warn!(client_ip = %client_ip, op = "login", "login blocked by rate limit");
        return Err(ApiError::TooManyRequests(gate.lockout.as_secs()));
    }

    if !gate.credentials_match(&payload.username, &payload.password) {
        gate.limiter.record_failure(&limiter_key).await?;
        warn!(client_ip = %client_ip, op = "login", "login failed");
        return Err(ApiError::Unauthorized);
    }
    gate.limiter.clear(&limiter_key).await?;

    let (token, csrf_token) = gate.create_session().await;
    let secure = proxies.is_https(&headers, addr.ip(), scheme);
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .max_age(CookieDuration::seconds(gate.session_ttl.as_secs() as i64))
        .build();
    info!(client_ip = %client_ip, op = "login", "login success");
    Ok((jar.add(cookie), Json(SessionInfo { csrf_token })))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(gate): Extension<Arc<SessionGate>>,
    jar: CookieJar,
) -> (CookieJar, axum::http::StatusCode) {
    if let Some(token) = session_token(&jar) {
        gate.remove_session(&token).await;
    }
    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        axum::http::StatusCode::NO_CONTENT,
    )
}

/// 查询当前登录状态，返回会话的 CSRF token。
pub async fn auth_status(
    Extension(gate): Extension<Arc<SessionGate>>,
    jar: CookieJar,
) -> Result<Json<SessionInfo>, ApiError> {
    let token = session_token(&jar).ok_or(ApiError::Unauthorized)?;
    let csrf_token = gate.touch(&token).await.ok_or(ApiError::Unauthorized)?;
    Ok(Json(SessionInfo { csrf_token }))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::FileRateLimiter;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn make_gate(dir: &std::path::Path, ttl: Duration) -> Arc<SessionGate> {
        let limiter = Arc::new(FileRateLimiter::new(
            dir.join("rate.json"),
            2,
            Duration::from_secs(900),
        ));
        Arc::new(SessionGate::new(
            "admin".into(),
            "secret".into(),
            ttl,
            limiter,
            Duration::from_secs(900),
        ))
    }

    async fn login(
        gate: &Arc<SessionGate>,
        password: &str,
    ) -> Result<(CookieJar, Json<SessionInfo>), ApiError> {
        login_from(gate, password, IpAddr::V4(Ipv4Addr::LOCALHOST), HeaderMap::new()).await
    }

    async fn login_from(
        gate: &Arc<SessionGate>,
        password: &str,
        peer: IpAddr,
        headers: HeaderMap,
    ) -> Result<(CookieJar, Json<SessionInfo>), ApiError> {
        auth_login(
            Extension(gate.clone()),
            Extension(RequestScheme::Http),
            Extension(TrustedProxies::default()),
            ConnectInfo(SocketAddr::new(peer, 40000)),
            headers,
            CookieJar::new(),
            Json(AuthLoginRequest {
                username: "admin".into(),
                password: password.into(),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn login_issues_session_and_csrf() {
        let temp = tempdir().expect("tempdir");
        let gate = make_gate(temp.path(), Duration::from_secs(60));
        let (jar, Json(info)) = login(&gate, "secret").await.expect("login");
        let token = session_token(&jar).expect("cookie set");

        assert!(gate.authorize(Some(&token)).await);
        assert!(gate.verify_csrf(Some(&token), &info.csrf_token).await);
        assert!(!gate.verify_csrf(Some(&token), "forged").await);
        assert!(!gate.verify_csrf(Some(&token), "").await);
        assert!(!gate.verify_csrf(None, &info.csrf_token).await);
    }

    #[tokio::test]
    async fn repeated_failures_lock_out_even_correct_password() {
        let temp = tempdir().expect("tempdir");
        let gate = make_gate(temp.path(), Duration::from_secs(60));
        for _ in 0..2 {
            assert!(matches!(
                login(&gate, "wrong").await,
                Err(ApiError::Unauthorized)
            ));
        }
        assert!(matches!(
            login(&gate, "secret").await,
            Err(ApiError::TooManyRequests(900))
        ));
    }

    #[tokio::test]
    async fn rotating_forwarded_for_does_not_escape_lockout() {
        let temp = tempdir().expect("tempdir");
        let gate = make_gate(temp.path(), Duration::from_secs(60));
        let peer = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9));
        let mut locked = 0;
        for i in 0..20 {
            let mut headers = HeaderMap::new();
            headers.insert(
                "x-forwarded-for",
                format!("10.0.0.{i}").parse().expect("header value"),
            );
            if let Err(ApiError::TooManyRequests(_)) =
                login_from(&gate, "wrong", peer, headers).await
            {
                locked += 1;
            }
        }
        assert_eq!(locked, 18);
        assert!(matches!(
            login_from(&gate, "secret", peer, HeaderMap::new()).await,
            Err(ApiError::TooManyRequests(_))
        ));
    }

    #[tokio::test]
    async fn expired_session_is_rejected_and_pruned() {
        let temp = tempdir().expect("tempdir");
        let gate = make_gate(temp.path(), Duration::ZERO);
        let (token, _) = gate.create_session().await;
        assert!(!gate.authorize(Some(&token)).await);
        gate.prune_expired().await;
        assert!(gate.sessions.lock().await.is_empty());
    }

    #[test]
    fn media_and_auth_routes_are_exempt() {
        assert!(is_auth_exempt_path("/api/auth/login"));
        assert!(is_auth_exempt_path("/api/media/stream/4"));
        assert!(!is_auth_exempt_path("/api/upload"));
        assert!(is_auth_exempt_path("/"));
    }
}
