//! ETag 计算与 If-Range 条件校验。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

/// 根据文件大小与修改时间生成强 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("\"{}\"", size)
}

/// 判断 `Range` 是否可用：没有 `If-Range` 时总是可用；否则其中的 ETag 或 HTTP 日期
/// 必须仍然对应当前文件。ETag 按强比较，弱 ETag 永不匹配。
pub fn if_range_matches(
    headers: &HeaderMap,
    current_etag: &str,
    modified: Option<SystemTime>,
) -> bool {
    let Some(value) = headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    else {
        return true;
    };
    if value.starts_with("W/") {
        return false;
    }
    if value.starts_with('"') {
        return !current_etag.starts_with("W/") && value == current_etag;
    }
    match parse_http_date(value) {
        Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use httpdate::fmt_http_date;
    use std::time::Duration;

    #[test]
    fn missing_if_range_allows_range() {
        assert!(if_range_matches(&HeaderMap::new(), "\"1\"", None));
    }

    #[test]
    fn stale_etag_or_date_disables_range() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_RANGE, HeaderValue::from_static("\"old\""));
        assert!(!if_range_matches(&headers, "\"new\"", None));
        assert!(if_range_matches(&headers, "\"old\"", None));

        let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let earlier = fmt_http_date(modified - Duration::from_secs(60));
        headers.insert(
            header::IF_RANGE,
            HeaderValue::from_str(&earlier).expect("header"),
        );
        assert!(!if_range_matches(&headers, "\"new\"", Some(modified)));

        let same = fmt_http_date(modified);
        headers.insert(header::IF_RANGE, HeaderValue::from_str(&same).expect("header"));
        assert!(if_range_matches(&headers, "\"new\"", Some(modified)));
    }

    #[test]
    fn weak_validator_never_matches() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_RANGE, HeaderValue::from_static("W/\"v1\""));
        assert!(!if_range_matches(&headers, "W/\"v1\"", None));
        assert!(!if_range_matches(&headers, "\"v1\"", None));
    }

    #[test]
    fn etag_is_strong() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.jpg");
        std::fs::write(&path, b"abc").expect("write");
        let etag = etag_from_metadata(&std::fs::metadata(&path).expect("metadata"));
        assert!(etag.starts_with("\"3-"), "{etag}");
    }
}
