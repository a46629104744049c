//! 单个分片上传的传输约定，服务端与客户端共用。
//!
//! 一个 `multipart/form-data` 请求携带一个分片。成功时响应体为 [`SUCCESS_TOKEN`]，
//! 其他任何响应都视为失败，响应体即错误详情。

use bytes::Bytes;

/// 上传客户端使用的固定分片大小。
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 服务端接受的单个分片上限。
pub const MAX_CHUNK_BYTES: u64 = CHUNK_SIZE + 64 * 1024;

/// 分片上传成功时的响应体。
pub const SUCCESS_TOKEN: &str = "OK";

pub const FIELD_CHUNK: &str = "chunk";
pub const FIELD_CHUNK_INDEX: &str = "chunk_index";
pub const FIELD_TOTAL_CHUNKS: &str = "total_chunks";
pub const FIELD_FILENAME: &str = "filename";
pub const FIELD_UPLOAD_ID: &str = "upload_id";
pub const FIELD_ALBUM_ID: &str = "album_id";
pub const FIELD_CSRF_TOKEN: &str = "csrf_token";

/// 线上传输的单个分片。
#[derive(Clone, Debug)]
pub struct ChunkRequest {
    pub chunk: Bytes,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub filename: String,
    pub upload_id: String,
    pub album_id: i64,
    pub csrf_token: String,
}

impl ChunkRequest {
    pub fn is_final(&self) -> bool {
        self.total_chunks > 0 && self.chunk_index == self.total_chunks - 1
    }
}

/// `ceil(size / chunk_size)`.
pub fn total_chunks(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// 第 `index` 个分片在 `size` 字节文件中的范围 `(start, len)`。
pub fn chunk_span(index: u64, size: u64, chunk_size: u64) -> (u64, u64) {
    let start = index.saturating_mul(chunk_size).min(size);
    let len = chunk_size.min(size - start);
    (start, len)
}

/// 响应体是否为成功标记。
pub fn is_success_body(body: &str) -> bool {
    body.trim() == SUCCESS_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks(0, CHUNK_SIZE), 0);
        assert_eq!(total_chunks(1, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(CHUNK_SIZE, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(CHUNK_SIZE + 1, CHUNK_SIZE), 2);
        assert_eq!(total_chunks(3 * CHUNK_SIZE - 7, CHUNK_SIZE), 3);
    }

    #[test]
    fn last_chunk_span_is_short() {
        let size = 2 * CHUNK_SIZE + 10;
        assert_eq!(chunk_span(0, size, CHUNK_SIZE), (0, CHUNK_SIZE));
        assert_eq!(chunk_span(2, size, CHUNK_SIZE), (2 * CHUNK_SIZE, 10));
        assert_eq!(chunk_span(5, size, CHUNK_SIZE), (size, 0));
    }

    #[test]
    fn success_body_tolerates_whitespace_only() {
        assert!(is_success_body("OK\n"));
        assert!(!is_success_body("OK but not really"));
        assert!(!is_success_body("Missing chunk"));
    }
}
