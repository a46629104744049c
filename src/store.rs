//! 元数据记录及其存储。

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 上传目标相册。
#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Album {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub is_public: bool,
    pub thumbnail: Option<i64>,
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Media {
    pub id: i64,
    pub album_id: i64,
    pub filename: String,
    pub title: String,
}

#[derive(Clone, Debug)]
pub struct NewMedia {
    pub album_id: i64,
    pub filename: String,
    pub title: String,
}

/// 上传与媒体服务使用的记录查询、写入与删除接口。
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn album(&self, id: i64) -> Result<Option<Album>, StoreError>;

    /// 媒体记录及其所属相册。
    async fn media(&self, id: i64) -> Result<Option<(Media, Album)>, StoreError>;

    async fn insert_media(&self, new: NewMedia) -> Result<Media, StoreError>;

    /// 没有匹配记录时返回 `false`。
    async fn delete_media(&self, id: i64) -> Result<bool, StoreError>;
}

#[derive(sqlx::FromRow)]
struct MediaAlbumRow {
    id: i64,
    album_id: i64,
    filename: String,
    title: String,
    slug: String,
    name: String,
    is_public: bool,
    thumbnail: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）`url` 指向的数据库并应用表结构。
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let filename = options.get_filename();
        if let Some(parent) = filename.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.apply_schema().await?;
        info!(url, "metadata store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());
        for stmt in statements {
            debug!("executing schema statement: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn album(&self, id: i64) -> Result<Option<Album>, StoreError> {
        let album = sqlx::query_as::<_, Album>(
            "SELECT id, slug, name, is_public, thumbnail FROM albums WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(album)
    }

    async fn media(&self, id: i64) -> Result<Option<(Media, Album)>, StoreError> {
        let row = sqlx::query_as::<_, MediaAlbumRow>(
            "SELECT i.id, i.album_id, i.filename, i.title,
                    a.slug, a.name, a.is_public, a.thumbnail
             FROM images i
             JOIN albums a ON i.album_id = a.id
             WHERE i.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            (
                Media {
                    id: row.id,
                    album_id: row.album_id,
                    filename: row.filename,
                    title: row.title,
                },
                Album {
                    id: row.album_id,
                    slug: row.slug,
                    name: row.name,
                    is_public: row.is_public,
                    thumbnail: row.thumbnail,
                },
            )
        }))
    }

    async fn insert_media(&self, new: NewMedia) -> Result<Media, StoreError> {
        let media = sqlx::query_as::<_, Media>(
            "INSERT INTO images (album_id, filename, title) VALUES (?, ?, ?)
             RETURNING id, album_id, filename, title",
        )
        .bind(new.album_id)
        .bind(&new.filename)
        .bind(&new.title)
        .fetch_one(&self.pool)
        .await?;
        Ok(media)
    }

    async fn delete_media(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
