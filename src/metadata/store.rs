//! 元数据存储
//!
//! - `MetadataStore`: 解析器依赖的只读查询接口（按所有者限定范围）
//! - `SqliteMetadataStore`: 基于 SQLite 的实现
//!
//! 查询结果包含软删除记录，是否过滤由调用方决定

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use super::types::{FileRecord, FolderRecord, ProjectRecord};

/// 元数据存储错误
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("查询线程异常: {0}")]
    Worker(String),
}

/// 元数据查询接口
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 按ID获取文件夹（不限定所有者，用于区分"不存在"和"无权限"）
    async fn get_folder(&self, folder_id: &str) -> Result<Option<FolderRecord>, MetadataError>;

    /// 列出某文件夹下属于 owner 的直接子文件夹，按 (name, id) 排序
    async fn list_child_folders(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> Result<Vec<FolderRecord>, MetadataError>;

    /// 列出某文件夹下属于 owner 的直接文件，按 (created_at, id) 排序
    async fn list_folder_files(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> Result<Vec<FileRecord>, MetadataError>;

    /// 批量获取属于 owner 的文件，不保证顺序
    async fn get_files(
        &self,
        owner_id: &str,
        file_ids: &[String],
    ) -> Result<Vec<FileRecord>, MetadataError>;

    /// 按ID获取项目（不限定所有者）
    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>, MetadataError>;

    /// 列出项目下属于 owner 的全部文件夹
    async fn list_project_folders(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> Result<Vec<FolderRecord>, MetadataError>;

    /// 列出项目下属于 owner 的全部文件（不论层级），按 (created_at, id) 排序
    async fn list_project_files(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> Result<Vec<FileRecord>, MetadataError>;
}

/// SQLite 元数据存储
///
/// 查询在 `spawn_blocking` 线程上执行，不占用异步运行时的工作线程
pub struct SqliteMetadataStore {
    /// SQLite 连接
    conn: Arc<Mutex<Connection>>,
}

const FILE_COLUMNS: &str =
    "id, owner_id, name, size, storage_key, folder_id, project_id, created_at, deleted_at";
const FOLDER_COLUMNS: &str = "id, owner_id, parent_id, name, project_id, deleted_at";

impl SqliteMetadataStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self, MetadataError> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_tables()?;

        info!("元数据库已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库（测试和演示用）
    pub fn open_in_memory() -> Result<Self, MetadataError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<(), MetadataError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                parent_id TEXT,
                name TEXT NOT NULL,
                project_id TEXT,
                deleted_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                storage_key TEXT NOT NULL,
                folder_id TEXT,
                project_id TEXT,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id, owner_id);
            CREATE INDEX IF NOT EXISTS idx_folders_project ON folders(project_id, owner_id);
            CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id, owner_id);
            CREATE INDEX IF NOT EXISTS idx_files_project ON files(project_id, owner_id);
            "#,
        )?;

        debug!("元数据表初始化完成");
        Ok(())
    }

    // ========================================================================
    // 写入（导入数据 / 测试夹具）
    // ========================================================================

    pub fn insert_project(&self, project: &ProjectRecord) -> Result<(), MetadataError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO projects (id, owner_id, name) VALUES (?1, ?2, ?3)",
            params![project.id, project.owner_id, project.name],
        )?;
        Ok(())
    }

    pub fn insert_folder(&self, folder: &FolderRecord) -> Result<(), MetadataError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO folders (id, owner_id, parent_id, name, project_id, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                folder.id,
                folder.owner_id,
                folder.parent_id,
                folder.name,
                folder.project_id,
                folder.deleted_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_file(&self, file: &FileRecord) -> Result<(), MetadataError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO files
             (id, owner_id, name, size, storage_key, folder_id, project_id, created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                file.id,
                file.owner_id,
                file.name,
                file.size as i64,
                file.storage_key,
                file.folder_id,
                file.project_id,
                file.created_at,
                file.deleted_at,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 在阻塞线程上持锁执行查询
    async fn with_conn<T, F>(&self, f: F) -> Result<T, MetadataError>
    where
        F: FnOnce(&Connection) -> Result<T, MetadataError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| MetadataError::Worker(e.to_string()))?
    }
}

fn query_files(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<FileRecord>, MetadataError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, file_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_folders(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<FolderRecord>, MetadataError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, folder_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let size: i64 = row.get(3)?;
    Ok(FileRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        size: size.max(0) as u64,
        storage_key: row.get(4)?,
        folder_id: row.get(5)?,
        project_id: row.get(6)?,
        created_at: row.get(7)?,
        deleted_at: row.get(8)?,
    })
}

fn folder_from_row(row: &Row<'_>) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        project_id: row.get(4)?,
        deleted_at: row.get(5)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_folder(&self, folder_id: &str) -> Result<Option<FolderRecord>, MetadataError> {
        let folder_id = folder_id.to_string();
        self.with_conn(move |conn| {
            let folder = conn
                .query_row(
                    &format!("SELECT {} FROM folders WHERE id = ?1", FOLDER_COLUMNS),
                    params![folder_id],
                    folder_from_row,
                )
                .optional()?;
            Ok(folder)
        })
        .await
    }

    async fn list_child_folders(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> Result<Vec<FolderRecord>, MetadataError> {
        let (owner_id, folder_id) = (owner_id.to_string(), folder_id.to_string());
        self.with_conn(move |conn| {
            query_folders(
                conn,
                &format!(
                    "SELECT {} FROM folders WHERE parent_id = ?1 AND owner_id = ?2 ORDER BY name, id",
                    FOLDER_COLUMNS
                ),
                params![folder_id, owner_id],
            )
        })
        .await
    }

    async fn list_folder_files(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> Result<Vec<FileRecord>, MetadataError> {
        let (owner_id, folder_id) = (owner_id.to_string(), folder_id.to_string());
        self.with_conn(move |conn| {
            query_files(
                conn,
                &format!(
                    "SELECT {} FROM files WHERE folder_id = ?1 AND owner_id = ?2 ORDER BY created_at, id",
                    FILE_COLUMNS
                ),
                params![folder_id, owner_id],
            )
        })
        .await
    }

    async fn get_files(
        &self,
        owner_id: &str,
        file_ids: &[String],
    ) -> Result<Vec<FileRecord>, MetadataError> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }

        let owner_id = owner_id.to_string();
        let file_ids = file_ids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM files WHERE id = ?1 AND owner_id = ?2",
                FILE_COLUMNS
            ))?;

            let mut files = Vec::with_capacity(file_ids.len());
            for file_id in &file_ids {
                if let Some(file) = stmt
                    .query_row(params![file_id, owner_id], file_from_row)
                    .optional()?
                {
                    files.push(file);
                }
            }
            Ok(files)
        })
        .await
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>, MetadataError> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let project = conn
                .query_row(
                    "SELECT id, owner_id, name FROM projects WHERE id = ?1",
                    params![project_id],
                    |row| {
                        Ok(ProjectRecord {
                            id: row.get(0)?,
                            owner_id: row.get(1)?,
                            name: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(project)
        })
        .await
    }

    async fn list_project_folders(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> Result<Vec<FolderRecord>, MetadataError> {
        let (owner_id, project_id) = (owner_id.to_string(), project_id.to_string());
        self.with_conn(move |conn| {
            query_folders(
                conn,
                &format!(
                    "SELECT {} FROM folders WHERE project_id = ?1 AND owner_id = ?2 ORDER BY name, id",
                    FOLDER_COLUMNS
                ),
                params![project_id, owner_id],
            )
        })
        .await
    }

    async fn list_project_files(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> Result<Vec<FileRecord>, MetadataError> {
        let (owner_id, project_id) = (owner_id.to_string(), project_id.to_string());
        self.with_conn(move |conn| {
            query_files(
                conn,
                &format!(
                    "SELECT {} FROM files WHERE project_id = ?1 AND owner_id = ?2 ORDER BY created_at, id",
                    FILE_COLUMNS
                ),
                params![project_id, owner_id],
            )
        })
        .await
    }
}
