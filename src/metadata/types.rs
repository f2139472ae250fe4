//! 元数据记录类型
//!
//! 文件、文件夹、项目三类记录，本子系统只读

use serde::{Deserialize, Serialize};

/// 文件记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// 文件ID
    pub id: String,
    /// 所有者ID
    pub owner_id: String,
    /// 原始文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 对象存储中的键
    pub storage_key: String,
    /// 所在文件夹（根目录下为 None）
    pub folder_id: Option<String>,
    /// 所属项目
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 软删除时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// 文件夹记录
///
/// 只有父指针，树结构由 `parent_id` 串起来
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: String,
    pub owner_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

impl FolderRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// 项目记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
}
