//! 元数据模块
//!
//! 选择解析器通过 `MetadataStore` 读取文件 / 文件夹 / 项目记录

pub mod store;
pub mod types;

pub use store::{MetadataError, MetadataStore, SqliteMetadataStore};
pub use types::{FileRecord, FolderRecord, ProjectRecord};
