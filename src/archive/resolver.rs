//! 选择解析器
//!
//! 把文件夹 / 文件ID列表 / 项目选择展开为有序、去重的文件列表：
//! - 文件夹：深度优先，先收集当前层的文件，再按 (name, id) 进入子文件夹
//! - 文件ID：按请求顺序，缺失的ID只记日志
//! - 项目：项目下所有文件，按目录路径分组，组内按 (created_at, id)
//!
//! 软删除的文件 / 文件夹一律排除

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::ResolveError;
use super::naming::sanitize_component;
use crate::metadata::{FileRecord, FolderRecord, MetadataStore};

/// 选择内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Folder(String),
    Files(Vec<String>),
    Project(String),
}

/// 解析出的单个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub record: FileRecord,
    /// 相对选择根的目录路径，`/` 分隔，根下为空串
    pub folder_path: String,
}

/// 解析结果
#[derive(Debug, Clone)]
pub struct ResolvedSelection {
    /// 项目选择时已按目录路径分组排序，同组文件相邻
    pub files: Vec<ResolvedFile>,
    /// 选择根的显示名，用于命名归档
    pub root_name: String,
}

impl ResolvedSelection {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.record.size).sum()
    }
}

/// 选择解析器
#[derive(Clone)]
pub struct SelectionResolver {
    store: Arc<dyn MetadataStore>,
}

/// 路径分量里不能出现分隔符
fn path_component(name: &str) -> String {
    sanitize_component(name, usize::MAX)
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        path_component(name)
    } else {
        format!("{}/{}", parent, path_component(name))
    }
}

impl SelectionResolver {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// 解析选择，结果为空时返回 `SelectionEmpty`
    pub async fn resolve(
        &self,
        owner_id: &str,
        selection: &Selection,
    ) -> Result<ResolvedSelection, ResolveError> {
        let resolved = match selection {
            Selection::Folder(folder_id) => self.resolve_folder(owner_id, folder_id).await?,
            Selection::Files(file_ids) => self.resolve_files(owner_id, file_ids).await?,
            Selection::Project(project_id) => self.resolve_project(owner_id, project_id).await?,
        };

        if resolved.files.is_empty() {
            info!("选择解析结果为空: owner={}, {:?}", owner_id, selection);
            return Err(ResolveError::SelectionEmpty);
        }

        info!(
            "选择解析完成: owner={}, 文件数={}, 总大小={} bytes",
            owner_id,
            resolved.files.len(),
            resolved.total_bytes()
        );
        Ok(resolved)
    }

    // ========================================================================
    // 文件夹
    // ========================================================================

    async fn resolve_folder(
        &self,
        owner_id: &str,
        folder_id: &str,
    ) -> Result<ResolvedSelection, ResolveError> {
        let folder = match self.store.get_folder(folder_id).await? {
            Some(folder) if !folder.is_deleted() => folder,
            _ => return Err(ResolveError::NotFound(format!("文件夹 {}", folder_id))),
        };
        if folder.owner_id != owner_id {
            return Err(ResolveError::AccessDenied(format!("文件夹 {}", folder_id)));
        }

        let mut files = Vec::new();
        let mut visited = HashSet::new();
        let mut seen_files = HashSet::new();
        self.walk_folder(
            owner_id,
            &folder.id,
            String::new(),
            &mut visited,
            &mut seen_files,
            &mut files,
        )
        .await?;

        Ok(ResolvedSelection {
            files,
            root_name: folder.name,
        })
    }

    #[async_recursion::async_recursion]
    async fn walk_folder(
        &self,
        owner_id: &str,
        folder_id: &str,
        current_path: String,
        visited: &mut HashSet<String>,
        seen_files: &mut HashSet<String>,
        out: &mut Vec<ResolvedFile>,
    ) -> Result<(), ResolveError> {
        if !visited.insert(folder_id.to_string()) {
            warn!("检测到文件夹循环引用，跳过: {}", folder_id);
            return Ok(());
        }

        // 先收集当前层的文件
        for record in self.store.list_folder_files(owner_id, folder_id).await? {
            if record.is_deleted() || !seen_files.insert(record.id.clone()) {
                continue;
            }
            out.push(ResolvedFile {
                record,
                folder_path: current_path.clone(),
            });
        }

        // 再进入子文件夹
        let children = self.store.list_child_folders(owner_id, folder_id).await?;
        debug!(
            "扫描文件夹 {} ({:?}): 子文件夹 {} 个",
            folder_id,
            current_path,
            children.len()
        );
        for child in children {
            if child.is_deleted() {
                continue;
            }
            let child_path = join(&current_path, &child.name);
            self.walk_folder(owner_id, &child.id, child_path, visited, seen_files, out)
                .await?;
        }

        Ok(())
    }

    // ========================================================================
    // 文件ID列表
    // ========================================================================

    async fn resolve_files(
        &self,
        owner_id: &str,
        file_ids: &[String],
    ) -> Result<ResolvedSelection, ResolveError> {
        let mut requested = Vec::with_capacity(file_ids.len());
        let mut seen = HashSet::new();
        for id in file_ids {
            if seen.insert(id.as_str()) {
                requested.push(id.clone());
            }
        }

        let found = self.store.get_files(owner_id, &requested).await?;
        let mut by_id: HashMap<String, FileRecord> = found
            .into_iter()
            .filter(|f| !f.is_deleted())
            .map(|f| (f.id.clone(), f))
            .collect();

        let mut files = Vec::with_capacity(by_id.len());
        let mut missing = Vec::new();
        for id in &requested {
            match by_id.remove(id) {
                Some(record) => files.push(ResolvedFile {
                    record,
                    folder_path: String::new(),
                }),
                None => missing.push(id.as_str()),
            }
        }

        if !missing.is_empty() {
            warn!(
                "部分文件未找到或无权访问，继续处理其余文件: owner={}, 缺失={:?}",
                owner_id, missing
            );
        }

        Ok(ResolvedSelection {
            files,
            root_name: "files".to_string(),
        })
    }

    // ========================================================================
    // 项目
    // ========================================================================

    async fn resolve_project(
        &self,
        owner_id: &str,
        project_id: &str,
    ) -> Result<ResolvedSelection, ResolveError> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| ResolveError::NotFound(format!("项目 {}", project_id)))?;
        if project.owner_id != owner_id {
            return Err(ResolveError::AccessDenied(format!("项目 {}", project_id)));
        }

        let folders: HashMap<String, FolderRecord> = self
            .store
            .list_project_folders(owner_id, project_id)
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();

        let mut path_cache: HashMap<String, Placement> = HashMap::new();
        let mut outside_cache: HashMap<String, bool> = HashMap::new();
        let mut files = Vec::new();
        for record in self.store.list_project_files(owner_id, project_id).await? {
            if record.is_deleted() {
                continue;
            }
            let placement = match &record.folder_id {
                None => Placement::Path(String::new()),
                Some(folder_id) => folder_path_in_project(folder_id, &folders, &mut path_cache),
            };
            let folder_path = match placement {
                Placement::Path(path) => path,
                Placement::Deleted => continue,
                Placement::Unlinked => {
                    let Some(folder_id) = record.folder_id.as_deref() else {
                        continue;
                    };
                    let live = match outside_cache.get(folder_id) {
                        Some(live) => *live,
                        None => {
                            let live = self.ancestors_live(folder_id).await?;
                            outside_cache.insert(folder_id.to_string(), live);
                            live
                        }
                    };
                    if !live {
                        continue;
                    }
                    warn!(
                        "文件所在文件夹不属于项目，放在归档根目录: file={}, folder={}, project={}",
                        record.id, folder_id, project_id
                    );
                    String::new()
                }
            };
            files.push(ResolvedFile {
                record,
                folder_path,
            });
        }

        files.sort_by(|a, b| {
            a.folder_path
                .cmp(&b.folder_path)
                .then(a.record.created_at.cmp(&b.record.created_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        Ok(ResolvedSelection {
            files,
            root_name: project.name,
        })
    }

    /// 文件夹及其祖先都未删除时返回 true；缺失的文件夹行不算删除
    async fn ancestors_live(&self, folder_id: &str) -> Result<bool, ResolveError> {
        let mut visited = HashSet::new();
        let mut current = Some(folder_id.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!("检测到文件夹循环引用: {}", id);
                break;
            }
            match self.store.get_folder(&id).await? {
                Some(folder) if folder.is_deleted() => return Ok(false),
                Some(folder) => current = folder.parent_id,
                None => break,
            }
        }
        Ok(true)
    }
}

/// 项目文件在归档中的位置
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    /// 相对项目根的目录路径
    Path(String),
    /// 所在文件夹或其项目内祖先已删除
    Deleted,
    /// 所在文件夹不在项目内（或项目文件夹成环），需要回查存储
    Unlinked,
}

/// 计算项目内文件夹相对项目根的路径
fn folder_path_in_project(
    folder_id: &str,
    folders: &HashMap<String, FolderRecord>,
    cache: &mut HashMap<String, Placement>,
) -> Placement {
    if let Some(cached) = cache.get(folder_id) {
        return cached.clone();
    }

    let mut names = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(folder_id.to_string());
    let mut result = Placement::Unlinked;

    while let Some(id) = current {
        if !visited.insert(id.clone()) {
            warn!("检测到项目文件夹循环引用: {}", id);
            break;
        }
        let Some(folder) = folders.get(&id) else {
            break;
        };
        if folder.is_deleted() {
            result = Placement::Deleted;
            break;
        }
        names.push(path_component(&folder.name));
        match &folder.parent_id {
            // 父文件夹不属于项目，视为项目根
            Some(parent) if folders.contains_key(parent) => current = Some(parent.clone()),
            _ => {
                names.reverse();
                result = Placement::Path(names.join("/"));
                break;
            }
        }
    }

    cache.insert(folder_id.to_string(), result.clone());
    result
}
