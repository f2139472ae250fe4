//! 归档条目命名
//!
//! - `sanitize_component`: 清理单个路径分量（去掉分隔符和控制字符，限制长度）
//! - `EntryNamer`: 为一个归档分配唯一条目名，冲突时在扩展名前追加 `_1`、`_2` ...
//!
//! 文件条目和目录前缀共用一个命名空间：`a` 和 `a/b` 不会同时出现

use std::collections::{HashMap, HashSet};

/// 清理后为空时使用的名字
const FALLBACK_NAME: &str = "unnamed";

/// 清理单个路径分量
///
/// 超长时保留扩展名，截断主干部分；长度按字符计
pub fn sanitize_component(name: &str, max_len: usize) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim();

    let cleaned = match cleaned {
        "" => FALLBACK_NAME.to_string(),
        "." | ".." => "_".to_string(),
        other => other.to_string(),
    };

    truncate_keep_extension(&cleaned, max_len.max(1))
}

/// 拆分主干和扩展名，扩展名包含前导 `.`
///
/// 以 `.` 开头的隐藏文件没有扩展名
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos < name.len() - 1 => name.split_at(pos),
        _ => (name, ""),
    }
}

fn truncate_keep_extension(name: &str, max_len: usize) -> String {
    let total = name.chars().count();
    if total <= max_len {
        return name.to_string();
    }

    let (stem, ext) = split_extension(name);
    let ext_len = ext.chars().count();
    if ext_len == 0 || ext_len >= max_len {
        return name.chars().take(max_len).collect();
    }

    let stem: String = stem.chars().take(max_len - ext_len).collect();
    format!("{}{}", stem, ext)
}

/// 带序号的名字，主干截断后仍不超过 `max_len`（序号本身超长时除外）
fn numbered(name: &str, n: u32, max_len: usize) -> String {
    let suffix = format!("_{}", n);
    let (stem, ext) = split_extension(name);
    let (stem, ext) = if ext.chars().count() + suffix.len() < max_len {
        (stem, ext)
    } else {
        (name, "")
    };
    let keep = max_len.saturating_sub(suffix.len() + ext.chars().count());
    let stem: String = stem.chars().take(keep).collect();
    format!("{}{}{}", stem, suffix, ext)
}

/// 单个归档内的条目命名器
#[derive(Debug)]
pub struct EntryNamer {
    /// 已分配的文件条目
    used: HashSet<String>,
    /// 已分配的目录前缀
    dirs: HashSet<String>,
    /// (父目录, 原目录名) -> 实际目录前缀
    dir_names: HashMap<(String, String), String>,
    max_len: usize,
}

impl EntryNamer {
    pub fn new(max_len: usize) -> Self {
        Self {
            used: HashSet::new(),
            dirs: HashSet::new(),
            dir_names: HashMap::new(),
            max_len: max_len.max(1),
        }
    }

    fn taken(&self, path: &str) -> bool {
        self.used.contains(path) || self.dirs.contains(path)
    }

    /// 分配目录前缀；与已有文件条目同名时改名，同一目录的后续文件沿用同一前缀
    fn assign_dir(&mut self, folder_path: &str) -> String {
        let mut current = String::new();
        for part in folder_path.split('/').filter(|part| !part.is_empty()) {
            let part = sanitize_component(part, self.max_len);
            let key = (current.clone(), part.clone());
            if let Some(assigned) = self.dir_names.get(&key) {
                current = assigned.clone();
                continue;
            }

            let mut candidate = join_path(&current, &part);
            let mut n = 0u32;
            while self.used.contains(&candidate) {
                n += 1;
                candidate = join_path(&current, &numbered(&part, n, self.max_len));
            }
            self.dirs.insert(candidate.clone());
            self.dir_names.insert(key, candidate.clone());
            current = candidate;
        }
        current
    }

    /// 为文件分配条目名
    ///
    /// `folder_path` 为 `/` 分隔的相对目录，每个分量同样会被清理；为空表示放在根下
    pub fn assign(&mut self, folder_path: &str, file_name: &str) -> String {
        let prefix = self.assign_dir(folder_path);
        let name = sanitize_component(file_name, self.max_len);

        let mut candidate = join_path(&prefix, &name);
        let mut n = 0u32;
        while self.taken(&candidate) {
            n += 1;
            candidate = join_path(&prefix, &numbered(&name, n, self.max_len));
        }

        self.used.insert(candidate.clone());
        candidate
    }

    /// 为失败文件分配占位条目名：`_errors/<name>.txt`
    pub fn assign_placeholder(&mut self, file_name: &str) -> String {
        let name = sanitize_component(file_name, self.max_len.saturating_sub(4).max(1));
        self.assign("_errors", &format!("{}.txt", name))
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
