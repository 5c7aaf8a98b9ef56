use crate::error::{RedirectorError, RedirectorResult};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use tracing::{debug, info};

const BEGIN_PREFIX: &str = "# BEGIN REDIRECTOR MANAGED BLOCK: ";
const END_PREFIX: &str = "# END REDIRECTOR MANAGED BLOCK: ";
const TEMP_PREFIX: &str = ".redirector_tmp_";

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# (BEGIN|END) REDIRECTOR MANAGED BLOCK: (\S+)$").expect("marker pattern is valid")
});

/// 托管块中的一条记录：`<ip> <主机名> [别名...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEntry {
    pub ip: IpAddr,
    pub names: Vec<String>,
}

impl ManagedEntry {
    pub fn new(ip: IpAddr, names: Vec<String>) -> Self {
        Self { ip, names }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let ip = fields.next()?.parse().ok()?;
        let names: Vec<String> = fields.map(str::to_string).collect();
        if names.is_empty() {
            return None;
        }
        Some(Self { ip, names })
    }
}

impl fmt::Display for ManagedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ip, self.names.join(" "))
    }
}

/// 一次写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// 文件已被原子替换
    Written,
    /// 内容未变化，没有写盘
    Unchanged,
}

/// 共享hosts文件
///
/// 所有虚拟主机控制器持有同一个实例（克隆共享同一把锁）。
/// 每次读-改-写都在锁内完成，网络探测永远在锁外。
#[derive(Debug, Clone)]
pub struct SharedHostsStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SharedHostsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_marker(id: &str) -> String {
        format!("{}{}", BEGIN_PREFIX, id)
    }

    pub fn end_marker(id: &str) -> String {
        format!("{}{}", END_PREFIX, id)
    }

    /// 启动时检查：文件可读，且所在目录可写（能创建临时文件）
    pub fn validate_access(&self) -> RedirectorResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let probe = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.directory())
            .map_err(|e| self.io_error(e))?;
        drop(probe);

        debug!("Hosts file {} is readable and replaceable", self.path.display());
        Ok(())
    }

    /// 更新或插入某个虚拟主机的托管块
    pub async fn upsert(&self, id: &str, entry: ManagedEntry) -> RedirectorResult<UpsertOutcome> {
        let store = self.clone();
        let id = id.to_string();
        self.blocking(move || store.rewrite_block(&id, Some(&entry)))
            .await
    }

    /// 删除某个虚拟主机的托管块
    pub async fn remove(&self, id: &str) -> RedirectorResult<UpsertOutcome> {
        let store = self.clone();
        let id = id.to_string();
        self.blocking(move || store.rewrite_block(&id, None)).await
    }

    /// 只保留给定标识符的托管块，其余一次性删除
    pub async fn retain(&self, ids: Vec<String>) -> RedirectorResult<Vec<String>> {
        let store = self.clone();
        self.blocking(move || store.retain_blocks(&ids)).await
    }

    /// 读取全部托管块
    pub async fn entries(&self) -> RedirectorResult<BTreeMap<String, ManagedEntry>> {
        let store = self.clone();
        self.blocking(move || {
            let _guard = store.lock.lock().unwrap_or_else(PoisonError::into_inner);
            let content = store.read()?;
            let lines: Vec<&str> = content.split_inclusive('\n').collect();

            let mut entries = BTreeMap::new();
            for block in store.blocks(&lines)? {
                let entry = store.parse_entry(&lines, &block)?;
                entries.insert(block.id, entry);
            }
            Ok(entries)
        })
        .await
    }

    /// 文件I/O放到阻塞线程池；即使调用方被取消，已开始的写入也会完整结束
    async fn blocking<T, F>(&self, f: F) -> RedirectorResult<T>
    where
        F: FnOnce() -> RedirectorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| self.io_error(std::io::Error::other(e)))?
    }

    fn rewrite_block(&self, id: &str, entry: Option<&ManagedEntry>) -> RedirectorResult<UpsertOutcome> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let original = self.read()?;
        let lines: Vec<&str> = original.split_inclusive('\n').collect();
        let existing = self.blocks(&lines)?.into_iter().find(|b| b.id == id);

        let mut updated = String::with_capacity(original.len() + 128);
        match (existing, entry) {
            (Some(block), Some(entry)) => {
                updated.extend(lines[..block.begin].iter().copied());
                updated.push_str(&render_block(id, entry));
                updated.extend(lines[block.end + 1..].iter().copied());
            }
            (None, Some(entry)) => {
                updated.push_str(&original);
                if !updated.is_empty() && !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(&render_block(id, entry));
            }
            (Some(block), None) => {
                updated.extend(lines[..block.begin].iter().copied());
                updated.extend(lines[block.end + 1..].iter().copied());
            }
            (None, None) => return Ok(UpsertOutcome::Unchanged),
        }

        if updated == original {
            return Ok(UpsertOutcome::Unchanged);
        }

        self.replace(&updated)?;
        match entry {
            Some(entry) => info!("Hosts file {} updated: {}", self.path.display(), entry),
            None => info!("Removed managed block '{}' from {}", id, self.path.display()),
        }
        Ok(UpsertOutcome::Written)
    }

    fn retain_blocks(&self, ids: &[String]) -> RedirectorResult<Vec<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let original = self.read()?;
        let lines: Vec<&str> = original.split_inclusive('\n').collect();
        let stale: Vec<Block> = self
            .blocks(&lines)?
            .into_iter()
            .filter(|b| !keep.contains(b.id.as_str()))
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let updated: String = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| !stale.iter().any(|b| b.begin <= *i && *i <= b.end))
            .map(|(_, line)| *line)
            .collect();

        self.replace(&updated)?;
        let removed: Vec<String> = stale.into_iter().map(|b| b.id).collect();
        info!(
            "Removed {} stale managed block(s) from {}: {:?}",
            removed.len(),
            self.path.display(),
            removed
        );
        Ok(removed)
    }

    fn read(&self) -> RedirectorResult<String> {
        fs::read_to_string(&self.path).map_err(|e| self.io_error(e))
    }

    /// 定位所有托管块；标记不成对、顺序颠倒或重复都视为文件损坏
    fn blocks(&self, lines: &[&str]) -> RedirectorResult<Vec<Block>> {
        let mut open: BTreeMap<String, usize> = BTreeMap::new();
        let mut blocks: Vec<Block> = Vec::new();

        for (index, line) in lines.iter().enumerate() {
            let Some(caps) = MARKER_RE.captures(line.trim_end_matches(['\r', '\n'])) else {
                continue;
            };
            let id = caps[2].to_string();

            if &caps[1] == "BEGIN" {
                if let Some((other, _)) = open.iter().next() {
                    return Err(self.corrupt(other, "BEGIN marker found inside another managed block"));
                }
                if blocks.iter().any(|b| b.id == id) {
                    return Err(self.corrupt(&id, "managed block appears more than once"));
                }
                open.insert(id, index);
            } else {
                let begin = open
                    .remove(&id)
                    .ok_or_else(|| self.corrupt(&id, "END marker without a preceding BEGIN marker"))?;
                blocks.push(Block {
                    id,
                    begin,
                    end: index,
                });
            }
        }

        if let Some((id, _)) = open.into_iter().next() {
            return Err(self.corrupt(&id, "BEGIN marker without a matching END marker"));
        }
        Ok(blocks)
    }

    fn parse_entry(&self, lines: &[&str], block: &Block) -> RedirectorResult<ManagedEntry> {
        let body: Vec<&str> = lines[block.begin + 1..block.end]
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();

        match body.as_slice() {
            [line] => ManagedEntry::parse(line)
                .ok_or_else(|| self.corrupt(&block.id, "unparseable entry line")),
            _ => Err(self.corrupt(&block.id, "expected exactly one entry line")),
        }
    }

    /// 写入同目录下的临时文件，复制原文件的权限和属主，再原子替换
    fn replace(&self, content: &str) -> RedirectorResult<()> {
        let metadata = fs::metadata(&self.path).map_err(|e| self.io_error(e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.directory())
            .map_err(|e| self.io_error(e))?;

        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| self.io_error(e))?;

        fs::set_permissions(tmp.path(), metadata.permissions()).map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            std::os::unix::fs::chown(tmp.path(), Some(metadata.uid()), Some(metadata.gid()))
                .map_err(|e| self.io_error(e))?;
        }

        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;
        Ok(())
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn io_error(&self, source: std::io::Error) -> RedirectorError {
        RedirectorError::store_io(&self.path, source)
    }

    fn corrupt(&self, id: &str, reason: &str) -> RedirectorError {
        RedirectorError::CorruptHostsFile {
            path: self.path.clone(),
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// 托管块在文件中的行范围（含首尾标记行）
#[derive(Debug)]
struct Block {
    id: String,
    begin: usize,
    end: usize,
}

fn render_block(id: &str, entry: &ManagedEntry) -> String {
    format!(
        "{}\n{}\n{}\n",
        SharedHostsStore::begin_marker(id),
        entry,
        SharedHostsStore::end_marker(id)
    )
}
