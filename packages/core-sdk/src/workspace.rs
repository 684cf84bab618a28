use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

/**
 * \brief 工作区文件访问接口，供服务端读写编辑器中的文件。
 */
pub trait FileStore: Send + Sync {
    fn get_file(&self, path: &str) -> Result<String>;
    fn update_file(&self, path: &str, content: &str) -> Result<()>;
    /** \brief 以 `/` 分隔的相对路径，按字典序排列。 */
    fn list_files(&self) -> Result<Vec<String>>;
}

/**
 * \brief 以本地目录为根的文件存储，拒绝越出根目录的路径。
 */
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules"];

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = root
            .canonicalize()
            .with_context(|| format!("workspace root {} is not accessible", root.display()))?;
        if !root.is_dir() {
            bail!("workspace root {} is not a directory", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    bail!("path {} escapes the workspace", path);
                }
            }
        }
        if resolved == self.root {
            bail!("path {} does not name a file", path);
        }
        Ok(resolved)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                let name = entry.file_name();
                if SKIPPED_DIRS.iter().any(|s| name == *s) {
                    continue;
                }
                self.walk(&path, out)?;
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(&self.root)
                    .map_err(|_| anyhow!("{} is outside the workspace", path.display()))?;
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(rel.join("/"));
            }
        }
        Ok(())
    }
}

impl FileStore for LocalFileStore {
    fn get_file(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        std::fs::read_to_string(&full).with_context(|| format!("failed to read {}", path))
    }

    fn update_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, content).with_context(|| format!("failed to write {}", path))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        self.walk(&self.root, &mut files)?;
        files.sort();
        Ok(files)
    }
}
