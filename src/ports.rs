//! Collaborator ports.
//!
//! The engine never touches the disk, the secret store or a human directly.
//! It goes through these traits so hosts can plug in their own editor
//! workspace, keychain and prompt UI:
//!
//! - [`WorkspaceFs`]: file read/write/append/delete/stat, used by the patch
//!   applier, the policy resolver and the custody ledger
//! - [`SecretStore`]: get/set by name, holds the ledger signing key
//! - [`ApprovalChannel`]: yes/no confirmation and free-text input, used only by
//!   the governance workflow
//!
//! Local and in-memory implementations are provided for the CLI and for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Error type for collaborator port operations
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("secret store error: {0}")]
    Secret(String),
}

/// Reject empty, absolute and parent-escaping paths.
///
/// Every path handed to a [`WorkspaceFs`] is relative to the workspace root.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, PortError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PortError::InvalidPath("<empty>".into()));
    }
    let candidate = Path::new(trimmed);
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PortError::InvalidPath(trimmed.to_string()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(PortError::InvalidPath(trimmed.to_string()));
    }
    Ok(out)
}

// ============================================================================
// Workspace filesystem
// ============================================================================

/// File capability over the project workspace. Paths are workspace-relative.
#[async_trait]
pub trait WorkspaceFs: Send + Sync {
    /// Read a file as UTF-8. `Ok(None)` when the file does not exist.
    async fn read_to_string(&self, path: &str) -> Result<Option<String>, PortError>;

    /// Create or replace a file, creating parent directories as needed.
    async fn write(&self, path: &str, content: &str) -> Result<(), PortError>;

    /// Append to a file and flush it to durable storage before returning.
    async fn append(&self, path: &str, content: &str) -> Result<(), PortError>;

    /// Delete a file. Deleting a missing file is not an error.
    async fn delete(&self, path: &str) -> Result<(), PortError>;

    /// Check if a file exists
    async fn exists(&self, path: &str) -> Result<bool, PortError>;
}

/// Local filesystem implementation, jailed to a root directory.
#[derive(Debug, Clone)]
pub struct LocalWorkspaceFs {
    root: PathBuf,
}

impl LocalWorkspaceFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, PortError> {
        Ok(self.root.join(validate_relative_path(path)?))
    }

    async fn ensure_parent(path: &Path) -> Result<(), PortError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceFs for LocalWorkspaceFs {
    async fn read_to_string(&self, path: &str) -> Result<Option<String>, PortError> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), PortError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn append(&self, path: &str, content: &str) -> Result<(), PortError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), PortError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, PortError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }
}

/// In-memory workspace, used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkspaceFs {
    files: Arc<RwLock<HashMap<PathBuf, String>>>,
}

impl MemoryWorkspaceFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the workspace with `(path, content)` pairs.
    pub async fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let fs = Self::new();
        {
            let mut guard = fs.files.write().await;
            for (path, content) in files {
                if let Ok(key) = validate_relative_path(path.as_ref()) {
                    guard.insert(key, content.into());
                }
            }
        }
        fs
    }

    /// Sorted list of every path currently stored.
    pub async fn paths(&self) -> Vec<String> {
        let guard = self.files.read().await;
        let mut out: Vec<String> = guard
            .keys()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        out.sort();
        out
    }
}

#[async_trait]
impl WorkspaceFs for MemoryWorkspaceFs {
    async fn read_to_string(&self, path: &str) -> Result<Option<String>, PortError> {
        let key = validate_relative_path(path)?;
        Ok(self.files.read().await.get(&key).cloned())
    }

    async fn write(&self, path: &str, content: &str) -> Result<(), PortError> {
        let key = validate_relative_path(path)?;
        self.files.write().await.insert(key, content.to_string());
        Ok(())
    }

    async fn append(&self, path: &str, content: &str) -> Result<(), PortError> {
        let key = validate_relative_path(path)?;
        self.files
            .write()
            .await
            .entry(key)
            .or_default()
            .push_str(content);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), PortError> {
        let key = validate_relative_path(path)?;
        self.files.write().await.remove(&key);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, PortError> {
        let key = validate_relative_path(path)?;
        Ok(self.files.read().await.contains_key(&key))
    }
}

// ============================================================================
// Secret store
// ============================================================================

/// Named secret storage (OS keychain, editor secret API, vault...).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>, PortError>;
    async fn set(&self, name: &str, value: &str) -> Result<(), PortError>;
}

/// In-memory secret store (tests, ephemeral sessions)
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<String>, PortError> {
        Ok(self.secrets.read().await.get(name).cloned())
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), PortError> {
        self.secrets
            .write()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per secret under a directory. Meant for the CLI, where no host
/// keychain is available.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, PortError> {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
            .collect();
        if safe.trim_matches('.').is_empty() {
            return Err(PortError::Secret(format!("invalid secret name: {name:?}")));
        }
        Ok(self.dir.join(safe))
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, name: &str) -> Result<Option<String>, PortError> {
        let path = self.path_for(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), PortError> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, value).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Human approval channel
// ============================================================================

/// A question put to the human operator during an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalPrompt {
    /// Risk is below threshold but a matched domain has low trust.
    TrustGate {
        min_trust: u8,
        gate: u8,
        domains: Vec<String>,
    },
    /// Risk is at or above the effective threshold; override is allowed.
    Override { risk: f64, threshold: f64 },
    /// Free-text reason recorded in the ledger.
    Justification,
    /// Identifier of the person requesting the override.
    Actor,
    /// Identifier of the second approver (must differ from the actor).
    SecondApprover,
    /// The second approver types back this code.
    ConfirmCode { code: String },
}

impl std::fmt::Display for ApprovalPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrustGate {
                min_trust,
                gate,
                domains,
            } => write!(
                f,
                "Low trust score ({min_trust}/100, gate {gate}) for domains [{}]. Continue apply?",
                domains.join(", ")
            ),
            Self::Override { risk, threshold } => {
                write!(f, "High-risk apply ({risk}/{threshold}). Continue?")
            }
            Self::Justification => write!(f, "Short reason for audit (required to continue apply)"),
            Self::Actor => write!(f, "Enter your identifier (user/email) for audit"),
            Self::SecondApprover => write!(f, "Enter second approver identifier"),
            Self::ConfirmCode { code } => {
                write!(f, "Type approval code {code} to confirm dual approval")
            }
        }
    }
}

/// Human-in-the-loop channel. Returning `false` / `None` is the cancel path.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn confirm(&self, prompt: &ApprovalPrompt) -> bool;
    async fn input(&self, prompt: &ApprovalPrompt) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_traversal_and_absolute() {
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("src/../../x").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("   ").is_err());
        assert!(validate_relative_path("./").is_err());
    }

    #[test]
    fn validate_strips_cur_dir() {
        let p = validate_relative_path("./src/a.rs").unwrap();
        assert_eq!(p, PathBuf::from("src/a.rs"));
    }

    #[tokio::test]
    async fn memory_fs_roundtrip() {
        let fs = MemoryWorkspaceFs::new();
        assert_eq!(fs.read_to_string("a.txt").await.unwrap(), None);
        fs.write("a.txt", "hello").await.unwrap();
        fs.append("a.txt", " world").await.unwrap();
        assert_eq!(
            fs.read_to_string("a.txt").await.unwrap().as_deref(),
            Some("hello world")
        );
        fs.delete("a.txt").await.unwrap();
        assert!(!fs.exists("a.txt").await.unwrap());
        // deleting again is fine
        fs.delete("a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn local_fs_jails_paths() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalWorkspaceFs::new(dir.path());
        fs.write("nested/dir/file.txt", "x").await.unwrap();
        assert!(fs.exists("nested/dir/file.txt").await.unwrap());
        assert!(matches!(
            fs.write("../escape.txt", "x").await,
            Err(PortError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn local_fs_append_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalWorkspaceFs::new(dir.path());
        fs.append("ledger.jsonl", "{}\n").await.unwrap();
        fs.append("ledger.jsonl", "{}\n").await.unwrap();
        let text = fs.read_to_string("ledger.jsonl").await.unwrap().unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn file_secret_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets"));
        assert_eq!(store.get("custody.hmacKey").await.unwrap(), None);
        store.set("custody.hmacKey", "abc123").await.unwrap();
        assert_eq!(
            store.get("custody.hmacKey").await.unwrap().as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn prompt_display_override() {
        let p = ApprovalPrompt::Override {
            risk: 85.0,
            threshold: 70.0,
        };
        assert_eq!(p.to_string(), "High-risk apply (85/70). Continue?");
    }
}
