//! Named document store. Observers may only touch a fixed allow-list of
//! project documents; names are validated before any filesystem access, so a
//! path-escaping name is rejected without ever being resolved.

use std::path::PathBuf;

use loopdeck_core::error::DocumentError;
use loopdeck_core::parse::is_safe_document_name;
use tokio::fs;

pub const DOCUMENT_NAMES: [&str; 4] = ["PROMPT.md", "AGENT.md", "TODO.md", "NOTES.md"];

pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn names(&self) -> Vec<String> {
        DOCUMENT_NAMES.iter().map(|name| name.to_string()).collect()
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, DocumentError> {
        if !is_safe_document_name(name) {
            return Err(DocumentError::InvalidName(name.to_string()));
        }
        if !DOCUMENT_NAMES.contains(&name) {
            return Err(DocumentError::NotFound(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    /// An allow-listed document that does not exist yet reads as empty.
    pub async fn read(&self, name: &str) -> Result<String, DocumentError> {
        let path = self.resolve(name)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(DocumentError::Io(err)),
        }
    }

    pub async fn write(&self, name: &str, content: &str) -> Result<(), DocumentError> {
        let path = self.resolve(name)?;
        fs::write(&path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = DocumentStore::new(dir.path().to_path_buf());
        store
            .write("PROMPT.md", "ship the tailer")
            .await
            .expect("write");
        let content = store.read("PROMPT.md").await.expect("read");
        assert_eq!(content, "ship the tailer");
    }

    #[tokio::test]
    async fn absent_document_reads_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        let store = DocumentStore::new(dir.path().to_path_buf());
        assert_eq!(store.read("NOTES.md").await.expect("read"), "");
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let store = DocumentStore::new(dir.path().to_path_buf());
        let err = store.read("SECRETS.md").await.expect_err("unknown");
        assert!(matches!(err, DocumentError::NotFound(_)));
        let err = store
            .write("SECRETS.md", "nope")
            .await
            .expect_err("unknown");
        assert!(matches!(err, DocumentError::NotFound(_)));
    }

    #[tokio::test]
    async fn escaping_names_are_rejected_before_io() {
        let dir = TempDir::new().expect("tempdir");
        let store = DocumentStore::new(dir.path().to_path_buf());
        for name in ["../PROMPT.md", "/etc/passwd", "a/b.md", ""] {
            let err = store.write(name, "x").await.expect_err("invalid");
            assert!(matches!(err, DocumentError::InvalidName(_)), "{name}");
        }
    }
}
