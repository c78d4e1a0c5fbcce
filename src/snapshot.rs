//! JSON snapshot of the mailbox

use crate::config::PersistenceConfig;
use crate::error::SnapshotError;
use crate::mailbox::Mailbox;
use crate::message::Message;

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Write all messages to `path`, replacing any previous snapshot.
///
/// The JSON is written to a temporary file next to `path` first, so readers
/// never observe a half-written snapshot.
pub fn save(path: &Path, messages: &[Arc<Message>]) -> Result<(), SnapshotError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let messages: Vec<&Message> = messages.iter().map(Arc::as_ref).collect();
    let mut file = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, &messages)?;
        writer.flush()?;
    }
    file.persist(path).map_err(|e| e.error)?;

    log::debug!("saved {} messages to {}", messages.len(), path.display());
    Ok(())
}

/// Read a snapshot written by [`save`]. A missing file is an empty snapshot.
pub fn load(path: &Path) -> Result<Vec<Message>, SnapshotError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let messages: Vec<Message> = serde_json::from_slice(&data)?;
    log::info!("loaded {} messages from {}", messages.len(), path.display());
    Ok(messages)
}

/// Delete the snapshot, if there is one
pub fn remove(path: &Path) -> Result<(), SnapshotError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Apply the persistence settings at startup.
///
/// With persistence on, the snapshot is restored into `mailbox` and its path
/// returned for later saves. With persistence off, a snapshot left at the
/// configured path is deleted so stale messages never come back.
pub fn open(
    persistence: &PersistenceConfig,
    mailbox: &Mailbox,
) -> Result<Option<PathBuf>, SnapshotError> {
    let Some(path) = &persistence.path else {
        if persistence.enabled {
            log::warn!("persistence is enabled but no path is set, messages stay in memory");
        }
        return Ok(None);
    };

    if !persistence.enabled {
        remove(path)?;
        return Ok(None);
    }

    mailbox.restore(load(path)?);
    Ok(Some(path.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime;

    fn mailbox_with(subjects: &[&str]) -> Mailbox {
        let mailbox = Mailbox::new();
        for subject in subjects {
            let raw = format!("Subject: {subject}\r\nX-Test: 1\r\n\r\nbody\r\n").into_bytes();
            let parts = mime::decompose(&raw).unwrap();
            mailbox.append(Message::capture(
                "a@x".to_owned(),
                vec!["b@y".to_owned()],
                raw,
                parts,
            ));
        }
        mailbox
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("messages.json");
        let mailbox = mailbox_with(&["one", "two"]);

        save(&path, &mailbox.list()).unwrap();
        let loaded = load(&path).unwrap();

        let original: Vec<Message> = mailbox.list().iter().map(|m| (**m).clone()).collect();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");

        save(&path, &mailbox_with(&["a", "b", "c"]).list()).unwrap();
        save(&path, &mailbox_with(&["d"]).list()).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].subject, "d");
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("none.json")).unwrap().is_empty());
    }

    #[test]
    fn test_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        fs::write(&path, b"[{\"id\": 1").unwrap();
        assert!(matches!(load(&path), Err(SnapshotError::Json(_))));
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        save(&path, &mailbox_with(&["x"]).list()).unwrap();

        remove(&path).unwrap();
        assert!(!path.exists());
        remove(&path).unwrap();
    }

    #[test]
    fn test_open_restores_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        save(&path, &mailbox_with(&["kept"]).list()).unwrap();

        let mailbox = Mailbox::new();
        let persistence = PersistenceConfig {
            enabled: true,
            path: Some(path.clone()),
        };
        assert_eq!(open(&persistence, &mailbox).unwrap(), Some(path.clone()));
        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox.list()[0].subject, "kept");
        assert!(path.exists());
    }

    #[test]
    fn test_open_deletes_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        save(&path, &mailbox_with(&["stale"]).list()).unwrap();

        let mailbox = Mailbox::new();
        let persistence = PersistenceConfig {
            enabled: false,
            path: Some(path.clone()),
        };
        assert_eq!(open(&persistence, &mailbox).unwrap(), None);
        assert!(mailbox.is_empty());
        assert!(!path.exists());

        // Nothing left to delete on the next start
        assert_eq!(open(&persistence, &mailbox).unwrap(), None);
    }

    #[test]
    fn test_open_without_path() {
        let mailbox = Mailbox::new();
        let persistence = PersistenceConfig {
            enabled: true,
            path: None,
        };
        assert_eq!(open(&persistence, &mailbox).unwrap(), None);
        assert!(mailbox.is_empty());
    }
}
