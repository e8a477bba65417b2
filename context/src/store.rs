//! On-disk transcript store.
//!
//! Layout under the storage root:
//!
//! ```text
//! message/<session_id>/<message_id>.json   MessageInfo
//! part/<message_id>/<part_id>.json         Part
//! ```
//!
//! The host mints time-sortable ids, so messages are ordered by message id and
//! parts by part id. Every write goes through [`atomic_write`]; a reader never
//! observes a torn file.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use keel_types::{MessageId, MessageInfo, Part, PartId, PersistedMessage, SessionId};

use crate::atomic_write::atomic_write;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed transcript file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct TranscriptStore {
    root: PathBuf,
}

impl TranscriptStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn message_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("message").join(session_id.as_str())
    }

    #[must_use]
    pub fn part_dir(&self, message_id: &MessageId) -> PathBuf {
        self.root.join("part").join(message_id.as_str())
    }

    fn message_path(&self, session_id: &SessionId, message_id: &MessageId) -> PathBuf {
        self.message_dir(session_id)
            .join(format!("{}.json", message_id.as_str()))
    }

    fn part_path(&self, message_id: &MessageId, part_id: &PartId) -> PathBuf {
        self.part_dir(message_id)
            .join(format!("{}.json", part_id.as_str()))
    }

    /// Message metadata for a session, oldest first. A missing session is empty.
    pub fn list_message_infos(&self, session_id: &SessionId) -> Result<Vec<MessageInfo>, StoreError> {
        let mut infos: Vec<MessageInfo> = read_json_dir(&self.message_dir(session_id))?;
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    /// Parts of one message in persisted order.
    pub fn read_parts(&self, message_id: &MessageId) -> Result<Vec<Part>, StoreError> {
        let mut parts: Vec<Part> = read_json_dir(&self.part_dir(message_id))?;
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(parts)
    }

    /// The full transcript of a session.
    pub fn list_messages(&self, session_id: &SessionId) -> Result<Vec<PersistedMessage>, StoreError> {
        self.list_message_infos(session_id)?
            .into_iter()
            .map(|info| {
                let parts = self.read_parts(&info.id)?;
                Ok(PersistedMessage::new(info, parts))
            })
            .collect()
    }

    pub fn read_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Result<Option<PersistedMessage>, StoreError> {
        let Some(info) = read_json::<MessageInfo>(&self.message_path(session_id, message_id))? else {
            return Ok(None);
        };
        let parts = self.read_parts(&info.id)?;
        Ok(Some(PersistedMessage::new(info, parts)))
    }

    pub fn read_part(
        &self,
        message_id: &MessageId,
        part_id: &PartId,
    ) -> Result<Option<Part>, StoreError> {
        read_json(&self.part_path(message_id, part_id))
    }

    pub fn write_message_info(&self, info: &MessageInfo) -> Result<(), StoreError> {
        write_json(&self.message_path(&info.session_id, &info.id), info)
    }

    pub fn write_part(&self, part: &Part) -> Result<(), StoreError> {
        write_json(&self.part_path(&part.message_id, &part.id), part)
    }

    /// Persist a whole message (metadata and parts).
    pub fn write_message(&self, message: &PersistedMessage) -> Result<(), StoreError> {
        self.write_message_info(&message.info)?;
        for part in &message.parts {
            self.write_part(part)?;
        }
        Ok(())
    }

    /// Remove a part. Returns `false` if it was already gone.
    pub fn delete_part(&self, message_id: &MessageId, part_id: &PartId) -> Result<bool, StoreError> {
        let path = self.part_path(message_id, part_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Write { path, source }),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Every `*.json` file in `dir`. Unparseable files are skipped with a warning so
/// one corrupt part never hides the rest of the transcript.
fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Read {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut items = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path) {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(StoreError::Parse { path, source }) => {
                warn!(path = %path.display(), "Skipping malformed transcript file: {source}");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(items)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &bytes).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}


#[cfg(test)]
mod tests {
    use keel_types::{PartKind, Role};

    use super::fixtures::TranscriptBuilder;
    use super::*;

    #[test]
    fn round_trips_a_transcript_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let session = SessionId::new("ses_1");

        TranscriptBuilder::new("ses_1")
            .user("hello")
            .assistant(vec![PartKind::StepStart, PartKind::text("hi")])
            .persist(&store);

        let messages = store.list_messages(&session).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].info.role, Role::User);
        assert_eq!(messages[1].parts.len(), 2);
        assert_eq!(messages[1].parts[0].kind, PartKind::StepStart);
        assert_eq!(messages[1].text(), "hi");
    }

    #[test]
    fn missing_session_and_message_are_empty_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let session = SessionId::new("ses_missing");

        assert!(store.list_messages(&session).unwrap().is_empty());
        assert!(
            store
                .read_message(&session, &MessageId::new("msg_x"))
                .unwrap()
                .is_none()
        );
        assert!(
            !store
                .delete_part(&MessageId::new("msg_x"), &PartId::new("prt_x"))
                .unwrap()
        );
    }

    #[test]
    fn malformed_part_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let messages = TranscriptBuilder::new("ses_1")
            .assistant(vec![PartKind::text("ok")])
            .persist(&store);

        let message_id = &messages[0].info.id;
        std::fs::write(store.part_dir(message_id).join("prt_zzz.json"), b"{not json").unwrap();

        let parts = store.read_parts(message_id).unwrap();
        assert_eq!(parts.len(), 1);
    }
}
