//! collaborators - narrow interfaces to the application around the session
//!
//! Feedback and lifecycle hooks are fire-and-forget. Identity is read once at
//! construction and injected, never looked up from ambient storage.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::discovery::DEFAULT_HOST_NAME;
use crate::types::PeerId;

/// sound/haptic cue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cue {
    Victory,
    Loss,
    CountdownTick,
    GameStart,
}

/// Sound and haptics. Must return immediately.
pub trait Feedback: Send + Sync {
    fn play(&self, cue: Cue);
}

/// Foreground monitoring. Backgrounding is reported back through the
/// coordinator handle, not through this trait.
pub trait Lifecycle: Send + Sync {
    fn start_monitoring(&self);
    fn stop_monitoring(&self);
}

/// no-op feedback
#[derive(Clone, Copy, Debug, Default)]
pub struct Silent;

impl Feedback for Silent {
    fn play(&self, _cue: Cue) {}
}

impl Lifecycle for Silent {
    fn start_monitoring(&self) {}
    fn stop_monitoring(&self) {}
}

/// feedback that only logs
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFeedback;

impl Feedback for LogFeedback {
    fn play(&self, cue: Cue) {
        tracing::debug!(?cue, "feedback");
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// who this device is
pub trait IdentityProvider: Send + Sync {
    fn local_peer_id(&self) -> PeerId;
    fn display_name(&self) -> String;
    fn avatar_color_index(&self) -> u8;
}

/// fixed identity, for tests and the simulator
#[derive(Clone, Debug)]
pub struct StaticIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
    pub avatar_color_index: u8,
}

impl StaticIdentity {
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>, avatar_color_index: u8) -> Self {
        Self {
            peer_id: PeerId::new(peer_id),
            display_name: display_name.into(),
            avatar_color_index,
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn avatar_color_index(&self) -> u8 {
        self.avatar_color_index
    }
}

const KEY_PEER_ID: &str = "peer_id";
const KEY_DISPLAY_NAME: &str = "display_name";
const KEY_AVATAR: &str = "avatar_color_index";

/// identity backed by a JSON key-value file
///
/// A peer id is generated and written back on first open.
pub struct FileIdentity {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileIdentity {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        let mut values: BTreeMap<String, String> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let fresh = !values.contains_key(KEY_PEER_ID);
        if fresh {
            let id = Uuid::new_v4().simple().to_string();
            tracing::info!(peer_id = %id, "generated device identity");
            values.insert(KEY_PEER_ID.to_string(), id);
        }

        let identity = Self {
            path,
            values: Mutex::new(values),
        };
        if fresh {
            identity.save()?;
        }
        Ok(identity)
    }

    pub fn set_display_name(&self, name: &str) -> Result<(), IdentityError> {
        self.values.lock().insert(KEY_DISPLAY_NAME.to_string(), name.to_string());
        self.save()
    }

    pub fn set_avatar_color_index(&self, index: u8) -> Result<(), IdentityError> {
        self.values.lock().insert(KEY_AVATAR.to_string(), index.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), IdentityError> {
        let bytes = serde_json::to_vec_pretty(&*self.values.lock())?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }
}

impl IdentityProvider for FileIdentity {
    fn local_peer_id(&self) -> PeerId {
        PeerId::new(self.get(KEY_PEER_ID).unwrap_or_default())
    }

    fn display_name(&self) -> String {
        self.get(KEY_DISPLAY_NAME)
            .unwrap_or_else(|| DEFAULT_HOST_NAME.to_string())
    }

    fn avatar_color_index(&self) -> u8 {
        self.get(KEY_AVATAR).and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_identity_persists_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = FileIdentity::open(&path).unwrap();
        let peer = first.local_peer_id();
        assert!(!peer.as_str().is_empty());
        assert_eq!(first.display_name(), "Player");

        first.set_display_name("Emma").unwrap();
        first.set_avatar_color_index(4).unwrap();

        let second = FileIdentity::open(&path).unwrap();
        assert_eq!(second.local_peer_id(), peer);
        assert_eq!(second.display_name(), "Emma");
        assert_eq!(second.avatar_color_index(), 4);
    }

    #[test]
    fn test_corrupt_identity_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(FileIdentity::open(&path), Err(IdentityError::Corrupt(_))));
    }

    #[test]
    fn test_static_identity() {
        let id = StaticIdentity::new("abc", "Sam", 2);
        assert_eq!(id.local_peer_id(), PeerId::from("abc"));
        assert_eq!(id.display_name(), "Sam");
    }
}
