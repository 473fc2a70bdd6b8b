use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use shared::protocol::Session;
use tracing::warn;

use crate::error::GatewayError;

/// Where the gateway keeps the current session between process runs.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<Session>, GatewayError>;
    fn save(&self, session: &Session) -> Result<(), GatewayError>;
    fn clear(&self) -> Result<(), GatewayError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn with_session(session: Session) -> Self {
        Self {
            inner: Mutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>, GatewayError> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| GatewayError::Store("session store lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, session: &Session) -> Result<(), GatewayError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| GatewayError::Store("session store lock poisoned".into()))?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), GatewayError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| GatewayError::Store("session store lock poisoned".into()))?;
        *guard = None;
        Ok(())
    }
}

/// JSON file holding the session tokens.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, GatewayError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(GatewayError::Store(format!(
                    "failed to read '{}': {err}",
                    self.path.display()
                )))
            }
        };

        match serde_json::from_slice::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "discarding corrupt session file");
                Ok(None)
            }
        }
    }

    fn save(&self, session: &Session) -> Result<(), GatewayError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    GatewayError::Store(format!(
                        "failed to create '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let raw = serde_json::to_vec_pretty(session)
            .map_err(|err| GatewayError::Store(err.to_string()))?;
        fs::write(&self.path, raw).map_err(|err| {
            GatewayError::Store(format!("failed to write '{}': {err}", self.path.display()))
        })
    }

    fn clear(&self) -> Result<(), GatewayError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GatewayError::Store(format!(
                "failed to remove '{}': {err}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use shared::{
        domain::UserId,
        protocol::{AuthUser, UserMetadata},
    };

    use super::*;

    fn session() -> Session {
        Session {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            user: AuthUser {
                id: UserId(uuid::Uuid::nil()),
                email: Some("fitter@example.com".into()),
                user_metadata: UserMetadata::default(),
            },
        }
    }

    #[test]
    fn file_store_round_trips_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));

        assert_eq!(store.load().expect("load empty"), None);
        store.save(&session()).expect("save");
        assert_eq!(store.load().expect("load"), Some(session()));

        store.clear().expect("clear");
        store.clear().expect("clear twice");
        assert_eq!(store.load().expect("load cleared"), None);
    }

    #[test]
    fn corrupt_file_reads_as_no_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json").expect("write");

        assert_eq!(FileSessionStore::new(path).load().expect("load"), None);
    }
}
