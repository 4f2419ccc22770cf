//! Filesystem-backed profile-picture storage.
//!
//! Implements the object-storage collaborator: a blob keyed by user id, a
//! retrievable URL in return.  Re-uploading replaces the previous picture;
//! only the returned URL is stored on the user record.

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, info};

use causerie_shared::types::UserId;

use crate::error::ServerError;

pub struct AvatarStore {
    base_path: PathBuf,
    max_size: usize,
}

impl AvatarStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create avatar directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Avatar store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Store (or replace) a user's avatar and return its public URL path.
    pub async fn store(&self, user: &UserId, data: &[u8]) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty avatar upload".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BadRequest(format!(
                "Avatar too large: {} bytes (max {})",
                data.len(),
                self.max_size
            )));
        }

        let path = self.file_path(user)?;
        fs::write(&path, data).await.map_err(|e| {
            ServerError::Internal(format!("Failed to write avatar for {}: {}", user, e))
        })?;

        debug!(user = %user, size = data.len(), "Stored avatar");
        Ok(format!("/avatars/{user}"))
    }

    /// Fetch a user's stored avatar bytes.
    pub async fn load(&self, user: &UserId) -> Result<Vec<u8>, ServerError> {
        let path = self.file_path(user)?;

        if !path.exists() {
            return Err(ServerError::NotFound(format!("no avatar for {user}")));
        }

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::Internal(format!("Failed to read avatar for {}: {}", user, e))
        })?;

        debug!(user = %user, size = data.len(), "Retrieved avatar");
        Ok(data)
    }

    /// On-disk location for a user's avatar.
    ///
    /// Principal ids are restricted to `[A-Za-z0-9-]`, which also rules out
    /// any path traversal; everything else is rejected before touching the
    /// filesystem.
    fn file_path(&self, user: &UserId) -> Result<PathBuf, ServerError> {
        if !user.is_well_formed() {
            return Err(ServerError::BadRequest(format!(
                "Invalid user id: {:?}",
                user.as_str()
            )));
        }
        Ok(self.base_path.join(user.as_str()))
    }
}
