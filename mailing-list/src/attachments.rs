use crate::metrics_defs::ATTACHMENTS_UPLOADED;
use crate::storage::{EntryKind, FileStorage, StorageError};
use shared::counter;
use std::sync::Arc;

pub const ATTACHMENTS_ROOT: &str = "/Mailed Attachments";
const FALLBACK_FILENAME: &str = "attachment";
const MAX_FOLDER_ATTEMPTS: u32 = 100;

// Path separators would otherwise nest the entry in another folder.
fn path_safe(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Stores attachments of mailed messages in one folder per owner and user.
#[derive(Clone)]
pub struct AttachmentStore {
    storage: Arc<dyn FileStorage>,
}

impl AttachmentStore {
    pub fn new(storage: Arc<dyn FileStorage>) -> Self {
        AttachmentStore { storage }
    }

    /// Returns the attachment folder for `owner_id` and `user_id`, creating it when
    /// missing. When the name is taken by a file, ` (1)`, ` (2)`, ... is appended.
    pub async fn ensure_folder(&self, owner_id: &str, user_id: &str) -> Result<String, StorageError> {
        let base = format!(
            "{ATTACHMENTS_ROOT}/{} - {}",
            path_safe(owner_id),
            path_safe(user_id)
        );

        for n in 0..MAX_FOLDER_ATTEMPTS {
            let candidate = if n == 0 {
                base.clone()
            } else {
                format!("{base} ({n})")
            };

            match self.storage.metadata(&candidate).await? {
                Some(meta) if meta.kind == EntryKind::Folder => return Ok(meta.path),
                Some(_) => continue,
                None => {}
            }

            match self.storage.create_folder(&candidate).await {
                Ok(meta) => {
                    tracing::debug!(path = %meta.path, "Created attachment folder");
                    return Ok(meta.path);
                }
                // Someone else took the name between the lookup and the create
                Err(StorageError::Conflict(_)) => {
                    if let Some(meta) = self.storage.metadata(&candidate).await? {
                        if meta.kind == EntryKind::Folder {
                            return Ok(meta.path);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(StorageError::NoFreeName(base))
    }

    /// Uploads an attachment into `folder` and returns its stored path. A missing
    /// or empty filename is replaced with a fallback name.
    pub async fn upload(
        &self,
        folder: &str,
        filename: Option<&str>,
        contents: Vec<u8>,
    ) -> Result<String, StorageError> {
        let filename = match filename.map(str::trim) {
            Some(name) if !name.is_empty() => path_safe(name),
            _ => FALLBACK_FILENAME.to_string(),
        };
        let size = contents.len();
        let meta = self
            .storage
            .upload(&format!("{}/{filename}", folder.trim_end_matches('/')), contents)
            .await?;

        counter!(ATTACHMENTS_UPLOADED).increment(1);
        tracing::info!(path = %meta.path, size, "Uploaded attachment");
        Ok(meta.path)
    }
}
