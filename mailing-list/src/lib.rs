pub mod attachments;
pub mod config;
pub mod directory;
pub mod mailgun;
pub mod metrics_defs;
pub mod notifier;
pub mod reconciler;
pub mod storage;
pub mod tasks;
pub mod types;

#[cfg(test)]
mod testutils;

use config::{Config, StorageConfig};
use directory::DirectoryError;
use mailgun::MailgunDirectory;
use reconciler::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use storage::{FileStorage, FilesystemStorage, HttpFileStorage, StorageError};
use tasks::{RetryPolicy, TaskRunner};

/// Builds a reconciler talking to the configured Mailgun directory.
pub fn get_reconciler(config: &Config) -> Result<Reconciler, DirectoryError> {
    let directory = MailgunDirectory::new(&config.mailgun)?;
    Ok(Reconciler::new(
        Arc::new(directory),
        config.mailgun.domain.clone(),
        config.site_url.clone(),
    ))
}

/// Starts a task runner with the configured retry policy. Must be called from within
/// a tokio runtime.
pub fn start_task_runner(config: &Config) -> Result<TaskRunner, DirectoryError> {
    let reconciler = get_reconciler(config)?;
    Ok(TaskRunner::start(
        Arc::new(reconciler),
        RetryPolicy::from(&config.tasks),
        config.tasks.queue_size,
    ))
}

pub fn get_storage(config: &StorageConfig) -> Result<Arc<dyn FileStorage>, StorageError> {
    let storage: Arc<dyn FileStorage> = match config {
        StorageConfig::Http {
            api_url,
            content_url,
            access_token,
            timeout_secs,
        } => Arc::new(HttpFileStorage::new(
            api_url.clone(),
            content_url.clone(),
            access_token.clone(),
            Duration::from_secs(*timeout_secs),
        )?),
        StorageConfig::Filesystem { base_dir } => Arc::new(FilesystemStorage::new(base_dir)),
    };
    Ok(storage)
}
