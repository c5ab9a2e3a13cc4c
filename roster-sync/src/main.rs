mod config;
mod telemetry;

use clap::{Parser, Subcommand};
use config::Config;
use mailing_list::attachments::AttachmentStore;
use mailing_list::directory::DirectoryError;
use mailing_list::storage::StorageError;
use mailing_list::tasks::{Task, TaskError};
use mailing_list::types::{Membership, SubscriberEntry, membership_from_entries};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(version, about = "Keeps project mailing lists in sync with their contributors")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "roster-sync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Reconcile one mailing list with the given members
    Reconcile {
        #[arg(long)]
        list_id: String,
        #[arg(long)]
        title: String,
        /// Delete the list instead of keeping it in sync
        #[arg(long)]
        delete: bool,
        /// JSON object mapping subscriber ids to {email, name, subscribed}
        #[arg(long, required_unless_present = "delete")]
        members: Option<PathBuf>,
    },
    /// Send a message from a mailing list
    Notify {
        #[arg(long)]
        list_id: String,
        #[arg(long)]
        title: String,
        #[arg(long = "to", required = true)]
        recipients: Vec<String>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
    /// Store a mailed attachment in the file storage service
    Attach {
        #[arg(long)]
        owner_id: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        file: PathBuf,
        /// Stored filename, defaults to the name of `file`
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("could not read members file: {0}")]
    MembersIo(#[source] std::io::Error),
    #[error("could not parse members file: {0}")]
    MembersParse(#[from] serde_json::Error),
    #[error("could not read attachment: {0}")]
    AttachmentIo(#[source] std::io::Error),
    #[error("no storage is configured")]
    MissingStorage,
    #[error("{0}")]
    Directory(#[from] DirectoryError),
    #[error("{0}")]
    Task(#[from] TaskError),
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("could not start runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match telemetry::init(&config.common) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config, command: CliCommand) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    rt.block_on(run_async(config, command))
}

async fn run_async(config: Config, command: CliCommand) -> Result<(), CliError> {
    let config = config.mailing_list;

    match command {
        CliCommand::Reconcile {
            list_id,
            title,
            delete,
            members,
        } => {
            let members = match members {
                Some(path) => load_members(&path)?,
                None => Membership::new(),
            };
            tracing::info!(list_id = %list_id, members = members.len(), delete, "Reconciling list");
            let task = Task::Reconcile {
                list_id,
                list_title: title,
                should_exist: !delete,
                members,
            };
            run_task(&config, task).await
        }
        CliCommand::Notify {
            list_id,
            title,
            recipients,
            subject,
            body,
        } => {
            let task = Task::SendMessage {
                list_id,
                list_title: title,
                recipients,
                subject,
                body,
            };
            run_task(&config, task).await
        }
        CliCommand::Attach {
            owner_id,
            user_id,
            file,
            name,
        } => {
            let storage_config = config.storage.as_ref().ok_or(CliError::MissingStorage)?;
            let store = AttachmentStore::new(mailing_list::get_storage(storage_config)?);

            let contents = tokio::fs::read(&file).await.map_err(CliError::AttachmentIo)?;
            let filename = name.or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            });

            let folder = store.ensure_folder(&owner_id, &user_id).await?;
            let path = store.upload(&folder, filename.as_deref(), contents).await?;
            println!("{path}");
            Ok(())
        }
    }
}

async fn run_task(config: &mailing_list::config::Config, task: Task) -> Result<(), CliError> {
    let runner = mailing_list::start_task_runner(config)?;
    let result = runner.run(task).await;
    runner.shutdown().await;
    Ok(result?)
}

fn load_members(path: &Path) -> Result<Membership, CliError> {
    let data = std::fs::read(path).map_err(CliError::MembersIo)?;
    let entries: HashMap<String, SubscriberEntry> = serde_json::from_slice(&data)?;
    Ok(membership_from_entries(entries))
}
