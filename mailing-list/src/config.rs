use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_MAILGUN_URL: &str = "https://api.mailgun.net/v3";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Mailgun API key cannot be empty")]
    EmptyApiKey,

    #[error("Mailgun domain cannot be empty")]
    EmptyDomain,

    #[error("Task queue size cannot be 0")]
    InvalidQueueSize,

    #[error("URL must use http or https: {0}")]
    UnsupportedScheme(Url),

    #[error("Storage access token cannot be empty")]
    EmptyAccessToken,
}

/// Mailgun-compatible directory configuration
#[derive(Clone, Deserialize, PartialEq)]
pub struct MailgunConfig {
    /// API key, sent as the basic auth password for the `api` user
    pub api_key: String,
    /// Mail domain hosting the lists. List addresses are `<list id>@<domain>`.
    pub domain: String,
    #[serde(default = "default_base_url")]
    pub base_url: Url,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for MailgunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailgunConfig")
            .field("api_key", &"<redacted>")
            .field("domain", &self.domain)
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_MAILGUN_URL).expect("default Mailgun URL is valid")
}

fn default_timeout_secs() -> u64 {
    30
}

/// Retry behavior of the deferred task runner
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// Fixed delay before a failed task is dispatched again
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Unset means failed tasks are retried until they succeed
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl TaskConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            retry_delay_secs: default_retry_delay_secs(),
            max_retries: None,
            queue_size: default_queue_size(),
        }
    }
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_queue_size() -> usize {
    64
}

#[derive(Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageConfig {
    Http {
        api_url: Url,
        content_url: Url,
        access_token: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Filesystem {
        base_dir: String,
    },
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageConfig::Http {
                api_url,
                content_url,
                timeout_secs,
                ..
            } => f
                .debug_struct("Http")
                .field("api_url", api_url)
                .field("content_url", content_url)
                .field("access_token", &"<redacted>")
                .field("timeout_secs", timeout_secs)
                .finish(),
            StorageConfig::Filesystem { base_dir } => f
                .debug_struct("Filesystem")
                .field("base_dir", base_dir)
                .finish(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub mailgun: MailgunConfig,
    /// Public URL of the owning site. Member unsubscribe links point back here.
    pub site_url: Url,
    #[serde(default)]
    pub tasks: TaskConfig,
    pub storage: Option<StorageConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.mailgun.api_key.is_empty() {
            return Err(ValidationError::EmptyApiKey);
        }
        if self.mailgun.domain.is_empty() {
            return Err(ValidationError::EmptyDomain);
        }
        if self.tasks.queue_size == 0 {
            return Err(ValidationError::InvalidQueueSize);
        }

        validate_scheme(&self.mailgun.base_url)?;
        validate_scheme(&self.site_url)?;

        if let Some(StorageConfig::Http {
            api_url,
            content_url,
            access_token,
            ..
        }) = &self.storage
        {
            validate_scheme(api_url)?;
            validate_scheme(content_url)?;
            if access_token.is_empty() {
                return Err(ValidationError::EmptyAccessToken);
            }
        }

        Ok(())
    }
}

fn validate_scheme(url: &Url) -> Result<(), ValidationError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ValidationError::UnsupportedScheme(url.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
mailgun:
    api_key: key-123
    domain: lists.example.org
site_url: https://osf.example.org/
tasks:
    retry_delay_secs: 10
    max_retries: 3
storage:
    type: filesystem
    base_dir: /var/lib/roster-sync
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.mailgun.base_url.as_str(), "https://api.mailgun.net/v3");
        assert_eq!(config.mailgun.timeout_secs, 30);
        assert_eq!(config.tasks.retry_delay(), Duration::from_secs(10));
        assert_eq!(config.tasks.max_retries, Some(3));
        assert_eq!(config.tasks.queue_size, 64);
        assert_eq!(
            config.storage,
            Some(StorageConfig::Filesystem {
                base_dir: "/var/lib/roster-sync".into()
            })
        );
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
mailgun: {api_key: key-123, domain: lists.example.org}
site_url: https://osf.example.org/
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tasks, TaskConfig::default());
        assert_eq!(config.tasks.max_retries, None);
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_http_storage() {
        let yaml = r#"
mailgun: {api_key: key-123, domain: lists.example.org}
site_url: https://osf.example.org/
storage:
    type: http
    api_url: https://api.dropboxapi.com/2
    content_url: https://content.dropboxapi.com/2
    access_token: secret-token
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.storage,
            Some(StorageConfig::Http { timeout_secs: 30, .. })
        ));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-token"));
        assert!(!debug.contains("key-123"));
    }

    #[test]
    fn test_validation_errors() {
        let base_config = Config {
            mailgun: MailgunConfig {
                api_key: "key-123".into(),
                domain: "lists.example.org".into(),
                base_url: default_base_url(),
                timeout_secs: 30,
            },
            site_url: Url::parse("https://osf.example.org/").unwrap(),
            tasks: TaskConfig::default(),
            storage: None,
        };
        assert!(base_config.validate().is_ok());

        let mut config = base_config.clone();
        config.mailgun.api_key = "".into();
        assert_eq!(config.validate(), Err(ValidationError::EmptyApiKey));

        let mut config = base_config.clone();
        config.mailgun.domain = "".into();
        assert_eq!(config.validate(), Err(ValidationError::EmptyDomain));

        let mut config = base_config.clone();
        config.tasks.queue_size = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidQueueSize));

        let mut config = base_config.clone();
        config.site_url = Url::parse("ftp://osf.example.org/").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnsupportedScheme(_))
        ));

        let mut config = base_config;
        config.storage = Some(StorageConfig::Http {
            api_url: Url::parse("https://api.dropboxapi.com/2").unwrap(),
            content_url: Url::parse("https://content.dropboxapi.com/2").unwrap(),
            access_token: "".into(),
            timeout_secs: 30,
        });
        assert_eq!(config.validate(), Err(ValidationError::EmptyAccessToken));
    }

    #[test]
    fn test_deserialization_errors() {
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
mailgun: {api_key: key-123, domain: lists.example.org}
site_url: "not-a-url"
"#
            )
            .is_err()
        );

        assert!(
            serde_yaml::from_str::<Config>(
                r#"
mailgun: {api_key: key-123, domain: lists.example.org}
site_url: https://osf.example.org/
storage: {type: gcs, bucket: attachments}
"#
            )
            .is_err()
        );
    }
}
