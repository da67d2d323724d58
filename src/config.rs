//! Environment configuration
//!
//! All settings are loaded from environment variables for 12-factor
//! compliance. Every loader goes through a lookup closure so tests can
//! feed a map instead of the process environment. Empty values count as
//! unset.

use crate::diff::DedupScope;
use crate::store::{LocalFsObjectStore, ObjectStore, RetryPolicy, RetryingObjectStore};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_METRICS_PORT: u16 = 8000;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_WEB3_STORAGE_ENDPOINT: &str = "https://api.web3.storage";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing {0} environment variable")]
    Missing(String),
    #[error("invalid {name}={value:?}: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

/// Typed access over a `name -> value` lookup
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn require(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Invalid {
                    name: name.to_string(),
                    reason: e.to_string(),
                    value,
                }),
        }
    }

    fn require_parsed<T>(&self, name: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.parse(name)?
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if v == "true" || v == "1" => Ok(true),
            Some(v) if v == "false" || v == "0" => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                name: name.to_string(),
                value,
                reason: "expected true or false".to_string(),
            }),
        }
    }
}

/// Backend a bucket is read through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    S3,
    LocalFs,
}

impl std::str::FromStr for StoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(StoreType::S3),
            "localfs" | "local" => Ok(StoreType::LocalFs),
            other => Err(format!("unknown store type {:?} (expected s3 or localfs)", other)),
        }
    }
}

/// Connection settings for one bucket
///
/// | Variable | Required | Description |
/// |----------|----------|-------------|
/// | `{ROLE}_BUCKET_NAME` | yes | Bucket name |
/// | `{ROLE}_BUCKET_REGION` | s3 | Region |
/// | `{ROLE}_BUCKET_ENDPOINT` | no | Custom endpoint (R2, MinIO) |
/// | `{ROLE}_BUCKET_ACCESS_KEY_ID` | s3 | Access key |
/// | `{ROLE}_BUCKET_SECRET_ACCESS_KEY` | s3 | Secret key |
/// | `{ROLE}_STORE_TYPE` | no | `s3` (default) or `localfs` |
/// | `{ROLE}_BUCKET_PATH` | localfs | Directory backing the bucket |
#[derive(Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub name: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub store_type: StoreType,
    pub local_path: Option<PathBuf>,
}

impl std::fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketConfig")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("store_type", &self.store_type)
            .field("local_path", &self.local_path)
            .finish_non_exhaustive()
    }
}

impl BucketConfig {
    /// Bucket backed by a local directory
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        BucketConfig {
            name: name.into(),
            region: String::new(),
            endpoint: None,
            access_key_id: String::new(),
            secret_access_key: String::new(),
            store_type: StoreType::LocalFs,
            local_path: Some(path.into()),
        }
    }

    /// Load the bucket for `role` (`ORIGIN` or `DESTINATION`)
    pub fn from_lookup<F>(role: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::load(role, &Env { lookup })
    }

    fn load<F>(role: &str, env: &Env<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| format!("{}_{}", role, suffix);
        let store_type = env
            .parse::<StoreType>(&var("STORE_TYPE"))?
            .unwrap_or(StoreType::S3);

        match store_type {
            StoreType::S3 => Ok(BucketConfig {
                region: env.require(&var("BUCKET_REGION"))?,
                name: env.require(&var("BUCKET_NAME"))?,
                endpoint: env.get(&var("BUCKET_ENDPOINT")),
                access_key_id: env.require(&var("BUCKET_ACCESS_KEY_ID"))?,
                secret_access_key: env.require(&var("BUCKET_SECRET_ACCESS_KEY"))?,
                store_type,
                local_path: None,
            }),
            StoreType::LocalFs => {
                let path = PathBuf::from(env.require(&var("BUCKET_PATH"))?);
                let name = match env.get(&var("BUCKET_NAME")) {
                    Some(name) => name,
                    None => path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| ConfigError::Missing(var("BUCKET_NAME")))?,
                };
                Ok(BucketConfig::local(name, path))
            }
        }
    }

    /// Open the bucket, wrapped in `policy`
    pub fn open(&self, policy: RetryPolicy) -> IoResult<Arc<dyn ObjectStore>> {
        match self.store_type {
            StoreType::LocalFs => {
                let path = self.local_path.clone().ok_or_else(|| {
                    IoError::new(ErrorKind::InvalidInput, "localfs bucket without a path")
                })?;
                Ok(Arc::new(RetryingObjectStore::new(
                    LocalFsObjectStore::new(path),
                    policy,
                )))
            }
            #[cfg(feature = "s3")]
            StoreType::S3 => Ok(Arc::new(RetryingObjectStore::new(
                crate::store::S3ObjectStore::new(self)?,
                policy,
            ))),
            #[cfg(not(feature = "s3"))]
            StoreType::S3 => Err(IoError::new(
                ErrorKind::Unsupported,
                "built without the s3 feature",
            )),
        }
    }
}

/// Retry settings for store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: crate::store::retry::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

impl RetryConfig {
    fn load<F>(env: &Env<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RetryConfig::default();
        Ok(RetryConfig {
            max_attempts: env
                .parse("RETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            base_delay: env
                .parse("RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay)
    }
}

/// Where the merged manifest goes
#[derive(Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Upload to web3.storage
    Web3 { token: String, endpoint: String },
    /// Content-addressed copy in a local directory
    Local { dir: PathBuf },
    /// Stop after merging
    None,
}

impl std::fmt::Debug for PublishTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishTarget::Web3 { endpoint, .. } => {
                f.debug_struct("Web3").field("endpoint", endpoint).finish_non_exhaustive()
            }
            PublishTarget::Local { dir } => f.debug_struct("Local").field("dir", dir).finish(),
            PublishTarget::None => write!(f, "None"),
        }
    }
}

impl PublishTarget {
    fn load<F>(env: &Env<F>, output_dir: &std::path::Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target = env
            .get("PUBLISH_TARGET")
            .unwrap_or_else(|| "web3".to_string())
            .to_ascii_lowercase();
        match target.as_str() {
            "web3" => Ok(PublishTarget::Web3 {
                token: env.require("WEB3_STORAGE_TOKEN")?,
                endpoint: env
                    .get("WEB3_STORAGE_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_WEB3_STORAGE_ENDPOINT.to_string()),
            }),
            "local" => Ok(PublishTarget::Local {
                dir: env
                    .get("PUBLISH_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| output_dir.join("published")),
            }),
            "none" => Ok(PublishTarget::None),
            _ => Err(ConfigError::Invalid {
                name: "PUBLISH_TARGET".to_string(),
                value: target,
                reason: "expected web3, local or none".to_string(),
            }),
        }
    }
}

/// `create-list` settings
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `ORIGIN_BUCKET_*` | required | Source bucket, see `BucketConfig` |
/// | `PREFIX` | none | Listing prefix |
/// | `READ_BATCH_SIZE` | required | Keys per listing page |
/// | `WRITE_BATCH_SIZE` | required | Entries per shard |
/// | `CONTINUATION_TOKEN` | none | Resume listing after this key |
/// | `OUTPUT_DIR` | `.` | Where shards and the manifest are written |
/// | `DEDUP_SCOPE` | `run` | `run` or `page` |
/// | `DRAIN_FINAL_BATCH` | `true` | Write the short final batch |
/// | `RESUME` | `false` | Continue shard numbering in a used output directory |
/// | `PUBLISH_ONLY` | `false` | Skip listing; merge existing shards and publish |
/// | `METRICS_PORT` | `8000` | `/metrics` port, `0` disables |
/// | `RETRY_MAX_ATTEMPTS` | `3` | Attempts per store operation |
/// | `RETRY_BASE_DELAY_MS` | `100` | First backoff delay |
/// | `PUBLISH_TARGET` | `web3` | `web3`, `local` or `none` |
/// | `WEB3_STORAGE_TOKEN` | web3 | API token |
/// | `WEB3_STORAGE_ENDPOINT` | `https://api.web3.storage` | API base URL |
/// | `PUBLISH_DIR` | `$OUTPUT_DIR/published` | Target directory for `local` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateListConfig {
    pub origin: BucketConfig,
    pub prefix: Option<String>,
    pub read_batch_size: usize,
    pub write_batch_size: usize,
    pub continuation_token: Option<String>,
    pub output_dir: PathBuf,
    pub dedup_scope: DedupScope,
    pub drain_final_batch: bool,
    /// Rerun after a failure: shards already on disk are kept and
    /// numbering continues after them
    pub resume: bool,
    /// Retry a failed publish: merge the shards on disk without listing
    pub publish_only: bool,
    pub metrics_port: u16,
    pub retry: RetryConfig,
    pub publish: PublishTarget,
}

impl CreateListConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let output_dir = env
            .get("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let read_batch_size: usize = env.require_parsed("READ_BATCH_SIZE")?;
        let write_batch_size: usize = env.require_parsed("WRITE_BATCH_SIZE")?;
        for (name, value) in [
            ("READ_BATCH_SIZE", read_batch_size),
            ("WRITE_BATCH_SIZE", write_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name: name.to_string(),
                    value: value.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        Ok(CreateListConfig {
            origin: BucketConfig::load("ORIGIN", &env)?,
            prefix: env.get("PREFIX"),
            read_batch_size,
            write_batch_size,
            continuation_token: env.get("CONTINUATION_TOKEN"),
            dedup_scope: env.parse("DEDUP_SCOPE")?.unwrap_or_default(),
            drain_final_batch: env.flag("DRAIN_FINAL_BATCH", true)?,
            resume: env.flag("RESUME", false)?,
            publish_only: env.flag("PUBLISH_ONLY", false)?,
            metrics_port: env.parse("METRICS_PORT")?.unwrap_or(DEFAULT_METRICS_PORT),
            retry: RetryConfig::load(&env)?,
            publish: PublishTarget::load(&env, &output_dir)?,
            output_dir,
        })
    }

    /// `{bucket}` or `{bucket}-{prefix}` with `/` replaced, used for the
    /// shard directory and manifest names
    pub fn list_name(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}-{}", self.origin.name, prefix.replace('/', "_"))
            }
            _ => self.origin.name.clone(),
        }
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.output_dir.join(self.list_name())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.ndjson", self.list_name()))
    }
}

/// `update-list` settings
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `DESTINATION_BUCKET_*` | required | Carpark bucket, see `BucketConfig` |
/// | `MANIFEST_PATH` | required | Manifest produced by `create-list` |
/// | `OUTPUT_DIR` | manifest's directory | Where the missing list is written |
/// | `RETRY_MAX_ATTEMPTS` | `3` | Attempts per store operation |
/// | `RETRY_BASE_DELAY_MS` | `100` | First backoff delay |
/// | `METRICS_PORT` | `8000` | `/metrics` port, `0` disables |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateListConfig {
    pub destination: BucketConfig,
    pub manifest_path: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub retry: RetryConfig,
}

impl UpdateListConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        Ok(UpdateListConfig {
            destination: BucketConfig::load("DESTINATION", &env)?,
            manifest_path: PathBuf::from(env.require("MANIFEST_PATH")?),
            output_dir: env.get("OUTPUT_DIR").map(PathBuf::from),
            metrics_port: env.parse("METRICS_PORT")?.unwrap_or(DEFAULT_METRICS_PORT),
            retry: RetryConfig::load(&env)?,
        })
    }

    /// `{manifest stem}-missing.ndjson`
    pub fn missing_path(&self) -> PathBuf {
        let stem = self
            .manifest_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest".to_string());
        let dir = match &self.output_dir {
            Some(dir) => dir.clone(),
            None => self
                .manifest_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default(),
        };
        dir.join(format!("{}-missing.ndjson", stem))
    }
}
