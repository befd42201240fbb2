use std::path::PathBuf;
use std::time::Duration;

use robotq_core::runner::robot::RobotRunnerConfig;
use robotq_storage::S3Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key}='{value}' is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Where run artifacts are stored.
#[derive(Debug, Clone)]
pub enum ArtifactBackend {
    S3(S3Config),
    Local(PathBuf),
}

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Per-run timeout bounds.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    /// Used when the execution config has no `timeout_secs`.
    pub default_timeout: Duration,
    /// Upper bound for any override.
    pub max_timeout: Duration,
}

/// Stale-claim recovery settings.
#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub finished_retention: Duration,
}

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub workers: usize,
    pub poll_interval: Duration,
    pub limits: RunLimits,
    /// Claims allowed per queue item before the reaper fails it.
    pub max_attempts: i32,
    pub reaper: ReaperConfig,
    pub shutdown_timeout: Duration,
    pub robot: RobotRunnerConfig,
    pub artifacts: ArtifactBackend,
    pub artifact_url_ttl: Duration,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                          |
    /// |-----------------------------|----------------------------------|
    /// | `DATABASE_URL`              | required                         |
    /// | `DATABASE_MAX_CONNECTIONS`  | `10`                             |
    /// | `WORKER_COUNT`              | `1`                              |
    /// | `WORKER_POLL_INTERVAL_MS`   | `1000`                           |
    /// | `RUN_TIMEOUT_SECS`          | `600`                            |
    /// | `RUN_MAX_TIMEOUT_SECS`      | `3600`                           |
    /// | `MAX_ATTEMPTS`              | `1`                              |
    /// | `REAPER_STALE_AFTER_SECS`   | `RUN_MAX_TIMEOUT_SECS + 300`     |
    /// | `REAPER_INTERVAL_SECS`      | `60`                             |
    /// | `QUEUE_RETENTION_HOURS`     | `24`                             |
    /// | `SHUTDOWN_TIMEOUT_SECS`     | `30`                             |
    /// | `ROBOT_PROGRAM`             | `robot`                          |
    /// | `ROBOT_ARGS`                | empty (whitespace separated)     |
    /// | `RUN_SCRATCH_DIR`           | system temp dir                  |
    /// | `ARTIFACT_BACKEND`          | `s3` (`s3` or `local`)           |
    /// | `ARTIFACT_LOCAL_DIR`        | `./artifacts`                    |
    /// | `MINIO_ENDPOINT`            | `localhost:9000`                 |
    /// | `MINIO_SECURE`              | `false`                          |
    /// | `MINIO_ACCESS_KEY`          | `minioadmin`                     |
    /// | `MINIO_SECRET_KEY`          | `minioadmin`                     |
    /// | `MINIO_BUCKET_NAME`         | `test-logs`                      |
    /// | `MINIO_REGION`              | `us-east-1`                      |
    /// | `ARTIFACT_URL_TTL_SECS`     | `3600`                           |
    /// | `LOG_FORMAT`                | `text` (`text` or `json`)        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let database_max_connections = env.parse("DATABASE_MAX_CONNECTIONS", 10u32)?;
        let workers = env.parse("WORKER_COUNT", 1usize)?;
        let poll_interval = Duration::from_millis(env.parse("WORKER_POLL_INTERVAL_MS", 1000u64)?);

        let default_timeout = Duration::from_secs(env.parse("RUN_TIMEOUT_SECS", 600u64)?);
        let max_timeout_secs = env.parse("RUN_MAX_TIMEOUT_SECS", 3600u64)?;
        let max_timeout = Duration::from_secs(max_timeout_secs);
        let max_attempts = env.parse("MAX_ATTEMPTS", 1i32)?;

        let reaper = ReaperConfig {
            stale_after: Duration::from_secs(
                env.parse("REAPER_STALE_AFTER_SECS", max_timeout_secs.saturating_add(300))?,
            ),
            sweep_interval: Duration::from_secs(env.parse("REAPER_INTERVAL_SECS", 60u64)?),
            finished_retention: Duration::from_secs(
                env.parse("QUEUE_RETENTION_HOURS", 24u64)?.saturating_mul(3600),
            ),
        };

        let shutdown_timeout = Duration::from_secs(env.parse("SHUTDOWN_TIMEOUT_SECS", 30u64)?);

        let robot = RobotRunnerConfig {
            program: env.get("ROBOT_PROGRAM").unwrap_or_else(|| "robot".into()),
            base_args: env
                .get("ROBOT_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            scratch_root: env
                .get("RUN_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        };

        let backend = env.get("ARTIFACT_BACKEND").unwrap_or_else(|| "s3".into());
        let artifacts = match backend.trim().to_ascii_lowercase().as_str() {
            "s3" | "minio" => ArtifactBackend::S3(s3_config(&env)?),
            "local" => ArtifactBackend::Local(
                env.get("ARTIFACT_LOCAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./artifacts")),
            ),
            _ => {
                return Err(ConfigError::Invalid {
                    key: "ARTIFACT_BACKEND",
                    value: backend,
                    reason: "expected 's3' or 'local'".into(),
                })
            }
        };
        let artifact_url_ttl = Duration::from_secs(env.parse("ARTIFACT_URL_TTL_SECS", 3600u64)?);

        let log_format = match env.get("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected 'text' or 'json'".into(),
                })
            }
        };

        let config = Self {
            database_url,
            database_max_connections,
            workers,
            poll_interval,
            limits: RunLimits {
                default_timeout,
                max_timeout,
            },
            max_attempts,
            reaper,
            shutdown_timeout,
            robot,
            artifacts,
            artifact_url_ttl,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the worker misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("DATABASE_MAX_CONNECTIONS", self.database_max_connections == 0),
            ("WORKER_COUNT", self.workers == 0),
            ("WORKER_POLL_INTERVAL_MS", self.poll_interval.is_zero()),
            ("RUN_TIMEOUT_SECS", self.limits.default_timeout.is_zero()),
            ("RUN_MAX_TIMEOUT_SECS", self.limits.max_timeout.is_zero()),
            ("MAX_ATTEMPTS", self.max_attempts < 1),
            ("REAPER_INTERVAL_SECS", self.reaper.sweep_interval.is_zero()),
            ("ARTIFACT_URL_TTL_SECS", self.artifact_url_ttl.is_zero()),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, bad)| *bad) {
            return Err(ConfigError::Inconsistent(format!("{key} must be greater than zero")));
        }
        if self.limits.default_timeout > self.limits.max_timeout {
            return Err(ConfigError::Inconsistent(
                "RUN_TIMEOUT_SECS must not exceed RUN_MAX_TIMEOUT_SECS".into(),
            ));
        }
        if self.reaper.stale_after <= self.limits.max_timeout {
            return Err(ConfigError::Inconsistent(
                "REAPER_STALE_AFTER_SECS must exceed RUN_MAX_TIMEOUT_SECS".into(),
            ));
        }
        Ok(())
    }
}

fn s3_config<F>(env: &Env<F>) -> Result<S3Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secure = env.parse("MINIO_SECURE", false)?;
    let endpoint = env
        .get("MINIO_ENDPOINT")
        .unwrap_or_else(|| "localhost:9000".into());
    let endpoint = if endpoint.contains("://") {
        endpoint
    } else {
        let scheme = if secure { "https" } else { "http" };
        format!("{scheme}://{endpoint}")
    };

    Ok(S3Config {
        endpoint: Some(endpoint),
        access_key: env.get("MINIO_ACCESS_KEY").unwrap_or_else(|| "minioadmin".into()),
        secret_key: env.get("MINIO_SECRET_KEY").unwrap_or_else(|| "minioadmin".into()),
        bucket: env.get("MINIO_BUCKET_NAME").unwrap_or_else(|| "test-logs".into()),
        region: env.get("MINIO_REGION").unwrap_or_else(|| "us-east-1".into()),
    })
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value for `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            }),
        }
    }
}
