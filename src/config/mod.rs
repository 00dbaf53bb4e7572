//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::domain::identity::Secret;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ateneo";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_RELATION_CAP: u32 = 20;
const DEFAULT_PORTAL_BASE_URL: &str = "https://portal.example.edu";
const DEFAULT_LOGIN_PATH: &str = "/cas/login";
const DEFAULT_FAILURE_PHRASE: &str = "Incorrect username or password";
const DEFAULT_AFFINITY_COOKIE: &str = "JSESSIONID";
const DEFAULT_HANDSHAKE_FIELDS: [&str; 3] = ["lt", "execution", "_eventId"];
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 45;
const DEFAULT_STUDENT_ROOT: &str = "/student";
const DEFAULT_STAFF_ROOT: &str = "/staff";
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_UNIT_MS: u64 = 500;
const DEFAULT_CACHE_CAPACITY: u32 = 1024;
const DEFAULT_SNAPSHOT_TTL_DAYS: u64 = 3;
const DEFAULT_NEGATIVE_TTL_MINUTES: u64 = 10;
const DEFAULT_SESSION_CAPACITY: u32 = 64;
const DEFAULT_SESSION_TTL_SECS: u64 = 1500;
const DEFAULT_SESSION_SWEEP_SECS: u64 = 300;
const DEFAULT_DELAY_MS: u64 = 1000;
const DEFAULT_DROP_MULTIPLE: u32 = 20;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 5000;

/// Command-line arguments for the Ateneo binary.
#[derive(Debug, Parser)]
#[command(name = "ateneo", version, about = "Academic portal sync worker")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ATENEO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the resident worker: delay-queue forwarder, deferred cache deletes
    /// and session pool upkeep.
    Worker(Box<WorkerArgs>),
    /// Refresh one subject and scope from the portal, then exit.
    Sync(SyncArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub overrides: WorkerOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the portal base URL.
    #[arg(long = "portal-base-url", value_name = "URL")]
    pub portal_base_url: Option<String>,

    /// Override the portal login account.
    #[arg(long = "portal-account", value_name = "ACCOUNT")]
    pub portal_account: Option<String>,

    /// Override the retry attempt budget for portal calls.
    #[arg(long = "retry-attempts", value_name = "COUNT")]
    pub retry_attempts: Option<u32>,

    /// Toggle the read-through snapshot cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub overrides: WorkerOverrides,

    /// Subject identifier whose records should be refreshed.
    #[arg(long, value_name = "ID")]
    pub subject: String,

    /// Record family to refresh (courses|seats|reservations|credits|history).
    #[arg(long, value_name = "SCOPE")]
    pub scope: String,

    /// Academic year, required for term-scoped families.
    #[arg(long, value_name = "YEAR")]
    pub year: Option<u16>,

    /// Term ordinal 1-3, required for term-scoped families.
    #[arg(long, value_name = "TERM")]
    pub term: Option<u8>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub store: StoreSettings,
    pub portal: PortalSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub sessions: SessionPoolSettings,
    pub broker: BrokerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Per-subject, per-scope relation ceiling checked after every upsert.
    pub relation_cap: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub base_url: Url,
    pub login_path: String,
    /// Marker text the login page shows on rejected credentials.
    pub failure_phrase: String,
    /// Cookie the portal pins request routing on; echoed in the POST URL.
    pub affinity_cookie: String,
    /// Hidden form fields the login POST must echo back.
    pub handshake_fields: Vec<String>,
    pub user_agent: String,
    pub request_timeout: Duration,
    /// Deadline for one whole acquire-fetch-extract-persist pass.
    pub pipeline_timeout: Duration,
    pub student_root: String,
    pub staff_root: String,
    pub account: Option<String>,
    pub secret: Option<Secret>,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub attempts: NonZeroU32,
    pub backoff_unit: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: NonZeroU32,
    /// Lifetime of real snapshots.
    pub snapshot_ttl: Duration,
    /// Lifetime of confirmed-empty sentinels.
    pub negative_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionPoolSettings {
    pub capacity: NonZeroU32,
    pub entry_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// How long a deferred message waits before it is forwarded.
    pub delay: Duration,
    /// Messages older than `delay * drop_multiple` are dropped unforwarded.
    pub drop_multiple: NonZeroU32,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("ATENEO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Worker(args)) => raw.apply_worker_overrides(&args.overrides),
        Some(Command::Sync(args)) => raw.apply_worker_overrides(&args.overrides),
        None => raw.apply_worker_overrides(&WorkerOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    store: RawStoreSettings,
    portal: RawPortalSettings,
    retry: RawRetrySettings,
    cache: RawCacheSettings,
    sessions: RawSessionSettings,
    broker: RawBrokerSettings,
}

impl RawSettings {
    fn apply_worker_overrides(&mut self, overrides: &WorkerOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.portal_base_url.as_ref() {
            self.portal.base_url = Some(url.clone());
        }
        if let Some(account) = overrides.portal_account.as_ref() {
            self.portal.account = Some(account.clone());
        }
        if let Some(attempts) = overrides.retry_attempts {
            self.retry.attempts = Some(attempts);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            store,
            portal,
            retry,
            cache,
            sessions,
            broker,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let store = build_store_settings(store)?;
        let portal = build_portal_settings(portal)?;
        let retry = build_retry_settings(retry)?;
        let cache = build_cache_settings(cache)?;
        let sessions = build_session_settings(sessions)?;
        let broker = build_broker_settings(broker)?;

        Ok(Self {
            logging,
            database,
            store,
            portal,
            retry,
            cache,
            sessions,
            broker,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = non_zero_u32(max_value.into(), "database.max_connections")?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let cap = store.relation_cap.unwrap_or(DEFAULT_RELATION_CAP);
    Ok(StoreSettings {
        relation_cap: non_zero_u32(cap.into(), "store.relation_cap")?,
    })
}

fn build_portal_settings(portal: RawPortalSettings) -> Result<PortalSettings, LoadError> {
    let base = portal
        .base_url
        .unwrap_or_else(|| DEFAULT_PORTAL_BASE_URL.to_string());
    let base_url = Url::parse(base.trim())
        .map_err(|err| LoadError::invalid("portal.base_url", format!("failed to parse: {err}")))?;
    if base_url.host_str().is_none() {
        return Err(LoadError::invalid("portal.base_url", "URL must have a host"));
    }

    let login_path = rooted_path(
        portal
            .login_path
            .unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string()),
        "portal.login_path",
    )?;
    let student_root = rooted_path(
        portal
            .student_root
            .unwrap_or_else(|| DEFAULT_STUDENT_ROOT.to_string()),
        "portal.student_root",
    )?;
    let staff_root = rooted_path(
        portal
            .staff_root
            .unwrap_or_else(|| DEFAULT_STAFF_ROOT.to_string()),
        "portal.staff_root",
    )?;

    let failure_phrase = portal
        .failure_phrase
        .unwrap_or_else(|| DEFAULT_FAILURE_PHRASE.to_string());
    if failure_phrase.trim().is_empty() {
        return Err(LoadError::invalid(
            "portal.failure_phrase",
            "must not be empty",
        ));
    }

    let affinity_cookie = portal
        .affinity_cookie
        .unwrap_or_else(|| DEFAULT_AFFINITY_COOKIE.to_string());
    if affinity_cookie.trim().is_empty() {
        return Err(LoadError::invalid(
            "portal.affinity_cookie",
            "must not be empty",
        ));
    }

    let handshake_fields = portal.handshake_fields.unwrap_or_else(|| {
        DEFAULT_HANDSHAKE_FIELDS
            .iter()
            .map(|field| field.to_string())
            .collect()
    });
    if handshake_fields.is_empty() || handshake_fields.iter().any(|f| f.trim().is_empty()) {
        return Err(LoadError::invalid(
            "portal.handshake_fields",
            "must list at least one non-empty field name",
        ));
    }

    let user_agent = portal
        .user_agent
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    let request_secs = portal
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if request_secs == 0 {
        return Err(LoadError::invalid(
            "portal.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let pipeline_secs = portal
        .pipeline_timeout_seconds
        .unwrap_or(DEFAULT_PIPELINE_TIMEOUT_SECS);
    if pipeline_secs == 0 {
        return Err(LoadError::invalid(
            "portal.pipeline_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let account = portal.account.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    let secret = portal.secret.map(Secret::new);

    Ok(PortalSettings {
        base_url,
        login_path,
        failure_phrase,
        affinity_cookie,
        handshake_fields,
        user_agent,
        request_timeout: Duration::from_secs(request_secs),
        pipeline_timeout: Duration::from_secs(pipeline_secs),
        student_root,
        staff_root,
        account,
        secret,
    })
}

fn build_retry_settings(retry: RawRetrySettings) -> Result<RetrySettings, LoadError> {
    let attempts = retry.attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS);
    let unit_ms = retry
        .backoff_unit_ms
        .unwrap_or(DEFAULT_RETRY_BACKOFF_UNIT_MS);
    if unit_ms == 0 {
        return Err(LoadError::invalid(
            "retry.backoff_unit_ms",
            "must be greater than zero",
        ));
    }

    Ok(RetrySettings {
        attempts: non_zero_u32(attempts.into(), "retry.attempts")?,
        backoff_unit: Duration::from_millis(unit_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY);
    let snapshot_days = cache
        .snapshot_ttl_days
        .unwrap_or(DEFAULT_SNAPSHOT_TTL_DAYS);
    if snapshot_days == 0 {
        return Err(LoadError::invalid(
            "cache.snapshot_ttl_days",
            "must be greater than zero",
        ));
    }
    let negative_minutes = cache
        .negative_ttl_minutes
        .unwrap_or(DEFAULT_NEGATIVE_TTL_MINUTES);
    if negative_minutes == 0 {
        return Err(LoadError::invalid(
            "cache.negative_ttl_minutes",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        capacity: non_zero_u32(capacity.into(), "cache.capacity")?,
        snapshot_ttl: Duration::from_secs(snapshot_days * 24 * 60 * 60),
        negative_ttl: Duration::from_secs(negative_minutes * 60),
    })
}

fn build_session_settings(sessions: RawSessionSettings) -> Result<SessionPoolSettings, LoadError> {
    let capacity = sessions.capacity.unwrap_or(DEFAULT_SESSION_CAPACITY);
    let entry_secs = sessions
        .entry_ttl_seconds
        .unwrap_or(DEFAULT_SESSION_TTL_SECS);
    if entry_secs == 0 {
        return Err(LoadError::invalid(
            "sessions.entry_ttl_seconds",
            "must be greater than zero",
        ));
    }
    let sweep_secs = sessions
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_SESSION_SWEEP_SECS);
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "sessions.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(SessionPoolSettings {
        capacity: non_zero_u32(capacity.into(), "sessions.capacity")?,
        entry_ttl: Duration::from_secs(entry_secs),
        sweep_interval: Duration::from_secs(sweep_secs),
    })
}

fn build_broker_settings(broker: RawBrokerSettings) -> Result<BrokerSettings, LoadError> {
    let delay_ms = broker.delay_ms.unwrap_or(DEFAULT_DELAY_MS);
    if delay_ms == 0 {
        return Err(LoadError::invalid(
            "broker.delay_ms",
            "must be greater than zero",
        ));
    }
    let drop_multiple = broker.drop_multiple.unwrap_or(DEFAULT_DROP_MULTIPLE);
    let poll_ms = broker.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_ms == 0 {
        return Err(LoadError::invalid(
            "broker.poll_interval_ms",
            "must be greater than zero",
        ));
    }
    let visibility_ms = broker
        .visibility_timeout_ms
        .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_MS);
    if visibility_ms == 0 {
        return Err(LoadError::invalid(
            "broker.visibility_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(BrokerSettings {
        delay: Duration::from_millis(delay_ms),
        drop_multiple: non_zero_u32(drop_multiple.into(), "broker.drop_multiple")?,
        poll_interval: Duration::from_millis(poll_ms),
        visibility_timeout: Duration::from_millis(visibility_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    relation_cap: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPortalSettings {
    base_url: Option<String>,
    login_path: Option<String>,
    failure_phrase: Option<String>,
    affinity_cookie: Option<String>,
    handshake_fields: Option<Vec<String>>,
    user_agent: Option<String>,
    request_timeout_seconds: Option<u64>,
    pipeline_timeout_seconds: Option<u64>,
    student_root: Option<String>,
    staff_root: Option<String>,
    account: Option<String>,
    secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrySettings {
    attempts: Option<u32>,
    backoff_unit_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    capacity: Option<u32>,
    snapshot_ttl_days: Option<u64>,
    negative_ttl_minutes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    capacity: Option<u32>,
    entry_ttl_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrokerSettings {
    delay_ms: Option<u64>,
    drop_multiple: Option<u32>,
    poll_interval_ms: Option<u64>,
    visibility_timeout_ms: Option<u64>,
}

fn rooted_path(path: String, key: &'static str) -> Result<String, LoadError> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') {
        return Err(LoadError::invalid(key, "path must start with `/`"));
    }
    Ok(trimmed.to_string())
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
