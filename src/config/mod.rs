//! Service configuration.
//!
//! Settings load from a TOML file, then environment variables override
//! individual fields. Environment names concatenate the nested field path,
//! e.g. `JOBS_MAXCONCURRENTJOBS` or `API_SECURITY_ADMINSECRETKEY`.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;
use crate::jobs::IMAGE_REGISTRY_DEFAULT;
use crate::logger::parse_level;

/// Maximum accepted request body for JSON endpoints (1MiB).
pub const API_REQUEST_BODY_MAX_SIZE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub jobs: JobsConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub http: HttpConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_address: String,
    pub tls: TlsConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: ":4545".to_string(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enable: bool,
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Whether or not to enable admin API access.
    pub enable_admin: bool,
    /// The secret key used to authenticate admin requests.
    pub admin_secret_key: String,
    /// Whether or not to allow clients to self-register.
    pub allow_self_registration: bool,
    pub session_cache: SessionCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionCacheConfig {
    pub expiration_minutes: u64,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            expiration_minutes: 1440,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_source: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_source: "/tmp/calls-offloader-db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobApiType {
    Docker,
    Kubernetes,
}

impl Default for JobApiType {
    fn default() -> Self {
        Self::Docker
    }
}

impl fmt::Display for JobApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

impl std::str::FromStr for JobApiType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "kubernetes" => Ok(Self::Kubernetes),
            other => Err(format!("invalid APIType value: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub api_type: JobApiType,
    pub max_concurrent_jobs: i64,
    pub failed_jobs_retention_time: RetentionTime,
    pub image_registry: String,
    pub kubernetes: KubernetesConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            api_type: JobApiType::Docker,
            max_concurrent_jobs: 2,
            failed_jobs_retention_time: RetentionTime::default(),
            image_registry: IMAGE_REGISTRY_DEFAULT.to_string(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Per job type resource requests/limits, as a JSON (or YAML) document.
    /// Parsed by the cluster executor at startup.
    pub jobs_resource_requirements: String,
    /// When set, the job volume is backed by this PVC instead of an emptyDir.
    pub persistent_volume_claim_name: String,
    /// Comma-separated `key=value` sysctls applied by privileged init
    /// containers before the job container starts.
    pub node_sysctls: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub enable_console: bool,
    pub console_json: bool,
    pub console_level: String,
    pub enable_file: bool,
    pub file_json: bool,
    pub file_location: String,
    pub file_level: String,
    pub enable_color: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enable_console: true,
            console_json: false,
            console_level: "INFO".to_string(),
            enable_file: true,
            file_json: true,
            file_location: "calls-offloader.log".to_string(),
            file_level: "DEBUG".to_string(),
            enable_color: false,
        }
    }
}

/// A duration with an extended `<N>d` (days) suffix on top of minutes and
/// hours. Anything below one minute (other than zero) is rejected at config
/// validation; zero disables retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionTime(pub Duration);

impl RetentionTime {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn parse(val: &str) -> Result<Self, ConfigError> {
        // The format intentionally accepts a single unit only; composite
        // values like "10h10m" are not valid.
        let re = Regex::new(r"^(\d+)([mhd])$").expect("retention time regex");
        let caps = re
            .captures(val)
            .ok_or_else(|| ConfigError::invalid("invalid retention time format"))?;

        let num: u64 = caps[1]
            .parse()
            .map_err(|_| ConfigError::invalid("invalid retention time format"))?;

        let secs = match &caps[2] {
            "m" => num * 60,
            "h" => num * 3600,
            "d" => num * 86400,
            _ => unreachable!(),
        };

        Ok(Self(Duration::from_secs(secs)))
    }
}

impl fmt::Display for RetentionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs > 0 && secs % 86400 == 0 {
            write!(f, "{}d", secs / 86400)
        } else if secs > 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else {
            write!(f, "{}m", secs / 60)
        }
    }
}

impl<'de> Deserialize<'de> for RetentionTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Self::default());
        }
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for RetentionTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl Config {
    /// Load the configuration from a TOML file, falling back to defaults when
    /// the file does not exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
            toml::from_str(&data)?
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Apply environment variable overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    fn apply_overrides(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = get("API_HTTP_LISTENADDRESS") {
            self.api.http.listen_address = v;
        }
        if let Some(v) = get("API_HTTP_TLS_ENABLE") {
            self.api.http.tls.enable = parse_var("API_HTTP_TLS_ENABLE", &v)?;
        }
        if let Some(v) = get("API_HTTP_TLS_CERTFILE") {
            self.api.http.tls.cert_file = v;
        }
        if let Some(v) = get("API_HTTP_TLS_KEYFILE") {
            self.api.http.tls.key_file = v;
        }
        if let Some(v) = get("API_SECURITY_ENABLEADMIN") {
            self.api.security.enable_admin = parse_var("API_SECURITY_ENABLEADMIN", &v)?;
        }
        if let Some(v) = get("API_SECURITY_ADMINSECRETKEY") {
            self.api.security.admin_secret_key = v;
        }
        if let Some(v) = get("API_SECURITY_ALLOWSELFREGISTRATION") {
            self.api.security.allow_self_registration =
                parse_var("API_SECURITY_ALLOWSELFREGISTRATION", &v)?;
        }
        if let Some(v) = get("API_SECURITY_SESSIONCACHE_EXPIRATIONMINUTES") {
            self.api.security.session_cache.expiration_minutes =
                parse_var("API_SECURITY_SESSIONCACHE_EXPIRATIONMINUTES", &v)?;
        }
        if let Some(v) = get("STORE_DATASOURCE") {
            self.store.data_source = v;
        }
        if let Some(v) = get("JOBS_APITYPE") {
            self.jobs.api_type = v
                .parse()
                .map_err(|e: String| ConfigError::env("JOBS_APITYPE", e))?;
        }
        if let Some(v) = get("JOBS_MAXCONCURRENTJOBS") {
            self.jobs.max_concurrent_jobs = parse_var("JOBS_MAXCONCURRENTJOBS", &v)?;
        }
        if let Some(v) = get("JOBS_FAILEDJOBSRETENTIONTIME") {
            self.jobs.failed_jobs_retention_time = RetentionTime::parse(&v)
                .map_err(|e| ConfigError::env("JOBS_FAILEDJOBSRETENTIONTIME", e))?;
        }
        if let Some(v) = get("JOBS_IMAGEREGISTRY") {
            self.jobs.image_registry = v;
        }
        if let Some(v) = get("JOBS_KUBERNETES_JOBSRESOURCEREQUIREMENTS") {
            self.jobs.kubernetes.jobs_resource_requirements = v;
        }
        if let Some(v) = get("JOBS_KUBERNETES_PERSISTENTVOLUMECLAIMNAME") {
            self.jobs.kubernetes.persistent_volume_claim_name = v;
        }
        if let Some(v) = get("JOBS_KUBERNETES_NODESYSCTLS") {
            self.jobs.kubernetes.node_sysctls = v;
        }
        if let Some(v) = get("LOGGER_ENABLECONSOLE") {
            self.logger.enable_console = parse_var("LOGGER_ENABLECONSOLE", &v)?;
        }
        if let Some(v) = get("LOGGER_CONSOLEJSON") {
            self.logger.console_json = parse_var("LOGGER_CONSOLEJSON", &v)?;
        }
        if let Some(v) = get("LOGGER_CONSOLELEVEL") {
            self.logger.console_level = v;
        }
        if let Some(v) = get("LOGGER_ENABLEFILE") {
            self.logger.enable_file = parse_var("LOGGER_ENABLEFILE", &v)?;
        }
        if let Some(v) = get("LOGGER_FILEJSON") {
            self.logger.file_json = parse_var("LOGGER_FILEJSON", &v)?;
        }
        if let Some(v) = get("LOGGER_FILELOCATION") {
            self.logger.file_location = v;
        }
        if let Some(v) = get("LOGGER_FILELEVEL") {
            self.logger.file_level = v;
        }
        if let Some(v) = get("LOGGER_ENABLECOLOR") {
            self.logger.enable_color = parse_var("LOGGER_ENABLECOLOR", &v)?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> Result<(), ConfigError> {
        self.api.is_valid()?;
        self.store.is_valid()?;
        self.jobs.is_valid()?;
        self.logger.is_valid()
    }
}

impl ApiConfig {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        self.security
            .is_valid()
            .map_err(|e| ConfigError::invalid(format!("failed to validate security config: {e}")))?;
        self.http
            .is_valid()
            .map_err(|e| ConfigError::invalid(format!("failed to validate http config: {e}")))
    }
}

impl HttpConfig {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if self.listen_address.is_empty() {
            return Err(ConfigError::invalid(
                "invalid ListenAddress value: should not be empty",
            ));
        }
        if self.tls.enable && (self.tls.cert_file.is_empty() || self.tls.key_file.is_empty()) {
            return Err(ConfigError::invalid(
                "invalid TLS config: both cert_file and key_file are required",
            ));
        }
        Ok(())
    }
}

impl SecurityConfig {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if !self.enable_admin {
            return Ok(());
        }
        if self.admin_secret_key.is_empty() {
            return Err(ConfigError::invalid(
                "invalid AdminSecretKey value: should not be empty",
            ));
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if self.data_source.is_empty() {
            return Err(ConfigError::invalid(
                "invalid DataSource value: should not be empty",
            ));
        }
        Ok(())
    }
}

impl JobsConfig {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs <= 0 {
            return Err(ConfigError::invalid(
                "invalid MaxConcurrentJobs value: should be greater than zero",
            ));
        }
        let retention = self.failed_jobs_retention_time.as_duration();
        if !retention.is_zero() && retention < Duration::from_secs(60) {
            return Err(ConfigError::invalid(
                "invalid FailedJobsRetentionTime value: should be at least one minute",
            ));
        }
        if self.image_registry.is_empty() {
            return Err(ConfigError::invalid(
                "invalid ImageRegistry value: should not be empty",
            ));
        }
        Ok(())
    }
}

impl LoggerConfig {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        if self.enable_console {
            parse_level(&self.console_level)
                .map_err(|e| ConfigError::invalid(format!("invalid ConsoleLevel value: {e}")))?;
        }
        if self.enable_file {
            parse_level(&self.file_level)
                .map_err(|e| ConfigError::invalid(format!("invalid FileLevel value: {e}")))?;
            if self.file_location.is_empty() {
                return Err(ConfigError::invalid(
                    "invalid FileLocation value: should not be empty",
                ));
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, val: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    val.parse().map_err(|e| ConfigError::env(name, e))
}
