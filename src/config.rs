use std::{collections::BTreeMap, fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize, de::Deserializer};

use crate::{
    ledger::CorruptLedgerPolicy,
    quota::DEFAULT_DAILY_LIMIT,
    time::{DayBoundary, parse_std_duration},
};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(long, env = "TEXT_ASSISTANT_CONFIG", default_value = "config.toml")]
    pub config: PathBuf,

    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub timezone: Option<String>,
    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long)]
    pub daily_limit: Option<u32>,
    #[arg(long)]
    pub ledger_path: Option<String>,
    #[arg(long)]
    pub on_corrupt_ledger: Option<String>,

    #[arg(long)]
    pub jwt_secret: Option<String>,
    #[arg(long)]
    pub token_ttl: Option<String>,
    #[arg(long)]
    pub users_path: Option<String>,
    #[arg(long)]
    pub admin_username: Option<String>,
    #[arg(long)]
    pub admin_password: Option<String>,

    #[arg(long)]
    pub generation_url: Option<String>,
    #[arg(long)]
    pub generation_api_key: Option<String>,
    #[arg(long)]
    pub generation_model: Option<String>,
    #[arg(long)]
    pub generation_max_tokens: Option<u32>,
    #[arg(long)]
    pub generation_timeout: Option<String>,

    #[arg(long)]
    pub interactions_enabled: Option<bool>,
    #[arg(long)]
    pub interactions_path: Option<String>,

    #[arg(long)]
    pub metrics_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub quota: QuotaConfig,
    pub auth: AuthConfig,
    pub generation: GenerationConfig,
    pub interactions: InteractionsConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    fn normalize(&mut self) {
        self.server.listen = self.server.listen.trim().to_string();
        self.server.timezone = self.server.timezone.trim().to_string();
        self.server.log_level = self.server.log_level.trim().to_string();

        self.quota.ledger_path = self.quota.ledger_path.trim().to_string();
        self.quota.on_corrupt = self.quota.on_corrupt.trim().to_ascii_lowercase();

        self.auth.jwt_secret = self.auth.jwt_secret.trim().to_string();
        self.auth.token_ttl = self.auth.token_ttl.trim().to_string();
        self.auth.users_path = self.auth.users_path.trim().to_string();
        normalize_optional_string(&mut self.auth.admin_username);
        normalize_optional_string(&mut self.auth.admin_password);

        self.generation.url = self.generation.url.trim().to_string();
        self.generation.model = self.generation.model.trim().to_string();
        self.generation.timeout = self.generation.timeout.trim().to_string();
        normalize_optional_string(&mut self.generation.api_key);

        self.interactions.path = self.interactions.path.trim().to_string();
        self.metrics.prefix = self.metrics.prefix.trim().to_string();
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty("server.listen", &self.server.listen)?;
        self.server.listen.parse::<SocketAddr>().with_context(|| {
            format!(
                "server.listen must be host:port, got {}",
                self.server.listen
            )
        })?;

        ensure_non_empty("server.timezone", &self.server.timezone)?;
        self.day_boundary()?;
        ensure_non_empty("server.log_level", &self.server.log_level)?;

        if self.quota.daily_limit == 0 {
            bail!("quota.daily_limit must be greater than zero");
        }
        ensure_non_empty("quota.ledger_path", &self.quota.ledger_path)?;
        self.quota.corruption_policy()?;

        ensure_non_empty("auth.jwt_secret", &self.auth.jwt_secret)?;
        parse_std_duration(&self.auth.token_ttl)
            .with_context(|| format!("invalid auth.token_ttl: {}", self.auth.token_ttl))?;
        ensure_non_empty("auth.users_path", &self.auth.users_path)?;
        match (&self.auth.admin_username, &self.auth.admin_password) {
            (Some(_), None) => bail!("auth.admin_password is required when auth.admin_username is set"),
            (None, Some(_)) => bail!("auth.admin_username is required when auth.admin_password is set"),
            _ => {}
        }

        ensure_non_empty("generation.url", &self.generation.url)?;
        reqwest::Url::parse(&self.generation.url)
            .with_context(|| format!("invalid generation.url: {}", self.generation.url))?;
        ensure_non_empty("generation.model", &self.generation.model)?;
        if self.generation.max_tokens == 0 {
            bail!("generation.max_tokens must be greater than zero");
        }
        parse_std_duration(&self.generation.timeout)
            .with_context(|| format!("invalid generation.timeout: {}", self.generation.timeout))?;

        if self.interactions.enabled {
            ensure_non_empty("interactions.path", &self.interactions.path)?;
        }
        ensure_non_empty("metrics.prefix", &self.metrics.prefix)?;

        Ok(())
    }

    pub fn day_boundary(&self) -> Result<DayBoundary> {
        DayBoundary::parse(&self.server.timezone)
            .with_context(|| format!("invalid server.timezone: {}", self.server.timezone))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub timezone: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            timezone: "local".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub daily_limit: u32,
    pub ledger_path: String,
    pub on_corrupt: String,
}

impl QuotaConfig {
    pub fn corruption_policy(&self) -> Result<CorruptLedgerPolicy> {
        self.on_corrupt
            .parse::<CorruptLedgerPolicy>()
            .with_context(|| format!("invalid quota.on_corrupt: {}", self.on_corrupt))
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            ledger_path: "usage_limits.json".to_string(),
            on_corrupt: "reset".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl: String,
    pub users_path: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub admin_username: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub admin_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl: "12h".to_string(),
            users_path: "users.json".to_string(),
            admin_username: None,
            admin_password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub url: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 300,
            timeout: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for InteractionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "logs.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "text_assistant".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<ServerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<QuotaOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<GenerationOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interactions: Option<InteractionsOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<MetricsOverrides>,
}

impl ConfigOverrides {
    fn from_cli(cli: &Cli) -> Self {
        let server = ServerOverrides {
            listen: normalized(cli.listen.clone()),
            timezone: normalized(cli.timezone.clone()),
            log_level: normalized(cli.log_level.clone()),
        };

        let quota = QuotaOverrides {
            daily_limit: cli.daily_limit,
            ledger_path: normalized(cli.ledger_path.clone()),
            on_corrupt: normalized(cli.on_corrupt_ledger.clone()),
        };

        let auth = AuthOverrides {
            jwt_secret: normalized(cli.jwt_secret.clone()),
            token_ttl: normalized(cli.token_ttl.clone()),
            users_path: normalized(cli.users_path.clone()),
            admin_username: normalized(cli.admin_username.clone()),
            admin_password: normalized(cli.admin_password.clone()),
        };

        let generation = GenerationOverrides {
            url: normalized(cli.generation_url.clone()),
            api_key: normalized(cli.generation_api_key.clone()),
            model: normalized(cli.generation_model.clone()),
            max_tokens: cli.generation_max_tokens,
            timeout: normalized(cli.generation_timeout.clone()),
        };

        let interactions = InteractionsOverrides {
            enabled: cli.interactions_enabled,
            path: normalized(cli.interactions_path.clone()),
        };

        let metrics = MetricsOverrides {
            prefix: normalized(cli.metrics_prefix.clone()),
        };

        Self {
            server: option_if_not_empty(server),
            quota: option_if_not_empty(quota),
            auth: option_if_not_empty(auth),
            generation: option_if_not_empty(generation),
            interactions: option_if_not_empty(interactions),
            metrics: option_if_not_empty(metrics),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

impl IsEmpty for ServerOverrides {
    fn is_empty(&self) -> bool {
        self.listen.is_none() && self.timezone.is_none() && self.log_level.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct QuotaOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    daily_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_corrupt: Option<String>,
}

impl IsEmpty for QuotaOverrides {
    fn is_empty(&self) -> bool {
        self.daily_limit.is_none() && self.ledger_path.is_none() && self.on_corrupt.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct AuthOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    jwt_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    users_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin_password: Option<String>,
}

impl IsEmpty for AuthOverrides {
    fn is_empty(&self) -> bool {
        self.jwt_secret.is_none()
            && self.token_ttl.is_none()
            && self.users_path.is_none()
            && self.admin_username.is_none()
            && self.admin_password.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct GenerationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<String>,
}

impl IsEmpty for GenerationOverrides {
    fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.api_key.is_none()
            && self.model.is_none()
            && self.max_tokens.is_none()
            && self.timeout.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct InteractionsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

impl IsEmpty for InteractionsOverrides {
    fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.path.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct MetricsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
}

impl IsEmpty for MetricsOverrides {
    fn is_empty(&self) -> bool {
        self.prefix.is_none()
    }
}

trait IsEmpty {
    fn is_empty(&self) -> bool;
}

fn option_if_not_empty<T: IsEmpty>(value: T) -> Option<T> {
    if value.is_empty() { None } else { Some(value) }
}

fn normalized(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

fn normalize_optional_string(value: &mut Option<String>) {
    if let Some(inner) = value {
        let trimmed = inner.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
        } else {
            *inner = trimmed;
        }
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(normalized(value))
}

pub fn load(cli: &Cli) -> Result<Config> {
    let config_provider = if cli.config.exists() {
        Toml::file(&cli.config)
    } else {
        Toml::string("")
    };

    let flat_env_overrides = flat_env_overrides()?;
    let cli_overrides = ConfigOverrides::from_cli(cli);

    let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(config_provider)
        .merge(Env::prefixed("TEXT_ASSISTANT_").split("__"))
        .merge(Serialized::defaults(flat_env_overrides))
        .merge(Serialized::defaults(cli_overrides))
        .extract()
        .context("failed to load configuration")?;

    config.normalize();
    config.validate()?;

    Ok(config)
}

fn flat_env_overrides() -> Result<ConfigOverrides> {
    let vars = std::env::vars().collect::<BTreeMap<String, String>>();
    flat_env_overrides_from_map(&vars)
}

fn flat_env_overrides_from_map(vars: &BTreeMap<String, String>) -> Result<ConfigOverrides> {
    let server = ServerOverrides {
        listen: env_string(vars, "TEXT_ASSISTANT_LISTEN"),
        timezone: env_string(vars, "TEXT_ASSISTANT_TIMEZONE"),
        log_level: env_string(vars, "TEXT_ASSISTANT_LOG_LEVEL"),
    };

    let quota = QuotaOverrides {
        daily_limit: env_parse(vars, "TEXT_ASSISTANT_DAILY_LIMIT")?,
        ledger_path: env_string(vars, "TEXT_ASSISTANT_LEDGER_PATH"),
        on_corrupt: env_string(vars, "TEXT_ASSISTANT_ON_CORRUPT_LEDGER"),
    };

    let auth = AuthOverrides {
        jwt_secret: env_string(vars, "TEXT_ASSISTANT_JWT_SECRET"),
        token_ttl: env_string(vars, "TEXT_ASSISTANT_TOKEN_TTL"),
        users_path: env_string(vars, "TEXT_ASSISTANT_USERS_PATH"),
        admin_username: env_string(vars, "TEXT_ASSISTANT_ADMIN_USERNAME"),
        admin_password: env_string(vars, "TEXT_ASSISTANT_ADMIN_PASSWORD"),
    };

    let generation = GenerationOverrides {
        url: env_string(vars, "TEXT_ASSISTANT_GENERATION_URL"),
        api_key: env_string(vars, "TEXT_ASSISTANT_GENERATION_API_KEY")
            .or_else(|| env_string(vars, "OPENAI_API_KEY")),
        model: env_string(vars, "TEXT_ASSISTANT_GENERATION_MODEL"),
        max_tokens: env_parse(vars, "TEXT_ASSISTANT_GENERATION_MAX_TOKENS")?,
        timeout: env_string(vars, "TEXT_ASSISTANT_GENERATION_TIMEOUT"),
    };

    let interactions = InteractionsOverrides {
        enabled: env_parse(vars, "TEXT_ASSISTANT_INTERACTIONS_ENABLED")?,
        path: env_string(vars, "TEXT_ASSISTANT_INTERACTIONS_PATH"),
    };

    let metrics = MetricsOverrides {
        prefix: env_string(vars, "TEXT_ASSISTANT_METRICS_PREFIX"),
    };

    Ok(ConfigOverrides {
        server: option_if_not_empty(server),
        quota: option_if_not_empty(quota),
        auth: option_if_not_empty(auth),
        generation: option_if_not_empty(generation),
        interactions: option_if_not_empty(interactions),
        metrics: option_if_not_empty(metrics),
    })
}

fn env_string(vars: &BTreeMap<String, String>, key: &str) -> Option<String> {
    normalized(vars.get(key).cloned())
}

fn env_parse<T>(vars: &BTreeMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = vars.get(key) else {
        return Ok(None);
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let parsed = trimmed
        .parse::<T>()
        .map_err(|err| anyhow!("invalid value for {key}: {trimmed} ({err})"))?;

    Ok(Some(parsed))
}

fn ensure_non_empty(key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{key} must not be empty");
    }

    Ok(())
}
