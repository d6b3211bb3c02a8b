use std::{collections::HashSet, fs::File, path::PathBuf, time::Duration};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use url::Url;

use crate::BackendName;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to read configuration file at {config_file:?}"))]
    ReadConfigFile {
        source: std::io::Error,
        config_file: PathBuf,
    },

    #[snafu(display("Failed to parse configuration file at {config_file:?}"))]
    ParseConfigFile {
        source: serde_yaml::Error,
        config_file: PathBuf,
    },

    #[snafu(display(
        "Configuration error: The backend {backend_name:?} is defined more than once"
    ))]
    DuplicateBackend { backend_name: BackendName },

    #[snafu(display(
        "Configuration error: In case ssl is used the `requestRouter.certPemFile` and \
         `requestRouter.keyPemFile` options must be set"
    ))]
    CertsMissing {},

    #[snafu(display(
        "Configuration error: `routingRules.rulesConfigPath` must be set when the rules \
         engine is enabled"
    ))]
    RulesConfigPathMissing {},
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub gateway: GatewayConfig,

    /// The initial backend pool. The pool can be mutated at runtime through the
    /// administrative interface without a restart.
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub routing_rules: RoutingRulesConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// The address clients use to reach the gateway. Every backend URI in a
    /// proxied response is rewritten to this address so that clients stay
    /// pinned to the gateway.
    pub external_address: Url,

    #[serde(default)]
    pub request_router: RequestRouterConfig,

    pub tracing: Option<TracingConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRouterConfig {
    #[serde(default = "default_request_router_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: bool,

    pub cert_pem_file: Option<PathBuf>,
    pub key_pem_file: Option<PathBuf>,
}

impl Default for RequestRouterConfig {
    fn default() -> Self {
        Self {
            port: default_request_router_port(),
            ssl: false,
            cert_pem_file: None,
            key_pem_file: None,
        }
    }
}

fn default_request_router_port() -> u16 {
    8080
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<Url>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub name: BackendName,

    /// The URL this backend advertises to clients. URIs carrying this prefix
    /// in proxied responses are rewritten to the gateway's external address.
    pub external_url: Url,

    /// The URL the gateway dials to reach the backend. Defaults to
    /// [`BackendConfig::external_url`].
    pub proxy_url: Option<Url>,

    #[serde(default = "default_routing_group")]
    pub routing_group: String,

    #[serde(default = "default_active")]
    pub active: bool,
}

pub fn default_routing_group() -> String {
    "adhoc".to_string()
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRulesConfig {
    #[serde(default)]
    pub rules_engine_enabled: bool,

    pub rules_config_path: Option<PathBuf>,

    /// Explicit selector choice. When absent the selector is derived from
    /// `rulesEngineEnabled`: `rulesEngine` if enabled, `header` otherwise.
    pub selector: Option<SelectorConfig>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SelectorConfig {
    Header,
    RulesEngine,
    HeaderWithRulesFallback,
}

impl RoutingRulesConfig {
    pub fn effective_selector(&self) -> SelectorConfig {
        self.selector.unwrap_or(if self.rules_engine_enabled {
            SelectorConfig::RulesEngine
        } else {
            SelectorConfig::Header
        })
    }

    pub fn needs_rules_engine(&self) -> bool {
        matches!(
            self.effective_selector(),
            SelectorConfig::RulesEngine | SelectorConfig::HeaderWithRulesFallback
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    #[serde(default)]
    pub ignore_cert: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            ignore_cert: false,
        }
    }
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(1000)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// The group used when no selector has an opinion, the selected group is
    /// unknown or empty, or the selection is `no-match`.
    #[serde(default = "default_routing_group")]
    pub default_group: String,

    /// Bindings not looked up for this long are evicted by the sweeper.
    #[serde(default = "default_binding_ttl", with = "humantime_serde")]
    pub binding_ttl: Duration,

    /// How long a binding outlives the terminal response of its query, so
    /// clients can still fetch final results.
    #[serde(default = "default_terminal_grace", with = "humantime_serde")]
    pub terminal_grace: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_group: default_routing_group(),
            binding_ttl: default_binding_ttl(),
            terminal_grace: default_terminal_grace(),
        }
    }
}

fn default_binding_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_terminal_grace() -> Duration {
    Duration::from_secs(15)
}

impl Config {
    /// Using [`std::fs::File`] over `tokio::fs::File`, as [`serde_yaml::from_reader`] does not
    /// support async. Should not matter, as we only read the config once during startup.
    pub async fn read_from_file(config_file: &PathBuf) -> Result<Self, Error> {
        let config_file_content =
            File::open(config_file).context(ReadConfigFileSnafu { config_file })?;

        let config: Config = serde_yaml::from_reader(config_file_content)
            .context(ParseConfigFileSnafu { config_file })?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut backends_seen = HashSet::new();
        for backend in &self.backends {
            if !backends_seen.insert(&backend.name) {
                DuplicateBackendSnafu {
                    backend_name: &backend.name,
                }
                .fail()?;
            }
        }

        let router = &self.gateway.request_router;
        if router.ssl && (router.cert_pem_file.is_none() || router.key_pem_file.is_none()) {
            CertsMissingSnafu {}.fail()?;
        }

        if self.routing_rules.needs_rules_engine()
            && self.routing_rules.rules_config_path.is_none()
        {
            RulesConfigPathMissingSnafu {}.fail()?;
        }

        Ok(())
    }
}

impl BackendConfig {
    pub fn proxy_url(&self) -> &Url {
        self.proxy_url.as_ref().unwrap_or(&self.external_url)
    }
}
