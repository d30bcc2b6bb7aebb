//! System configuration parsing (`buildit.kdl`).

use crate::nodes::{
    get_all_string_args, get_bool_prop, get_duration_prop, get_first_string_arg,
    get_string_prop, get_u32_prop,
};
use crate::{ConfigError, ConfigResult};
use buildit_core::TargetRegistry;
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_LEASE: Duration = Duration::from_secs(90);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(15);
/// Builds of large packages can take a full day.
const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_WORKER_OFFLINE: Duration = Duration::from_secs(600);
const DEFAULT_LISTEN: &str = "0.0.0.0:3000";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Store and queue endpoint. `None` selects the in-process memory store.
    pub store_url: Option<String>,
    pub lease: LeaseConfig,
    pub build: BuildConfig,
    pub targets: TargetRegistry,
    pub worker: Option<WorkerConfig>,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub duration: Duration,
    /// Strictly less than `duration`.
    pub heartbeat: Duration,
    pub max_attempts: u32,
    pub scan_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: DEFAULT_LEASE,
            heartbeat: DEFAULT_LEASE / 3,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    pub timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_BUILD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub target: String,
    /// Defaults to the machine hostname.
    pub hostname: Option<String>,
    pub environment: EnvironmentConfig,
}

/// Which build environment a worker drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentConfig {
    /// Run a host command; the payload is passed on stdin.
    Process {
        command: Vec<String>,
        workdir: Option<PathBuf>,
    },
    /// Run a container; the payload is passed in `BUILDIT_PAYLOAD`.
    Docker { image: String, command: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Log every terminal transition.
    pub log: bool,
    pub webhooks: Vec<WebhookConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: Url,
    /// HMAC-SHA256 key for the `X-Buildit-Signature` header.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    /// Bearer token required on mutating endpoints.
    pub token: Option<String>,
    /// Workers not seen for this long are reported offline.
    pub worker_offline_after: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3000))),
            token: None,
            worker_offline_after: DEFAULT_WORKER_OFFLINE,
        }
    }
}

impl SystemConfig {
    /// Apply `BUILDIT_DATABASE_URL` and `BUILDIT_API_TOKEN` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BUILDIT_DATABASE_URL") {
            self.store_url = Some(url);
        }
        if let Some(token) = lookup("BUILDIT_API_TOKEN") {
            self.api.token = Some(token);
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut store_url = None;
    let mut lease = LeaseConfig::default();
    let mut build = BuildConfig::default();
    let mut target_names: Vec<String> = Vec::new();
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut worker = None;
    let mut notify = NotifyConfig::default();
    let mut api = ApiConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "store" => {
                store_url = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("store url".to_string()))?,
                );
            }
            "lease" => {
                if let Some(d) = get_duration_prop(node, "duration")? {
                    lease.duration = d;
                    lease.heartbeat = d / 3;
                }
                if let Some(h) = get_duration_prop(node, "heartbeat")? {
                    lease.heartbeat = h;
                }
                if let Some(n) = get_u32_prop(node, "max-attempts")? {
                    lease.max_attempts = n;
                }
                if let Some(s) = get_duration_prop(node, "scan-interval")? {
                    lease.scan_interval = s;
                }
            }
            "build" => {
                if let Some(t) = get_duration_prop(node, "timeout")? {
                    build.timeout = t;
                }
            }
            "targets" => {
                for name in get_all_string_args(node) {
                    if target_names.contains(&name) {
                        return Err(ConfigError::Duplicate(format!("target '{}'", name)));
                    }
                    target_names.push(name);
                }
            }
            "group" => {
                let mut args = get_all_string_args(node).into_iter();
                let name = args
                    .next()
                    .ok_or_else(|| ConfigError::MissingField("group name".to_string()))?;
                groups.push((name, args.collect()));
            }
            "worker" => {
                if worker.is_some() {
                    return Err(ConfigError::Duplicate("worker".to_string()));
                }
                worker = Some(parse_worker(node)?);
            }
            "notify" => {
                notify = parse_notify(node)?;
            }
            "api" => {
                if let Some(listen) = get_string_prop(node, "listen") {
                    api.listen = listen
                        .parse()
                        .map_err(|e| ConfigError::invalid("api listen", format!("{}", e)))?;
                }
                api.token = get_string_prop(node, "token");
                if let Some(d) = get_duration_prop(node, "worker-offline")? {
                    api.worker_offline_after = d;
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate_lease(&lease)?;
    let targets = build_registry(&target_names, &groups)?;

    if let Some(worker) = &worker {
        if !target_names.contains(&worker.target) {
            return Err(ConfigError::InvalidReference(format!(
                "worker serves unknown target '{}'",
                worker.target
            )));
        }
    }

    Ok(SystemConfig {
        store_url,
        lease,
        build,
        targets,
        worker,
        notify,
        api,
    })
}

fn validate_lease(lease: &LeaseConfig) -> ConfigResult<()> {
    if lease.duration.is_zero() {
        return Err(ConfigError::invalid("lease duration", "must be positive"));
    }
    if lease.heartbeat.is_zero() || lease.heartbeat >= lease.duration {
        return Err(ConfigError::invalid(
            "lease heartbeat",
            format!(
                "heartbeat ({:?}) must be positive and shorter than the lease ({:?})",
                lease.heartbeat, lease.duration
            ),
        ));
    }
    if lease.max_attempts == 0 {
        return Err(ConfigError::invalid("lease max-attempts", "must be at least 1"));
    }
    if lease.scan_interval.is_zero() {
        return Err(ConfigError::invalid("lease scan-interval", "must be positive"));
    }
    Ok(())
}

fn build_registry(
    target_names: &[String],
    groups: &[(String, Vec<String>)],
) -> ConfigResult<TargetRegistry> {
    if target_names.is_empty() {
        return Err(ConfigError::MissingField("targets".to_string()));
    }

    let name_re = Regex::new(r"^[a-z0-9][a-z0-9_-]*$")
        .map_err(|e| ConfigError::invalid("target", e.to_string()))?;
    for name in target_names {
        if !name_re.is_match(name) {
            return Err(ConfigError::invalid(
                "target",
                format!("'{}' is not a valid target name", name),
            ));
        }
    }

    let mut registry = TargetRegistry::new(target_names.iter().cloned());
    let mut seen = HashSet::new();
    for (name, members) in groups {
        if !seen.insert(name.as_str()) || target_names.contains(name) {
            return Err(ConfigError::Duplicate(format!("group '{}'", name)));
        }
        registry
            .add_group(name.clone(), members.iter().cloned())
            .map_err(|e| ConfigError::InvalidReference(e.to_string()))?;
    }
    Ok(registry)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let target = get_string_prop(node, "target")
        .ok_or_else(|| ConfigError::MissingField("worker target".to_string()))?;
    let hostname = get_string_prop(node, "hostname");

    let mut environment = None;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "environment" {
                environment = Some(parse_environment(child)?);
            }
        }
    }

    Ok(WorkerConfig {
        target,
        hostname,
        environment: environment
            .ok_or_else(|| ConfigError::MissingField("worker environment".to_string()))?,
    })
}

fn parse_environment(node: &KdlNode) -> ConfigResult<EnvironmentConfig> {
    let kind = get_first_string_arg(node).unwrap_or_default();

    let mut command = Vec::new();
    let mut image = None;
    let mut workdir = None;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "command" => command = get_all_string_args(child),
                "image" => image = get_first_string_arg(child),
                "workdir" => workdir = get_first_string_arg(child).map(PathBuf::from),
                _ => {}
            }
        }
    }

    match kind.as_str() {
        "process" => {
            if command.is_empty() {
                return Err(ConfigError::MissingField(
                    "command for process environment".to_string(),
                ));
            }
            Ok(EnvironmentConfig::Process { command, workdir })
        }
        "docker" => {
            let image = image.ok_or_else(|| {
                ConfigError::MissingField("image for docker environment".to_string())
            })?;
            Ok(EnvironmentConfig::Docker { image, command })
        }
        _ => Err(ConfigError::invalid(
            "environment",
            format!("unknown environment type: {}", kind),
        )),
    }
}

fn parse_notify(node: &KdlNode) -> ConfigResult<NotifyConfig> {
    let mut config = NotifyConfig {
        log: get_bool_prop(node, "log").unwrap_or(true),
        webhooks: Vec::new(),
    };
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "webhook" {
                let raw = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("webhook url".to_string()))?;
                let url = Url::parse(&raw)
                    .map_err(|e| ConfigError::invalid("webhook url", e.to_string()))?;
                config.webhooks.push(WebhookConfig {
                    url,
                    secret: get_string_prop(child, "secret"),
                });
            }
        }
    }
    Ok(config)
}
