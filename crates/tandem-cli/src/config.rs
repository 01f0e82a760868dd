use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tandem_core::providers::{
    AnthropicProvider, OpenAiImageProvider, OpenAiProvider, PollSettings, PredictionJobProvider,
    Provider,
};
use tandem_core::{
    ContextConfig, ContextPolicy, ContextStrategy, FallbackOrchestrator, InputLimits,
    OrchestratorConfig, ProviderDescriptor, ProviderRegistry, RequestHandler, TaskType,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TandemConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            max_prompt_chars: default_max_prompt_chars(),
            max_history_messages: default_max_history_messages(),
        }
    }
}

fn default_max_message_chars() -> usize {
    10_000
}

fn default_max_prompt_chars() -> usize {
    1_000
}

fn default_max_history_messages() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Per-task override keyed by task name, e.g. `video = 300`
    #[serde(default)]
    pub task_timeout_secs: BTreeMap<String, u64>,
    /// Longest silence between chunks of an open chat stream
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            task_timeout_secs: BTreeMap::new(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_token_budget")]
    pub max_token_budget: u64,
    #[serde(default)]
    pub strategy: ContextStrategy,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_token_budget: default_max_token_budget(),
            strategy: ContextStrategy::default(),
        }
    }
}

impl ContextSection {
    fn to_context_config(self) -> Result<ContextConfig> {
        Ok(ContextConfig::new(self.max_messages, self.max_token_budget, self.strategy)?)
    }
}

fn default_max_messages() -> usize {
    20
}

fn default_max_token_budget() -> u64 {
    6000
}

/// Backend protocol spoken by a provider entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai_image")]
    OpenAiImage,
    #[serde(rename = "prediction_job")]
    PredictionJob,
}

impl ProviderKind {
    pub fn supports(&self, task: TaskType) -> bool {
        match self {
            Self::OpenAi | Self::Anthropic => task.is_textual(),
            Self::OpenAiImage => task == TaskType::Image,
            Self::PredictionJob => matches!(task, TaskType::Image | TaskType::Video),
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiImage => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::PredictionJob => "https://api.replicate.com",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::OpenAiImage => "dall-e-3",
            Self::PredictionJob => "black-forest-labs/flux-schnell",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub task: TaskType,
    pub kind: ProviderKind,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Unset: as many polls as fit inside the task deadline, at most 30
    #[serde(default)]
    pub max_polls: Option<u32>,
    /// MIME type assumed for job outputs that do not declare one
    #[serde(default)]
    pub output_mime: Option<String>,
    #[serde(default)]
    pub context: Option<ContextSection>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

fn default_priority() -> u32 {
    100
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_poll_interval_ms() -> u64 {
    2000
}

const DEFAULT_MAX_POLLS: u32 = 30;

impl ProviderConfig {
    /// Poll settings for a job provider whose attempts end at `deadline`.
    ///
    /// The whole poll budget has to fit strictly inside the deadline so the
    /// adapter reaches its own ceiling, and cancels the job, before the
    /// orchestrator gives up on it.
    fn poll_settings(&self, deadline: Duration) -> Result<PollSettings> {
        if self.poll_interval_ms == 0 {
            bail!("Provider '{}' needs poll_interval_ms above zero", self.id);
        }
        let interval = Duration::from_millis(self.poll_interval_ms);
        let fitting = u32::try_from((deadline.as_millis().saturating_sub(1)) / interval.as_millis()).unwrap_or(u32::MAX);

        let max_polls = match self.max_polls {
            Some(0) => bail!("Provider '{}' needs max_polls above zero", self.id),
            Some(n) if n > fitting => bail!(
                "Provider '{}' polls for up to {:?} ({} x {} ms), which must stay below its {} deadline of {:?}",
                self.id,
                interval * n,
                n,
                self.poll_interval_ms,
                self.task,
                deadline
            ),
            Some(n) => n,
            None if fitting == 0 => bail!(
                "Provider '{}' poll_interval_ms {} leaves no room for a poll within the {} deadline of {:?}",
                self.id,
                self.poll_interval_ms,
                self.task,
                deadline
            ),
            None => {
                if fitting < DEFAULT_MAX_POLLS {
                    debug!("Provider '{}' polls at most {} times to fit its deadline", self.id, fitting);
                }
                fitting.min(DEFAULT_MAX_POLLS)
            }
        };
        Ok(PollSettings { max_polls, interval })
    }

    fn build(&self, deadline: Duration) -> Result<Arc<dyn Provider>> {
        let base_url = self
            .base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string());
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string());
        let api_key = self.api_key.clone();

        let provider: Arc<dyn Provider> = match self.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(api_key, model, base_url, self.max_tokens)?),
            ProviderKind::Anthropic => {
                Arc::new(AnthropicProvider::new(api_key, model, base_url, self.max_tokens)?)
            }
            ProviderKind::OpenAiImage => Arc::new(OpenAiImageProvider::new(api_key, model, base_url)?),
            ProviderKind::PredictionJob => {
                let mime = self.output_mime.clone().unwrap_or_else(|| match self.task {
                    TaskType::Video => "video/mp4".to_string(),
                    _ => "image/png".to_string(),
                });
                let poll = self.poll_settings(deadline)?;
                Arc::new(PredictionJobProvider::new(api_key, model, base_url, mime, poll)?)
            }
        };
        Ok(provider)
    }
}

fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tandem")
}

impl TandemConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // The file holds API keys: refuse it if group or other can read it
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `tandem init` first.",
                path.display()
            )
        })?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to load config at {}", path.display()))?;
        debug!("Loaded config from {} ({} providers)", path.display(), config.providers.len());
        Ok(config)
    }

    /// Expand `${VAR}` references, parse, and validate
    pub fn parse(content: &str) -> Result<Self> {
        for (id, suggested_var) in hardcoded_keys(content) {
            warn!(
                "API key for '{}' is hardcoded in config file. For security, use environment variables: api_key = \"${{{}}}\"",
                id, suggested_var
            );
        }

        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limits.max_message_chars == 0 || self.limits.max_prompt_chars == 0 {
            bail!("[limits] character ceilings must be at least 1");
        }
        self.context.to_context_config().context("Invalid [context] section")?;
        if self.orchestrator.attempt_timeout_secs == 0 || self.orchestrator.idle_timeout_secs == 0 {
            bail!("[orchestrator] timeouts must be at least 1 second");
        }
        let orchestrator = self.orchestrator_config()?;

        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.id.trim().is_empty() {
                bail!("Provider entries need a non-empty id");
            }
            if !seen.insert((p.task, p.id.as_str())) {
                bail!("Provider '{}' is registered twice for {}", p.id, p.task);
            }
            if !p.kind.supports(p.task) {
                bail!(
                    "Provider '{}' of kind {:?} cannot serve the {} task",
                    p.id,
                    p.kind,
                    p.task
                );
            }
            if p.kind == ProviderKind::PredictionJob {
                p.poll_settings(orchestrator.timeout_for(p.task))?;
            }
            if let Some(ctx) = p.context {
                ctx.to_context_config()
                    .with_context(|| format!("Invalid context override for provider '{}'", p.id))?;
            }
            if p.api_key.is_empty() {
                warn!("Provider '{}' has no API key; its calls will fail and fall through", p.id);
            }
        }

        for task in TaskType::ALL {
            if !self.providers.iter().any(|p| p.task == task) {
                warn!("No providers configured for {}", task);
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid [server] bind address '{}'", self.server.bind))
    }

    pub fn input_limits(&self) -> InputLimits {
        InputLimits {
            max_message_chars: self.limits.max_message_chars,
            max_prompt_chars: self.limits.max_prompt_chars,
            max_history_messages: self.limits.max_history_messages,
        }
    }

    pub fn orchestrator_config(&self) -> Result<OrchestratorConfig> {
        let mut config = OrchestratorConfig {
            attempt_timeout: Duration::from_secs(self.orchestrator.attempt_timeout_secs),
            idle_timeout: Duration::from_secs(self.orchestrator.idle_timeout_secs),
            ..Default::default()
        };
        for (task, secs) in &self.orchestrator.task_timeout_secs {
            let task: TaskType = task
                .parse()
                .map_err(|e| anyhow::anyhow!("[orchestrator.task_timeout_secs]: {}", e))?;
            config = config.with_task_timeout(task, Duration::from_secs(*secs));
        }
        Ok(config)
    }

    pub fn context_policy(&self) -> Result<ContextPolicy> {
        let mut policy = ContextPolicy::new(self.context.to_context_config()?);
        for p in &self.providers {
            if let Some(ctx) = p.context {
                policy = policy.with_override(p.task, p.id.clone(), ctx.to_context_config()?);
            }
        }
        Ok(policy)
    }

    pub fn build_registry(&self) -> Result<ProviderRegistry> {
        let orchestrator = self.orchestrator_config()?;
        let mut builder = ProviderRegistry::builder();
        for p in &self.providers {
            let provider = p
                .build(orchestrator.timeout_for(p.task))
                .with_context(|| format!("Failed to set up provider '{}'", p.id))?;
            let display_name = p.display_name.clone().unwrap_or_else(|| p.id.clone());
            builder = builder.register(
                p.task,
                ProviderDescriptor::new(p.id.clone(), display_name, p.priority, provider),
            );
        }
        Ok(builder.build())
    }

    pub fn build_handler(&self) -> Result<RequestHandler> {
        let registry = Arc::new(self.build_registry()?);
        let orchestrator = FallbackOrchestrator::new(registry, self.orchestrator_config()?);
        Ok(RequestHandler::new(orchestrator, self.context_policy()?, self.input_limits()))
    }

    /// Copy safe to print: every API key masked
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        for p in &mut copy.providers {
            p.api_key = mask_secret(&p.api_key);
        }
        copy
    }
}

/// Provider api_key values that are literal strings rather than `${VAR}` references
fn hardcoded_keys(content: &str) -> Vec<(String, String)> {
    let Ok(raw) = toml::from_str::<TandemConfig>(content) else {
        return Vec::new();
    };
    raw.providers
        .iter()
        .filter(|p| !p.api_key.is_empty() && !p.api_key.contains("${"))
        .map(|p| (p.id.clone(), format!("{}_API_KEY", p.id.to_uppercase().replace('-', "_"))))
        .collect()
}

/// Replace `${VAR}` with the variable's value; unset variables become empty
fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();
        let value = std::env::var(&var_name).unwrap_or_else(|_| {
            warn!("Environment variable '{}' referenced in config is not set", var_name);
            String::new()
        });

        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len; // Skip past the expanded value
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[[providers]]
id = "a"
task = "chat"
kind = "openai"
api_key = "sk-test-123456"
priority = 20

[[providers]]
id = "b"
task = "chat"
kind = "anthropic"
api_key = "sk-ant-test-abcdef"
priority = 10

[providers.context]
max_messages = 4
max_token_budget = 500
strategy = "recent"
"#;

    fn write_private(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        file
    }

    #[test]
    fn test_default_config_parses() {
        let cfg = TandemConfig::parse(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8787");
        assert_eq!(cfg.limits.max_prompt_chars, 1000);
        assert_eq!(cfg.orchestrator.task_timeout_secs.get("video"), Some(&300));
        let orchestrator = cfg.orchestrator_config().unwrap();
        assert_eq!(orchestrator.idle_timeout, Duration::from_secs(30));
        for p in cfg.providers.iter().filter(|p| p.kind == ProviderKind::PredictionJob) {
            let deadline = orchestrator.timeout_for(p.task);
            assert!(p.poll_settings(deadline).unwrap().budget() < deadline, "{} polls too long", p.id);
        }
        for task in TaskType::ALL {
            assert!(cfg.providers.iter().any(|p| p.task == task), "no provider for {}", task);
        }
        cfg.build_handler().unwrap();
    }

    #[test]
    fn test_load_and_build_registry() {
        let file = write_private(MINIMAL);
        let cfg = TandemConfig::load(&Some(file.path().to_path_buf())).unwrap();

        assert_eq!(cfg.limits.max_message_chars, 10_000);
        assert_eq!(cfg.context.max_messages, 20);

        let registry = cfg.build_registry().unwrap();
        let order: Vec<_> = registry
            .get_order(TaskType::Chat, None)
            .into_iter()
            .map(|d| d.id.clone())
            .collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(registry.providers(TaskType::Chat)[0].display_name, "b");
    }

    #[test]
    fn test_context_override() {
        let cfg = TandemConfig::parse(MINIMAL).unwrap();
        let policy = cfg.context_policy().unwrap();
        let b = policy.config_for(TaskType::Chat, "b");
        assert_eq!(b.max_messages, 4);
        assert_eq!(b.strategy, ContextStrategy::Recent);
        assert_eq!(policy.config_for(TaskType::Chat, "a").max_messages, 20);
    }

    #[test]
    fn test_orchestrator_timeouts() {
        let cfg = TandemConfig::parse(
            r#"
[orchestrator]
attempt_timeout_secs = 15

[orchestrator.task_timeout_secs]
video = 240
"#,
        )
        .unwrap();
        let orch = cfg.orchestrator_config().unwrap();
        assert_eq!(orch.timeout_for(TaskType::Chat), Duration::from_secs(15));
        assert_eq!(orch.timeout_for(TaskType::Video), Duration::from_secs(240));
    }

    #[test]
    fn test_unknown_timeout_task_rejected() {
        let err = TandemConfig::parse("[orchestrator.task_timeout_secs]\naudio = 30\n").unwrap_err();
        assert!(format!("{:#}", err).contains("unknown task type 'audio'"));
    }

    const VIDEO_JOB: &str = r#"
[orchestrator.task_timeout_secs]
video = 300

[[providers]]
id = "jobs"
task = "video"
kind = "prediction_job"
poll_interval_ms = 5000
"#;

    #[test]
    fn test_poll_budget_reaching_deadline_rejected() {
        let err = TandemConfig::parse(&format!("{}max_polls = 60\n", VIDEO_JOB)).unwrap_err();
        assert!(format!("{:#}", err).contains("must stay below its video deadline"));

        let cfg = TandemConfig::parse(&format!("{}max_polls = 59\n", VIDEO_JOB)).unwrap();
        let poll = cfg.providers[0].poll_settings(Duration::from_secs(300)).unwrap();
        assert_eq!(poll.budget(), Duration::from_secs(295));
    }

    #[test]
    fn test_unset_poll_count_fits_deadline() {
        let cfg = TandemConfig::parse(
            r#"
[[providers]]
id = "jobs"
task = "image"
kind = "prediction_job"
"#,
        )
        .unwrap();
        let deadline = cfg.orchestrator_config().unwrap().timeout_for(TaskType::Image);
        let poll = cfg.providers[0].poll_settings(deadline).unwrap();
        assert_eq!(poll.max_polls, 29);
        assert!(poll.budget() < deadline);

        let cfg = TandemConfig::parse(VIDEO_JOB).unwrap();
        assert_eq!(cfg.providers[0].poll_settings(Duration::from_secs(300)).unwrap().max_polls, 30);
    }

    #[test]
    fn test_poll_interval_longer_than_deadline_rejected() {
        let err = TandemConfig::parse(
            r#"
[orchestrator]
attempt_timeout_secs = 1

[[providers]]
id = "jobs"
task = "image"
kind = "prediction_job"
poll_interval_ms = 1000
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("leaves no room"));
    }

    #[test]
    fn test_incompatible_kind_rejected() {
        let err = TandemConfig::parse(
            r#"
[[providers]]
id = "dalle"
task = "chat"
kind = "openai_image"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("cannot serve the chat task"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = TandemConfig::parse(
            r#"
[[providers]]
id = "a"
task = "chat"
kind = "openai"

[[providers]]
id = "a"
task = "chat"
kind = "anthropic"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("registered twice"));
    }

    #[test]
    fn test_zero_max_messages_rejected() {
        let err = TandemConfig::parse("[context]\nmax_messages = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("max_messages"));
    }

    #[cfg(unix)]
    #[test]
    fn test_permissive_file_refused() {
        use std::os::unix::fs::PermissionsExt;
        let file = write_private(MINIMAL);
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = TandemConfig::load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("overly permissive"));
    }

    #[test]
    fn test_missing_file_mentions_init() {
        let dir = tempfile::tempdir().unwrap();
        let err = TandemConfig::load(&Some(dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("tandem init"));
    }

    #[test]
    fn test_expand_env_vars() {
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(expand_env_vars("x=${PATH};"), format!("x={};", path));
        assert_eq!(expand_env_vars("k=\"${TANDEM_SURELY_UNSET_VAR_9F2C}\""), "k=\"\"");
        assert_eq!(expand_env_vars("no vars"), "no vars");
        assert_eq!(expand_env_vars("${unterminated"), "${unterminated");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-ant-1234567890"), "sk-...7890");
    }

    #[test]
    fn test_masked_and_debug_hide_keys() {
        let cfg = TandemConfig::parse(MINIMAL).unwrap();
        let printed = toml::to_string_pretty(&cfg.masked()).unwrap();
        assert!(!printed.contains("sk-ant-test-abcdef"));
        assert!(printed.contains("sk-...cdef"));
        assert!(!format!("{:?}", cfg).contains("sk-test-123456"));
    }

    #[test]
    fn test_hardcoded_keys_detected() {
        let found = hardcoded_keys(MINIMAL);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, "A_API_KEY");
        assert!(hardcoded_keys("[[providers]]\nid = \"x\"\ntask = \"chat\"\nkind = \"openai\"\napi_key = \"${X}\"\n").is_empty());
    }
}
