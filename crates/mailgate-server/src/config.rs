use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    pub rest: RestConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_config_path)
            .context(
                "config path not found (MAILGATE_CONFIG_PATH or mailgate.yaml/mailgate.yml)",
            )?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        for server in &mut self.servers {
            server.normalize();
        }
        self.rest.normalize();
        self.runtime.normalize()?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("config must declare at least one server");
        }
        for server in &self.servers {
            server.validate()?;
        }
        self.rest.validate()?;
        self.runtime.validate()?;
        Ok(())
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: mailgate-server [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: mailgate-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

/// One IMAP server and the mailbox tree it is expected to expose.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default)]
    pub tls_insecure: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// mailbox name -> success/failure child mailbox names, in the order
    /// they were declared in the config file.
    pub mailbox_config: MailboxConfigList,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailboxMoveConfig {
    pub success: String,
    pub failure: String,
}

/// Ordered mailbox -> move-config mapping. A plain `HashMap` cannot
/// preserve the declaration order that mailbox polling must follow, so
/// this deserializes a YAML/JSON mapping into an insertion-ordered list.
#[derive(Debug, Clone, Default)]
pub struct MailboxConfigList(pub Vec<(String, MailboxMoveConfig)>);

impl MailboxConfigList {
    pub fn get(&self, name: &str) -> Option<&MailboxMoveConfig> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a MailboxConfigList {
    type Item = &'a (String, MailboxMoveConfig);
    type IntoIter = std::slice::Iter<'a, (String, MailboxMoveConfig)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for MailboxConfigList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MailboxConfigListVisitor;

        impl<'de> serde::de::Visitor<'de> for MailboxConfigListVisitor {
            type Value = MailboxConfigList;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a mapping of mailbox name to move config")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, MailboxMoveConfig>()? {
                    entries.push((key, value));
                }
                Ok(MailboxConfigList(entries))
            }
        }

        deserializer.deserialize_map(MailboxConfigListVisitor)
    }
}

impl ServerConfig {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.host = self.host.trim().to_string();
        self.user = self.user.trim().to_string();
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("server config missing `name`");
        }
        if self.host.is_empty() {
            bail!("server `{}` missing `host`", self.name);
        }
        if self.user.is_empty() || self.pass.is_empty() {
            bail!("server `{}` missing `user`/`pass`", self.name);
        }
        if self.mailbox_config.is_empty() {
            bail!("server `{}` must declare at least one mailbox in `mailbox_config`", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestConfig {
    pub base_url: String,
    pub user: String,
    pub pass: String,
    #[serde(default = "default_db_query_path")]
    pub db_query_path: String,
}

impl RestConfig {
    fn normalize(&mut self) {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.user = self.user.trim().to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("rest config missing `base_url`");
        }
        if self.user.is_empty() {
            bail!("rest config missing `user`");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnPersonNotFound {
    CreateSystemIssue,
    MoveMsgToFailureFolder,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultIssueAttrs {
    pub author_id: String,
    #[serde(default)]
    pub status_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub priority_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpamConfig {
    #[serde(default = "default_spam_time_span_minutes")]
    pub time_span_minutes: u64,
    #[serde(default = "default_spam_max_issues")]
    pub max_num_of_issues: u32,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub dont_check_authors: Vec<String>,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            time_span_minutes: default_spam_time_span_minutes(),
            max_num_of_issues: default_spam_max_issues(),
            headers: Vec::new(),
            dont_check_authors: Vec::new(),
        }
    }
}

/// One attribute the body processor is permitted to pull out of a message
/// body, keyed by its type grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Date,
    Id,
    String,
}

/// A single delimiter: either matched literally or as a regex.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommentDelimiter {
    Literal(String),
    Regex { regex: String },
}

impl CommentDelimiter {
    pub fn compile(&self) -> Result<Regex> {
        match self {
            CommentDelimiter::Literal(text) => Regex::new(&regex::escape(text))
                .with_context(|| format!("failed to compile literal delimiter `{text}`")),
            CommentDelimiter::Regex { regex } => {
                Regex::new(regex).with_context(|| format!("failed to compile delimiter regex `{regex}`"))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_query_messages")]
    pub max_query_messages: usize,
    #[serde(
        default = "default_query_interval",
        deserialize_with = "mailgate_helpers::de::deserialize_duration"
    )]
    pub query_interval: DurationSeconds,
    #[serde(default)]
    pub join_original_as_eml: bool,
    #[serde(default = "default_true")]
    pub join_attachments: bool,
    #[serde(default)]
    pub truncate_comments_after_delimiter: bool,
    #[serde(default)]
    pub comment_delimiters: Vec<CommentDelimiter>,
    #[serde(default)]
    pub permitted_body_attributes: HashMap<String, AttributeType>,
    pub default_issue_attrs: DefaultIssueAttrs,
    pub on_person_not_found: OnPersonNotFoundFlags,
    #[serde(default)]
    pub spam: SpamConfig,
}

/// Two independent booleans rather than an enum so the mutual-exclusivity
/// invariant is validated at load time instead of assumed away by the type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnPersonNotFoundFlags {
    #[serde(default)]
    pub create_system_issue: bool,
    #[serde(default)]
    pub move_msg_to_failure_folder: bool,
}

impl OnPersonNotFoundFlags {
    pub fn resolve(&self) -> Result<OnPersonNotFound> {
        match (self.create_system_issue, self.move_msg_to_failure_folder) {
            (true, false) => Ok(OnPersonNotFound::CreateSystemIssue),
            (false, true) => Ok(OnPersonNotFound::MoveMsgToFailureFolder),
            (false, false) => bail!(
                "runtime.on_person_not_found must set exactly one of `create_system_issue` or `move_msg_to_failure_folder`"
            ),
            (true, true) => bail!(
                "runtime.on_person_not_found cannot set both `create_system_issue` and `move_msg_to_failure_folder`"
            ),
        }
    }
}

/// Newtype so `mailgate_helpers::de::deserialize_duration` (which requires
/// `From<Duration> + Default`) can target it without reaching into `std`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationSeconds(pub Duration);

impl From<Duration> for DurationSeconds {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_query_messages: default_max_query_messages(),
            query_interval: default_query_interval(),
            join_original_as_eml: false,
            join_attachments: true,
            truncate_comments_after_delimiter: false,
            comment_delimiters: Vec::new(),
            permitted_body_attributes: HashMap::new(),
            default_issue_attrs: DefaultIssueAttrs {
                author_id: String::new(),
                status_id: None,
                category_id: None,
                priority_id: None,
                source_id: None,
            },
            on_person_not_found: OnPersonNotFoundFlags::default(),
            spam: SpamConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn normalize(&mut self) -> Result<()> {
        self.max_query_messages = self.max_query_messages.max(1);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.on_person_not_found.resolve()?;
        for delimiter in &self.comment_delimiters {
            delimiter.compile()?;
        }
        if self.default_issue_attrs.author_id.trim().is_empty() {
            bail!("runtime.default_issue_attrs.author_id must not be empty");
        }
        Ok(())
    }
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_slice(&raw)
        .with_context(|| format!("failed to parse YAML config {}", path.display()))
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("MAILGATE_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        let home_yaml = PathBuf::from(&home).join("mailgate.yaml");
        if home_yaml.exists() {
            return Some(home_yaml);
        }
        let home_yml = PathBuf::from(home).join("mailgate.yml");
        if home_yml.exists() {
            return Some(home_yml);
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join("mailgate.yaml");
    if cwd_yaml.exists() {
        return Some(cwd_yaml);
    }
    let cwd_yml = cwd.join("mailgate.yml");
    if cwd_yml.exists() {
        return Some(cwd_yml);
    }

    None
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn default_imap_port() -> u16 {
    993
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_db_query_path() -> String {
    "dbQuery".to_string()
}

fn default_max_query_messages() -> usize {
    50
}

fn default_query_interval() -> DurationSeconds {
    DurationSeconds(Duration::from_secs(60))
}

fn default_true() -> bool {
    true
}

fn default_spam_time_span_minutes() -> u64 {
    60
}

fn default_spam_max_issues() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_person_not_found_rejects_both_and_neither() {
        let neither = OnPersonNotFoundFlags { create_system_issue: false, move_msg_to_failure_folder: false };
        assert!(neither.resolve().is_err());

        let both = OnPersonNotFoundFlags { create_system_issue: true, move_msg_to_failure_folder: true };
        assert!(both.resolve().is_err());

        let one = OnPersonNotFoundFlags { create_system_issue: true, move_msg_to_failure_folder: false };
        assert_eq!(one.resolve().unwrap(), OnPersonNotFound::CreateSystemIssue);
    }

    #[test]
    fn mailbox_config_preserves_declaration_order() {
        let yaml = r#"
zeta:
  success: ZS
  failure: ZF
alpha:
  success: AS
  failure: AF
mid:
  success: MS
  failure: MF
"#;
        let parsed: MailboxConfigList = serde_yaml::from_str(yaml).unwrap();
        let names: Vec<&str> = parsed.0.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(parsed.get("alpha").unwrap().success, "AS");
    }

    #[test]
    fn comment_delimiter_literal_is_escaped() {
        let delimiter = CommentDelimiter::Literal("a.b".to_string());
        let compiled = delimiter.compile().unwrap();
        assert!(compiled.is_match("x a.b y"));
        assert!(!compiled.is_match("x axb y"));
    }

    #[test]
    fn parses_minimal_yaml_config() {
        let yaml = r#"
servers:
  - name: support
    host: imap.example.com
    user: bot@example.com
    pass: secret
    mailbox_config:
      INBOX:
        success: Processed
        failure: Failed
rest:
  base_url: https://tickets.example.com/api
  user: svc
  pass: secret
runtime:
  default_issue_attrs:
    author_id: "1"
  on_person_not_found:
    create_system_issue: true
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.normalize().unwrap();
        config.validate().unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.runtime.max_query_messages, 50);
    }
}
