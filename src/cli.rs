use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::ai::{DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAiClient, OpenAiConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::metadata::{PKG_DESCRIPTION, PKG_NAME, PKG_VERSION};
use crate::service::RoadmapService;
use crate::storage::{AccountStore, FileStore, MemoryStore, Store, rest::create_rest_store};
use crate::subscription::SubscriptionStatus;
use crate::types::UserAccount;

#[derive(Parser, Debug, Clone)]
#[command(name = PKG_NAME)]
#[command(version = PKG_VERSION)]
#[command(about = PKG_DESCRIPTION, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the MCP server
    Start(CommandArguments),
    /// Show the resolved configuration
    Status(CommandArguments),
    /// Set the local user's subscription in the data file
    Account(AccountArguments),
    /// Print version information
    Version,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// In-process only, lost on exit
    Memory,
    /// JSON file on disk
    File,
    /// Hosted PostgREST database
    Rest,
}

#[derive(Args, Debug, Clone)]
pub struct CommandArguments {
    /// User every tool call acts on behalf of
    #[arg(long, env = "ROADMAP_USER_ID", default_value = "local-user")]
    pub user_id: String,

    /// Storage backend
    #[arg(long, env = "ROADMAP_STORE", value_enum, default_value_t = StoreKind::File)]
    pub store: StoreKind,

    /// Data file for the file store (defaults to ~/.roadmap-mcp/data.json)
    #[arg(long, env = "ROADMAP_DATA_FILE")]
    pub data_file: Option<PathBuf>,

    /// Base URL or host of the hosted database
    #[arg(long, env = "ROADMAP_REST_URL")]
    pub rest_url: Option<String>,

    /// API key for the hosted database
    #[arg(long, env = "ROADMAP_REST_KEY", hide_env_values = true)]
    pub rest_key: Option<String>,

    /// OpenAI API key; sub-step generation is disabled without it
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Chat model used for sub-step generation
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub openai_model: String,

    /// Chat-completions base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    /// Enable stdio transport
    #[arg(long, env = "MCP_ENABLE_STDIO", default_value_t = true, action = ArgAction::Set)]
    pub enable_stdio: bool,

    /// Enable streamable HTTP transport
    #[arg(long, env = "MCP_ENABLE_HTTP", default_value_t = false, action = ArgAction::Set)]
    pub enable_http: bool,

    /// Streamable HTTP bind address
    #[arg(long, env = "MCP_HTTP_ADDR", default_value = "127.0.0.1:3001")]
    pub http_addr: String,
}

#[derive(Args, Debug, Clone)]
pub struct AccountArguments {
    /// User whose subscription is set
    #[arg(long, env = "ROADMAP_USER_ID", default_value = "local-user")]
    pub user_id: String,

    /// Data file to update (defaults to ~/.roadmap-mcp/data.json)
    #[arg(long, env = "ROADMAP_DATA_FILE")]
    pub data_file: Option<PathBuf>,

    /// Subscription tier
    #[arg(long, value_parser = ["free", "pro"])]
    pub tier: String,

    /// Subscription status; only an active pro subscription lifts the free limits
    #[arg(long, value_parser = ["active", "canceled", "past_due"], default_value = "active")]
    pub status: String,
}

impl AccountArguments {
    /// Writes tier and status onto the user's account, keeping its other fields.
    pub fn apply(&self) -> ServiceResult<SubscriptionStatus> {
        let user_id = self.user_id.trim();
        if user_id.is_empty() {
            return Err(ServiceError::FromString(
                "ROADMAP_USER_ID cannot be empty".to_string(),
            ));
        }
        let store = FileStore::open(self.data_file.clone().unwrap_or_else(FileStore::default_path))?;
        let mut account = store.get_user(user_id)?.unwrap_or_else(|| UserAccount {
            id: user_id.to_string(),
            ..Default::default()
        });
        account.subscription_tier = Some(self.tier.clone());
        account.subscription_status = Some(self.status.clone());
        store.upsert_user(account.clone())?;
        tracing::info!(
            user_id,
            tier = %self.tier,
            status = %self.status,
            path = %store.path().display(),
            "account updated"
        );
        Ok(SubscriptionStatus::from_account(Some(&account)))
    }
}

impl CommandArguments {
    pub fn default_settings() -> Self {
        Self {
            user_id: "local-user".to_string(),
            store: StoreKind::File,
            data_file: None,
            rest_url: None,
            rest_key: None,
            openai_api_key: None,
            openai_model: DEFAULT_MODEL.to_string(),
            openai_base_url: DEFAULT_BASE_URL.to_string(),
            enable_stdio: true,
            enable_http: false,
            http_addr: "127.0.0.1:3001".to_string(),
        }
    }

    /// Validate CLI/environment-derived arguments.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enable_stdio && !self.enable_http {
            return Err("Enable at least one transport (stdio or http)".to_string());
        }
        if self.enable_http {
            self.http_addr
                .parse::<SocketAddr>()
                .map_err(|e| format!("Invalid MCP_HTTP_ADDR '{}': {e}", self.http_addr))?;
        }
        if self.user_id.trim().is_empty() {
            return Err("ROADMAP_USER_ID cannot be empty".to_string());
        }
        if self.store == StoreKind::Rest
            && self.rest_url.as_deref().is_none_or(|u| u.trim().is_empty())
        {
            return Err("ROADMAP_REST_URL is required for the rest store".to_string());
        }
        Ok(())
    }

    pub fn data_path(&self) -> PathBuf {
        self.data_file.clone().unwrap_or_else(FileStore::default_path)
    }

    pub fn build_store(&self) -> ServiceResult<Arc<dyn Store>> {
        let store: Arc<dyn Store> = match self.store {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::File => Arc::new(FileStore::open(self.data_path())?),
            StoreKind::Rest => {
                let url = self.rest_url.as_deref().ok_or_else(|| {
                    ServiceError::FromString("ROADMAP_REST_URL is not set".to_string())
                })?;
                Arc::new(create_rest_store(url, self.rest_key.clone()))
            }
        };
        Ok(store)
    }

    pub fn build_service(&self) -> ServiceResult<RoadmapService> {
        let service = RoadmapService::new(self.build_store()?);
        Ok(match &self.openai_api_key {
            Some(key) if !key.trim().is_empty() => {
                let mut config = OpenAiConfig::new(key.trim());
                config.model = self.openai_model.clone();
                config.base_url = self.openai_base_url.clone();
                service.with_generator(Arc::new(OpenAiClient::new(config)))
            }
            _ => {
                tracing::info!("OPENAI_API_KEY not set; generate_substeps is disabled");
                service
            }
        })
    }

    /// Human-readable summary for the `status` command. Secrets are never printed.
    pub fn describe(&self) -> String {
        let store = match self.store {
            StoreKind::Memory => "memory".to_string(),
            StoreKind::File => format!("file ({})", self.data_path().display()),
            StoreKind::Rest => format!("rest ({})", self.rest_url.as_deref().unwrap_or("unset")),
        };
        let ai = if self.openai_api_key.is_some() {
            format!("enabled ({})", self.openai_model)
        } else {
            "disabled".to_string()
        };
        let http = if self.enable_http {
            self.http_addr.as_str()
        } else {
            "disabled"
        };
        format!(
            "user:  {}\nstore: {store}\nai:    {ai}\nstdio: {}\nhttp:  {http}",
            self.user_id,
            if self.enable_stdio { "enabled" } else { "disabled" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Tier;

    #[test]
    fn defaults_are_valid() {
        assert!(CommandArguments::default_settings().validate().is_ok());
    }

    #[test]
    fn requires_a_transport() {
        let mut args = CommandArguments::default_settings();
        args.enable_stdio = false;
        assert!(args.validate().is_err());
        args.enable_http = true;
        assert!(args.validate().is_ok());
        args.http_addr = "not-an-addr".to_string();
        assert!(args.validate().is_err());
    }

    #[test]
    fn rest_store_needs_url() {
        let mut args = CommandArguments::default_settings();
        args.store = StoreKind::Rest;
        assert!(args.validate().is_err());
        args.rest_url = Some("db.example.com".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn parses_start_flags() {
        let cli = Cli::try_parse_from([
            "roadmap-mcp",
            "start",
            "--store",
            "memory",
            "--enable-http",
            "true",
            "--user-id",
            "founder",
        ])
        .unwrap();
        match cli.command {
            Command::Start(args) => {
                assert_eq!(args.store, StoreKind::Memory);
                assert!(args.enable_http);
                assert_eq!(args.user_id, "founder");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn account_command_upgrades_the_file_store_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let cli = Cli::try_parse_from([
            "roadmap-mcp",
            "account",
            "--user-id",
            "founder",
            "--data-file",
            path.to_str().unwrap(),
            "--tier",
            "pro",
        ])
        .unwrap();
        let Command::Account(args) = cli.command else {
            panic!("expected the account command");
        };
        assert_eq!(args.status, "active");

        let status = args.apply().unwrap();
        assert_eq!(status.tier, Tier::Pro);

        let reopened = FileStore::open(&path).unwrap();
        let account = reopened.get_user("founder").unwrap();
        assert_eq!(Tier::of(account.as_ref()), Tier::Pro);
    }

    #[test]
    fn account_command_rejects_unknown_tiers() {
        let parsed = Cli::try_parse_from(["roadmap-mcp", "account", "--tier", "gold"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn describe_hides_secrets() {
        let mut args = CommandArguments::default_settings();
        args.openai_api_key = Some("sk-secret".to_string());
        let text = args.describe();
        assert!(text.contains("enabled (gpt-4o)"));
        assert!(!text.contains("sk-secret"));
    }
}
