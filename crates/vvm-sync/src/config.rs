//! # Engine Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     VVM_DB_PATH=/var/lib/vvmd/vvm.db                                   │
//! │     VVM_SYNC_INTERVAL_SECS=1800                                        │
//! │     VVM_POSTPONE_MS=5000                                               │
//! │     VVM_NETWORK_TIMEOUT_SECS=30                                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/vvmd/vvmd.toml (Linux)                                   │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [daemon]
//! database_path = "/var/lib/vvmd/vvm.db"
//! sync_interval_secs = 3600
//!
//! [scheduler]
//! upload_postpone_ms = 5000
//! retry_count = 4
//! retry_interval_ms = 5000
//!
//! [[accounts]]
//! id = "sim-1"
//! enabled = true
//!
//! [accounts.credentials]
//! username = "5551234@vvm.example"
//! password = "secret"
//! server = "vvm.example"
//! port = "143"
//!
//! [accounts.carrier]
//! prefetch_enabled = true
//! ssl_port = 993
//! disabled_capabilities = ["STARTTLS"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use vvm_core::omtp::{IMAP_CHANGE_TUI_PWD_FORMAT, IMAP_CHANGE_VM_LANG_FORMAT, IMAP_CLOSE_NUT};
use vvm_core::{AccountHandle, ImapCredentials};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Daemon Settings
// =============================================================================

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Interval of the periodic "sync requested" alarm (seconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_sync_interval() -> u64 {
    3600
}

impl Default for DaemonSettings {
    fn default() -> Self {
        DaemonSettings {
            database_path: None,
            sync_interval_secs: default_sync_interval(),
        }
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Network acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// How long a sync waits for a usable network (seconds).
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Per-response IMAP read timeout (seconds).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            acquire_timeout_secs: default_acquire_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Task scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Quiet window before an upload task is dispatched (milliseconds).
    /// Every equivalent trigger inside the window restarts it.
    #[serde(default = "default_postpone_ms")]
    pub upload_postpone_ms: u64,

    /// Tasks due within this many milliseconds are dispatched together.
    #[serde(default = "default_ready_tolerance_ms")]
    pub ready_tolerance_ms: u64,

    /// Extra attempts of a task whose run failed.
    #[serde(default = "default_task_retry_count")]
    pub retry_count: u32,

    /// Delay before each extra attempt (milliseconds).
    #[serde(default = "default_task_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_postpone_ms() -> u64 {
    5000
}

fn default_ready_tolerance_ms() -> u64 {
    100
}

fn default_task_retry_count() -> u32 {
    4
}

fn default_task_retry_interval_ms() -> u64 {
    5000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            upload_postpone_ms: default_postpone_ms(),
            ready_tolerance_ms: default_ready_tolerance_ms(),
            retry_count: default_task_retry_count(),
            retry_interval_ms: default_task_retry_interval_ms(),
        }
    }
}

// =============================================================================
// Fetch Settings
// =============================================================================

/// On-demand payload fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Attempts before giving up.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Initial backoff between attempts (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff between attempts (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchSettings {
            retry_count: default_retry_count(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Carrier Configuration
// =============================================================================

/// Carrier-specific command strings.
///
/// Placeholders: `{new_pin}`, `{old_pin}`, `{language}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierCommands {
    #[serde(default = "default_change_pin")]
    pub change_pin: String,

    #[serde(default = "default_change_language")]
    pub change_language: String,

    #[serde(default = "default_close_tutorial")]
    pub close_tutorial: String,
}

fn default_change_pin() -> String {
    IMAP_CHANGE_TUI_PWD_FORMAT.to_string()
}

fn default_change_language() -> String {
    IMAP_CHANGE_VM_LANG_FORMAT.to_string()
}

fn default_close_tutorial() -> String {
    IMAP_CLOSE_NUT.to_string()
}

impl Default for CarrierCommands {
    fn default() -> Self {
        CarrierCommands {
            change_pin: default_change_pin(),
            change_language: default_change_language(),
            close_tutorial: default_close_tutorial(),
        }
    }
}

impl CarrierCommands {
    /// Builds the PIN change command line.
    pub fn change_pin_command(&self, old_pin: &str, new_pin: &str) -> String {
        self.change_pin
            .replace("{new_pin}", new_pin)
            .replace("{old_pin}", old_pin)
    }

    /// Builds the greeting language command line.
    pub fn change_language_command(&self, language: &str) -> String {
        self.change_language.replace("{language}", language)
    }

    /// Builds the "close new user tutorial" command line.
    pub fn close_tutorial_command(&self) -> String {
        self.close_tutorial.clone()
    }
}

/// Per-carrier behaviour, passed explicitly into each sync invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierConfig {
    /// Fetch audio during sync instead of on first playback.
    #[serde(default = "default_true")]
    pub prefetch_enabled: bool,

    /// Data must go over cellular even when Wi-Fi is up.
    #[serde(default)]
    pub cellular_data_required: bool,

    /// Implicit-TLS port. 0 keeps the port from the credentials.
    #[serde(default)]
    pub ssl_port: u16,

    /// Capabilities to ignore even if the server advertises them.
    #[serde(default)]
    pub disabled_capabilities: Vec<String>,

    /// Carrier command table.
    #[serde(default)]
    pub commands: CarrierCommands,

    /// Archive old voicemails locally when the server quota fills up.
    #[serde(default)]
    pub archive_enabled: bool,

    /// Shortest PIN the carrier accepts.
    #[serde(default = "default_pin_min")]
    pub pin_min_length: usize,

    /// Longest PIN the carrier accepts.
    #[serde(default = "default_pin_max")]
    pub pin_max_length: usize,
}

fn default_true() -> bool {
    true
}

fn default_pin_min() -> usize {
    4
}

fn default_pin_max() -> usize {
    7
}

impl Default for CarrierConfig {
    fn default() -> Self {
        CarrierConfig {
            prefetch_enabled: true,
            cellular_data_required: false,
            ssl_port: 0,
            disabled_capabilities: Vec::new(),
            commands: CarrierCommands::default(),
            archive_enabled: false,
            pin_min_length: default_pin_min(),
            pin_max_length: default_pin_max(),
        }
    }
}

impl CarrierConfig {
    /// Returns true if `capability` was disabled for this carrier.
    pub fn is_capability_disabled(&self, capability: &str) -> bool {
        self.disabled_capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// Returns true if audio should be fetched during this sync.
    pub fn should_prefetch(&self, roaming: bool) -> bool {
        self.prefetch_enabled && !roaming
    }
}

// =============================================================================
// Account Configuration
// =============================================================================

/// One voicemail account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account id (phone account handle).
    pub id: String,

    /// Visual voicemail enabled by the user.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credentials to seed the store with. Normally delivered by the carrier.
    #[serde(default)]
    pub credentials: Option<ImapCredentials>,

    /// Carrier behaviour.
    #[serde(default)]
    pub carrier: CarrierConfig,
}

impl AccountConfig {
    /// Returns the account handle.
    pub fn handle(&self) -> AccountHandle {
        AccountHandle::new(self.id.clone())
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VvmConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub fetch: FetchSettings,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl VvmConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (vvmd.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.daemon.sync_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_interval_secs must be greater than 0".into(),
            ));
        }

        if self.fetch.retry_count == 0 {
            return Err(SyncError::InvalidConfig(
                "fetch.retry_count must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(SyncError::InvalidConfig("account id must not be empty".into()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "account '{}' is configured twice",
                    account.id
                )));
            }

            let commands = &account.carrier.commands;
            if !commands.change_pin.contains("{new_pin}") || !commands.change_pin.contains("{old_pin}")
            {
                return Err(SyncError::InvalidConfig(format!(
                    "account '{}': change_pin command needs {{new_pin}} and {{old_pin}}",
                    account.id
                )));
            }
            if !commands.change_language.contains("{language}") {
                return Err(SyncError::InvalidConfig(format!(
                    "account '{}': change_language command needs {{language}}",
                    account.id
                )));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("VVM_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.daemon.database_path = Some(PathBuf::from(path));
        }

        if let Ok(secs) = std::env::var("VVM_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.daemon.sync_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid VVM_SYNC_INTERVAL_SECS"),
            }
        }

        if let Ok(ms) = std::env::var("VVM_POSTPONE_MS") {
            match ms.parse::<u64>() {
                Ok(m) => self.scheduler.upload_postpone_ms = m,
                Err(_) => warn!(value = %ms, "Ignoring invalid VVM_POSTPONE_MS"),
            }
        }

        if let Ok(secs) = std::env::var("VVM_NETWORK_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.network.acquire_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid VVM_NETWORK_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "vvm", "vvmd")
            .map(|dirs| dirs.config_dir().join("vvmd.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the database file, falling back to the platform data directory.
    pub fn database_path(&self) -> PathBuf {
        self.daemon.database_path.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("org", "vvm", "vvmd")
                .map(|dirs| dirs.data_dir().join("vvm.db"))
                .unwrap_or_else(|| PathBuf::from("vvm.db"))
        })
    }

    /// Looks up an account by handle.
    pub fn account(&self, account: &AccountHandle) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == account.as_str())
    }

    /// Returns the carrier config of an account, or the defaults.
    pub fn carrier(&self, account: &AccountHandle) -> CarrierConfig {
        self.account(account)
            .map(|a| a.carrier.clone())
            .unwrap_or_default()
    }

    /// Returns true if the user enabled visual voicemail for the account.
    pub fn is_enabled(&self, account: &AccountHandle) -> bool {
        self.account(account).is_some_and(|a| a.enabled)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.sync_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.network.acquire_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.network.read_timeout_secs)
    }

    pub fn upload_postpone(&self) -> Duration {
        Duration::from_millis(self.scheduler.upload_postpone_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VvmConfig::default();
        assert_eq!(config.scheduler.upload_postpone_ms, 5000);
        assert_eq!(config.fetch.retry_count, 3);
        assert_eq!(config.scheduler.retry_count, 4);
        assert_eq!(config.scheduler.retry_interval_ms, 5000);
        assert!(config.accounts.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_account_section() {
        let toml_str = r#"
            [[accounts]]
            id = "sim-1"

            [accounts.credentials]
            username = "5551234@vvm.example"
            password = "secret"
            server = "vvm.example"
            port = "143"

            [accounts.carrier]
            ssl_port = 993
            disabled_capabilities = ["STARTTLS"]
        "#;

        let config: VvmConfig = toml::from_str(toml_str).unwrap();
        let account = config.account(&AccountHandle::new("sim-1")).unwrap();

        assert!(account.enabled);
        assert_eq!(account.carrier.ssl_port, 993);
        assert!(account.carrier.prefetch_enabled);
        assert!(account.carrier.is_capability_disabled("starttls"));
        assert_eq!(account.credentials.as_ref().unwrap().port, "143");
        assert_eq!(account.carrier.commands, CarrierCommands::default());
    }

    #[test]
    fn test_carrier_commands() {
        let commands = CarrierCommands::default();
        assert_eq!(
            commands.change_pin_command("1111", "2222"),
            "XCHANGE_TUI_PWD PWD=2222 OLD_PWD=1111"
        );
        assert_eq!(commands.change_language_command("es"), "XCHANGE_VM_LANG LANG=es");
        assert_eq!(commands.close_tutorial_command(), "XCLOSE_NUT");
    }

    #[test]
    fn test_prefetch_gate() {
        let carrier = CarrierConfig::default();
        assert!(carrier.should_prefetch(false));
        assert!(!carrier.should_prefetch(true));

        let carrier = CarrierConfig {
            prefetch_enabled: false,
            ..Default::default()
        };
        assert!(!carrier.should_prefetch(false));
    }

    #[test]
    fn test_config_validation() {
        let mut config = VvmConfig::default();
        config.accounts.push(AccountConfig {
            id: "sim-1".into(),
            enabled: true,
            credentials: None,
            carrier: CarrierConfig::default(),
        });
        assert!(config.validate().is_ok());

        config.accounts.push(config.accounts[0].clone());
        assert!(config.validate().is_err());

        config.accounts.pop();
        config.accounts[0].carrier.commands.change_pin = "XCHANGE_TUI_PWD".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("vvmd-{}.toml", uuid::Uuid::new_v4()));

        let mut config = VvmConfig::default();
        config.daemon.sync_interval_secs = 900;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[daemon]"));

        let reloaded: VvmConfig = toml::from_str(&contents).unwrap();
        assert_eq!(reloaded.daemon.sync_interval_secs, 900);

        let _ = std::fs::remove_file(path);
    }
}
