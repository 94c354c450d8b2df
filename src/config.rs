use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Fantasy league real-time server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "league-server", version, about = "Fantasy league real-time server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "LEAGUE_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "LEAGUE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./league.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "LEAGUE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Real-time layer tuning (loaded from [realtime] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Task runner tuning (loaded from [tasks] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub tasks: TasksConfig,
}

/// Tuning knobs for the connection/broadcast layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Max outbound messages per connection per wall-clock second
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_sec: u32,

    /// Idle time after which a connection is considered stale (default: 300 = 5 minutes)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Interval between stale-connection sweeps (default: 30)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Interval between live-statistics heartbeats (default: 10)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 10,
            stale_after_secs: 300,
            sweep_interval_secs: 30,
            stats_interval_secs: 10,
        }
    }
}

fn default_rate_limit() -> u32 {
    10
}

fn default_stale_after() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    10
}

/// Tuning knobs for the scheduled task runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Scheduling tick interval (default: 30)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Extra sleep after an error inside the scheduling tick itself (default: 60)
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// How many task results to retain for inspection (default: 1000)
    #[serde(default = "default_result_retention")]
    pub result_retention: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            error_backoff_secs: 60,
            result_retention: 1000,
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_error_backoff() -> u64 {
    60
}

fn default_result_retention() -> usize {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./league.toml".to_string(),
            json_logs: false,
            generate_config: false,
            realtime: RealtimeConfig::default(),
            tasks: TasksConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (LEAGUE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("LEAGUE_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Fantasy League Server Configuration
# Place this file at ./league.toml or specify with --config <path>
# All settings can be overridden via environment variables (LEAGUE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# ---- Real-time Layer ----
# [realtime]

# Max outbound messages per connection per wall-clock second
# rate_limit_per_sec = 10

# Idle seconds after which a connection is evicted by the stale sweep
# stale_after_secs = 300

# Seconds between stale-connection sweeps
# sweep_interval_secs = 30

# Seconds between live-statistics heartbeats
# stats_interval_secs = 10

# ---- Task Runner ----
# [tasks]

# Seconds between scheduling ticks
# poll_interval_secs = 30

# Extra sleep after an error inside the scheduling tick
# error_backoff_secs = 60

# Number of task results retained for inspection
# result_retention = 1000
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_behavior() {
        let config = Config::default();
        assert_eq!(config.realtime.rate_limit_per_sec, 10);
        assert_eq!(config.realtime.stale_after_secs, 300);
        assert_eq!(config.realtime.sweep_interval_secs, 30);
        assert_eq!(config.realtime.stats_interval_secs, 10);
        assert_eq!(config.tasks.poll_interval_secs, 30);
        assert_eq!(config.tasks.result_retention, 1000);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
                port = 9100
                [realtime]
                rate_limit_per_sec = 3
                [tasks]
                poll_interval_secs = 5
                "#,
            ))
            .extract()
            .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.realtime.rate_limit_per_sec, 3);
        assert_eq!(config.realtime.stale_after_secs, 300);
        assert_eq!(config.tasks.poll_interval_secs, 5);
    }
}
