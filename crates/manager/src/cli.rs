use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use jackadi_common::constant::{MANAGER_PLUGIN_DIR, MANAGER_SOCK_PATH, REGISTRY_FILE_NAME};

#[derive(Debug, Parser)]
pub struct Cli {
    /// Bind address for agent and operator traffic
    #[clap(long = "bind", env = "JACKADI_MANAGER_BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_addr: IpAddr,

    #[clap(long, env = "JACKADI_MANAGER_PORT", default_value_t = 4500)]
    pub port: u16,

    /// Path to the directory containing the manager's state
    #[clap(long, env = "JACKADI_MANAGER_DATA_DIR", default_value = "/var/lib/jackadi")]
    pub path: PathBuf,

    /// Directory the plugin binaries are served from
    #[clap(long, env = "JACKADI_MANAGER_PLUGIN_DIR", default_value = MANAGER_PLUGIN_DIR)]
    pub plugin_dir: PathBuf,

    /// Plugin policy file mapping agent patterns to plugin sets
    #[clap(
        long,
        env = "JACKADI_MANAGER_PLUGIN_POLICY",
        default_value = "/opt/jackadi/plugins.yaml"
    )]
    pub plugin_policy: PathBuf,

    /// Unix socket serving the operator API to the local CLI
    #[clap(long, env = "JACKADI_MANAGER_SOCKET", default_value = MANAGER_SOCK_PATH)]
    pub socket_path: PathBuf,

    /// Register connecting agents without operator approval
    #[clap(long, env = "JACKADI_MANAGER_AUTO_ACCEPT", default_value_t = false)]
    pub auto_accept: bool,

    /// Basic-auth credential file (`user:bcrypt-hash` lines) guarding
    /// the HTTP API; unset disables authentication
    #[clap(long, env = "JACKADI_MANAGER_HTTP_AUTH")]
    pub http_auth: Option<PathBuf>,

    /// RBAC file restricting endpoints and tasks per user
    #[clap(long, env = "JACKADI_MANAGER_AUTHORIZATION")]
    pub authorization: Option<PathBuf>,

    /// Seconds to wait when enqueueing a task for a busy agent
    #[clap(long, env = "JACKADI_MANAGER_DISPATCH_TIMEOUT", default_value_t = 10)]
    pub dispatch_timeout: u64,

    /// Default task timeout in seconds
    #[clap(long, env = "JACKADI_MANAGER_TASK_TIMEOUT", default_value_t = 30)]
    pub task_timeout: u64,

    /// Seconds between fleet spec collections
    #[clap(long, env = "JACKADI_MANAGER_SPEC_INTERVAL", default_value_t = 60)]
    pub spec_interval: u64,

    /// Keep the inventory in memory only
    #[clap(long, hide = true)]
    pub no_registry: bool,
}

impl Cli {
    pub fn database_path(&self) -> PathBuf {
        self.path.join("database")
    }

    pub fn registry_path(&self) -> Option<PathBuf> {
        (!self.no_registry).then(|| self.path.join(REGISTRY_FILE_NAME))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }
}
