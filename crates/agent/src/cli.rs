use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use http::Uri;
use jackadi_common::constant::{AGENT_PLUGIN_DIR, AGENT_WS_ROUTE};
use jackadi_common::state::AgentId;

#[derive(Debug, Parser)]
pub struct Cli {
    /// Manager endpoint address (IP, or wss://host, http://host)
    #[clap(long, env = "JACKADI_AGENT_ENDPOINT", default_value = "127.0.0.1:4500")]
    pub endpoint: String,

    /// Agent ID, used to identify the agent to the manager.
    #[clap(long, env = "JACKADI_AGENT_ID")]
    pub id: AgentId,

    /// Directory the plugins are synced into
    #[clap(long, env = "JACKADI_AGENT_PLUGIN_DIR", default_value = AGENT_PLUGIN_DIR)]
    pub plugin_dir: PathBuf,

    /// Default task timeout in seconds
    #[clap(long, env = "JACKADI_AGENT_TASK_TIMEOUT", default_value_t = 30)]
    pub task_timeout: u64,

    /// Seconds between plugin syncs against the manager policy
    #[clap(long, env = "JACKADI_AGENT_PLUGIN_SYNC_INTERVAL", default_value_t = 60)]
    pub plugin_sync_interval: u64,
}

impl Cli {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }

    pub fn plugin_sync_interval(&self) -> Duration {
        Duration::from_secs(self.plugin_sync_interval)
    }

    /// The HTTP endpoint for plugin downloads and the websocket URI
    /// the task stream runs over.
    pub fn endpoint_and_uri(&self) -> (String, Uri) {
        let endpoint = &self.endpoint;

        let mut qs = url::form_urlencoded::Serializer::new(String::new());
        qs.append_pair("id", self.id.as_ref());

        let (is_tls, host) = endpoint
            .split_once("://")
            .map(|(left, right)| (left == "wss" || left == "https", right))
            .unwrap_or((false, endpoint.as_str()));

        let addr = format!("{host}{}", if host.contains(':') { "" } else { ":4500" });

        let ws_uri = Uri::builder()
            .scheme(if is_tls { "wss" } else { "ws" })
            .authority(addr.clone())
            .path_and_query(format!("{AGENT_WS_ROUTE}?{}", qs.finish()))
            .build()
            .expect("build websocket uri");

        (
            format!(
                "{proto}://{addr}",
                proto = if is_tls { "https" } else { "http" },
            ),
            ws_uri,
        )
    }
}
