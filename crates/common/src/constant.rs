use std::time::Duration;

/// Websocket route agents connect to on the manager.
pub const AGENT_WS_ROUTE: &str = "/agent";

/// Route prefix serving plugin binaries to agents.
pub const PLUGIN_CONTENT_ROUTE: &str = "/plugin";

/// Unix socket the manager exposes for the local CLI.
pub const MANAGER_SOCK_PATH: &str = "/run/jackadi/manager.sock";

/// Default plugin directory on the manager.
pub const MANAGER_PLUGIN_DIR: &str = "/opt/jackadi/plugins";

/// Default plugin directory on agents.
pub const AGENT_PLUGIN_DIR: &str = "/var/lib/jackadi/plugins";

/// File name of the manager's inventory snapshot.
pub const REGISTRY_FILE_NAME: &str = "registry.json";

/// Header carrying the agent's certificate fingerprint when mTLS is
/// terminated in front of the manager.
pub const HEADER_CERT_FINGERPRINT: &str = "x-jackadi-cert-fingerprint";

/// Fast-path task name answered without queueing or locking.
pub const HEALTH_PING_TASK: &str = "health:instant-ping";

/// Built-in task collecting every plugin's spec facts.
pub const SPECS_ALL_TASK: &str = "specs:all";

/// Max tasks concurrently running in the agent's no-lock slot pool.
pub const MAX_CONCURRENT_TASKS: usize = 2;

/// Max requests admitted (waiting + running) before FullQueue.
pub const MAX_WAITING_REQUESTS: usize = 1000;

/// Default per-task execution budget when the request carries none.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between registration rechecks for a connected, unaccepted
/// agent.
pub const AGENT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Bound on handing a routed response to its waiter.
pub const RESPONSE_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Period of the manager's specs collection loop.
pub const SPEC_COLLECTION_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before an agent retries a dropped manager connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long the agent waits for in-flight tasks on shutdown before
/// force-killing plugin subprocesses.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// An agent is active if its last message is within this window.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60);

/// Lifetime of stored results, group indexes, and request records.
pub const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Freshness window of the parsed plugin policy file.
pub const POLICY_CACHE_TTL: Duration = Duration::from_secs(10);

/// Default and per-iteration page size of result listings.
pub const PAGE_LIMIT: usize = 100;

/// Hard cap a result listing request may ask for.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Interval between agent-side websocket pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);
