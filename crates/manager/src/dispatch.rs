use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use jackadi_common::impl_into_status_code;
use jackadi_common::message::{TaskRequest, TaskResponse};
use jackadi_common::state::{AgentId, SpecsMap};
use jackadi_common::targets::{parse_id_list, IdMatcher, Query, TargetMode, TargetParseError};
use thiserror::Error;
use tokio::sync::mpsc;

/// One outbound unit of work: the request to forward and the channel
/// its response is routed back on.
#[derive(Debug)]
pub struct AgentTask {
    pub request: TaskRequest,
    pub response_tx: mpsc::Sender<TaskResponse>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent `{0}` is already registered")]
    AlreadyRegistered(AgentId),
    #[error("agent `{0}` not found")]
    AgentNotFound(AgentId),
    #[error("agent `{0}` task channel is closed")]
    ClosedTaskChannel(AgentId),
    #[error("timed out enqueueing task for agent `{0}`")]
    Timeout(AgentId),
    #[error("agent `{0}` task channel must be closed first")]
    ChannelStillOpen(AgentId),
    #[error("no agent matches the target expression")]
    NoMatchingAgents,
    #[error(transparent)]
    Target(#[from] TargetParseError),
}

impl_into_status_code!(DispatchError, |e| match e {
    AgentNotFound(_) | NoMatchingAgents => ::http::StatusCode::NOT_FOUND,
    Target(_) => ::http::StatusCode::BAD_REQUEST,
    _ => ::http::StatusCode::INTERNAL_SERVER_ERROR,
});

enum Slot {
    Open(mpsc::Sender<AgentTask>),
    /// Kept so concurrent sends observe ClosedTaskChannel until the
    /// stream handler unregisters the entry.
    Closed,
}

/// Routes tasks to per-agent outbound channels and resolves target
/// expressions against the known fleet.
///
/// The receiving half of each channel is owned by the agent's stream
/// handler; the dispatcher only ever enqueues.
#[derive(Default)]
pub struct Dispatcher {
    channels: DashMap<AgentId, Slot>,
    /// true = ready to receive, false = known but not dispatchable.
    /// Absent = never registered, or forgotten.
    dispatchable: DashMap<AgentId, bool>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the agent's task channel, handing the receiver to the
    /// caller (the stream handler).
    pub fn register_agent(&self, id: AgentId) -> Result<mpsc::Receiver<AgentTask>, DispatchError> {
        let entry = self.channels.entry(id);
        match entry {
            dashmap::Entry::Occupied(_) => Err(DispatchError::AlreadyRegistered(id)),
            dashmap::Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(1);
                vacant.insert(Slot::Open(tx));
                self.dispatchable.insert(id, true);
                Ok(rx)
            }
        }
    }

    /// Close the agent's channel, ending the stream handler's drain
    /// loop. The entry stays behind as a tombstone.
    pub fn close(&self, id: AgentId) -> Result<(), DispatchError> {
        match self.channels.get_mut(&id) {
            Some(mut slot) => {
                *slot = Slot::Closed;
                self.dispatchable.insert(id, false);
                Ok(())
            }
            None => Err(DispatchError::AgentNotFound(id)),
        }
    }

    /// Drop the channel entry of a closed agent.
    pub fn unregister_agent(&self, id: AgentId) -> Result<(), DispatchError> {
        match self.channels.get(&id).as_deref() {
            Some(Slot::Open(_)) => return Err(DispatchError::ChannelStillOpen(id)),
            Some(Slot::Closed) => {}
            None => return Err(DispatchError::AgentNotFound(id)),
        }
        self.channels.remove(&id);
        self.dispatchable.insert(id, false);
        Ok(())
    }

    /// Erase the agent from the dispatchable map entirely.
    pub fn forget(&self, id: AgentId) -> Result<(), DispatchError> {
        if self.channels.contains_key(&id) {
            return Err(DispatchError::ChannelStillOpen(id));
        }
        self.dispatchable.remove(&id);
        Ok(())
    }

    pub fn is_dispatchable(&self, id: AgentId) -> bool {
        self.dispatchable.get(&id).is_some_and(|ready| *ready)
    }

    /// Enqueue a task for an agent, waiting at most `timeout` for the
    /// stream handler to pick it up.
    pub async fn send(
        &self,
        id: AgentId,
        task: AgentTask,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        // clone the sender out so the map shard is not held across
        // the await
        let tx = match self.channels.get(&id).as_deref() {
            Some(Slot::Open(tx)) => tx.clone(),
            Some(Slot::Closed) => return Err(DispatchError::ClosedTaskChannel(id)),
            None => return Err(DispatchError::AgentNotFound(id)),
        };

        match tokio::time::timeout(timeout, tx.send(task)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DispatchError::ClosedTaskChannel(id)),
            Err(_) => Err(DispatchError::Timeout(id)),
        }
    }

    /// Resolve a target expression to the set of matched agents, each
    /// flagged with whether it is ready to receive.
    pub fn targeted_agents(
        &self,
        expr: &str,
        mode: TargetMode,
        specs: impl Fn(AgentId) -> Option<SpecsMap>,
    ) -> Result<HashMap<AgentId, bool>, DispatchError> {
        let expr = expr.trim();
        match mode {
            TargetMode::Exact => {
                let id = AgentId::from_str(expr)
                    .map_err(|_| TargetParseError::InvalidId(expr.to_string()))?;
                Ok(HashMap::from([(id, self.is_dispatchable(id))]))
            }
            TargetMode::List => {
                let targets = parse_id_list(expr)?
                    .into_iter()
                    .map(|id| (id, self.is_dispatchable(id)))
                    .collect::<HashMap<_, _>>();
                if targets.is_empty() {
                    return Err(DispatchError::NoMatchingAgents);
                }
                Ok(targets)
            }
            TargetMode::Glob => self.matched_agents(&IdMatcher::glob(expr)),
            TargetMode::Regex => self.matched_agents(&IdMatcher::regex(expr)?),
            TargetMode::Query => {
                let query = Query::from_str(expr)?;
                let targets = self
                    .dispatchable
                    .iter()
                    .filter(|entry| query.matches(entry.key().as_ref(), specs(*entry.key()).as_ref()))
                    .map(|entry| (*entry.key(), *entry.value()))
                    .collect::<HashMap<_, _>>();
                if targets.is_empty() {
                    return Err(DispatchError::NoMatchingAgents);
                }
                Ok(targets)
            }
        }
    }

    fn matched_agents(&self, matcher: &IdMatcher) -> Result<HashMap<AgentId, bool>, DispatchError> {
        let targets = self
            .dispatchable
            .iter()
            .filter(|entry| matcher.matches(entry.key().as_ref()))
            .map(|entry| (*entry.key(), *entry.value()))
            .collect::<HashMap<_, _>>();
        if targets.is_empty() {
            return Err(DispatchError::NoMatchingAgents);
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod test {
    use jackadi_common::message::InternalError;

    use super::*;

    fn id(s: &str) -> AgentId {
        AgentId::from_str(s).unwrap()
    }

    fn no_specs(_: AgentId) -> Option<SpecsMap> {
        None
    }

    fn task() -> AgentTask {
        let (tx, _rx) = mpsc::channel(1);
        AgentTask {
            request: TaskRequest::default(),
            response_tx: tx,
        }
    }

    #[test]
    fn test_register_twice_fails() {
        let dispatcher = Dispatcher::new();
        let _rx = dispatcher.register_agent(id("web-1")).unwrap();
        assert!(matches!(
            dispatcher.register_agent(id("web-1")),
            Err(DispatchError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_send_lifecycle() {
        let dispatcher = Dispatcher::new();
        let web = id("web-1");

        assert!(matches!(
            dispatcher.send(web, task(), Duration::from_millis(10)).await,
            Err(DispatchError::AgentNotFound(_))
        ));

        let mut rx = dispatcher.register_agent(web).unwrap();
        dispatcher
            .send(web, task(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());

        // nobody draining and capacity one: a second send times out
        dispatcher
            .send(web, task(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(
            dispatcher.send(web, task(), Duration::from_millis(50)).await,
            Err(DispatchError::Timeout(_))
        ));

        dispatcher.close(web).unwrap();
        assert!(matches!(
            dispatcher.send(web, task(), Duration::from_millis(10)).await,
            Err(DispatchError::ClosedTaskChannel(_))
        ));

        // the drain loop observes the close after the queued task
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        dispatcher.unregister_agent(web).unwrap();
        assert!(!dispatcher.is_dispatchable(web));
        dispatcher.forget(web).unwrap();
        assert!(matches!(
            dispatcher.send(web, task(), Duration::from_millis(10)).await,
            Err(DispatchError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_unregister_requires_close() {
        let dispatcher = Dispatcher::new();
        let web = id("web-1");
        let _rx = dispatcher.register_agent(web).unwrap();

        assert!(matches!(
            dispatcher.unregister_agent(web),
            Err(DispatchError::ChannelStillOpen(_))
        ));
        assert!(matches!(
            dispatcher.forget(web),
            Err(DispatchError::ChannelStillOpen(_))
        ));
    }

    #[test]
    fn test_targeted_agents_modes() {
        let dispatcher = Dispatcher::new();
        let _rx1 = dispatcher.register_agent(id("web-1")).unwrap();
        let _rx2 = dispatcher.register_agent(id("web-2")).unwrap();
        let _rx3 = dispatcher.register_agent(id("db-1")).unwrap();
        dispatcher.close(id("web-2")).unwrap();

        // exact mode always yields a single entry with the ready bit
        let targets = dispatcher
            .targeted_agents("web-2", TargetMode::Exact, no_specs)
            .unwrap();
        assert_eq!(targets, HashMap::from([(id("web-2"), false)]));
        let targets = dispatcher
            .targeted_agents("ghost", TargetMode::Exact, no_specs)
            .unwrap();
        assert_eq!(targets, HashMap::from([(id("ghost"), false)]));

        let targets = dispatcher
            .targeted_agents("web-1, db-1", TargetMode::List, no_specs)
            .unwrap();
        assert_eq!(
            targets,
            HashMap::from([(id("web-1"), true), (id("db-1"), true)])
        );

        let targets = dispatcher
            .targeted_agents("web-*", TargetMode::Glob, no_specs)
            .unwrap();
        assert_eq!(
            targets,
            HashMap::from([(id("web-1"), true), (id("web-2"), false)])
        );

        let targets = dispatcher
            .targeted_agents("(web|db)-1", TargetMode::Regex, no_specs)
            .unwrap();
        assert_eq!(
            targets,
            HashMap::from([(id("web-1"), true), (id("db-1"), true)])
        );

        assert!(matches!(
            dispatcher.targeted_agents("ghost-*", TargetMode::Glob, no_specs),
            Err(DispatchError::NoMatchingAgents)
        ));
        assert!(matches!(
            dispatcher.targeted_agents("(", TargetMode::Regex, no_specs),
            Err(DispatchError::Target(_))
        ));
        assert!(matches!(
            dispatcher.targeted_agents("", TargetMode::List, no_specs),
            Err(DispatchError::Target(TargetParseError::EmptyExpression))
        ));
    }

    #[test]
    fn test_targeted_agents_query() {
        let dispatcher = Dispatcher::new();
        let _rx1 = dispatcher.register_agent(id("web-1")).unwrap();
        let _rx2 = dispatcher.register_agent(id("web-2")).unwrap();
        let _rx3 = dispatcher.register_agent(id("db-1")).unwrap();

        let specs = |agent: AgentId| {
            let role = if AsRef::<str>::as_ref(&agent).starts_with("web") {
                "webserver"
            } else {
                "database"
            };
            serde_json::json!({ "os": "linux", "role": role })
                .as_object()
                .cloned()
        };

        let targets = dispatcher
            .targeted_agents(
                "specs.os == linux and specs.role =~ web*",
                TargetMode::Query,
                specs,
            )
            .unwrap();
        assert_eq!(
            targets,
            HashMap::from([(id("web-1"), true), (id("web-2"), true)])
        );

        assert!(matches!(
            dispatcher.targeted_agents("specs.role == mainframe", TargetMode::Query, specs),
            Err(DispatchError::NoMatchingAgents)
        ));
    }

    // dropping a response sender must not panic the routing path
    #[tokio::test]
    async fn test_response_channel_dropped() {
        let (tx, rx) = mpsc::channel::<TaskResponse>(1);
        drop(rx);
        let response = TaskResponse::internal(1, 0, InternalError::Ok);
        assert!(tx.send(response).await.is_err());
    }
}
