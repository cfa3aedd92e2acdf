use std::sync::Mutex;

use jackadi_common::constant::{MAX_PAGE_LIMIT, PAGE_LIMIT, RECORD_TTL};
use jackadi_common::db::{DatabaseError, JsonTree};
use jackadi_common::message::{
    GroupId, InternalError, RequestRecord, ResultRecord, TaskId, TaskResponse,
};
use jackadi_common::state::AgentId;
use serde::{Deserialize, Serialize};

const RESULT_PREFIX: &str = "res:";
const REQUEST_PREFIX: &str = "req:";
/// Upper bound key for reverse scans; `~` sorts after every digit.
const SCAN_CEILING: &str = "~";

const GROUPED_PREFIX: &str = "grouped:";

/// A stored result is either a full per-task record or the group
/// index listing the task ids of one fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredResult {
    Record(ResultRecord),
    Grouped(String),
}

/// Row shape returned by listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub id: TaskId,
    pub agent: String,
    pub status: ResultStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
    InternalError,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: usize,
    pub from_date: Option<TaskId>,
    pub to_date: Option<TaskId>,
    pub targets: Option<Vec<AgentId>>,
}

/// Thin layer over the ordered KV store, owning the group-index
/// read-modify-write.
pub struct ResultsStore {
    records: JsonTree,
    /// Serializes [`Self::store_result`] so group-index appends are
    /// atomic.
    write_lock: Mutex<()>,
}

impl ResultsStore {
    pub fn new(records: JsonTree) -> Self {
        Self {
            records,
            write_lock: Mutex::new(()),
        }
    }

    /// Persist one response and fold its task id into the group index
    /// when the response belongs to a group.
    pub fn store_result(
        &self,
        agent: AgentId,
        response: &TaskResponse,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let key = format!("{RESULT_PREFIX}{}", response.task_id);
        let record = ResultRecord {
            agent,
            response: response.clone(),
        };
        self.records.save(&key, &record, Some(RECORD_TTL))?;

        if response.group_id != 0 {
            let group_key = format!("{RESULT_PREFIX}{}", response.group_id);
            let index = match self.records.restore::<StoredResult>(&group_key)? {
                Some(StoredResult::Grouped(existing)) => {
                    format!("{existing},{}", response.task_id)
                }
                _ => format!("{GROUPED_PREFIX}{}", response.task_id),
            };
            self.records
                .save(&group_key, &index, Some(RECORD_TTL))?;
        }

        Ok(())
    }

    pub fn store_request(&self, id: GroupId, request: &RequestRecord) -> Result<(), DatabaseError> {
        let key = format!("{REQUEST_PREFIX}{id}");
        self.records.save(&key, request, Some(RECORD_TTL))
    }

    pub fn get_result(&self, id: TaskId) -> Result<Option<StoredResult>, DatabaseError> {
        self.records.restore(&format!("{RESULT_PREFIX}{id}"))
    }

    pub fn get_request(&self, id: GroupId) -> Result<Option<RequestRecord>, DatabaseError> {
        self.records.restore(&format!("{REQUEST_PREFIX}{id}"))
    }

    /// Walk results newest first. The seek point for `to_date` is
    /// approximate (decimal ids are not zero-padded), so every row is
    /// re-checked against the parsed id; once a row is older than
    /// `from_date` the scan stops for good.
    pub fn list_results(&self, params: &ListParams) -> Vec<ResultSummary> {
        let limit = match params.limit {
            0 => PAGE_LIMIT,
            limit => limit.min(MAX_PAGE_LIMIT),
        };

        let upper = match params.to_date {
            Some(to_date) => format!("{RESULT_PREFIX}{to_date}"),
            None => format!("{RESULT_PREFIX}{SCAN_CEILING}"),
        };

        let mut rows = Vec::with_capacity(limit.min(PAGE_LIMIT));
        let mut to_skip = params.offset;

        for (key, json) in self.records.scan_range_rev(RESULT_PREFIX, &upper) {
            let Some(id) = key
                .strip_prefix(RESULT_PREFIX)
                .and_then(|id| id.parse::<TaskId>().ok())
            else {
                continue;
            };
            if params.to_date.is_some_and(|to_date| id > to_date) {
                continue;
            }
            if params.from_date.is_some_and(|from_date| id < from_date) {
                break;
            }

            let summary = match serde_json::from_slice::<StoredResult>(&json) {
                Ok(StoredResult::Grouped(index)) => {
                    // group indexes carry no agent and never match a
                    // target filter
                    if params.targets.is_some() {
                        continue;
                    }
                    ResultSummary {
                        id,
                        agent: index,
                        status: ResultStatus::Success,
                    }
                }
                Ok(StoredResult::Record(record)) => {
                    if params
                        .targets
                        .as_ref()
                        .is_some_and(|targets| !targets.contains(&record.agent))
                    {
                        continue;
                    }
                    ResultSummary {
                        id,
                        agent: record.agent.to_string(),
                        status: classify(&record.response),
                    }
                }
                Err(e) => {
                    tracing::error!("malformed result record under `{key}`: {e}");
                    continue;
                }
            };

            if to_skip > 0 {
                to_skip -= 1;
                continue;
            }

            rows.push(summary);
            if rows.len() >= limit {
                break;
            }
        }

        rows
    }

    /// Drop expired rows; run periodically.
    pub fn sweep(&self) -> Result<usize, DatabaseError> {
        self.records.sweep()
    }
}

fn classify(response: &TaskResponse) -> ResultStatus {
    if response.internal_error == InternalError::Ok && response.task_error.is_empty() {
        ResultStatus::Success
    } else if !response.task_error.is_empty() {
        ResultStatus::Error
    } else {
        ResultStatus::InternalError
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn scratch_store() -> (tempfile::TempDir, ResultsStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = ResultsStore::new(JsonTree::new(db.open_tree("records").unwrap()));
        (dir, store)
    }

    fn agent(s: &str) -> AgentId {
        AgentId::from_str(s).unwrap()
    }

    fn response(task_id: TaskId, group_id: GroupId) -> TaskResponse {
        TaskResponse {
            task_id,
            group_id,
            output: b"{}".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_group_index_accumulates_in_arrival_order() {
        let (_dir, store) = scratch_store();
        let group = 1000;

        store.store_result(agent("web-1"), &response(1, group)).unwrap();
        store.store_result(agent("web-2"), &response(2, group)).unwrap();

        let Some(StoredResult::Grouped(index)) = store.get_result(group).unwrap() else {
            panic!("expected a group index under res:{group}");
        };
        assert_eq!(index, "grouped:1,2");

        // both full records are readable
        for id in [1, 2] {
            assert!(matches!(
                store.get_result(id).unwrap(),
                Some(StoredResult::Record(_))
            ));
        }
    }

    #[test]
    fn test_ungrouped_results_skip_the_index() {
        let (_dir, store) = scratch_store();
        store.store_result(agent("web-1"), &response(5, 0)).unwrap();
        assert!(store.get_result(0).unwrap().is_none());
    }

    #[test]
    fn test_request_round_trip() {
        let (_dir, store) = scratch_store();
        let record = RequestRecord {
            task_name: "disk:usage".into(),
            connected_targets: vec![agent("web-1")],
            disconnected_targets: vec![agent("db-1")],
        };
        store.store_request(77, &record).unwrap();

        let back = store.get_request(77).unwrap().unwrap();
        assert_eq!(back.task_name, "disk:usage");
        assert_eq!(back.connected_targets, vec![agent("web-1")]);
        assert_eq!(back.disconnected_targets, vec![agent("db-1")]);
    }

    #[test]
    fn test_list_results_newest_first_with_bounds() {
        let (_dir, store) = scratch_store();
        for id in [10, 20, 30, 40] {
            store.store_result(agent("web-1"), &response(id, 0)).unwrap();
        }

        let rows = store.list_results(&ListParams::default());
        let ids: Vec<TaskId> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![40, 30, 20, 10]);

        // to_date is inclusive; from_date stops the reverse scan
        let rows = store.list_results(&ListParams {
            from_date: Some(20),
            to_date: Some(30),
            ..Default::default()
        });
        let ids: Vec<TaskId> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![30, 20]);

        // a to_date between ids lands on an approximate key and must
        // not leak newer entries
        let rows = store.list_results(&ListParams {
            to_date: Some(25),
            ..Default::default()
        });
        let ids: Vec<TaskId> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![20, 10]);

        let rows = store.list_results(&ListParams {
            offset: 1,
            limit: 2,
            ..Default::default()
        });
        let ids: Vec<TaskId> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![30, 20]);
    }

    #[test]
    fn test_list_results_filters_targets() {
        let (_dir, store) = scratch_store();
        store.store_result(agent("web-1"), &response(1, 0)).unwrap();
        store.store_result(agent("db-1"), &response(2, 0)).unwrap();
        store.store_result(agent("web-1"), &response(3, 100)).unwrap();

        let rows = store.list_results(&ListParams {
            targets: Some(vec![agent("web-1")]),
            ..Default::default()
        });
        let ids: Vec<TaskId> = rows.iter().map(|r| r.id).collect();
        // the group index under res:100 is filtered out with targets
        assert_eq!(ids, vec![3, 1]);
        assert!(rows.iter().all(|r| r.agent == "web-1"));
    }

    #[test]
    fn test_list_results_status_classification() {
        let (_dir, store) = scratch_store();
        store.store_result(agent("web-1"), &response(1, 0)).unwrap();
        store
            .store_result(
                agent("web-1"),
                &TaskResponse {
                    task_id: 2,
                    task_error: "exit status 2".into(),
                    retcode: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .store_result(
                agent("web-1"),
                &TaskResponse::internal(3, 0, InternalError::Timeout),
            )
            .unwrap();

        let rows = store.list_results(&ListParams::default());
        let statuses: Vec<ResultStatus> = rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ResultStatus::InternalError,
                ResultStatus::Error,
                ResultStatus::Success
            ]
        );
    }
}
