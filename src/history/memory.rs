use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    clamp_limit, parse_max_age_days, CaseStatus, HistoryStore, Result, RunPage, RunQuery,
    RunStatus, TestCaseRunRecord, TestRunRecord,
};

/// In-memory `HistoryStore` for hermetic tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    runs: Mutex<Vec<(TestRunRecord, Vec<TestCaseRunRecord>)>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn save_run(&self, run: TestRunRecord, cases: Vec<TestCaseRunRecord>) -> Result<()> {
        self.runs.lock().push((run, cases));
        Ok(())
    }

    async fn get_run_by_id(&self, run_id: &str) -> Result<Option<(TestRunRecord, Vec<TestCaseRunRecord>)>> {
        Ok(self
            .runs
            .lock()
            .iter()
            .find(|(r, _)| r.id == run_id)
            .cloned())
    }

    async fn get_runs(&self, project: &str, query: RunQuery) -> Result<RunPage> {
        let limit = clamp_limit(query.limit);
        let since_ms = query
            .days
            .map(|d| chrono::Utc::now().timestamp_millis() - d as i64 * 86_400_000);

        let mut matched: Vec<TestRunRecord> = self
            .runs
            .lock()
            .iter()
            .map(|(r, _)| r.clone())
            .filter(|r| r.project == project)
            .filter(|r| query.status.map_or(true, |s| s == r.status))
            .filter(|r| since_ms.map_or(true, |t| r.timestamp_ms >= t))
            .collect();
        matched.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(query.offset as usize)
            .take(limit as usize)
            .collect();

        Ok(RunPage { runs: page, total })
    }

    async fn get_runs_in_date_range(
        &self,
        project: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<TestRunRecord>> {
        let mut runs: Vec<TestRunRecord> = self
            .runs
            .lock()
            .iter()
            .map(|(r, _)| r.clone())
            .filter(|r| r.project == project && r.timestamp_ms >= start_ms && r.timestamp_ms <= end_ms)
            .collect();
        runs.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(runs)
    }

    async fn get_cases_for_run(&self, run_id: &str) -> Result<Vec<TestCaseRunRecord>> {
        Ok(self
            .runs
            .lock()
            .iter()
            .find(|(r, _)| r.id == run_id)
            .map(|(_, cases)| cases.clone())
            .unwrap_or_default())
    }

    async fn get_case_history(
        &self,
        case_name: &str,
        project: &str,
        limit: u32,
        suite_id: Option<&str>,
    ) -> Result<Vec<TestCaseRunRecord>> {
        let limit = clamp_limit(limit);
        let runs = self.runs.lock();
        let mut ordered: Vec<&(TestRunRecord, Vec<TestCaseRunRecord>)> =
            runs.iter().filter(|(r, _)| r.project == project).collect();
        ordered.sort_by(|a, b| b.0.timestamp_ms.cmp(&a.0.timestamp_ms));

        let mut out = Vec::new();
        for (_, cases) in ordered {
            for case in cases {
                if case.case_name == case_name
                    && suite_id.map_or(true, |s| s == case.suite_id)
                {
                    out.push(case.clone());
                    if out.len() as u32 >= limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_distinct_case_names(
        &self,
        project: &str,
        suite_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<String>> {
        let limit = limit.unwrap_or(1000) as usize;
        let mut names = Vec::new();
        for (run, cases) in self.runs.lock().iter() {
            if run.project != project {
                continue;
            }
            for case in cases {
                if suite_id.map_or(true, |s| s == case.suite_id) && !names.contains(&case.case_name) {
                    names.push(case.case_name.clone());
                    if names.len() >= limit {
                        return Ok(names);
                    }
                }
            }
        }
        Ok(names)
    }

    async fn cleanup(&self, project: &str, max_age: &str, max_runs: u32) -> Result<u64> {
        let mut runs = self.runs.lock();
        let before = runs.len();

        if let Some(days) = parse_max_age_days(max_age) {
            let cutoff = chrono::Utc::now().timestamp_millis() - days * 86_400_000;
            runs.retain(|(r, _)| r.project != project || r.timestamp_ms >= cutoff);
        }

        let mut project_indices: Vec<usize> = runs
            .iter()
            .enumerate()
            .filter(|(_, (r, _))| r.project == project)
            .map(|(i, _)| i)
            .collect();
        project_indices.sort_by_key(|&i| std::cmp::Reverse(runs[i].0.timestamp_ms));
        let keep: std::collections::HashSet<usize> = project_indices
            .into_iter()
            .take(max_runs as usize)
            .collect();

        let mut idx = 0usize;
        runs.retain(|(r, _)| {
            let keep_this = r.project != project || keep.contains(&idx);
            idx += 1;
            keep_this
        });

        Ok((before - runs.len()) as u64)
    }

    async fn close(&self) -> Result<()> {
        self.runs.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{CaseStatus as _CaseStatus, Trigger};

    fn run(id: &str, ts: i64, status: RunStatus) -> (TestRunRecord, Vec<TestCaseRunRecord>) {
        (
            TestRunRecord {
                id: id.to_string(),
                project: "proj".to_string(),
                timestamp_ms: ts,
                git_commit: None,
                git_branch: None,
                config_hash: "h".to_string(),
                trigger: Trigger::Cli,
                duration_ms: 1,
                passed: 1,
                failed: 0,
                skipped: 0,
                flaky: 0,
                status,
            },
            vec![],
        )
    }

    #[tokio::test]
    async fn get_runs_orders_descending_and_clamps_limit() {
        let store = InMemoryHistoryStore::new();
        for i in 0..3 {
            let (r, c) = run(&format!("r{i}"), i, RunStatus::Passed);
            store.save_run(r, c).await.unwrap();
        }
        let page = store
            .get_runs("proj", RunQuery { status: None, days: None, limit: 0, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.runs.len(), 1); // clamped to 1
        assert_eq!(page.runs[0].id, "r2");
    }
}
