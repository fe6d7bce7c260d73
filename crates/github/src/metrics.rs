/// CI/CD aggregates over a page of workflow runs
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{RunConclusion, WorkflowRun};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub by_conclusion: HashMap<RunConclusion, usize>,
    /// Percentage of completed runs that succeeded, `None` with nothing completed
    pub success_rate: Option<f64>,
    pub mean_duration_secs: Option<f64>,
}

impl RunMetrics {
    pub fn from_runs(runs: &[WorkflowRun]) -> Self {
        let mut metrics = RunMetrics {
            total: runs.len(),
            ..Default::default()
        };

        let mut durations = Vec::new();
        for run in runs {
            if !run.is_completed() {
                metrics.in_progress += 1;
                continue;
            }
            metrics.completed += 1;
            let conclusion = run.conclusion.unwrap_or(RunConclusion::Unknown);
            *metrics.by_conclusion.entry(conclusion).or_default() += 1;
            if let Some(duration) = run.duration() {
                durations.push(duration.num_milliseconds() as f64 / 1000.0);
            }
        }

        if metrics.completed > 0 {
            let successes = metrics.count(RunConclusion::Success);
            metrics.success_rate = Some(successes as f64 * 100.0 / metrics.completed as f64);
        }
        if !durations.is_empty() {
            metrics.mean_duration_secs = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        metrics
    }

    pub fn count(&self, conclusion: RunConclusion) -> usize {
        self.by_conclusion.get(&conclusion).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunStatus;
    use chrono::{Duration, TimeZone, Utc};

    fn run(id: u64, status: RunStatus, conclusion: Option<RunConclusion>, minutes: i64) -> WorkflowRun {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        WorkflowRun {
            id,
            name: Some("CI".to_string()),
            workflow_id: 7,
            run_number: id,
            head_branch: Some("main".to_string()),
            head_sha: format!("{:040x}", id),
            event: "push".to_string(),
            status: Some(status),
            conclusion,
            html_url: format!("https://github.com/o/r/actions/runs/{}", id),
            created_at,
            updated_at: created_at + Duration::minutes(minutes),
            run_started_at: None,
        }
    }

    #[test]
    fn test_metrics_over_mixed_runs() {
        let runs = vec![
            run(1, RunStatus::Completed, Some(RunConclusion::Success), 2),
            run(2, RunStatus::Completed, Some(RunConclusion::Success), 4),
            run(3, RunStatus::Completed, Some(RunConclusion::Failure), 6),
            run(4, RunStatus::Completed, Some(RunConclusion::Cancelled), 0),
            run(5, RunStatus::InProgress, None, 1),
        ];
        let metrics = RunMetrics::from_runs(&runs);

        assert_eq!(metrics.total, 5);
        assert_eq!(metrics.completed, 4);
        assert_eq!(metrics.in_progress, 1);
        assert_eq!(metrics.count(RunConclusion::Success), 2);
        assert_eq!(metrics.count(RunConclusion::Failure), 1);
        assert_eq!(metrics.success_rate, Some(50.0));
        assert_eq!(metrics.mean_duration_secs, Some(180.0));
    }

    #[test]
    fn test_empty_runs() {
        let metrics = RunMetrics::from_runs(&[]);
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.success_rate, None);
        assert_eq!(metrics.mean_duration_secs, None);
    }
}
