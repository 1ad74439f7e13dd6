use std::cmp::Ordering;

use crate::models::{Resources, Runner, RunnerState};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Orders the runners that can take `resources`, best candidate first.
///
/// A candidate is `ready`, not in `exclude`, and has at least the requested free capacity on
/// every dimension. Candidates are ranked by [`Runner::load`], ties broken by runner id.
pub fn rank_candidates(
    runners: impl IntoIterator<Item = Runner>,
    resources: &Resources,
    exclude: &[String],
) -> Vec<Runner> {
    let mut candidates: Vec<Runner> = runners
        .into_iter()
        .filter(|runner| runner.state == RunnerState::Ready)
        .filter(|runner| !exclude.contains(&runner.id))
        .filter(|runner| resources.fits_within(&runner.available()))
        .collect();

    candidates.sort_by(compare_load);
    candidates
}

fn compare_load(a: &Runner, b: &Runner) -> Ordering {
    a.load().total_cmp(&b.load()).then_with(|| a.id.cmp(&b.id))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::RunnerApiVersion;

    fn runner(id: &str, allocated: Resources) -> Runner {
        let now = Utc::now();
        Runner {
            id: id.to_string(),
            region_id: "eu".to_string(),
            api_url: format!("http://{id}"),
            api_key: "key".to_string(),
            api_version: RunnerApiVersion::V0,
            capacity: Resources::new(8, 16, 100),
            allocated,
            capacity_version: 0,
            state: RunnerState::Ready,
            consecutive_failures: 0,
            last_checked_at: None,
            unresponsive_since: None,
            region_credential_version: None,
            created_at: now,
            modified_at: now,
        }
    }

    fn ids(runners: &[Runner]) -> Vec<&str> {
        runners.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_rank_prefers_least_loaded_then_id() {
        let runners = vec![
            runner("r3", Resources::default()),
            runner("r2", Resources::new(4, 2, 10)),
            runner("r1", Resources::default()),
        ];

        let ranked = rank_candidates(runners, &Resources::new(1, 1, 1), &[]);
        assert_eq!(ids(&ranked), vec!["r1", "r3", "r2"]);
    }

    #[test]
    fn test_rank_is_independent_of_input_order() {
        let a = vec![
            runner("r1", Resources::new(2, 2, 2)),
            runner("r2", Resources::new(2, 2, 2)),
        ];
        let b = a.iter().rev().cloned().collect::<Vec<_>>();

        let request = Resources::new(1, 1, 1);
        assert_eq!(
            ids(&rank_candidates(a, &request, &[])),
            ids(&rank_candidates(b, &request, &[]))
        );
    }

    #[test]
    fn test_rank_filters_state_capacity_and_exclusions() {
        let mut disabled = runner("r1", Resources::default());
        disabled.state = RunnerState::Disabled;
        let full = runner("r2", Resources::new(8, 1, 1));
        let excluded = runner("r3", Resources::default());
        let ok = runner("r4", Resources::new(6, 0, 0));

        let ranked = rank_candidates(
            vec![disabled, full, excluded, ok],
            &Resources::new(2, 4, 10),
            &["r3".to_string()],
        );
        assert_eq!(ids(&ranked), vec!["r4"]);
    }

    #[test]
    fn test_rank_requires_every_dimension() {
        let runners = vec![runner("r1", Resources::new(0, 0, 95))];
        assert!(rank_candidates(runners, &Resources::new(1, 1, 10), &[]).is_empty());
    }
}
