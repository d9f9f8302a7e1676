//! Work item lifecycle: `pending → queued → processing → {completed, failed}`
//! and `failed → queued` while retries remain. Nothing else is reachable.

use chrono::{DateTime, Utc};

use leadgen_common::{PipelineError, PipelineResult, ScrapeQueueWorkItem, WorkStatus};

/// The full transition table. Guards that depend on the item (retry budget)
/// are checked in [`transition`].
pub fn can_transition(from: WorkStatus, to: WorkStatus) -> bool {
    use WorkStatus::*;
    matches!(
        (from, to),
        (Pending, Queued)
            | (Queued, Processing)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Failed, Queued)
    )
}

/// Move `item` to `to`, stamping the timestamps that belong to the new state.
/// Entering `processing` bumps the attempt counter.
pub fn transition(
    item: &mut ScrapeQueueWorkItem,
    to: WorkStatus,
    now: DateTime<Utc>,
) -> PipelineResult<()> {
    let from = item.status;
    if !can_transition(from, to) {
        return Err(PipelineError::InvalidTransition { from, to });
    }
    if from == WorkStatus::Failed && !item.has_retries_left() {
        return Err(PipelineError::InvalidTransition { from, to });
    }

    match to {
        WorkStatus::Queued => {
            item.queued_at = Some(now);
            item.next_retry_at = None;
        }
        WorkStatus::Processing => {
            item.attempt += 1;
            item.started_at = Some(now);
            item.completed_at = None;
        }
        WorkStatus::Completed | WorkStatus::Failed => {
            item.completed_at = Some(now);
        }
        WorkStatus::Pending => {}
    }
    item.status = to;
    item.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadgen_common::{SourceType, WorkItemKey};
    use uuid::Uuid;

    const ALL: [WorkStatus; 5] = [
        WorkStatus::Pending,
        WorkStatus::Queued,
        WorkStatus::Processing,
        WorkStatus::Completed,
        WorkStatus::Failed,
    ];

    fn item(status: WorkStatus) -> ScrapeQueueWorkItem {
        let now = Utc::now();
        ScrapeQueueWorkItem {
            id: Uuid::new_v4(),
            key: WorkItemKey {
                zip_code: "78701".into(),
                state: "TX".into(),
                source_type: SourceType::GoogleMaps,
                profession: "plumber".into(),
            },
            status,
            priority: 0,
            attempt: 0,
            consecutive_failures: 0,
            max_retries: 5,
            permanent_failure: false,
            last_error: None,
            records_found: 0,
            queued_at: None,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[test]
    fn exhaustive_transition_table() {
        let allowed = [
            (WorkStatus::Pending, WorkStatus::Queued),
            (WorkStatus::Queued, WorkStatus::Processing),
            (WorkStatus::Processing, WorkStatus::Completed),
            (WorkStatus::Processing, WorkStatus::Failed),
            (WorkStatus::Failed, WorkStatus::Queued),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(can_transition(from, to), expected, "{from} -> {to}");

                let mut it = item(from);
                let result = transition(&mut it, to, Utc::now());
                assert_eq!(result.is_ok(), expected, "{from} -> {to}");
                if !expected {
                    assert_eq!(it.status, from, "rejected transition must not mutate");
                }
            }
        }
    }

    #[test]
    fn exhausted_item_cannot_requeue() {
        let mut it = item(WorkStatus::Failed);
        it.consecutive_failures = 5;
        assert!(matches!(
            transition(&mut it, WorkStatus::Queued, Utc::now()),
            Err(PipelineError::InvalidTransition { .. })
        ));

        let mut permanent = item(WorkStatus::Failed);
        permanent.permanent_failure = true;
        assert!(transition(&mut permanent, WorkStatus::Queued, Utc::now()).is_err());
    }

    #[test]
    fn claiming_bumps_attempt() {
        let mut it = item(WorkStatus::Queued);
        transition(&mut it, WorkStatus::Processing, Utc::now()).unwrap();
        assert_eq!(it.attempt, 1);
        assert!(it.started_at.is_some());
    }
}
