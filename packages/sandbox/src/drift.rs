// ABOUTME: Pure drift detection between stored sandbox records and a substrate snapshot
// ABOUTME: Classifies each sandbox into at most one drift and proposes, never applies, a fix

use crate::substrate::{SubstrateSnapshot, Workload, WorkloadPhase};
use chrono::{DateTime, Duration, Utc};
use liteboxd_storage::lifecycle::{can_transition, transition_path};
use liteboxd_storage::{DesiredState, DriftType, FixAction, LifecycleStatus, Sandbox};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    /// How long a new (or re-created) sandbox may lack a workload
    pub creation_grace: Duration,
    /// How long a phase/status disagreement must persist
    pub stale_threshold: Duration,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            creation_grace: Duration::seconds(600),
            stale_threshold: Duration::seconds(60),
        }
    }
}

/// One proposed fix for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftItem {
    pub sandbox_id: String,
    pub drift_type: DriftType,
    pub action: FixAction,
    pub detail: String,
    /// Record revision at detection time; `None` when no record exists
    pub observed_revision: Option<i64>,
    /// Lifecycle status proposed by a stale-status fix
    pub target_status: Option<LifecycleStatus>,
    pub observed_phase: Option<WorkloadPhase>,
    pub observed_ip: Option<String>,
}

impl DriftItem {
    fn new(
        sandbox_id: &str,
        drift_type: DriftType,
        action: FixAction,
        detail: String,
        record: Option<&Sandbox>,
        workload: Option<&Workload>,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            drift_type,
            action,
            detail,
            observed_revision: record.map(|r| r.revision),
            target_status: None,
            observed_phase: workload.map(|w| w.phase),
            observed_ip: workload.and_then(|w| w.ip.clone()),
        }
    }
}

/// Compare `records` against `snapshot` as of `now`.
///
/// Deterministic: the same inputs always give the same items, sorted by
/// sandbox id, with at most one item per id. Priority when several rules
/// match is expired, orphan, missing, stale. An incomplete snapshot proves
/// nothing about absence, so absence-based rules are skipped.
pub fn detect(
    records: &[Sandbox],
    snapshot: &SubstrateSnapshot,
    now: DateTime<Utc>,
    settings: &DetectorSettings,
) -> Vec<DriftItem> {
    let by_id: BTreeMap<&str, &Sandbox> = records.iter().map(|r| (r.id.as_str(), r)).collect();
    let workloads: BTreeMap<&str, &Workload> = snapshot
        .workloads
        .iter()
        .map(|w| (w.id.as_str(), w))
        .collect();

    let ids: BTreeSet<&str> = by_id.keys().chain(workloads.keys()).copied().collect();

    ids.into_iter()
        .filter_map(|id| {
            classify(
                id,
                by_id.get(id).copied(),
                workloads.get(id).copied(),
                !snapshot.incomplete,
                now,
                settings,
            )
        })
        .collect()
}

fn classify(
    id: &str,
    record: Option<&Sandbox>,
    workload: Option<&Workload>,
    complete: bool,
    now: DateTime<Utc>,
    settings: &DetectorSettings,
) -> Option<DriftItem> {
    if let Some(r) = record {
        if r.desired_state != DesiredState::Deleted && r.is_expired(now) {
            return Some(DriftItem::new(
                id,
                DriftType::Expired,
                FixAction::MarkDeleted,
                format!("expired at {}", r.expires_at.to_rfc3339()),
                record,
                workload,
            ));
        }
    }

    if let Some(w) = workload {
        match record {
            None => {
                return Some(DriftItem::new(
                    id,
                    DriftType::OrphanInSubstrate,
                    FixAction::Terminate,
                    format!("no record for workload, pod_phase={}", w.phase),
                    record,
                    workload,
                ));
            }
            Some(r)
                if r.desired_state == DesiredState::Deleted
                    && w.phase != WorkloadPhase::Terminating =>
            {
                return Some(DriftItem::new(
                    id,
                    DriftType::OrphanInSubstrate,
                    FixAction::Terminate,
                    format!("desired_state=deleted, pod_phase={}", w.phase),
                    record,
                    workload,
                ));
            }
            _ => {}
        }
    }

    let r = record?;

    match workload {
        None if complete => missing_or_gone(id, r, now, settings),
        None => None,
        Some(w) => stale_phase(id, r, w, now, settings),
    }
}

/// Absence rules: a wanted sandbox lost its workload, or a going-away
/// sandbox has finished going.
fn missing_or_gone(
    id: &str,
    r: &Sandbox,
    now: DateTime<Utc>,
    settings: &DetectorSettings,
) -> Option<DriftItem> {
    use LifecycleStatus::*;

    let winding_down = matches!(r.lifecycle_status, Terminating | Terminated);

    if r.desired_state == DesiredState::Running && !winding_down {
        // a pending record restarts its window when it is (re)created
        let anchor = if r.lifecycle_status == Pending {
            r.created_at.max(r.updated_at)
        } else {
            r.created_at
        };
        if anchor + settings.creation_grace > now {
            return None;
        }
        return Some(DriftItem::new(
            id,
            DriftType::MissingInSubstrate,
            FixAction::Recreate,
            format!(
                "desired_state=running, db_status={}, no workload since {}",
                r.lifecycle_status,
                anchor.to_rfc3339()
            ),
            Some(r),
            None,
        ));
    }

    let gone = (r.desired_state == DesiredState::Deleted && r.lifecycle_status != Terminated)
        || r.lifecycle_status == Terminating;
    if gone && can_transition(r.lifecycle_status, Terminated) {
        let mut item = DriftItem::new(
            id,
            DriftType::StaleStatus,
            FixAction::UpdateStatus,
            format!("db_status={}, workload absent", r.lifecycle_status),
            Some(r),
            None,
        );
        item.target_status = Some(Terminated);
        return Some(item);
    }

    None
}

fn stale_phase(
    id: &str,
    r: &Sandbox,
    w: &Workload,
    now: DateTime<Utc>,
    settings: &DetectorSettings,
) -> Option<DriftItem> {
    let observed = w.phase.lifecycle()?;
    if observed == r.lifecycle_status
        || now - w.last_transition_at < settings.stale_threshold
        || transition_path(r.lifecycle_status, observed).is_none()
    {
        return None;
    }

    let mut item = DriftItem::new(
        id,
        DriftType::StaleStatus,
        FixAction::UpdateStatus,
        format!("db_status={}, pod_phase={}", r.lifecycle_status, w.phase),
        Some(r),
        Some(w),
    );
    item.target_status = Some(observed);
    Some(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(id: &str, desired: DesiredState, status: LifecycleStatus, age_secs: i64) -> Sandbox {
        let created_at = now() - Duration::seconds(age_secs);
        Sandbox {
            id: id.to_string(),
            template_name: Some("web".to_string()),
            template_version: Some(1),
            image: "nginx:1.27".to_string(),
            cpu: "500m".to_string(),
            memory: "512Mi".to_string(),
            ttl_seconds: 3600,
            env: HashMap::new(),
            desired_state: desired,
            lifecycle_status: status,
            status_reason: None,
            pod_phase: None,
            pod_ip: None,
            last_seen_at: None,
            revision: 3,
            created_at,
            expires_at: created_at + Duration::seconds(3600),
            updated_at: created_at,
            deleted_at: None,
        }
    }

    fn workload(id: &str, phase: WorkloadPhase, since_secs: i64) -> Workload {
        Workload {
            id: id.to_string(),
            phase,
            ip: Some("10.0.0.7".to_string()),
            last_transition_at: now() - Duration::seconds(since_secs),
        }
    }

    fn snapshot(workloads: Vec<Workload>) -> SubstrateSnapshot {
        SubstrateSnapshot {
            workloads,
            incomplete: false,
            warnings: vec![],
            taken_at: now(),
        }
    }

    fn run(records: &[Sandbox], snap: &SubstrateSnapshot) -> Vec<DriftItem> {
        detect(records, snap, now(), &DetectorSettings::default())
    }

    #[test]
    fn test_in_sync_sandbox_has_no_drift() {
        let records = vec![record("a", DesiredState::Running, LifecycleStatus::Running, 60)];
        let snap = snapshot(vec![workload("a", WorkloadPhase::Running, 30)]);
        assert!(run(&records, &snap).is_empty());
    }

    #[test]
    fn test_missing_workload_past_grace() {
        let records = vec![record("a", DesiredState::Running, LifecycleStatus::Running, 600)];
        let items = run(&records, &snapshot(vec![]));

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].drift_type, DriftType::MissingInSubstrate);
        assert_eq!(items[0].action, FixAction::Recreate);
        assert_eq!(items[0].observed_revision, Some(3));
    }

    #[test]
    fn test_missing_workload_inside_grace_is_ignored() {
        let records = vec![record("a", DesiredState::Running, LifecycleStatus::Pending, 599)];
        assert!(run(&records, &snapshot(vec![])).is_empty());
    }

    #[test]
    fn test_recreated_pending_record_restarts_grace() {
        let mut r = record("a", DesiredState::Running, LifecycleStatus::Pending, 3000);
        r.updated_at = now() - Duration::seconds(30);
        assert!(run(&[r], &snapshot(vec![])).is_empty());
    }

    #[test]
    fn test_orphan_without_record() {
        let snap = snapshot(vec![workload("x", WorkloadPhase::Running, 5)]);
        let items = run(&[], &snap);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sandbox_id, "x");
        assert_eq!(items[0].drift_type, DriftType::OrphanInSubstrate);
        assert_eq!(items[0].action, FixAction::Terminate);
        assert_eq!(items[0].observed_revision, None);
    }

    #[test]
    fn test_deleted_record_with_live_workload_is_orphan() {
        let records = vec![record("a", DesiredState::Deleted, LifecycleStatus::Running, 60)];
        let snap = snapshot(vec![workload("a", WorkloadPhase::Running, 30)]);
        let items = run(&records, &snap);
        assert_eq!(items[0].drift_type, DriftType::OrphanInSubstrate);

        // already going away: nothing to terminate, status follows the phase
        let snap = snapshot(vec![workload("a", WorkloadPhase::Terminating, 120)]);
        let items = run(&records, &snap);
        assert_eq!(items[0].drift_type, DriftType::StaleStatus);
        assert_eq!(items[0].target_status, Some(LifecycleStatus::Terminating));
    }

    #[test]
    fn test_expired_wins_over_everything() {
        let records = vec![record("a", DesiredState::Running, LifecycleStatus::Running, 7200)];
        let items = run(&records, &snapshot(vec![]));

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].drift_type, DriftType::Expired);
        assert_eq!(items[0].action, FixAction::MarkDeleted);
    }

    #[test]
    fn test_stale_status_needs_threshold() {
        let records = vec![record("a", DesiredState::Running, LifecycleStatus::Pending, 120)];

        let fresh = snapshot(vec![workload("a", WorkloadPhase::Running, 10)]);
        assert!(run(&records, &fresh).is_empty());

        let old = snapshot(vec![workload("a", WorkloadPhase::Running, 60)]);
        let items = run(&records, &old);
        assert_eq!(items[0].drift_type, DriftType::StaleStatus);
        assert_eq!(items[0].target_status, Some(LifecycleStatus::Running));
        assert_eq!(items[0].observed_phase, Some(WorkloadPhase::Running));
        assert_eq!(items[0].detail, "db_status=pending, pod_phase=Running");
    }

    #[test]
    fn test_stale_status_skips_illegal_edges_and_unknown() {
        let records = vec![
            record("a", DesiredState::Running, LifecycleStatus::Running, 120),
            record("b", DesiredState::Running, LifecycleStatus::Running, 120),
        ];
        let snap = snapshot(vec![
            // running -> pending is not an edge
            workload("a", WorkloadPhase::Pending, 100),
            workload("b", WorkloadPhase::Unknown, 100),
        ]);
        assert!(run(&records, &snap).is_empty());
    }

    #[test]
    fn test_failed_record_follows_workload_that_came_up() {
        let records = vec![
            record("a", DesiredState::Running, LifecycleStatus::Error, 900),
            record("b", DesiredState::Running, LifecycleStatus::Error, 900),
        ];
        let snap = snapshot(vec![
            workload("a", WorkloadPhase::Running, 600),
            workload("b", WorkloadPhase::Failed, 600),
        ]);
        let items = run(&records, &snap);

        // b already agrees with its workload
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sandbox_id, "a");
        assert_eq!(items[0].drift_type, DriftType::StaleStatus);
        assert_eq!(items[0].target_status, Some(LifecycleStatus::Running));
        assert_eq!(items[0].detail, "db_status=error, pod_phase=Running");
    }

    #[test]
    fn test_exited_workload_maps_to_terminal_statuses() {
        let records = vec![
            record("a", DesiredState::Running, LifecycleStatus::Running, 120),
            record("b", DesiredState::Running, LifecycleStatus::Running, 120),
        ];
        let snap = snapshot(vec![
            workload("a", WorkloadPhase::Succeeded, 100),
            workload("b", WorkloadPhase::Failed, 100),
        ]);
        let targets: Vec<_> = run(&records, &snap)
            .into_iter()
            .map(|i| (i.sandbox_id, i.target_status))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("a".to_string(), Some(LifecycleStatus::Terminated)),
                ("b".to_string(), Some(LifecycleStatus::Error)),
            ]
        );
    }

    #[test]
    fn test_deleted_record_without_workload_becomes_terminated() {
        let records = vec![
            record("a", DesiredState::Deleted, LifecycleStatus::Terminating, 60),
            record("b", DesiredState::Deleted, LifecycleStatus::Pending, 60),
        ];
        let items = run(&records, &snapshot(vec![]));

        assert_eq!(items.len(), 2);
        for item in &items {
            assert_eq!(item.drift_type, DriftType::StaleStatus);
            assert_eq!(item.target_status, Some(LifecycleStatus::Terminated));
        }
    }

    #[test]
    fn test_incomplete_snapshot_suppresses_absence_rules() {
        let records = vec![
            record("a", DesiredState::Running, LifecycleStatus::Running, 900),
            record("b", DesiredState::Deleted, LifecycleStatus::Terminating, 900),
            record("c", DesiredState::Running, LifecycleStatus::Pending, 900),
        ];
        let mut snap = snapshot(vec![workload("c", WorkloadPhase::Running, 300)]);
        snap.incomplete = true;

        let items = run(&records, &snap);
        // only the observed sandbox can drift
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].sandbox_id, "c");
        assert_eq!(items[0].drift_type, DriftType::StaleStatus);
    }

    #[test]
    fn test_detection_is_idempotent_and_sorted() {
        let records = vec![
            record("d", DesiredState::Running, LifecycleStatus::Running, 900),
            record("b", DesiredState::Running, LifecycleStatus::Running, 7200),
            record("a", DesiredState::Deleted, LifecycleStatus::Running, 60),
        ];
        let snap = snapshot(vec![
            workload("c", WorkloadPhase::Running, 5),
            workload("a", WorkloadPhase::Running, 5),
        ]);

        let first = run(&records, &snap);
        let second = run(&records, &snap);
        assert_eq!(first, second);

        let ids: Vec<_> = first.iter().map(|i| i.sandbox_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        let kinds: Vec<_> = first.iter().map(|i| i.drift_type).collect();
        assert_eq!(
            kinds,
            vec![
                DriftType::OrphanInSubstrate,
                DriftType::Expired,
                DriftType::OrphanInSubstrate,
                DriftType::MissingInSubstrate,
            ]
        );
    }
}
