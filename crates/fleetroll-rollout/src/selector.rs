//! Batch selection: which instances a run targets.
//!
//! Selection is a pure function of the instance records and the target
//! policy. The requested total is split across regions in proportion to
//! each region's eligible pool; the integer remainder goes one at a time
//! to regions in descending pool size (ties broken by region name), and
//! within a region the lowest instance ids are taken first. Identical
//! inputs therefore always produce the identical batch.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use fleetroll_state::{InstanceKey, InstanceRecord, InstanceStatus, RolloutSize, TargetPolicy};

use crate::error::{RolloutError, RolloutResult};

/// Statuses a run may pick up.
pub fn eligible_statuses(redeploy: bool) -> Vec<InstanceStatus> {
    let mut statuses = vec![
        InstanceStatus::Unmanaged,
        InstanceStatus::Pending,
        InstanceStatus::Failed,
        InstanceStatus::Skipped,
    ];
    if redeploy {
        statuses.push(InstanceStatus::Succeeded);
    }
    statuses
}

/// Per-region share of a selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegionQuota {
    pub eligible: u32,
    pub selected: u32,
}

/// The batch chosen for one run.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    /// Ordered by region, then instance id.
    pub instances: Vec<InstanceRecord>,
    pub quotas: BTreeMap<String, RegionQuota>,
    /// Size the policy asked for before capping at the eligible pool.
    pub requested: u32,
    pub eligible: u32,
    /// `requested - selected` when the pool was too small.
    pub shortfall: u32,
    pub eligible_statuses: Vec<InstanceStatus>,
}

impl Selection {
    pub fn keys(&self) -> Vec<InstanceKey> {
        self.instances.iter().map(InstanceRecord::table_key).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Reject sizes that can never select anything.
pub fn validate_size(size: RolloutSize) -> RolloutResult<()> {
    match size {
        RolloutSize::Count(0) => Err(RolloutError::InvalidPolicy(
            "count must be at least 1".to_string(),
        )),
        RolloutSize::Percent(0) => Err(RolloutError::InvalidPolicy(
            "percent must be at least 1".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Choose the batch for `policy` out of `records`.
///
/// Records outside the policy's region/account filter or in a
/// non-eligible status are ignored, so callers may pass the whole fleet.
pub fn select_batch(records: &[InstanceRecord], policy: &TargetPolicy) -> RolloutResult<Selection> {
    validate_size(policy.size)?;

    let statuses = eligible_statuses(policy.redeploy);
    let filter = policy.filter();

    let mut pools: BTreeMap<String, Vec<&InstanceRecord>> = BTreeMap::new();
    for record in records {
        if filter.matches(record) && statuses.contains(&record.status) {
            pools.entry(record.region.clone()).or_default().push(record);
        }
    }
    for pool in pools.values_mut() {
        pool.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    }

    let eligible: u64 = pools.values().map(|p| p.len() as u64).sum();
    let requested = requested_total(policy.size, eligible);
    let effective = requested.min(eligible);

    let mut quotas: BTreeMap<String, RegionQuota> = pools
        .iter()
        .map(|(region, pool)| {
            let n = pool.len() as u64;
            let base = match policy.size {
                RolloutSize::Percent(p) => (n * u64::from(p) / 100).min(n),
                RolloutSize::Count(_) => effective * n / eligible,
            };
            (
                region.clone(),
                RegionQuota {
                    eligible: n as u32,
                    selected: base as u32,
                },
            )
        })
        .collect();

    let assigned: u64 = quotas.values().map(|q| u64::from(q.selected)).sum();
    distribute_remainder(&mut quotas, effective.saturating_sub(assigned));

    let mut instances = Vec::with_capacity(effective as usize);
    for (region, pool) in &pools {
        let take = quotas.get(region).map(|q| q.selected as usize).unwrap_or(0);
        instances.extend(pool.iter().take(take).map(|r| (*r).clone()));
    }

    let selection = Selection {
        requested: clamp_u32(requested),
        eligible: clamp_u32(eligible),
        shortfall: clamp_u32(requested - effective),
        instances,
        quotas,
        eligible_statuses: statuses,
    };

    debug!(
        size = %policy.size,
        eligible = selection.eligible,
        requested = selection.requested,
        selected = selection.len(),
        shortfall = selection.shortfall,
        "batch selected"
    );

    Ok(selection)
}

/// Total the policy asks for. Percentages round half up.
fn requested_total(size: RolloutSize, eligible: u64) -> u64 {
    match size {
        RolloutSize::Count(n) => u64::from(n),
        RolloutSize::Percent(p) => (eligible * u64::from(p) + 50) / 100,
    }
}

/// Hand out `remaining` slots one at a time, largest pools first.
fn distribute_remainder(quotas: &mut BTreeMap<String, RegionQuota>, mut remaining: u64) {
    let mut order: Vec<String> = quotas.keys().cloned().collect();
    // Stable sort keeps the BTreeMap's name order among equal pools.
    order.sort_by_key(|region| std::cmp::Reverse(quotas[region].eligible));

    while remaining > 0 {
        let mut progressed = false;
        for region in &order {
            if remaining == 0 {
                break;
            }
            let Some(quota) = quotas.get_mut(region) else {
                continue;
            };
            if quota.selected < quota.eligible {
                quota.selected += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(region: &str, count: usize, status: InstanceStatus) -> Vec<InstanceRecord> {
        (0..count)
            .map(|i| InstanceRecord::new(&format!("i-{region}-{i:03}"), region, "prod", status))
            .collect()
    }

    fn per_region(selection: &Selection) -> BTreeMap<String, u32> {
        selection
            .quotas
            .iter()
            .map(|(r, q)| (r.clone(), q.selected))
            .collect()
    }

    #[test]
    fn count_splits_proportionally() {
        let mut records = fleet("r1", 60, InstanceStatus::Pending);
        records.extend(fleet("r2", 40, InstanceStatus::Pending));

        let selection = select_batch(&records, &TargetPolicy::new(RolloutSize::Count(10))).unwrap();
        let split = per_region(&selection);
        assert_eq!(split["r1"], 6);
        assert_eq!(split["r2"], 4);
        assert_eq!(selection.len(), 10);
        assert_eq!(selection.shortfall, 0);
    }

    #[test]
    fn percent_rounds_half_up_and_picks_lowest_ids() {
        let records = vec![
            InstanceRecord::new("i-c", "r1", "prod", InstanceStatus::Pending),
            InstanceRecord::new("i-a", "r1", "prod", InstanceStatus::Pending),
            InstanceRecord::new("i-b", "r1", "prod", InstanceStatus::Pending),
        ];
        let selection =
            select_batch(&records, &TargetPolicy::new(RolloutSize::Percent(50))).unwrap();
        let ids: Vec<_> = selection.instances.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, ["i-a", "i-b"]);
    }

    #[test]
    fn percent_total_across_regions_matches_rounded_pool() {
        let mut records = fleet("r-a", 5, InstanceStatus::Pending);
        records.extend(fleet("r-b", 5, InstanceStatus::Pending));
        records.extend(fleet("r-c", 3, InstanceStatus::Pending));

        let selection =
            select_batch(&records, &TargetPolicy::new(RolloutSize::Percent(50))).unwrap();
        // round(13 * 0.5) = 7
        assert_eq!(selection.len(), 7);
        let split = per_region(&selection);
        // Bases 2/2/1, remainder 2 to the two largest pools by name.
        assert_eq!(split["r-a"], 3);
        assert_eq!(split["r-b"], 3);
        assert_eq!(split["r-c"], 1);
    }

    #[test]
    fn selection_is_deterministic() {
        let mut records = fleet("r1", 7, InstanceStatus::Pending);
        records.extend(fleet("r2", 11, InstanceStatus::Failed));
        let policy = TargetPolicy::new(RolloutSize::Count(9));

        let first = select_batch(&records, &policy).unwrap().keys();
        records.reverse();
        let second = select_batch(&records, &policy).unwrap().keys();
        assert_eq!(first, second);
    }

    #[test]
    fn count_larger_than_pool_reports_shortfall() {
        let records = fleet("r1", 4, InstanceStatus::Pending);
        let selection = select_batch(&records, &TargetPolicy::new(RolloutSize::Count(10))).unwrap();
        assert_eq!(selection.len(), 4);
        assert_eq!(selection.requested, 10);
        assert_eq!(selection.shortfall, 6);
    }

    #[test]
    fn remainder_skips_exhausted_regions() {
        let mut records = fleet("big", 9, InstanceStatus::Pending);
        records.extend(fleet("tiny", 1, InstanceStatus::Pending));
        // 9 of 10: tiny's base is 0, big's is 8; the single leftover goes to big.
        let selection = select_batch(&records, &TargetPolicy::new(RolloutSize::Count(9))).unwrap();
        let split = per_region(&selection);
        assert_eq!(split["big"], 9);
        assert_eq!(split["tiny"], 0);
    }

    #[test]
    fn ineligible_statuses_are_ignored() {
        let mut records = fleet("r1", 3, InstanceStatus::Succeeded);
        records.extend(fleet("r2", 2, InstanceStatus::Dispatched));
        records.extend(fleet("r3", 2, InstanceStatus::Skipped));

        let selection =
            select_batch(&records, &TargetPolicy::new(RolloutSize::Percent(100))).unwrap();
        assert_eq!(selection.eligible, 2);
        assert!(selection.instances.iter().all(|r| r.region == "r3"));

        let mut redeploy = TargetPolicy::new(RolloutSize::Percent(100));
        redeploy.redeploy = true;
        let selection = select_batch(&records, &redeploy).unwrap();
        assert_eq!(selection.eligible, 5);
        assert!(
            selection
                .instances
                .iter()
                .all(|r| r.status != InstanceStatus::Dispatched)
        );
    }

    #[test]
    fn region_and_account_filters_apply() {
        let mut records = fleet("r1", 4, InstanceStatus::Pending);
        records.extend(fleet("r2", 4, InstanceStatus::Pending));
        records.push(InstanceRecord::new("i-other", "r1", "staging", InstanceStatus::Pending));

        let mut policy = TargetPolicy::new(RolloutSize::Percent(100));
        policy.regions = vec!["r1".to_string()];
        policy.accounts = vec!["prod".to_string()];

        let selection = select_batch(&records, &policy).unwrap();
        assert_eq!(selection.len(), 4);
        assert!(selection.instances.iter().all(|r| r.region == "r1" && r.account == "prod"));
    }

    #[test]
    fn zero_size_is_rejected() {
        let records = fleet("r1", 4, InstanceStatus::Pending);
        assert!(matches!(
            select_batch(&records, &TargetPolicy::new(RolloutSize::Count(0))),
            Err(RolloutError::InvalidPolicy(_))
        ));
        assert!(matches!(
            select_batch(&records, &TargetPolicy::new(RolloutSize::Percent(0))),
            Err(RolloutError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let selection = select_batch(&[], &TargetPolicy::new(RolloutSize::Percent(50))).unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.shortfall, 0);

        let selection = select_batch(&[], &TargetPolicy::new(RolloutSize::Count(3))).unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.shortfall, 3);
    }

    #[test]
    fn output_is_ordered_by_region_then_id() {
        let mut records = fleet("us-west-2", 3, InstanceStatus::Pending);
        records.extend(fleet("eu-west-1", 3, InstanceStatus::Pending));
        let selection =
            select_batch(&records, &TargetPolicy::new(RolloutSize::Percent(100))).unwrap();
        let keys = selection.keys();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
