//! Run and fleet summaries, read straight from the state store.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use fleetroll_state::{
    epoch_millis, InstanceFilter, InstanceRecord, InstanceStatus, RunId, StateResult, StateStore,
};

use crate::error::{RolloutError, RolloutResult};

/// Instance counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unmanaged: u32,
    pub pending: u32,
    pub dispatched: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl StatusCounts {
    pub fn add(&mut self, status: InstanceStatus) {
        match status {
            InstanceStatus::Unmanaged => self.unmanaged += 1,
            InstanceStatus::Pending => self.pending += 1,
            InstanceStatus::Dispatched => self.dispatched += 1,
            InstanceStatus::Succeeded => self.succeeded += 1,
            InstanceStatus::Failed => self.failed += 1,
            InstanceStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &StatusCounts) {
        self.unmanaged += other.unmanaged;
        self.pending += other.pending;
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> u32 {
        self.unmanaged
            + self.pending
            + self.dispatched
            + self.succeeded
            + self.failed
            + self.skipped
    }

    /// Instances without a working agent.
    pub fn uninstalled(&self) -> u32 {
        self.unmanaged + self.pending + self.failed
    }

    pub fn get(&self, status: InstanceStatus) -> u32 {
        match status {
            InstanceStatus::Unmanaged => self.unmanaged,
            InstanceStatus::Pending => self.pending,
            InstanceStatus::Dispatched => self.dispatched,
            InstanceStatus::Succeeded => self.succeeded,
            InstanceStatus::Failed => self.failed,
            InstanceStatus::Skipped => self.skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub instance_id: String,
    pub region: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionSummary {
    pub region: String,
    pub counts: StatusCounts,
    pub failures: Vec<FailureDetail>,
}

/// Per-region status counts, for one run or the whole fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Set for run reports.
    pub run_id: Option<RunId>,
    pub generated_at: u64,
    /// Ordered by region name.
    pub regions: Vec<RegionSummary>,
    pub totals: StatusCounts,
}

impl Summary {
    /// A summary with no instances, for runs that never got to report.
    pub fn empty(run_id: Option<RunId>) -> Self {
        Self::build(run_id, Vec::new())
    }

    fn build(
        run_id: Option<RunId>,
        entries: Vec<(String, InstanceStatus, Option<&InstanceRecord>)>,
    ) -> Self {
        let mut regions: BTreeMap<String, RegionSummary> = BTreeMap::new();
        for (region, status, record) in entries {
            let summary = regions.entry(region.clone()).or_insert_with(|| RegionSummary {
                region,
                counts: StatusCounts::default(),
                failures: Vec::new(),
            });
            summary.counts.add(status);
            if status == InstanceStatus::Failed {
                if let Some(record) = record {
                    summary.failures.push(FailureDetail {
                        instance_id: record.instance_id.clone(),
                        region: record.region.clone(),
                        error: record
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
            }
        }

        let mut totals = StatusCounts::default();
        for summary in regions.values() {
            totals.merge(&summary.counts);
        }

        Summary {
            run_id,
            generated_at: epoch_millis(),
            regions: regions.into_values().collect(),
            totals,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &FailureDetail> {
        self.regions.iter().flat_map(|r| r.failures.iter())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct Reporter {
    store: StateStore,
}

impl Reporter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Summary of one run's batch.
    ///
    /// Every selected instance is counted exactly once, so the totals add
    /// up to the batch size. An instance the run never got to (abort,
    /// declined confirmation, lost claim) or that a later run has since
    /// taken over counts as `skipped`.
    pub fn report_run(&self, run_id: &str) -> RolloutResult<Summary> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| RolloutError::RunNotFound(run_id.to_string()))?;

        let mut records = Vec::with_capacity(run.selected_instances.len());
        for key in &run.selected_instances {
            records.push((key, self.store.get_instance(key)?));
        }

        let entries = records
            .iter()
            .map(|(key, record)| match record {
                Some(r) if r.last_run_id.as_deref() == Some(run_id) => {
                    (r.region.clone(), r.status, Some(r))
                }
                Some(r) => (r.region.clone(), InstanceStatus::Skipped, None),
                None => (region_of(key), InstanceStatus::Skipped, None),
            })
            .collect();

        Ok(Summary::build(Some(run_id.to_string()), entries))
    }

    /// Current status of every instance matching `filter`.
    pub fn report_fleet(&self, filter: &InstanceFilter) -> StateResult<Summary> {
        let records = self.store.list_instances(filter)?;
        let entries = records
            .iter()
            .map(|r| (r.region.clone(), r.status, Some(r)))
            .collect();
        Ok(Summary::build(None, entries))
    }
}

fn region_of(key: &str) -> String {
    key.split_once('/')
        .map(|(region, _)| region.to_string())
        .unwrap_or_default()
}

fn cell(count: u32, total: u32) -> String {
    if total == 0 {
        return "0".to_string();
    }
    format!("{count} ({:.1}%)", f64::from(count) * 100.0 / f64::from(total))
}

/// Plain-text table: one row per region plus a totals row, then failures.
pub fn format_table(summary: &Summary) -> String {
    const COLUMNS: [(&str, InstanceStatus); 6] = [
        ("SUCCEEDED", InstanceStatus::Succeeded),
        ("FAILED", InstanceStatus::Failed),
        ("SKIPPED", InstanceStatus::Skipped),
        ("DISPATCHED", InstanceStatus::Dispatched),
        ("PENDING", InstanceStatus::Pending),
        ("UNMANAGED", InstanceStatus::Unmanaged),
    ];

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut header = vec!["REGION".to_string(), "TOTAL".to_string()];
    header.extend(COLUMNS.iter().map(|(name, _)| name.to_string()));
    header.push("UNINSTALLED".to_string());
    rows.push(header);

    let row = |label: &str, counts: &StatusCounts| {
        let total = counts.total();
        let mut row = vec![label.to_string(), total.to_string()];
        row.extend(COLUMNS.iter().map(|(_, status)| cell(counts.get(*status), total)));
        row.push(cell(counts.uninstalled(), total));
        row
    };
    for region in &summary.regions {
        rows.push(row(&region.region, &region.counts));
    }
    rows.push(row("TOTAL", &summary.totals));

    let widths: Vec<usize> = (0..rows[0].len())
        .map(|i| rows.iter().map(|r| r[i].len()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    if let Some(run_id) = &summary.run_id {
        let _ = writeln!(out, "Run {run_id}");
    }
    for row in &rows {
        let line: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(value, width)| format!("{value:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }

    let failures: Vec<&FailureDetail> = summary.failures().collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\nFailures ({}):", failures.len());
        for failure in failures {
            let _ = writeln!(
                out,
                "  {}/{}: {}",
                failure.region, failure.instance_id, failure.error
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetroll_state::{RolloutRun, RolloutSize, RunOutcome, TargetPolicy};

    fn record(id: &str, region: &str, status: InstanceStatus, run: Option<&str>) -> InstanceRecord {
        let mut r = InstanceRecord::new(id, region, "prod", status);
        r.last_run_id = run.map(str::to_string);
        if status == InstanceStatus::Failed {
            r.last_error = Some(format!("{id} broke"));
        }
        r
    }

    fn run_with(store: &StateStore, run_id: &str, selected: &[&InstanceRecord]) {
        store
            .put_run(&RolloutRun {
                run_id: run_id.to_string(),
                policy: TargetPolicy::new(RolloutSize::Count(selected.len() as u32)),
                dry_run: false,
                started_at: 1,
                ended_at: Some(2),
                lock_token: "t".to_string(),
                selected_instances: selected.iter().map(|r| r.table_key()).collect(),
                shortfall: 0,
                outcome: RunOutcome::Completed,
            })
            .unwrap();
    }

    #[test]
    fn run_report_counts_every_selected_instance_once() {
        let store = StateStore::open_in_memory().unwrap();
        let ok = record("i-1", "r1", InstanceStatus::Succeeded, Some("run-1"));
        let bad = record("i-2", "r2", InstanceStatus::Failed, Some("run-1"));
        let untouched = record("i-3", "r2", InstanceStatus::Pending, None);
        let bystander = record("i-4", "r1", InstanceStatus::Pending, None);
        for r in [&ok, &bad, &untouched, &bystander] {
            store.upsert_instance(r, None).unwrap();
        }
        run_with(&store, "run-1", &[&ok, &bad, &untouched]);

        let summary = Reporter::new(store).report_run("run-1").unwrap();
        assert_eq!(summary.totals.total(), 3);
        assert_eq!(summary.totals.succeeded, 1);
        assert_eq!(summary.totals.failed, 1);
        assert_eq!(summary.totals.skipped, 1);

        let failures: Vec<_> = summary.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, "i-2 broke");
        assert_eq!(summary.regions[0].region, "r1");
    }

    #[test]
    fn unknown_run() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            Reporter::new(store).report_run("run-x"),
            Err(RolloutError::RunNotFound(_))
        ));
    }

    #[test]
    fn fleet_report_groups_by_region() {
        let store = StateStore::open_in_memory().unwrap();
        for r in [
            record("i-1", "r1", InstanceStatus::Succeeded, Some("run-1")),
            record("i-2", "r1", InstanceStatus::Unmanaged, None),
            record("i-3", "r2", InstanceStatus::Failed, Some("run-1")),
            record("i-4", "r2", InstanceStatus::Pending, None),
        ] {
            store.upsert_instance(&r, None).unwrap();
        }

        let summary = Reporter::new(store.clone())
            .report_fleet(&InstanceFilter::all())
            .unwrap();
        assert_eq!(summary.run_id, None);
        assert_eq!(summary.regions.len(), 2);
        assert_eq!(summary.totals.total(), 4);
        assert_eq!(summary.totals.uninstalled(), 3);

        let r2 = Reporter::new(store)
            .report_fleet(&InstanceFilter::all().region("r2"))
            .unwrap();
        assert_eq!(r2.totals.total(), 2);
    }

    #[test]
    fn table_shows_percentages_and_failures() {
        let store = StateStore::open_in_memory().unwrap();
        for r in [
            record("i-1", "r1", InstanceStatus::Succeeded, None),
            record("i-2", "r1", InstanceStatus::Succeeded, None),
            record("i-3", "r1", InstanceStatus::Succeeded, None),
            record("i-4", "r1", InstanceStatus::Failed, None),
        ] {
            store.upsert_instance(&r, None).unwrap();
        }
        let summary = Reporter::new(store).report_fleet(&InstanceFilter::all()).unwrap();
        let table = format_table(&summary);
        assert!(table.contains("REGION"));
        assert!(table.contains("3 (75.0%)"));
        assert!(table.contains("1 (25.0%)"));
        assert!(table.contains("r1/i-4: i-4 broke"));
    }

    #[test]
    fn json_output_is_structured() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .upsert_instance(&record("i-1", "r1", InstanceStatus::Pending, None), None)
            .unwrap();
        let summary = Reporter::new(store).report_fleet(&InstanceFilter::all()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(value["totals"]["pending"], 1);
        assert_eq!(value["regions"][0]["region"], "r1");
    }
}
