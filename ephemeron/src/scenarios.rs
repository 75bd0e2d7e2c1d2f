//! Canonical weak-map workloads.
//!
//! Each scenario drives a fresh [`Runtime`] through a fixed sequence of
//! mutations and collections and checks the observable table state after
//! every cycle. The CLI runs them by name and the benchmarks reuse them.

use std::{cell::Cell, fmt, rc::Rc};

use heap::{GcStats, HeapError, HeapSettings, StepResult};
use object::{TableSize, Value};

use crate::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Dead keys are cleared, live keys keep their values.
    Weakness,
    /// Weakening a handle clears dependent entries one cycle later.
    TwoCycle,
    /// 32 inserts grow the table to 128; losing every key shrinks it to 32.
    GrowShrink,
    /// One key overwritten with 32 values on evacuation candidates.
    CompactValues,
    /// 32 keys on evacuation candidates, looked up across three cycles.
    CompactKeys,
    /// A map blackened by incremental marking must not outlive its scope.
    IncrementalAbort,
    /// Mixed inserts, deletes, incremental and compacting cycles.
    Stress,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::Weakness,
        Scenario::TwoCycle,
        Scenario::GrowShrink,
        Scenario::CompactValues,
        Scenario::CompactKeys,
        Scenario::IncrementalAbort,
        Scenario::Stress,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::Weakness => "weakness",
            Scenario::TwoCycle => "two-cycle",
            Scenario::GrowShrink => "grow-shrink",
            Scenario::CompactValues => "compact-values",
            Scenario::CompactKeys => "compact-keys",
            Scenario::IncrementalAbort => "incremental-abort",
            Scenario::Stress => "stress",
        }
    }
}

#[derive(Debug)]
pub enum ScenarioError {
    Heap(HeapError),
    Check(String),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::Heap(err) => write!(f, "heap error: {err}"),
            ScenarioError::Check(message) => write!(f, "check failed: {message}"),
        }
    }
}

impl std::error::Error for ScenarioError {}

impl From<HeapError> for ScenarioError {
    fn from(err: HeapError) -> Self {
        ScenarioError::Heap(err)
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    /// Statistics of every cycle, in order.
    pub cycles: Vec<GcStats>,
    /// Size of the scenario's main table at the end.
    pub final_size: TableSize,
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = |pick: fn(&GcStats) -> usize| self.cycles.iter().map(pick).sum::<usize>();
        write!(
            f,
            "{:<18} {:>3} cycles  cleared {:>5}  evacuated {:>5}  swept {:>6}  \
             final ({}, {}, {})",
            self.scenario.name(),
            self.cycles.len(),
            total(|s| s.cleared_entries),
            total(|s| s.evacuated),
            total(|s| s.swept),
            self.final_size.element_count,
            self.final_size.deleted_count,
            self.final_size.capacity,
        )
    }
}

/// Knobs for a scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    pub settings: HeapSettings,
    /// Rounds of the stress scenario.
    pub iterations: usize,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            settings: HeapSettings::default(),
            iterations: 50,
        }
    }
}

pub fn run(scenario: Scenario, options: &ScenarioOptions) -> Result<ScenarioReport, ScenarioError> {
    log::info!("running scenario {}", scenario.name());
    let mut rt = Runtime::new(options.settings.clone());
    let mut cycles = Vec::new();
    let final_size = match scenario {
        Scenario::Weakness => weakness(&mut rt, &mut cycles)?,
        Scenario::TwoCycle => two_cycle(&mut rt, &mut cycles)?,
        Scenario::GrowShrink => grow_shrink(&mut rt, &mut cycles)?,
        Scenario::CompactValues => compact_values(&mut rt, &mut cycles)?,
        Scenario::CompactKeys => compact_keys(&mut rt, &mut cycles)?,
        Scenario::IncrementalAbort => incremental_abort(&mut rt, &mut cycles)?,
        Scenario::Stress => stress(&mut rt, &mut cycles, options.iterations)?,
    };
    Ok(ScenarioReport {
        scenario,
        cycles,
        final_size,
    })
}

// ── Checks ────────────────────────────────────────────────────────────

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioError::Check(message()))
    }
}

fn expect_size(
    rt: &Runtime,
    map: Value,
    expected: (usize, usize, usize),
    context: &str,
) -> Result<TableSize, ScenarioError> {
    let size = rt.weak_collection_size(map)?;
    let actual = (size.element_count, size.deleted_count, size.capacity);
    ensure(actual == expected, || {
        format!("{context}: table size {actual:?}, expected {expected:?}")
    })?;
    Ok(size)
}

/// Root at `depth` from the top of the stack.
fn root(rt: &Runtime, depth: usize) -> Result<Value, ScenarioError> {
    rt.peek(depth)
        .ok_or_else(|| ScenarioError::Check(format!("missing root at depth {depth}")))
}

/// Looks up `key` and checks that the value's tag field matches.
fn expect_tagged(rt: &Runtime, map: Value, key: Value, tag: i64) -> Result<(), ScenarioError> {
    let value = rt
        .weak_collection_get(map, key)?
        .ok_or_else(|| ScenarioError::Check(format!("key with tag {tag} lost")))?;
    let found = rt.field(value, 0)?;
    ensure(found == Value::from_i64(tag), || {
        format!("value for tag {tag} holds {found:?}")
    })
}

// ── Scenarios ─────────────────────────────────────────────────────────

fn weakness(rt: &mut Runtime, cycles: &mut Vec<GcStats>) -> Result<TableSize, ScenarioError> {
    let map = rt.create_weak_collection()?;
    rt.push(map);
    let key = rt.allocate_object(&[])?;
    rt.push(key);
    // reachable only through the entry
    let held = rt.allocate_object(&[Value::from_i64(1)])?;
    rt.weak_collection_set(map, key, held)?;

    for _ in 0..8 {
        let key = rt.allocate_object(&[])?;
        let value = rt.allocate_object(&[key])?;
        rt.weak_collection_set(map, key, value)?;
    }
    expect_size(rt, map, (9, 0, 32), "after inserts")?;

    let stats = rt.run_collection(false);
    cycles.push(stats);
    ensure(stats.cleared_entries == 8, || {
        format!("cleared {} entries, expected 8", stats.cleared_entries)
    })?;

    let (map, key) = (root(rt, 1)?, root(rt, 0)?);
    expect_tagged(rt, map, key, 1)?;
    expect_size(rt, map, (1, 8, 32), "after collection")
}

fn two_cycle(rt: &mut Runtime, cycles: &mut Vec<GcStats>) -> Result<TableSize, ScenarioError> {
    let map = rt.create_weak_collection()?;
    rt.push(map);
    let key = rt.allocate_object(&[])?;
    let a = rt.allocate_object(&[])?;
    let b = rt.allocate_object(&[])?;
    rt.weak_collection_set(map, key, a)?;
    rt.weak_collection_set(map, a, b)?;

    let handle = rt.create_global(key);
    let fired = Rc::new(Cell::new(0));

    cycles.push(rt.run_collection(false));
    let map = root(rt, 0)?;
    ensure(fired.get() == 0, || "callback fired while strong".to_string())?;
    expect_size(rt, map, (2, 0, 32), "strong handle")?;

    let counter = fired.clone();
    rt.make_handle_weak(handle, 0, move |_, _| counter.set(counter.get() + 1))?;

    cycles.push(rt.run_collection(false));
    let map = root(rt, 0)?;
    ensure(fired.get() == 1, || {
        format!("callback fired {} times after weakening", fired.get())
    })?;
    ensure(rt.global(handle)?.is_none(), || "handle not cleared".to_string())?;
    expect_size(rt, map, (2, 0, 32), "first cycle after weakening")?;

    cycles.push(rt.run_collection(false));
    let map = root(rt, 0)?;
    ensure(fired.get() == 1, || "callback fired twice".to_string())?;
    rt.destroy_global(handle)?;
    expect_size(rt, map, (0, 2, 32), "second cycle after weakening")
}

fn grow_shrink(rt: &mut Runtime, cycles: &mut Vec<GcStats>) -> Result<TableSize, ScenarioError> {
    let map = rt.create_weak_collection()?;
    rt.push(map);
    expect_size(rt, map, (0, 0, 32), "fresh table")?;

    for tag in 0..32 {
        let key = rt.allocate_object(&[])?;
        rt.push(key);
        rt.weak_collection_set(map, key, Value::from_i64(tag))?;
    }
    expect_size(rt, map, (32, 0, 128), "after growth")?;

    cycles.push(rt.run_collection(false));
    let map = rt.stack[0];
    expect_size(rt, map, (32, 0, 128), "keys still rooted")?;

    rt.stack.truncate(1);
    let stats = rt.run_collection(false);
    cycles.push(stats);
    ensure(stats.shrunk_tables == 1, || {
        format!("shrunk {} tables, expected 1", stats.shrunk_tables)
    })?;
    let map = rt.stack[0];
    expect_size(rt, map, (0, 32, 32), "after shrink")
}

fn compact_values(rt: &mut Runtime, cycles: &mut Vec<GcStats>) -> Result<TableSize, ScenarioError> {
    let map = rt.create_weak_collection()?;
    rt.push(map);
    let key = rt.allocate_object(&[])?;
    rt.push(key);
    for tag in 0..32 {
        let value = rt.allocate_object(&[Value::from_i64(tag)])?;
        rt.weak_collection_set(map, key, value)?;
    }

    for cycle in 0..3 {
        cycles.push(rt.run_collection(true));
        let (map, key) = (root(rt, 1)?, root(rt, 0)?);
        expect_tagged(rt, map, key, 31)?;
        expect_size(rt, map, (1, 0, 32), &format!("cycle {cycle}"))?;
    }
    let map = root(rt, 1)?;
    Ok(rt.weak_collection_size(map)?)
}

fn compact_keys(rt: &mut Runtime, cycles: &mut Vec<GcStats>) -> Result<TableSize, ScenarioError> {
    let map = rt.create_weak_collection()?;
    rt.push(map);
    for tag in 0..32 {
        let key = rt.allocate_object(&[Value::from_i64(tag)])?;
        rt.push(key);
        let value = rt.allocate_object(&[Value::from_i64(tag)])?;
        rt.weak_collection_set(map, key, value)?;
    }

    for cycle in 0..3 {
        cycles.push(rt.run_collection(true));
        let map = rt.stack[0];
        for (tag, &key) in rt.stack[1..].iter().enumerate() {
            let tag = tag as i64;
            ensure(rt.field(key, 0)? == Value::from_i64(tag), || {
                format!("cycle {cycle}: key {tag} corrupted")
            })?;
            expect_tagged(rt, map, key, tag)?;
        }
        expect_size(rt, map, (32, 0, 128), &format!("cycle {cycle}"))?;
    }
    Ok(rt.weak_collection_size(rt.stack[0])?)
}

fn incremental_abort(
    rt: &mut Runtime,
    cycles: &mut Vec<GcStats>,
) -> Result<TableSize, ScenarioError> {
    let key = rt.allocate_object(&[])?;
    rt.push(key);

    // a scope that creates a map, lets marking blacken it, then drops it
    {
        let map = rt.create_weak_collection()?;
        rt.push(map);
        let value = rt.allocate_object(&[])?;
        rt.weak_collection_set(map, key, value)?;
        rt.simulate_incremental_marking();
        rt.pop();
    }
    cycles.push(rt.run_collection(false));
    ensure(rt.heap.object_count() == 1, || {
        format!("{} objects survive, expected only the key", rt.heap.object_count())
    })?;
    ensure(rt.heap.backing_entries() == 0, || {
        format!("{} backing entries still charged", rt.heap.backing_entries())
    })?;

    // the other way round: the map survives, its key loses its last root
    // after marking already reached it
    let map = rt.create_weak_collection()?;
    rt.push(map);
    let key = root(rt, 1)?;
    rt.weak_collection_set(map, key, Value::from_i64(7))?;
    rt.simulate_incremental_marking();
    rt.stack.remove(0);
    cycles.push(rt.run_collection(false));
    let map = root(rt, 0)?;
    expect_size(rt, map, (0, 1, 32), "key dropped after marking")
}

/// A key and a value whose first fields carry the same fresh tag.
fn tagged_pair(rt: &mut Runtime, next_tag: &mut i64) -> Result<(Value, Value), ScenarioError> {
    let tag = Value::from_i64(*next_tag);
    *next_tag += 1;
    let key = rt.allocate_object(&[tag])?;
    let value = rt.allocate_object(&[tag])?;
    Ok((key, value))
}

fn stress(
    rt: &mut Runtime,
    cycles: &mut Vec<GcStats>,
    iterations: usize,
) -> Result<TableSize, ScenarioError> {
    let map = rt.create_weak_collection()?;
    rt.push(map);
    let mut next_tag = 0;

    for round in 0..iterations {
        let map = rt.stack[0];
        for n in 0..16 {
            let (key, value) = tagged_pair(rt, &mut next_tag)?;
            rt.weak_collection_set(map, key, value)?;
            if n % 2 == 0 {
                rt.push(key);
            }
        }
        if round % 3 == 2 && rt.stack.len() > 1 {
            let key = rt.stack.remove(1);
            if round % 2 == 0 {
                rt.weak_collection_delete(map, key)?;
            }
        }

        let stats = match round % 4 {
            0 => rt.run_collection(false),
            1 => {
                rt.start_incremental_marking();
                rt.incremental_marking_step(8);
                // insert behind the marker
                let (key, value) = tagged_pair(rt, &mut next_tag)?;
                rt.push(key);
                rt.weak_collection_set(map, key, value)?;
                while rt.incremental_marking_step(8) == StepResult::MoreWork {}
                rt.finish_incremental_collection()
            }
            2 => rt.run_collection(true),
            _ => {
                rt.start_incremental_marking();
                rt.incremental_marking_step(1);
                rt.abort_incremental_marking();
                rt.run_collection(false)
            }
        };
        cycles.push(stats);

        let map = rt.stack[0];
        for &key in &rt.stack[1..] {
            let tag = rt.field(key, 0)?;
            let tag = tag.as_fixnum().ok_or_else(|| {
                ScenarioError::Check(format!("round {round}: key tag {tag:?} is not a fixnum"))
            })?;
            expect_tagged(rt, map, key, tag)?;
        }
        let size = rt.weak_collection_size(map)?;
        let rooted = rt.stack.len() - 1;
        ensure(size.element_count == rooted, || {
            format!(
                "round {round}: {} entries for {rooted} rooted keys",
                size.element_count
            )
        })?;
        log::debug!("stress round {round}: {size:?}");
    }
    Ok(rt.weak_collection_size(rt.stack[0])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ScenarioOptions {
        ScenarioOptions {
            settings: HeapSettings {
                page_cells: 32,
                max_pages: 512,
                verify_heap: true,
                ..HeapSettings::default()
            },
            iterations: 24,
        }
    }

    fn run_ok(scenario: Scenario) -> ScenarioReport {
        match run(scenario, &options()) {
            Ok(report) => report,
            Err(err) => panic!("{}: {err}", scenario.name()),
        }
    }

    #[test]
    fn test_weakness_clears_dead_keys() {
        let report = run_ok(Scenario::Weakness);
        assert_eq!(report.cycles[0].cleared_entries, 8);
    }

    #[test]
    fn test_weakening_a_handle_takes_two_cycles() {
        let report = run_ok(Scenario::TwoCycle);
        let cleared: Vec<_> = report.cycles.iter().map(|s| s.cleared_entries).collect();
        assert_eq!(cleared, vec![0, 0, 2]);
        let handles: Vec<_> = report.cycles.iter().map(|s| s.cleared_handles).collect();
        assert_eq!(handles, vec![0, 1, 0]);
    }

    #[test]
    fn test_growth_then_shrink() {
        let report = run_ok(Scenario::GrowShrink);
        assert_eq!(
            report.final_size,
            TableSize {
                element_count: 0,
                deleted_count: 32,
                capacity: 32
            }
        );
    }

    #[test]
    fn test_values_on_candidates_survive_compaction() {
        let report = run_ok(Scenario::CompactValues);
        assert!(report.cycles.iter().all(|s| s.evacuated > 0));
        assert!(report.cycles.iter().all(|s| s.updated_slots > 0));
    }

    #[test]
    fn test_keys_on_candidates_survive_compaction() {
        let report = run_ok(Scenario::CompactKeys);
        assert_eq!(report.cycles.len(), 3);
        assert!(report.cycles.iter().all(|s| s.evacuated >= 64));
    }

    #[test]
    fn test_compaction_scenarios_pass_without_compaction() {
        let mut options = options();
        options.settings.never_compact = true;
        for scenario in [Scenario::CompactValues, Scenario::CompactKeys] {
            let report = run(scenario, &options).unwrap();
            assert!(report.cycles.iter().all(|s| s.evacuated == 0));
        }
    }

    #[test]
    fn test_aborted_marking_does_not_leak_black_maps() {
        run_ok(Scenario::IncrementalAbort);
    }

    #[test]
    fn test_stress_keeps_rooted_entries() {
        let report = run_ok(Scenario::Stress);
        assert_eq!(report.cycles.len(), 24);
        assert!(report.cycles.iter().any(|s| s.evacuated > 0));
        assert!(report.cycles.iter().map(|s| s.cleared_entries).sum::<usize>() > 0);
    }

    #[test]
    fn test_every_scenario_passes_with_default_settings() {
        let options = ScenarioOptions {
            iterations: 8,
            ..ScenarioOptions::default()
        };
        for scenario in Scenario::ALL {
            if let Err(err) = run(scenario, &options) {
                panic!("{}: {err}", scenario.name());
            }
        }
    }

    #[test]
    fn test_report_mentions_scenario_name() {
        let report = run_ok(Scenario::Weakness);
        assert!(report.to_string().starts_with("weakness"));
    }
}
