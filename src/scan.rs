//! The scan executor: drives a whole table select.
//!
//! For each plan step the executor first attempts an index strategy; when
//! none applies it narrows the program window to the step's instruction
//! range and evaluates records sequentially with the cheapest executor
//! [`crate::specialize`] hands back. Without a plan at all, the entire
//! program runs sequentially.

use serde::{Deserialize, Serialize};

use crate::access::{FulltextMode, FulltextOpt, RangeQuery, TableProvider, TableResolver};
use crate::exec::specialize;
use crate::plan::{build_plan, ScanStep, StepArg};
use crate::vm::{score_value, EvalContext};
use crate::{
    Combinator, Error, Num, Operator, ProcedureRegistry, Program, ResultSet, Result, TypedValue,
    NIL_RECORD,
};

/// Tunables for plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Let full-text index lookups skip records below the smallest id
    /// already accumulated when intersecting.
    pub enable_min_id_skip: bool,
    /// Range strategies are skipped when intersecting into fewer active
    /// records than this fraction of the table.
    pub too_many_index_match_ratio: f64,
    /// Hard cap on the active-record threshold derived from the ratio.
    pub too_many_index_match_cap: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enable_min_id_skip: true,
            too_many_index_match_ratio: 0.01,
            too_many_index_match_cap: 1000,
        }
    }
}

/// Run `program` as a filter over its subject table, merging matches into
/// `seed` under `outer`.
pub fn select(
    db: &dyn TableResolver,
    procs: &ProcedureRegistry,
    program: &mut Program,
    seed: Option<ResultSet>,
    outer: Combinator,
    config: &ScanConfig,
) -> Result<ResultSet> {
    let table = db.table(program.subject_table()).ok_or_else(|| {
        Error::MalformedProgram(format!(
            "program bound to unknown table {}",
            program.subject_table()
        ))
    })?;
    let mut res = seed.unwrap_or_default();
    if program.is_empty() {
        return Ok(res);
    }
    let seed_size = res.len() as u64;
    // Narrowing combinators over an empty accumulator cannot add records.
    if outer != Combinator::Or && seed_size == 0 {
        return Ok(res);
    }
    let plan = build_plan(program, table, outer, seed_size);
    match plan {
        Some(plan) => {
            log::debug!("scan plan:\n{}", plan);
            let mut stack: Vec<ResultSet> = Vec::new();
            for step in &plan.steps {
                if step.flags.pop {
                    let parent = stack
                        .pop()
                        .ok_or_else(|| Error::MalformedProgram("unbalanced scan plan".into()))?;
                    let child = std::mem::replace(&mut res, parent);
                    res.merge(&child, step.logical_op);
                    continue;
                }
                if step.flags.push {
                    stack.push(std::mem::take(&mut res));
                }
                if !index_step(procs, table, step, &mut res, config)? {
                    sequential_range(
                        db,
                        procs,
                        table,
                        program,
                        step.start,
                        step.end,
                        step.logical_op,
                        step.weight,
                        &mut res,
                    )?;
                }
            }
            if !stack.is_empty() {
                return Err(Error::MalformedProgram("unbalanced scan plan".into()));
            }
            Ok(res)
        }
        None => {
            log::debug!("program not plannable, scanning sequentially");
            let end = program.len().saturating_sub(1) as u32;
            sequential_range(db, procs, table, program, 0, end, outer, 1, &mut res)?;
            Ok(res)
        }
    }
}

/// Try to answer one step from an index, merging into `res`. Returns false
/// when no strategy applies and the step must run sequentially.
fn index_step(
    procs: &ProcedureRegistry,
    table: &dyn TableProvider,
    step: &ScanStep,
    res: &mut ResultSet,
    config: &ScanConfig,
) -> Result<bool> {
    if step.flags.sequential_only {
        return Ok(false);
    }
    match step.op {
        Operator::Call => call_step(procs, table, step, res),
        Operator::Equal => equal_step(table, step, res),
        Operator::Less | Operator::Greater | Operator::LessEqual | Operator::GreaterEqual => {
            range_step(table, step, res, config)
        }
        Operator::Match | Operator::Near | Operator::Similar | Operator::Regexp => {
            fulltext_step(table, step, res, config)
        }
        Operator::Prefix | Operator::Suffix => affix_step(table, step, res),
        _ => Ok(false),
    }
}

fn call_step(
    procs: &ProcedureRegistry,
    table: &dyn TableProvider,
    step: &ScanStep,
    res: &mut ResultSet,
) -> Result<bool> {
    let mut values = step.args.iter().filter_map(|a| match a {
        StepArg::Value(v) => Some(v),
        StepArg::Column { .. } => None,
    });
    let name = match values.next() {
        Some(TypedValue::Text(s)) => s.clone(),
        _ => return Ok(false),
    };
    let Some(selector) = procs.selector(&name) else {
        return Ok(false);
    };
    let args: Vec<TypedValue> = values.cloned().collect();
    let index = step
        .index_targets
        .first()
        .and_then(|t| table.index(&t.column, step.op));
    selector.select(table, index, &args, res, step.logical_op)?;
    Ok(true)
}

fn query_text(step: &ScanStep) -> Option<&str> {
    match &step.query {
        Some(TypedValue::Text(s)) => Some(s),
        _ => None,
    }
}

/// Collect an index lookup into a fresh set and merge it.
fn merge_partial(
    res: &mut ResultSet,
    op: Combinator,
    weight: i32,
    lookup: impl FnOnce(&mut dyn FnMut(crate::RecordId, i32)),
) {
    let mut partial = ResultSet::new();
    let mut sink = |id: crate::RecordId, w: i32| partial.add(id, w.saturating_mul(weight));
    lookup(&mut sink);
    res.merge(&partial, op);
}

fn equal_step(
    table: &dyn TableProvider,
    step: &ScanStep,
    res: &mut ResultSet,
) -> Result<bool> {
    let query = match &step.query {
        Some(q) => q,
        None => return Ok(false),
    };
    // The empty string matches nothing through a lexicon; let the
    // sequential path decide.
    if matches!(query, TypedValue::Text(s) if s.is_empty()) {
        return Ok(false);
    }
    if step.flags.accessor {
        let hit = match step.column() {
            Some(("_id", _)) => id_query(query).filter(|&id| table.contains(id)),
            Some(("_key", _)) => table.lookup_key(query),
            _ => return Ok(false),
        };
        merge_partial(res, step.logical_op, step.weight, |sink| {
            if let Some(id) = hit {
                sink(id, 1);
            }
        });
        return Ok(true);
    }
    let Some(target) = step.index_targets.first() else {
        return Ok(false);
    };
    let Some(index) = table.index(&target.column, Operator::Equal) else {
        return Ok(false);
    };
    let weights = section_weights(step);
    merge_partial(res, step.logical_op, step.weight, |sink| {
        index.lookup_equal(query, &weights, sink);
    });
    Ok(true)
}

/// Record id a query value designates under loose comparison: numeric text
/// parses, fractional floats designate no record at all. Mirrors what the
/// VM's `_id == query` comparison accepts, so the bypass and the sequential
/// path agree.
fn id_query(query: &TypedValue) -> Option<crate::RecordId> {
    match query.as_num_casting().ok()? {
        Num::I(i) if i > 0 && i <= u32::MAX as i64 => Some(i as crate::RecordId),
        Num::U(u) if u > 0 && u <= u32::MAX as u64 => Some(u as crate::RecordId),
        Num::F(f) if f.fract() == 0.0 && f > 0.0 && f <= u32::MAX as f64 => {
            Some(f as crate::RecordId)
        }
        _ => None,
    }
}

fn section_weights(step: &ScanStep) -> Vec<(u32, i32)> {
    step.index_targets
        .iter()
        .filter(|t| t.section > 0)
        .map(|t| (t.section, t.weight))
        .collect()
}

/// Directional comparison as seen from the column when the constant came
/// first in the program.
fn effective_range_op(step: &ScanStep) -> Operator {
    if !step.flags.pre_const {
        return step.op;
    }
    match step.op {
        Operator::Less => Operator::Greater,
        Operator::Greater => Operator::Less,
        Operator::LessEqual => Operator::GreaterEqual,
        Operator::GreaterEqual => Operator::LessEqual,
        other => other,
    }
}

fn range_step(
    table: &dyn TableProvider,
    step: &ScanStep,
    res: &mut ResultSet,
    config: &ScanConfig,
) -> Result<bool> {
    // Intersecting a small active set against a potentially huge range is
    // cheaper record by record.
    if step.logical_op == Combinator::And {
        let threshold = (table.size() as f64 * config.too_many_index_match_ratio) as u64;
        let threshold = threshold.min(config.too_many_index_match_cap);
        if (res.len() as u64) < threshold {
            return Ok(false);
        }
    }
    let Some(target) = step.index_targets.first() else {
        return Ok(false);
    };
    let op = effective_range_op(step);
    let Some(index) = table.index(&target.column, op) else {
        return Ok(false);
    };
    let query = match &step.query {
        Some(q) => q.clone(),
        None => return Ok(false),
    };
    let Some(range) = RangeQuery::from_op(op, query) else {
        return Ok(false);
    };
    merge_partial(res, step.logical_op, step.weight, |sink| {
        index.lookup_range(&range, sink);
    });
    Ok(true)
}

fn fulltext_step(
    table: &dyn TableProvider,
    step: &ScanStep,
    res: &mut ResultSet,
    config: &ScanConfig,
) -> Result<bool> {
    let Some(target) = step.index_targets.first() else {
        return Ok(false);
    };
    let Some(index) = table.index(&target.column, step.op) else {
        return Ok(false);
    };
    let Some(query) = query_text(step) else {
        return Ok(false);
    };
    if query.is_empty() {
        return Ok(false);
    }
    let mode = match step.op {
        Operator::Match => FulltextMode::Match,
        Operator::Near => FulltextMode::Near,
        Operator::Similar => FulltextMode::Similar,
        _ => FulltextMode::Regexp,
    };
    let min_record = if config.enable_min_id_skip
        && step.logical_op == Combinator::And
        && !res.is_empty()
    {
        res.ids().first().copied().unwrap_or(NIL_RECORD)
    } else {
        NIL_RECORD
    };
    let weights = section_weights(step);
    let opt = FulltextOpt {
        mode,
        max_interval: step.max_interval,
        similarity_threshold: step.similarity_threshold,
        weights: &weights,
        min_record,
        phrase_position: step.phrase_position,
    };
    merge_partial(res, step.logical_op, step.weight, |sink| {
        index.lookup_fulltext(query, &opt, sink);
    });
    Ok(true)
}

fn affix_step(
    table: &dyn TableProvider,
    step: &ScanStep,
    res: &mut ResultSet,
) -> Result<bool> {
    let Some(target) = step.index_targets.first() else {
        return Ok(false);
    };
    let Some(index) = table.index(&target.column, step.op) else {
        return Ok(false);
    };
    let Some(query) = query_text(step) else {
        return Ok(false);
    };
    match step.op {
        Operator::Prefix => {
            merge_partial(res, step.logical_op, step.weight, |sink| {
                index.lookup_prefix(query, sink);
            });
            Ok(true)
        }
        Operator::Suffix if index.supports_suffix() => {
            merge_partial(res, step.logical_op, step.weight, |sink| {
                index.lookup_suffix(query, sink);
            });
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Evaluate instructions `[start, end]` per record and merge under `op`.
#[allow(clippy::too_many_arguments)]
fn sequential_range(
    db: &dyn TableResolver,
    procs: &ProcedureRegistry,
    table: &dyn TableProvider,
    program: &mut Program,
    start: u32,
    end: u32,
    op: Combinator,
    weight: i32,
    res: &mut ResultSet,
) -> Result<()> {
    let hooks = call_targets(program, procs, start, end);
    for name in &hooks {
        procs.get(name)?.init()?;
    }
    let guard = program.narrow(start, end);
    let prog = guard.program();
    let ctx = EvalContext {
        table,
        tables: db,
        procs,
    };
    let mut ex = specialize(prog, table)?;
    let mut score_for = |id: crate::RecordId| -> Result<i32> {
        match ex.run(prog, &ctx, id) {
            Ok(v) => Ok(score_value(&v).saturating_mul(weight)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::debug!("record {} skipped: {}", id, e);
                Ok(0)
            }
        }
    };
    match op {
        Combinator::Or => {
            for id in table.cursor() {
                let score = score_for(id)?;
                if score > 0 {
                    res.add(id, score);
                }
            }
        }
        Combinator::And => {
            for id in res.ids() {
                let score = score_for(id)?;
                if score > 0 {
                    res.add(id, score);
                } else {
                    res.remove(id);
                }
            }
        }
        Combinator::AndNot => {
            for id in res.ids() {
                if score_for(id)? > 0 {
                    res.remove(id);
                }
            }
        }
        Combinator::Adjust => {
            for id in res.ids() {
                let score = score_for(id)?;
                if score > 0 {
                    res.add(id, score);
                }
            }
        }
    }
    drop(guard);
    for name in &hooks {
        procs.get(name)?.fin()?;
    }
    Ok(())
}

/// Procedure names a window invokes, for init/fin bracketing: every text
/// constant in the window that names a registered procedure, provided the
/// window contains a call at all.
fn call_targets(
    program: &Program,
    procs: &ProcedureRegistry,
    start: u32,
    end: u32,
) -> Vec<String> {
    let range = start as usize..=end as usize;
    if !range
        .clone()
        .filter_map(|i| program.code(i))
        .any(|c| c.op == Operator::Call)
    {
        return Vec::new();
    }
    let mut names = Vec::new();
    for i in range {
        let Some(code) = program.code(i) else { break };
        if code.op != Operator::Push {
            continue;
        }
        if let Some(TypedValue::Text(s)) = program.constant_of(i) {
            if procs.get(s).is_ok() && !names.contains(s) {
                names.push(s.clone());
            }
        }
    }
    names
}
