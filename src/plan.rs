//! The scan planner: static analysis that turns a postfix filter program
//! into a sequence of scan steps, each answerable by an index lookup plus a
//! set operation.
//!
//! Planning is best-effort. Any construct the analysis cannot express
//! (arithmetic inside a term, assignments, a negation with no rewrite)
//! makes the whole program unplannable and the driver evaluates it
//! sequentially instead, so the planner never needs to be complete, only
//! correct.

use std::fmt;

use smallvec::SmallVec;

use crate::access::TableProvider;
use crate::{Combinator, Operator, Program, TypedValue};

const DEFAULT_MAX_INTERVAL: i32 = 10;
const DEFAULT_SIMILARITY_THRESHOLD: i32 = 0;
/// Terms with more collected arguments than this are not plannable.
const MAX_STEP_ARGS: usize = 8;

/// One argument of a scan step, extracted from the program.
#[derive(Debug, Clone, PartialEq)]
pub enum StepArg {
    /// A column of the subject table; `section` is 1-based, 0 meaning "all
    /// sections".
    Column { name: String, section: u32 },
    Value(TypedValue),
}

/// A column an index lookup should target, with its score weight.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTarget {
    pub column: String,
    pub section: u32,
    pub weight: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepFlags {
    /// Open a grouping level before this step.
    pub push: bool,
    /// Synthetic step that only closes a grouping level.
    pub pop: bool,
    /// The constant appeared before the column, so a directional
    /// comparison reads right-to-left.
    pub pre_const: bool,
    /// The term reads a pseudo-column such as `_id` or `_key`.
    pub accessor: bool,
    /// The term embeds a computed value and must never use an index.
    pub sequential_only: bool,
}

/// One step of a scan plan.
#[derive(Debug, Clone)]
pub struct ScanStep {
    pub op: Operator,
    /// How this step's partial result merges into the accumulated one.
    pub logical_op: Combinator,
    /// First instruction of the term, inclusive.
    pub start: u32,
    /// Last instruction of the term, inclusive.
    pub end: u32,
    pub flags: StepFlags,
    pub args: SmallVec<[StepArg; 2]>,
    pub index_targets: SmallVec<[IndexTarget; 1]>,
    pub query: Option<TypedValue>,
    pub max_interval: i32,
    pub similarity_threshold: i32,
    /// Exact token position the match must start at, when constrained.
    pub phrase_position: Option<u32>,
    /// Score multiplier for the whole term.
    pub weight: i32,
}

impl ScanStep {
    fn new(start: u32) -> Self {
        Self {
            op: Operator::Nop,
            logical_op: Combinator::Or,
            start,
            end: start,
            flags: StepFlags {
                push: true,
                ..StepFlags::default()
            },
            args: SmallVec::new(),
            index_targets: SmallVec::new(),
            query: None,
            max_interval: DEFAULT_MAX_INTERVAL,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            phrase_position: None,
            weight: 1,
        }
    }

    fn push_arg(&mut self, arg: StepArg) -> Option<()> {
        if self.args.len() >= MAX_STEP_ARGS {
            return None;
        }
        self.args.push(arg);
        Some(())
    }

    fn synthetic_pop(at: u32, op: Combinator) -> Self {
        let mut s = Self::new(at);
        s.flags = StepFlags {
            pop: true,
            ..StepFlags::default()
        };
        s.logical_op = op;
        s
    }

    /// The primary column argument, if the term has one.
    pub fn column(&self) -> Option<(&str, u32)> {
        self.args.iter().find_map(|a| match a {
            StepArg::Column { name, section } => Some((name.as_str(), *section)),
            StepArg::Value(_) => None,
        })
    }
}

/// An index-aware scan plan.
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    pub steps: Vec<ScanStep>,
}

impl fmt::Display for ScanPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.steps.iter().enumerate() {
            write!(f, "#{} {} {:?}", i, s.logical_op, s.op)?;
            if s.flags.push {
                write!(f, " push")?;
            }
            if s.flags.pop {
                write!(f, " pop")?;
            }
            if let Some((name, section)) = s.column() {
                write!(f, " {}", name)?;
                if section > 0 {
                    write!(f, "[{}]", section)?;
                }
            }
            if let Some(q) = &s.query {
                write!(f, " {:?}", q)?;
            }
            for t in &s.index_targets {
                write!(f, " idx:{}", t.column)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stat {
    Start,
    Var,
    Col1,
    Col2,
    Const,
}

/// Build a plan for `program`, or `None` when the program is not
/// plannable and must run sequentially.
///
/// `outer` is the combinator merging the whole select into `seed_size`
/// pre-existing results.
pub fn build_plan(
    program: &Program,
    table: &dyn TableProvider,
    outer: Combinator,
    seed_size: u64,
) -> Option<ScanPlan> {
    if program.is_empty() {
        return None;
    }
    if let Some(plan) = build_simple(program, table, outer, seed_size) {
        return Some(plan);
    }
    validate(program)?;
    materialize(program, table, outer, seed_size)
}

/// Fast recognizer for a lone comparison or a left-deep AND chain of
/// comparisons, the overwhelmingly common filter shapes. Uses the forward
/// links the builder laid down to check each comparison really feeds the
/// chain.
fn build_simple(
    program: &Program,
    table: &dyn TableProvider,
    outer: Combinator,
    seed_size: u64,
) -> Option<ScanPlan> {
    let len = program.len();
    let first = simple_term(program, table, 0)?;
    let mut i = first.end as usize + 1;
    let mut steps = vec![first];
    // A left-deep chain reads term, term, And, term, And, ...; the head of
    // each non-first term must forward-link to the And consuming it.
    while i < len {
        let mut step = simple_term(program, table, i)?;
        i = step.end as usize + 1;
        if program.code(i)?.op != Operator::And {
            return None;
        }
        let head = program.code(step.start as usize)?;
        if step.start as i32 + head.forward_link != i as i32 {
            return None;
        }
        step.flags.push = false;
        step.logical_op = Combinator::And;
        steps.push(step);
        i += 1;
    }
    finalize(&mut steps, program.len() as u32, outer, seed_size)?;
    Some(ScanPlan { steps })
}

/// Recognize `column <cmp> constant` at `at`, returning its step.
fn simple_term(
    program: &Program,
    table: &dyn TableProvider,
    at: usize,
) -> Option<ScanStep> {
    let c0 = program.code(at)?;
    let c1 = program.code(at + 1)?;
    let c2 = program.code(at + 2)?;
    let c3 = program.code(at + 3)?;
    let c4 = program.code(at + 4)?;
    if c0.op != Operator::Push || c0.constant.is_some() {
        return None;
    }
    let name = match program.constant_of(at + 1) {
        Some(TypedValue::Text(s)) if c1.op == Operator::Push => s.clone(),
        _ => return None,
    };
    if c2.op != Operator::GetValue {
        return None;
    }
    if c3.op != Operator::Push || c3.constant.is_none() {
        return None;
    }
    if !c4.op.is_comparison() {
        return None;
    }
    let mut step = ScanStep::new(at as u32);
    step.op = c4.op;
    step.end = (at + 4) as u32;
    step.flags.accessor = name.starts_with('_');
    step.args.push(StepArg::Column {
        name: name.clone(),
        section: 0,
    });
    step.args
        .push(StepArg::Value(program.constant_of(at + 3)?.clone()));
    step.query = program.constant_of(at + 3).cloned();
    if !step.flags.accessor && table.index(&name, step.op).is_some() {
        step.index_targets.push(IndexTarget {
            column: name,
            section: 0,
            weight: 1,
        });
    }
    Some(step)
}

/// Pass one: walk the program once and check it is a well-formed boolean
/// combination of index-expressible terms.
fn validate(program: &Program) -> Option<()> {
    let mut stat = Stat::Start;
    let mut terms = 0u32;
    let mut combinators = 0u32;
    let len = program.len();
    for i in 0..len {
        let code = program.code(i)?;
        match code.op {
            op if op.is_scannable() => {
                if !matches!(stat, Stat::Col1 | Stat::Col2 | Stat::Const) {
                    return None;
                }
                stat = Stat::Start;
                terms += 1;
            }
            op if op.is_arithmetic() => {
                // Arithmetic is only expressible as a weight adjustment
                // applied right after a closed term.
                if !matches!(stat, Stat::Col1 | Stat::Col2 | Stat::Const) {
                    return None;
                }
                if terms != combinators + 1 {
                    return None;
                }
                stat = Stat::Start;
            }
            Operator::And | Operator::Or | Operator::AndNot | Operator::Adjust => {
                if stat != Stat::Start {
                    return None;
                }
                combinators += 1;
                if combinators >= terms {
                    return None;
                }
            }
            Operator::Not => {
                if stat != Stat::Start {
                    return None;
                }
            }
            Operator::Push => {
                stat = if code.constant.is_none() {
                    Stat::Var
                } else {
                    Stat::Const
                };
            }
            Operator::GetValue => match stat {
                Stat::Start | Stat::Const | Stat::Var => stat = Stat::Col1,
                Stat::Col1 => return None,
                Stat::Col2 => {}
            },
            Operator::GetMember => {
                if stat != Stat::Const {
                    return None;
                }
                stat = Stat::Col1;
            }
            Operator::Call => {
                if code.relational || i + 1 == len {
                    terms += 1;
                    stat = Stat::Start;
                } else {
                    stat = Stat::Col2;
                }
            }
            _ => return None,
        }
    }
    if stat == Stat::Start && terms == combinators + 1 {
        Some(())
    } else {
        None
    }
}

/// Pass two: materialize the steps, grouping flags included.
fn materialize(
    program: &Program,
    table: &dyn TableProvider,
    outer: Combinator,
    seed_size: u64,
) -> Option<ScanPlan> {
    let mut steps: Vec<ScanStep> = Vec::new();
    let mut si: Option<ScanStep> = None;
    let mut stat = Stat::Start;
    // Step index where each pending operand's steps begin, for the
    // negation rewrite.
    let mut operand_starts: Vec<usize> = Vec::new();
    let mut invert_next = false;
    let len = program.len();
    let mut i = 0;
    while i < len {
        let code = program.code(i)?;
        match code.op {
            op if op.is_scannable() => {
                let mut s = si.take().unwrap_or_else(|| ScanStep::new(i as u32));
                s.op = op;
                s.end = i as u32;
                build_match(&mut s, table);
                if let Some((weight, skip)) = term_weight(program, i) {
                    s.weight = weight;
                    s.end = (i + skip) as u32;
                    i += skip;
                }
                operand_starts.push(steps.len());
                steps.push(s);
                stat = Stat::Start;
            }
            Operator::And | Operator::Or | Operator::AndNot | Operator::Adjust => {
                let mut op = Combinator::try_from(code.op).ok()?;
                if invert_next {
                    op = match op {
                        Combinator::And => Combinator::AndNot,
                        Combinator::AndNot => Combinator::And,
                        other => other,
                    };
                    invert_next = false;
                }
                put_logical_op(&mut steps, op, i as u32)?;
                if operand_starts.len() < 2 {
                    return None;
                }
                let left = operand_starts[operand_starts.len() - 2];
                operand_starts.truncate(operand_starts.len() - 2);
                operand_starts.push(left);
                stat = Stat::Start;
            }
            Operator::Not => {
                let operand_start = *operand_starts.last()?;
                let next = if i + 1 < len {
                    program.code(i + 1).map(|c| c.op)
                } else {
                    None
                };
                rewrite_not(&mut steps, operand_start, i as u32, next, &mut invert_next)?;
            }
            Operator::Push => {
                // Every push opens the pending step, so the step's window
                // starts at the subject push and the sequential fallback
                // sees the whole term.
                let s = si.get_or_insert_with(|| ScanStep::new(i as u32));
                if code.constant.is_none() {
                    stat = Stat::Var;
                } else {
                    if stat == Stat::Start {
                        s.flags.pre_const = true;
                    }
                    s.push_arg(StepArg::Value(program.constant_of(i)?.clone()))?;
                    stat = Stat::Const;
                }
            }
            Operator::GetValue => match stat {
                Stat::Start | Stat::Const | Stat::Var => {
                    let s = si.as_mut()?;
                    let name = match s.args.pop() {
                        Some(StepArg::Value(TypedValue::Text(name))) => name,
                        _ => return None,
                    };
                    if name.starts_with('_') {
                        s.flags.accessor = true;
                    }
                    s.args.push(StepArg::Column { name, section: 0 });
                    stat = Stat::Col1;
                }
                Stat::Col1 => return None,
                Stat::Col2 => {}
            },
            Operator::GetMember => {
                let s = si.as_mut()?;
                let section = match s.args.pop() {
                    Some(StepArg::Value(v)) => v.as_num()?.as_i64_wrapping(),
                    _ => return None,
                };
                if section < 0 {
                    return None;
                }
                let name = match s.args.pop() {
                    Some(StepArg::Column { name, .. }) => name,
                    _ => return None,
                };
                s.args.push(StepArg::Column {
                    name,
                    section: section as u32 + 1,
                });
                stat = Stat::Col1;
            }
            Operator::Call => {
                if code.relational || i + 1 == len {
                    let mut s = si.take().unwrap_or_else(|| ScanStep::new(i as u32));
                    s.op = Operator::Call;
                    s.end = i as u32;
                    if let Some((weight, skip)) = term_weight(program, i) {
                        s.weight = weight;
                        s.end = (i + skip) as u32;
                        i += skip;
                    }
                    operand_starts.push(steps.len());
                    steps.push(s);
                    stat = Stat::Start;
                } else {
                    let s = si.as_mut()?;
                    s.flags.sequential_only = true;
                    stat = Stat::Col2;
                }
            }
            _ => return None,
        }
        i += 1;
    }
    if si.is_some() {
        return None;
    }
    finalize(&mut steps, len as u32, outer, seed_size)?;
    Some(ScanPlan { steps })
}

/// Detect a `term * weight` adjustment following a whole-term call and
/// return the weight plus the instruction count to skip.
fn term_weight(program: &Program, call_at: usize) -> Option<(i32, usize)> {
    let push = program.code(call_at + 1)?;
    let star = program.code(call_at + 2)?;
    if push.op != Operator::Push || star.op != Operator::Star {
        return None;
    }
    let v = program.constant_of(call_at + 1)?;
    v.as_num().map(|n| (n.as_i64_wrapping() as i32, 2))
}

/// Derive the index targets and query of a freshly closed term from its
/// collected arguments.
fn build_match(step: &mut ScanStep, table: &dyn TableProvider) {
    if step.flags.sequential_only {
        return;
    }
    for arg in &step.args {
        match arg {
            StepArg::Column { name, section } => {
                if step.flags.accessor {
                    continue;
                }
                if table.index(name, step.op).is_some() {
                    put_index(
                        &mut step.index_targets,
                        IndexTarget {
                            column: name.clone(),
                            section: *section,
                            weight: 1,
                        },
                    );
                }
            }
            StepArg::Value(v) => {
                if step.query.is_none() {
                    step.query = Some(v.clone());
                }
            }
        }
    }
    // A third argument tunes the proximity or similarity threshold.
    if step.args.len() >= 3 {
        let extra = step.args.iter().filter_map(|a| match a {
            StepArg::Value(v) => Some(v),
            _ => None,
        });
        let mut extra = extra.skip(1);
        if let Some(v) = extra.next() {
            if let Some(n) = v.as_num() {
                match step.op {
                    Operator::Near => step.max_interval = n.as_i64_wrapping() as i32,
                    Operator::Similar => {
                        step.similarity_threshold = n.as_i64_wrapping() as i32
                    }
                    _ => {}
                }
            }
        }
        // A fourth argument pins the match to an exact starting position.
        if step.op == Operator::Near {
            if let Some(n) = extra.next().and_then(|v| v.as_num()) {
                let p = n.as_i64_wrapping();
                if p >= 0 {
                    step.phrase_position = Some(p as u32);
                }
            }
        }
    }
}

/// Register an index target, keeping the most recently confirmed target in
/// front so the executor prefers it.
fn put_index(targets: &mut SmallVec<[IndexTarget; 1]>, target: IndexTarget) {
    if let Some(pos) = targets
        .iter()
        .position(|t| t.column == target.column && t.section == target.section)
    {
        let existing = targets.remove(pos);
        targets.insert(0, existing);
    } else {
        targets.push(target);
    }
}

/// Resolve a just-seen combinator against the pending steps: clear the
/// matching group-opening `push` flag, or append a synthetic `pop` step
/// when dissimilar combinators keep the grouping level alive.
fn put_logical_op(steps: &mut Vec<ScanStep>, op: Combinator, at: u32) -> Option<()> {
    let mut nparens = 1i32;
    let mut ndifops = 0i32;
    let mut restart: Option<usize> = None;
    let mut j = steps.len();
    loop {
        if j == 0 {
            // Unmatched grouping level.
            return None;
        }
        j -= 1;
        if steps[j].flags.pop {
            ndifops += 1;
            nparens += 1;
        } else if steps[j].flags.push {
            nparens -= 1;
            if nparens == 0 {
                match restart {
                    None => {
                        if ndifops > 0 {
                            if j > 0 && op != Combinator::AndNot {
                                restart = Some(j);
                                nparens = 1;
                                ndifops = 0;
                            } else {
                                steps.push(ScanStep::synthetic_pop(at, op));
                                break;
                            }
                        } else {
                            steps[j].flags.push = false;
                            steps[j].logical_op = op;
                            break;
                        }
                    }
                    Some(r) => {
                        if ndifops > 0 {
                            steps.push(ScanStep::synthetic_pop(at, op));
                        } else {
                            steps[j].flags.push = false;
                            steps[j].logical_op = op;
                            let len = steps.len();
                            steps[j..len].rotate_left(r - j);
                        }
                        break;
                    }
                }
            }
        } else if op == Combinator::AndNot || steps[j].logical_op != op {
            ndifops += 1;
        }
    }
    Some(())
}

/// Rewrite a `Not` over the steps of its operand, or report the program
/// unplannable.
fn rewrite_not(
    steps: &mut Vec<ScanStep>,
    operand_start: usize,
    not_at: u32,
    next: Option<Operator>,
    invert_next: &mut bool,
) -> Option<()> {
    if steps.len() <= operand_start {
        return None;
    }
    if steps.len() - operand_start == 1 {
        let last = steps.len() - 1;
        if let Some(flipped) = steps[last].op.complement() {
            steps[last].op = flipped;
            // The sequential fallback evaluates the instruction window, so
            // it must see the negation too.
            steps[last].end = not_at;
            return Some(());
        }
        if steps[last].op == Operator::Equal {
            steps[last].op = Operator::NotEqual;
            steps[last].end = not_at;
            return Some(());
        }
        // Negation of a term with no complement: all records minus the
        // term.
        let mut all = ScanStep::new(steps[last].start);
        all.op = Operator::Call;
        all.end = steps[last].start;
        all.args
            .push(StepArg::Value(TypedValue::Text("all_records".into())));
        all.flags.push = steps[last].flags.push;
        all.logical_op = steps[last].logical_op;
        steps[last].flags.push = false;
        steps[last].logical_op = Combinator::AndNot;
        steps.insert(last, all);
        return Some(());
    }
    // A negated group has no step of its own; the rewrite depends on the
    // instruction that consumes it.
    match next {
        // The consuming conjunction inverts: `a && !(g)` is `a &! g` and
        // `a &! !(g)` is `a && g`.
        Some(Operator::And) | Some(Operator::AndNot) => {
            *invert_next = true;
            Some(())
        }
        // Or cannot invert; subtract the group from all records instead:
        // `a || !(g)` becomes `a || (all &! g)`.
        Some(Operator::Or) => {
            let mut all = ScanStep::new(steps[operand_start].start);
            all.op = Operator::Call;
            all.end = steps[operand_start].start;
            all.args
                .push(StepArg::Value(TypedValue::Text("all_records".into())));
            all.flags.push = steps[operand_start].flags.push;
            all.logical_op = steps[operand_start].logical_op;
            steps[operand_start].flags.push = true;
            steps[operand_start].logical_op = Combinator::Or;
            steps.insert(operand_start, all);
            steps.push(ScanStep::synthetic_pop(not_at, Combinator::AndNot));
            Some(())
        }
        _ => None,
    }
}

/// Apply the outer combinator that merges the plan into the seed result.
fn finalize(
    steps: &mut Vec<ScanStep>,
    program_len: u32,
    outer: Combinator,
    seed_size: u64,
) -> Option<()> {
    if outer == Combinator::Or && seed_size == 0 {
        let first = steps.first_mut()?;
        if !(first.flags.push && first.logical_op == Combinator::Or) {
            return None;
        }
        first.flags.push = false;
        Some(())
    } else {
        put_logical_op(steps, outer, program_len)
    }
}
