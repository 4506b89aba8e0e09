//! Fast-path executors: specialized per-record evaluators for the handful
//! of program shapes that dominate real filters.
//!
//! [`specialize`] inspects the program's visible window once and returns an
//! [`Executor`]. A shape it does not recognize falls back to the general
//! VM; a shape it recognizes but cannot set up (missing column, impossible
//! constant cast) is a hard error, except for comparisons against a record
//! column where the answer is statically known.

use crate::access::{value_sections, ColumnProvider, TableProvider};
use crate::vm::{compare_holds, EvalContext, Vm};
use crate::{DataKind, Error, Instruction, Operator, Program, RecordId, Result, TypedValue};

/// A regular-expression pattern compiled once at specialization time.
pub struct CompiledPattern {
    #[cfg(feature = "regex")]
    re: Option<regex::Regex>,
    #[cfg(not(feature = "regex"))]
    pattern: String,
}

impl CompiledPattern {
    fn new(pattern: &str) -> Self {
        #[cfg(feature = "regex")]
        {
            let re = match regex::Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::warn!("invalid regex pattern {:?}: {}", pattern, e);
                    None
                }
            };
            Self { re }
        }
        #[cfg(not(feature = "regex"))]
        Self {
            pattern: pattern.to_string(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        #[cfg(feature = "regex")]
        {
            self.re.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
        }
        #[cfg(not(feature = "regex"))]
        {
            text.contains(&self.pattern)
        }
    }
}

/// A per-record evaluator chosen by [`specialize`].
pub enum Executor<'a> {
    /// The program is a single constant push.
    Constant(TypedValue),
    /// The program fetches one column of the subject record.
    Column(&'a dyn ColumnProvider),
    /// Column compared against a constant already cast into the column's
    /// domain.
    Comparison {
        column: &'a dyn ColumnProvider,
        op: Operator,
        operand: TypedValue,
    },
    /// Text column matched against a precompiled pattern.
    Regex {
        column: &'a dyn ColumnProvider,
        pattern: CompiledPattern,
    },
    /// The program's value is known without looking at the record.
    Static(bool),
    /// Full VM evaluation.
    General(Box<Vm<'a>>),
}

impl<'a> Executor<'a> {
    /// Evaluate the program for one record.
    pub fn run(
        &mut self,
        program: &Program,
        ctx: &EvalContext<'a>,
        record: RecordId,
    ) -> Result<TypedValue> {
        match self {
            Executor::Constant(v) => Ok(v.clone()),
            Executor::Column(col) => Ok(col.get(record)),
            Executor::Comparison {
                column,
                op,
                operand,
            } => Ok(TypedValue::Bool(compare_holds(
                *op,
                &column.get(record),
                operand,
            ))),
            Executor::Regex { column, pattern } => {
                let value = column.get(record);
                let hit = value_sections(&value)
                    .iter()
                    .any(|(_, s)| pattern.matches(s));
                Ok(TypedValue::Bool(hit))
            }
            Executor::Static(b) => Ok(TypedValue::Bool(*b)),
            Executor::General(vm) => vm.eval(program, ctx, record),
        }
    }
}

fn is_subject_push(c: &Instruction) -> bool {
    c.op == Operator::Push && c.constant.is_none()
}

fn const_of<'p>(program: &'p Program, c: &Instruction) -> Option<&'p TypedValue> {
    if c.op != Operator::Push {
        return None;
    }
    c.constant.and_then(|idx| program.const_value(idx))
}

fn const_text<'p>(program: &'p Program, c: &Instruction) -> Option<&'p str> {
    match const_of(program, c) {
        Some(TypedValue::Text(s)) => Some(s),
        _ => None,
    }
}

/// Whether `codes` starts with a plain subject-column fetch, returning the
/// column name.
fn column_fetch<'p>(program: &'p Program, codes: &[Instruction]) -> Option<&'p str> {
    if codes.len() < 3 {
        return None;
    }
    if !is_subject_push(&codes[0]) || codes[2].op != Operator::GetValue {
        return None;
    }
    const_text(program, &codes[1])
}

/// Pick the cheapest executor for the program's visible window.
pub fn specialize<'a>(
    program: &Program,
    table: &'a dyn TableProvider,
) -> Result<Executor<'a>> {
    let codes = program.window_codes();

    if codes.len() == 1 {
        if let Some(v) = const_of(program, &codes[0]) {
            return Ok(Executor::Constant(v.clone()));
        }
    }

    if let Some(name) = column_fetch(program, codes) {
        // Accessor pseudo-columns keep the general path.
        if !name.starts_with('_') {
            match codes.len() {
                3 => {
                    let column = table
                        .column(name)
                        .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
                    return Ok(Executor::Column(column));
                }
                5 if codes[4].op.is_comparison() => {
                    if let Some(operand) = const_of(program, &codes[3]) {
                        let column = table
                            .column(name)
                            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
                        return comparison_executor(column, codes[4].op, operand);
                    }
                }
                5 if codes[4].op == Operator::Regexp => {
                    if let Some(pattern) = const_text(program, &codes[3]) {
                        let column = table
                            .column(name)
                            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
                        if column.kind() == DataKind::Text {
                            return Ok(Executor::Regex {
                                column,
                                pattern: CompiledPattern::new(pattern),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Ok(Executor::General(Box::new(Vm::new())))
}

fn comparison_executor<'a>(
    column: &'a dyn ColumnProvider,
    op: Operator,
    operand: &TypedValue,
) -> Result<Executor<'a>> {
    match operand.cast_to(column.kind()) {
        Ok(cast) => Ok(Executor::Comparison {
            column,
            op,
            operand: cast,
        }),
        // A record column can never equal a value outside its domain; the
        // comparison's outcome is fixed.
        Err(_) if column.kind() == DataKind::Record => {
            Ok(Executor::Static(op == Operator::NotEqual))
        }
        Err(e) => Err(e),
    }
}
