//! Instruction programs: the compiled, postfix representation of a filter
//! expression, produced by an external compiler and consumed by the VM and
//! the scan planner.
//!
//! Instructions live in an index-addressed arena (`Vec`), so growth never
//! invalidates references; `forward_link` is a plain instruction-count
//! offset, not a pointer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, TableId, TypedValue};

/// Operator of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Operator {
    /// Push a constant (or the subject record when no constant is attached).
    Push,
    /// Placeholder operator for synthetic plan steps; never executed.
    Nop,
    /// Pop a column name and a record, push the column value.
    GetValue,
    /// Pop a column name and a record, push a settable column reference.
    GetRef,
    /// Pop an index/key and a container, push the addressed element.
    GetMember,
    /// Invoke a registered procedure with the popped arguments.
    Call,
    And,
    Or,
    AndNot,
    /// Score-only merge: adds weight, never filters.
    Adjust,
    Not,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    /// Full-text term match.
    Match,
    /// Full-text match with a maximum term interval.
    Near,
    /// Full-text similarity above a threshold.
    Similar,
    Prefix,
    Suffix,
    Regexp,
    Plus,
    Minus,
    Star,
    Slash,
    Mod,
    Shiftl,
    Shiftr,
    /// Unsigned (logical) right shift.
    Shiftrr,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    ModAssign,
    ShiftlAssign,
    ShiftrAssign,
    ShiftrrAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    /// Rectangular-approximation distance in meters over four fixed-point
    /// millisecond coordinates.
    GeoDistance,
    GeoWithinCircle,
    GeoWithinRectangle,
}

impl Operator {
    /// Operators that close a filter term the planner can express as a scan
    /// step.
    pub fn is_scannable(&self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::NotEqual
                | Operator::Less
                | Operator::Greater
                | Operator::LessEqual
                | Operator::GreaterEqual
                | Operator::Match
                | Operator::Near
                | Operator::Similar
                | Operator::Prefix
                | Operator::Suffix
                | Operator::Regexp
                | Operator::GeoWithinCircle
                | Operator::GeoWithinRectangle
        )
    }

    pub fn is_combinator(&self) -> bool {
        matches!(
            self,
            Operator::And | Operator::Or | Operator::AndNot | Operator::Adjust
        )
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::NotEqual
                | Operator::Less
                | Operator::Greater
                | Operator::LessEqual
                | Operator::GreaterEqual
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Operator::Plus
                | Operator::Minus
                | Operator::Star
                | Operator::Slash
                | Operator::Mod
                | Operator::Shiftl
                | Operator::Shiftr
                | Operator::Shiftrr
                | Operator::BitwiseAnd
                | Operator::BitwiseOr
                | Operator::BitwiseXor
                | Operator::BitwiseNot
        )
    }

    pub fn is_assignment(&self) -> bool {
        matches!(
            self,
            Operator::Assign
                | Operator::PlusAssign
                | Operator::MinusAssign
                | Operator::StarAssign
                | Operator::SlashAssign
                | Operator::ModAssign
                | Operator::ShiftlAssign
                | Operator::ShiftrAssign
                | Operator::ShiftrrAssign
                | Operator::AndAssign
                | Operator::OrAssign
                | Operator::XorAssign
        )
    }

    /// The arithmetic operator a compound assignment applies, if any.
    pub fn assignment_arith(&self) -> Option<Operator> {
        match self {
            Operator::PlusAssign => Some(Operator::Plus),
            Operator::MinusAssign => Some(Operator::Minus),
            Operator::StarAssign => Some(Operator::Star),
            Operator::SlashAssign => Some(Operator::Slash),
            Operator::ModAssign => Some(Operator::Mod),
            Operator::ShiftlAssign => Some(Operator::Shiftl),
            Operator::ShiftrAssign => Some(Operator::Shiftr),
            Operator::ShiftrrAssign => Some(Operator::Shiftrr),
            Operator::AndAssign => Some(Operator::BitwiseAnd),
            Operator::OrAssign => Some(Operator::BitwiseOr),
            Operator::XorAssign => Some(Operator::BitwiseXor),
            _ => None,
        }
    }

    /// Logical complement of a directional comparison, used by the planner's
    /// negation rewrite. `Equal` is intentionally absent: negating it needs
    /// context the rewrite rules supply separately.
    pub fn complement(&self) -> Option<Operator> {
        match self {
            Operator::Less => Some(Operator::GreaterEqual),
            Operator::Greater => Some(Operator::LessEqual),
            Operator::LessEqual => Some(Operator::Greater),
            Operator::GreaterEqual => Some(Operator::Less),
            Operator::NotEqual => Some(Operator::Equal),
            _ => None,
        }
    }
}

/// One instruction of a [`Program`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Operator,
    pub nargs: u32,
    /// Index into the program's constant pool; `None` on a `Push` means the
    /// subject record.
    pub constant: Option<u32>,
    /// Set when this instruction produces an operand of a logical
    /// combinator: the planner uses it to tell a whole-term `Call` from a
    /// nested one.
    pub relational: bool,
    /// Distance to the instruction that consumes this one as an operand,
    /// when that consumer is a logical combinator or `Not`. Zero when no
    /// such consumer exists.
    pub forward_link: i32,
}

/// A compiled postfix instruction sequence with its constant pool and the
/// subject-table binding.
///
/// During scan-plan execution the visible instruction range is temporarily
/// narrowed to a single step's sub-range through [`Program::narrow`]; the
/// guard restores the full window on every exit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    codes: Vec<Instruction>,
    consts: Vec<TypedValue>,
    subject_table: TableId,
    window: Option<(u32, u32)>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn subject_table(&self) -> TableId {
        self.subject_table
    }

    pub fn code(&self, i: usize) -> Option<&Instruction> {
        self.codes.get(i)
    }

    /// The currently visible instruction index range.
    pub fn window(&self) -> std::ops::Range<usize> {
        match self.window {
            Some((s, e)) => s as usize..e as usize,
            None => 0..self.codes.len(),
        }
    }

    /// The instructions inside the current window.
    pub fn window_codes(&self) -> &[Instruction] {
        &self.codes[self.window()]
    }

    pub fn const_value(&self, idx: u32) -> Option<&TypedValue> {
        self.consts.get(idx as usize)
    }

    /// The constant attached to instruction `i`, if any.
    pub fn constant_of(&self, i: usize) -> Option<&TypedValue> {
        self.codes.get(i).and_then(|c| c.constant).and_then(|idx| self.const_value(idx))
    }

    /// Narrow the visible range to `[start, end]` (inclusive). The returned
    /// guard restores the previous window when dropped, error paths
    /// included.
    pub fn narrow(&mut self, start: u32, end: u32) -> WindowGuard<'_> {
        let saved = self.window;
        self.window = Some((start, end + 1));
        WindowGuard {
            program: self,
            saved,
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.codes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match c.constant.and_then(|idx| self.const_value(idx)) {
                Some(v) => write!(f, "{}:{:?}({:?})", i, c.op, v)?,
                None => write!(f, "{}:{:?}", i, c.op)?,
            }
        }
        Ok(())
    }
}

/// Scoped narrowing of a program's visible instruction range.
pub struct WindowGuard<'a> {
    program: &'a mut Program,
    saved: Option<(u32, u32)>,
}

impl WindowGuard<'_> {
    pub fn program(&self) -> &Program {
        self.program
    }
}

impl Drop for WindowGuard<'_> {
    fn drop(&mut self) {
        self.program.window = self.saved;
    }
}

/// Builder for [`Program`]s: the surface an expression compiler targets.
///
/// Appending a logical combinator links each operand's head instruction
/// forward to the combinator and flags each operand's closing instruction
/// as relational, so the planner can walk terms without rebuilding the
/// expression tree.
#[derive(Debug)]
pub struct ProgramBuilder {
    codes: Vec<Instruction>,
    consts: Vec<TypedValue>,
    subject_table: TableId,
    starts: Vec<usize>,
    underflow: bool,
}

impl ProgramBuilder {
    pub fn new(subject_table: TableId) -> Self {
        Self {
            codes: Vec::new(),
            consts: Vec::new(),
            subject_table,
            starts: Vec::new(),
            underflow: false,
        }
    }

    /// Push the subject record variable.
    pub fn subject(&mut self) -> &mut Self {
        self.append(Operator::Push, 0, None)
    }

    /// Push a constant.
    pub fn constant(&mut self, value: TypedValue) -> &mut Self {
        let idx = self.intern(value);
        self.append(Operator::Push, 0, Some(idx))
    }

    /// Shorthand for `subject; constant(name); GetValue`.
    pub fn column(&mut self, name: &str) -> &mut Self {
        self.subject();
        self.constant(TypedValue::Text(name.to_string()));
        self.op(Operator::GetValue, 2)
    }

    /// Shorthand for `subject; constant(name); GetRef`.
    pub fn column_ref(&mut self, name: &str) -> &mut Self {
        self.subject();
        self.constant(TypedValue::Text(name.to_string()));
        self.op(Operator::GetRef, 2)
    }

    /// Append an operator consuming `nargs` operands.
    pub fn op(&mut self, op: Operator, nargs: u32) -> &mut Self {
        self.append(op, nargs, None)
    }

    pub fn finish(self) -> Result<Program> {
        if self.underflow {
            return Err(Error::MalformedProgram(
                "operator consumed more operands than were pushed".into(),
            ));
        }
        if !self.codes.is_empty() && self.starts.len() != 1 {
            return Err(Error::MalformedProgram(format!(
                "{} dangling operands after final instruction",
                self.starts.len()
            )));
        }
        Ok(Program {
            codes: self.codes,
            consts: self.consts,
            subject_table: self.subject_table,
            window: None,
        })
    }

    fn intern(&mut self, value: TypedValue) -> u32 {
        if let Some(pos) = self.consts.iter().position(|c| *c == value) {
            return pos as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    fn append(&mut self, op: Operator, nargs: u32, constant: Option<u32>) -> &mut Self {
        let i = self.codes.len();
        let nargs_us = nargs as usize;
        if nargs_us > self.starts.len() {
            self.underflow = true;
            return self;
        }
        let first_operand = self.starts.len() - nargs_us;
        if op.is_combinator() || op == Operator::Not {
            // Link operand heads forward to their consumer and flag each
            // operand's closing instruction.
            let mut spans: Vec<(usize, usize)> = Vec::with_capacity(nargs_us);
            for k in 0..nargs_us {
                let s = self.starts[first_operand + k];
                let e = if k + 1 < nargs_us {
                    self.starts[first_operand + k + 1]
                } else {
                    i
                };
                spans.push((s, e));
            }
            for (s, e) in spans {
                self.codes[s].forward_link = (i - s) as i32;
                if op.is_combinator() && e > s {
                    self.codes[e - 1].relational = true;
                }
            }
        }
        if nargs_us > 0 {
            let start = self.starts[first_operand];
            self.starts.truncate(first_operand);
            self.starts.push(start);
        } else {
            self.starts.push(i);
        }
        self.codes.push(Instruction {
            op,
            nargs,
            constant,
            relational: false,
            forward_link: 0,
        });
        self
    }
}
