//! The bytecode interpreter: a stack machine evaluating a [`Program`]'s
//! visible window against one record.
//!
//! The operand stack is owned by the [`Vm`] and reused across records, so a
//! full-table sequential scan allocates once. Most per-record soft failures
//! (bad casts, division by zero) surface as errors the scan executor maps
//! to "record does not match"; structural failures are fatal and abort the
//! scan.

use std::f64::consts::PI;

use rustc_hash::FxHashMap;

use crate::access::{
    section_matches, value_sections, ColumnProvider, FulltextMode, FulltextOpt, TableProvider,
    TableResolver,
};
use crate::{
    DataKind, Error, Num, Operator, ProcedureRegistry, Program, RecordId, Result, TableId,
    TypedValue,
};

// Fixed-point geographic coordinates are milliseconds of arc; distances use
// the rectangular approximation over a sphere of this radius (meters).
const GEO_RESOLUTION: f64 = 3_600_000.0;
const GEO_RADIUS: f64 = 6_357_303.0;

fn msec_to_rad(msec: f64) -> f64 {
    PI * msec / (GEO_RESOLUTION * 180.0)
}

fn rect_distance(lng1: f64, lat1: f64, lng2: f64, lat2: f64) -> f64 {
    let x = (lng2 - lng1) * ((lat1 + lat2) / 2.0).cos();
    let y = lat2 - lat1;
    (x * x + y * y).sqrt() * GEO_RADIUS
}

/// Everything an evaluation needs besides the program and the record.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    /// The subject table the program was compiled against.
    pub table: &'a dyn TableProvider,
    /// Resolver for tables reached through `Record` columns.
    pub tables: &'a dyn TableResolver,
    pub procs: &'a ProcedureRegistry,
}

/// One operand-stack slot: a value, or a settable column reference.
#[derive(Debug, Clone)]
enum Slot {
    Val(TypedValue),
    Ref { column: String },
}

/// A reusable evaluator for one program.
///
/// The operand stack and the column memo persist across records. The memo
/// caches column resolution per fetch instruction, so a sequential scan pays
/// the name lookup on the first record only; it is keyed by instruction
/// position, which is why a `Vm` must not be shared between programs.
#[derive(Default)]
pub struct Vm<'a> {
    stack: Vec<Slot>,
    columns: FxHashMap<usize, (TableId, &'a dyn ColumnProvider)>,
}

impl<'a> Vm<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the program's visible window for `record` and return the
    /// top-of-stack value.
    pub fn eval(
        &mut self,
        program: &Program,
        ctx: &EvalContext<'a>,
        record: RecordId,
    ) -> Result<TypedValue> {
        self.stack.clear();
        for pc in program.window() {
            let code = program
                .code(pc)
                .ok_or_else(|| Error::MalformedProgram(format!("instruction {} out of range", pc)))?;
            match code.op {
                Operator::Push => match code.constant {
                    Some(idx) => {
                        let v = program.const_value(idx).cloned().ok_or_else(|| {
                            Error::MalformedProgram(format!("constant {} out of range", idx))
                        })?;
                        self.stack.push(Slot::Val(v));
                    }
                    None => self.stack.push(Slot::Val(TypedValue::Record {
                        table: program.subject_table(),
                        id: record,
                    })),
                },
                Operator::Nop => {}
                Operator::GetValue => {
                    let name = self.pop_text(ctx, record, pc)?;
                    let target = self.pop_val(ctx, record, pc)?;
                    let v = self.read_column(program, ctx, &target, &name, pc)?;
                    self.stack.push(Slot::Val(v));
                }
                Operator::GetRef => {
                    let name = self.pop_text(ctx, record, pc)?;
                    let _target = self.pop_val(ctx, record, pc)?;
                    self.stack.push(Slot::Ref { column: name });
                }
                Operator::GetMember => {
                    let key = self.pop_val(ctx, record, pc)?;
                    let container = self.pop_val(ctx, record, pc)?;
                    let v = member_of(ctx, &container, &key);
                    self.stack.push(Slot::Val(v));
                }
                Operator::Call => {
                    let nargs = code.nargs as usize;
                    let mut args = Vec::with_capacity(nargs);
                    for _ in 0..nargs {
                        args.push(self.pop_val(ctx, record, pc)?);
                    }
                    args.reverse();
                    let name = match args.first() {
                        Some(TypedValue::Text(s)) => s.clone(),
                        other => {
                            return Err(Error::MalformedProgram(format!(
                                "call target must be a procedure name, got {:?}",
                                other
                            )))
                        }
                    };
                    let v = ctx.procs.get(&name)?.next(&args[1..])?;
                    self.stack.push(Slot::Val(v));
                }
                Operator::Not => {
                    let v = self.pop_val(ctx, record, pc)?;
                    self.stack.push(Slot::Val(TypedValue::Bool(!v.is_truthy())));
                }
                Operator::And => {
                    let r = self.pop_val(ctx, record, pc)?;
                    let l = self.pop_val(ctx, record, pc)?;
                    let v = if l.is_truthy() { r } else { TypedValue::Bool(false) };
                    self.stack.push(Slot::Val(v));
                }
                Operator::Or => {
                    let r = self.pop_val(ctx, record, pc)?;
                    let l = self.pop_val(ctx, record, pc)?;
                    let v = if l.is_truthy() { l } else { r };
                    self.stack.push(Slot::Val(v));
                }
                Operator::AndNot => {
                    let r = self.pop_val(ctx, record, pc)?;
                    let l = self.pop_val(ctx, record, pc)?;
                    self.stack
                        .push(Slot::Val(TypedValue::Bool(l.is_truthy() && !r.is_truthy())));
                }
                Operator::Adjust => {
                    let _r = self.pop_val(ctx, record, pc)?;
                    // Score adjustment is a scan-level concern; as a value
                    // the left operand passes through.
                }
                op if op.is_comparison() => {
                    let r = self.pop_val(ctx, record, pc)?;
                    let l = self.pop_val(ctx, record, pc)?;
                    self.stack.push(Slot::Val(TypedValue::Bool(compare_holds(op, &l, &r))));
                }
                Operator::Match | Operator::Prefix | Operator::Suffix | Operator::Regexp => {
                    let query = self.pop_text(ctx, record, pc)?;
                    let target = self.pop_val(ctx, record, pc)?;
                    let hit = text_op_matches(code.op, &target, &query, 10, 0, None);
                    self.stack.push(Slot::Val(TypedValue::Bool(hit)));
                }
                Operator::Near | Operator::Similar => {
                    // Optional trailing operands: a third tunes the interval
                    // or threshold, a fourth pins a near match to an exact
                    // starting position.
                    let fourth = if code.nargs >= 4 {
                        let v = self.pop_val(ctx, record, pc)?;
                        v.as_num().map(|n| n.as_i64_wrapping())
                    } else {
                        None
                    };
                    let third = if code.nargs >= 3 {
                        let v = self.pop_val(ctx, record, pc)?;
                        v.as_num().map(|n| n.as_i64_wrapping() as i32)
                    } else {
                        None
                    };
                    let query = self.pop_text(ctx, record, pc)?;
                    let target = self.pop_val(ctx, record, pc)?;
                    let (max_interval, threshold) = match code.op {
                        Operator::Near => (third.unwrap_or(10), 0),
                        _ => (10, third.unwrap_or(0)),
                    };
                    let phrase = match code.op {
                        Operator::Near => fourth.filter(|p| *p >= 0).map(|p| p as u32),
                        _ => None,
                    };
                    let hit = text_op_matches(
                        code.op,
                        &target,
                        &query,
                        max_interval,
                        threshold,
                        phrase,
                    );
                    self.stack.push(Slot::Val(TypedValue::Bool(hit)));
                }
                Operator::BitwiseNot => {
                    let v = self.pop_val(ctx, record, pc)?;
                    let n = v.as_num_casting()?;
                    let kind = operand_kind(&v, n);
                    let out = TypedValue::from_num_wrapping(kind, Num::I(!n.as_i64_wrapping()));
                    self.stack.push(Slot::Val(out));
                }
                op if op.is_arithmetic() => {
                    let r = self.pop_val(ctx, record, pc)?;
                    let l = self.pop_val(ctx, record, pc)?;
                    self.stack.push(Slot::Val(binary_arith(op, &l, &r)?));
                }
                Operator::Assign => {
                    let value = self.pop_val(ctx, record, pc)?;
                    let column = self.pop_ref(pc)?;
                    let written = self.write_column(ctx, record, &column, value)?;
                    self.stack.push(Slot::Val(written));
                }
                op if op.is_assignment() => {
                    let rhs = self.pop_val(ctx, record, pc)?;
                    let column = self.pop_ref(pc)?;
                    let arith = op
                        .assignment_arith()
                        .ok_or(Error::UnknownOperator(op))?;
                    let current = ctx
                        .table
                        .column(&column)
                        .ok_or_else(|| Error::ColumnNotFound(column.clone()))?
                        .get(record);
                    let value = binary_arith(arith, &current, &rhs)?;
                    let written = self.write_column(ctx, record, &column, value)?;
                    self.stack.push(Slot::Val(written));
                }
                Operator::GeoDistance => {
                    let [lng1, lat1, lng2, lat2] = self.pop_coords(ctx, record, pc)?;
                    let d = rect_distance(
                        msec_to_rad(lng1),
                        msec_to_rad(lat1),
                        msec_to_rad(lng2),
                        msec_to_rad(lat2),
                    );
                    self.stack.push(Slot::Val(TypedValue::Float(d)));
                }
                Operator::GeoWithinCircle => {
                    let [lng0, lat0, lng1, lat1] = self.pop_coords(ctx, record, pc)?;
                    let radius = self.pop_val(ctx, record, pc)?;
                    let d = rect_distance(
                        msec_to_rad(lng0),
                        msec_to_rad(lat0),
                        msec_to_rad(lng1),
                        msec_to_rad(lat1),
                    );
                    let within = match radius.as_num() {
                        Some(n) => d <= n.as_f64(),
                        None => false,
                    };
                    self.stack.push(Slot::Val(TypedValue::Bool(within)));
                }
                Operator::GeoWithinRectangle => {
                    // Bounds compare on the raw fixed-point coordinates; the
                    // second pair is the circle-form center and unused here.
                    let lng0 = self.pop_int(ctx, record, pc)?;
                    let lat0 = self.pop_int(ctx, record, pc)?;
                    let _lng1 = self.pop_int(ctx, record, pc)?;
                    let _lat1 = self.pop_int(ctx, record, pc)?;
                    let lng_min = self.pop_int(ctx, record, pc)?;
                    let lat_min = self.pop_int(ctx, record, pc)?;
                    let lng_max = self.pop_int(ctx, record, pc)?;
                    let lat_max = self.pop_int(ctx, record, pc)?;
                    let within = lng_min <= lng0
                        && lng0 <= lng_max
                        && lat_min <= lat0
                        && lat0 <= lat_max;
                    self.stack.push(Slot::Val(TypedValue::Bool(within)));
                }
                other => return Err(Error::UnknownOperator(other)),
            }
        }
        match self.stack.pop() {
            Some(slot) => self.load(ctx, record, slot),
            None => Ok(TypedValue::Void),
        }
    }

    fn pop(&mut self, pc: usize) -> Result<Slot> {
        self.stack.pop().ok_or(Error::StackUnderflow(pc))
    }

    fn pop_val(
        &mut self,
        ctx: &EvalContext<'_>,
        record: RecordId,
        pc: usize,
    ) -> Result<TypedValue> {
        let slot = self.pop(pc)?;
        self.load(ctx, record, slot)
    }

    fn pop_text(
        &mut self,
        ctx: &EvalContext<'_>,
        record: RecordId,
        pc: usize,
    ) -> Result<String> {
        match self.pop_val(ctx, record, pc)? {
            TypedValue::Text(s) => Ok(s),
            other => match other.cast_to(DataKind::Text)? {
                TypedValue::Text(s) => Ok(s),
                _ => Err(Error::TypeCast {
                    from: other.kind(),
                    to: DataKind::Text,
                }),
            },
        }
    }

    fn pop_ref(&mut self, pc: usize) -> Result<String> {
        match self.pop(pc)? {
            Slot::Ref { column } => Ok(column),
            Slot::Val(_) => Err(Error::NotSettable),
        }
    }

    fn pop_int(&mut self, ctx: &EvalContext<'_>, record: RecordId, pc: usize) -> Result<i64> {
        let v = self.pop_val(ctx, record, pc)?;
        Ok(v.as_num_casting()?.as_i64_wrapping())
    }

    /// Pop four coordinates, top of stack first.
    fn pop_coords(
        &mut self,
        ctx: &EvalContext<'_>,
        record: RecordId,
        pc: usize,
    ) -> Result<[f64; 4]> {
        let a = self.pop_int(ctx, record, pc)? as f64;
        let b = self.pop_int(ctx, record, pc)? as f64;
        let c = self.pop_int(ctx, record, pc)? as f64;
        let d = self.pop_int(ctx, record, pc)? as f64;
        Ok([a, b, c, d])
    }

    fn load(&self, ctx: &EvalContext<'_>, record: RecordId, slot: Slot) -> Result<TypedValue> {
        match slot {
            Slot::Val(v) => Ok(v),
            Slot::Ref { column } => Ok(ctx
                .table
                .column(&column)
                .ok_or(Error::ColumnNotFound(column))?
                .get(record)),
        }
    }

    fn read_column(
        &mut self,
        program: &Program,
        ctx: &EvalContext<'a>,
        target: &TypedValue,
        name: &str,
        pc: usize,
    ) -> Result<TypedValue> {
        let (table, id) = match target {
            TypedValue::Record { table, id } => (*table, *id),
            other => {
                return Err(Error::MalformedProgram(format!(
                    "column access on a non-record value of kind {:?}",
                    other.kind()
                )))
            }
        };
        // The memo holds one resolution per fetch site; the table check
        // covers record operands that switch tables between records.
        if let Some(&(cached, col)) = self.columns.get(&pc) {
            if cached == table {
                return Ok(col.get(id));
            }
        }
        let provider: &'a dyn TableProvider = if table == program.subject_table() {
            ctx.table
        } else {
            ctx.tables
                .table(table)
                .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?
        };
        match name {
            "_id" => Ok(TypedValue::UInt32(id)),
            "_key" => Ok(provider.key_of(id).unwrap_or(TypedValue::Void)),
            _ => {
                let col = provider
                    .column(name)
                    .ok_or_else(|| Error::ColumnNotFound(name.to_string()))?;
                self.columns.insert(pc, (table, col));
                Ok(col.get(id))
            }
        }
    }

    fn write_column(
        &self,
        ctx: &EvalContext<'_>,
        record: RecordId,
        column: &str,
        value: TypedValue,
    ) -> Result<TypedValue> {
        let col = ctx
            .table
            .column(column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))?;
        let cast = value.cast_to(col.kind())?;
        col.set(record, cast.clone())?;
        Ok(cast)
    }
}

/// Member access: numeric index into a vector, or (for a record value) a
/// keyed lookup in the record's table.
fn member_of(ctx: &EvalContext<'_>, container: &TypedValue, key: &TypedValue) -> TypedValue {
    match container {
        TypedValue::Vector(items) => match key.as_num() {
            Some(n) => {
                let i = n.as_i64_wrapping();
                if i < 0 {
                    return TypedValue::Void;
                }
                items.get(i as usize).cloned().unwrap_or(TypedValue::Void)
            }
            None => TypedValue::Void,
        },
        TypedValue::Record { table, .. } => ctx
            .tables
            .table(*table)
            .and_then(|t| t.lookup_key(key))
            .map(|id| TypedValue::Record { table: *table, id })
            .unwrap_or(TypedValue::Void),
        _ => TypedValue::Void,
    }
}

pub(crate) fn compare_holds(op: Operator, l: &TypedValue, r: &TypedValue) -> bool {
    use std::cmp::Ordering;
    match op {
        Operator::Equal => l.loose_eq(r),
        Operator::NotEqual => !l.loose_eq(r),
        _ => match l.compare(r) {
            None => false,
            Some(ord) => match op {
                Operator::Less => ord == Ordering::Less,
                Operator::Greater => ord == Ordering::Greater,
                Operator::LessEqual => ord != Ordering::Greater,
                Operator::GreaterEqual => ord != Ordering::Less,
                _ => false,
            },
        },
    }
}

fn text_op_matches(
    op: Operator,
    target: &TypedValue,
    query: &str,
    max_interval: i32,
    threshold: i32,
    phrase_position: Option<u32>,
) -> bool {
    let sections = value_sections(target);
    match op {
        Operator::Prefix => sections.iter().any(|(_, s)| s.starts_with(query)),
        Operator::Suffix => sections.iter().any(|(_, s)| s.ends_with(query)),
        _ => {
            let mode = match op {
                Operator::Match => FulltextMode::Match,
                Operator::Near => FulltextMode::Near,
                Operator::Similar => FulltextMode::Similar,
                Operator::Regexp => FulltextMode::Regexp,
                _ => return false,
            };
            let opt = FulltextOpt {
                mode,
                max_interval,
                similarity_threshold: threshold,
                phrase_position,
                ..FulltextOpt::default()
            };
            sections.iter().any(|(_, s)| section_matches(s, query, &opt))
        }
    }
}

fn operand_kind(v: &TypedValue, n: Num) -> DataKind {
    let k = v.kind();
    if k.is_numeric() {
        k
    } else {
        match n {
            Num::I(_) => DataKind::Int64,
            Num::U(_) => DataKind::UInt64,
            Num::F(_) => DataKind::Float,
        }
    }
}

/// Binary arithmetic with type promotion and native wrapping semantics.
pub(crate) fn binary_arith(op: Operator, l: &TypedValue, r: &TypedValue) -> Result<TypedValue> {
    // Text concatenation is the one non-numeric arithmetic case.
    if op == Operator::Plus {
        if let (TypedValue::Text(a), TypedValue::Text(b)) = (l, r) {
            return Ok(TypedValue::Text(format!("{}{}", a, b)));
        }
    }
    let ln = l.as_num_casting()?;
    let rn = r.as_num_casting()?;
    let lk = operand_kind(l, ln);
    let rk = operand_kind(r, rn);
    let promoted = lk.promote(rk).ok_or(Error::TypeCast { from: lk, to: rk })?;

    if promoted == DataKind::Float
        && matches!(
            op,
            Operator::Plus | Operator::Minus | Operator::Star | Operator::Slash | Operator::Mod
        )
    {
        let a = ln.as_f64();
        let b = rn.as_f64();
        let out = match op {
            Operator::Plus => a + b,
            Operator::Minus => a - b,
            Operator::Star => a * b,
            Operator::Slash => {
                if b == 0.0 {
                    return Err(Error::DivisionByZero);
                }
                a / b
            }
            _ => {
                if b == 0.0 {
                    return Err(Error::DivisionByZero);
                }
                a % b
            }
        };
        return Ok(TypedValue::Float(out));
    }

    let num = if promoted.is_signed() || promoted == DataKind::Float {
        Num::I(signed_arith(op, ln.as_i64_wrapping(), rn.as_i64_wrapping())?)
    } else {
        Num::U(unsigned_arith(
            op,
            ln.as_i64_wrapping() as u64,
            rn.as_i64_wrapping() as u64,
        )?)
    };
    Ok(TypedValue::from_num_wrapping(promoted, num))
}

fn signed_arith(op: Operator, a: i64, b: i64) -> Result<i64> {
    Ok(match op {
        Operator::Plus => a.wrapping_add(b),
        Operator::Minus => a.wrapping_sub(b),
        Operator::Star => a.wrapping_mul(b),
        Operator::Slash => {
            if b == 0 {
                return Err(Error::DivisionByZero);
            }
            // i64::MIN / -1 overflows; negation is the defined result.
            if b == -1 {
                a.wrapping_neg()
            } else {
                a / b
            }
        }
        Operator::Mod => {
            if b == 0 {
                return Err(Error::DivisionByZero);
            }
            if b == -1 {
                0
            } else {
                a % b
            }
        }
        Operator::Shiftl => a.wrapping_shl(b as u32 & 63),
        Operator::Shiftr => a.wrapping_shr(b as u32 & 63),
        Operator::Shiftrr => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
        Operator::BitwiseAnd => a & b,
        Operator::BitwiseOr => a | b,
        Operator::BitwiseXor => a ^ b,
        other => return Err(Error::UnknownOperator(other)),
    })
}

fn unsigned_arith(op: Operator, a: u64, b: u64) -> Result<u64> {
    Ok(match op {
        Operator::Plus => a.wrapping_add(b),
        Operator::Minus => a.wrapping_sub(b),
        Operator::Star => a.wrapping_mul(b),
        Operator::Slash => {
            if b == 0 {
                return Err(Error::DivisionByZero);
            }
            a / b
        }
        Operator::Mod => {
            if b == 0 {
                return Err(Error::DivisionByZero);
            }
            a % b
        }
        Operator::Shiftl => a.wrapping_shl(b as u32 & 63),
        Operator::Shiftr | Operator::Shiftrr => a.wrapping_shr(b as u32 & 63),
        Operator::BitwiseAnd => a & b,
        Operator::BitwiseOr => a | b,
        Operator::BitwiseXor => a ^ b,
        other => return Err(Error::UnknownOperator(other)),
    })
}

/// Convert an evaluation result into a match score: zero means "does not
/// match".
pub fn score_value(v: &TypedValue) -> i32 {
    match v {
        TypedValue::Void => 0,
        TypedValue::Vector(_) | TypedValue::Record { .. } => 1,
        TypedValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(|i| i32::try_from(i).unwrap_or(1))
            .unwrap_or(1),
        other => other
            .as_num()
            .map(|n| i32::try_from(n.as_i64_wrapping()).unwrap_or(1))
            .unwrap_or(1),
    }
}
