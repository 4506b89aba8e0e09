//! Typed values: the unit of data flow through the VM and the planner.
//!
//! Every value carries a domain tag ([`DataKind`]); operations consult the
//! tag before interpreting the payload, and conversion between domains is an
//! explicit, fallible cast.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identifier of a record within a table. Zero is the nil record.
pub type RecordId = u32;

/// The nil record id: never a valid member of a table.
pub const NIL_RECORD: RecordId = 0;

/// Identifier of a table within a [`crate::TableResolver`].
pub type TableId = u32;

/// Domain tag of a [`TypedValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DataKind {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    /// Microseconds since the epoch; promotes like `Int64`.
    Time,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Text,
    /// Reference into another table.
    Record,
    Vector,
}

impl DataKind {
    pub fn is_numeric(&self) -> bool {
        self.promotion_rank().is_some()
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataKind::Int8 | DataKind::Int16 | DataKind::Int32 | DataKind::Int64 | DataKind::Time
        )
    }

    /// Position in the arithmetic promotion ladder:
    /// int8 < int16 < int32 < int64/time < uint8 < uint16 < uint32 < uint64 < float.
    /// Non-numeric kinds have no rank.
    pub fn promotion_rank(&self) -> Option<u8> {
        match self {
            DataKind::Int8 => Some(0),
            DataKind::Int16 => Some(1),
            DataKind::Int32 => Some(2),
            DataKind::Int64 | DataKind::Time => Some(3),
            DataKind::UInt8 => Some(4),
            DataKind::UInt16 => Some(5),
            DataKind::UInt32 => Some(6),
            DataKind::UInt64 => Some(7),
            DataKind::Float => Some(8),
            _ => None,
        }
    }

    /// The result domain of an arithmetic operation over two numeric kinds.
    pub fn promote(self, other: DataKind) -> Option<DataKind> {
        let a = self.promotion_rank()?;
        let b = other.promotion_rank()?;
        Some(if a >= b { self } else { other })
    }
}

/// A tagged runtime value.
///
/// `Text` owns its bytes; vectors own their elements. Record references are
/// a `(table, id)` pair; resolving them is the caller's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TypedValue {
    Void,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Time(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f64),
    Text(String),
    Record { table: TableId, id: RecordId },
    Vector(Vec<TypedValue>),
}

/// Loose numeric view of a value, used by the arithmetic dispatcher.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    I(i64),
    U(u64),
    F(f64),
}

impl Num {
    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Num::I(v) => v as f64,
            Num::U(v) => v as f64,
            Num::F(v) => v,
        }
    }

    pub(crate) fn as_i64_wrapping(self) -> i64 {
        match self {
            Num::I(v) => v,
            Num::U(v) => v as i64,
            Num::F(v) => v as i64,
        }
    }

    pub(crate) fn is_zero(self) -> bool {
        match self {
            Num::I(v) => v == 0,
            Num::U(v) => v == 0,
            Num::F(v) => v == 0.0,
        }
    }
}

impl TypedValue {
    pub fn kind(&self) -> DataKind {
        match self {
            TypedValue::Void => DataKind::Void,
            TypedValue::Bool(_) => DataKind::Bool,
            TypedValue::Int8(_) => DataKind::Int8,
            TypedValue::Int16(_) => DataKind::Int16,
            TypedValue::Int32(_) => DataKind::Int32,
            TypedValue::Int64(_) => DataKind::Int64,
            TypedValue::Time(_) => DataKind::Time,
            TypedValue::UInt8(_) => DataKind::UInt8,
            TypedValue::UInt16(_) => DataKind::UInt16,
            TypedValue::UInt32(_) => DataKind::UInt32,
            TypedValue::UInt64(_) => DataKind::UInt64,
            TypedValue::Float(_) => DataKind::Float,
            TypedValue::Text(_) => DataKind::Text,
            TypedValue::Record { .. } => DataKind::Record,
            TypedValue::Vector(_) => DataKind::Vector,
        }
    }

    /// Domain-specific truthiness: non-zero numerics, non-empty text and
    /// vectors, non-nil record references.
    pub fn is_truthy(&self) -> bool {
        match self {
            TypedValue::Void => false,
            TypedValue::Bool(b) => *b,
            TypedValue::Int8(v) => *v != 0,
            TypedValue::Int16(v) => *v != 0,
            TypedValue::Int32(v) => *v != 0,
            TypedValue::Int64(v) => *v != 0,
            TypedValue::Time(v) => *v != 0,
            TypedValue::UInt8(v) => *v != 0,
            TypedValue::UInt16(v) => *v != 0,
            TypedValue::UInt32(v) => *v != 0,
            TypedValue::UInt64(v) => *v != 0,
            TypedValue::Float(v) => *v != 0.0,
            TypedValue::Text(s) => !s.is_empty(),
            TypedValue::Record { id, .. } => *id != NIL_RECORD,
            TypedValue::Vector(v) => !v.is_empty(),
        }
    }

    /// Loose numeric view without text parsing.
    pub(crate) fn as_num(&self) -> Option<Num> {
        match self {
            TypedValue::Bool(b) => Some(Num::I(*b as i64)),
            TypedValue::Int8(v) => Some(Num::I(*v as i64)),
            TypedValue::Int16(v) => Some(Num::I(*v as i64)),
            TypedValue::Int32(v) => Some(Num::I(*v as i64)),
            TypedValue::Int64(v) | TypedValue::Time(v) => Some(Num::I(*v)),
            TypedValue::UInt8(v) => Some(Num::U(*v as u64)),
            TypedValue::UInt16(v) => Some(Num::U(*v as u64)),
            TypedValue::UInt32(v) => Some(Num::U(*v as u64)),
            TypedValue::UInt64(v) => Some(Num::U(*v)),
            TypedValue::Float(v) => Some(Num::F(*v)),
            _ => None,
        }
    }

    /// Numeric view with a text-parsing attempt, the rule the VM applies
    /// when a text operand reaches an arithmetic operator.
    pub(crate) fn as_num_casting(&self) -> Result<Num> {
        if let Some(n) = self.as_num() {
            return Ok(n);
        }
        if let TypedValue::Text(s) = self {
            let t = s.trim();
            if let Ok(v) = t.parse::<i64>() {
                return Ok(Num::I(v));
            }
            if let Ok(v) = t.parse::<f64>() {
                return Ok(Num::F(v));
            }
        }
        Err(Error::TypeCast {
            from: self.kind(),
            to: DataKind::Int64,
        })
    }

    /// Build a value of `kind` from a numeric result, truncating to the
    /// target width the way native integer arithmetic would.
    pub(crate) fn from_num_wrapping(kind: DataKind, n: Num) -> TypedValue {
        let i = n.as_i64_wrapping();
        match kind {
            DataKind::Int8 => TypedValue::Int8(i as i8),
            DataKind::Int16 => TypedValue::Int16(i as i16),
            DataKind::Int32 => TypedValue::Int32(i as i32),
            DataKind::Int64 => TypedValue::Int64(i),
            DataKind::Time => TypedValue::Time(i),
            DataKind::UInt8 => TypedValue::UInt8(i as u8),
            DataKind::UInt16 => TypedValue::UInt16(i as u16),
            DataKind::UInt32 => TypedValue::UInt32(i as u32),
            DataKind::UInt64 => match n {
                Num::U(u) => TypedValue::UInt64(u),
                _ => TypedValue::UInt64(i as u64),
            },
            DataKind::Float => TypedValue::Float(n.as_f64()),
            DataKind::Bool => TypedValue::Bool(i != 0),
            _ => TypedValue::Void,
        }
    }

    /// Explicit cast into another domain. Total over the supported domain
    /// pairs; everything else is a `TypeCast` error.
    pub fn cast_to(&self, kind: DataKind) -> Result<TypedValue> {
        let fail = || Error::TypeCast {
            from: self.kind(),
            to: kind,
        };
        if self.kind() == kind {
            return Ok(self.clone());
        }
        match (self, kind) {
            (_, DataKind::Void) => Err(fail()),
            (TypedValue::Void, _) => Err(fail()),
            (TypedValue::Text(s), DataKind::Bool) => match s.trim() {
                "true" => Ok(TypedValue::Bool(true)),
                "false" => Ok(TypedValue::Bool(false)),
                _ => Err(fail()),
            },
            (TypedValue::Text(s), DataKind::Float) => s
                .trim()
                .parse::<f64>()
                .map(TypedValue::Float)
                .map_err(|_| fail()),
            (TypedValue::Text(s), k) if k.is_numeric() => {
                let i = s.trim().parse::<i64>().map_err(|_| fail())?;
                checked_int_to(i, k).ok_or_else(fail)
            }
            (v, DataKind::Text) => match v {
                TypedValue::Bool(b) => Ok(TypedValue::Text(b.to_string())),
                TypedValue::Float(f) => Ok(TypedValue::Text(f.to_string())),
                other => match other.as_num() {
                    Some(Num::I(i)) => Ok(TypedValue::Text(i.to_string())),
                    Some(Num::U(u)) => Ok(TypedValue::Text(u.to_string())),
                    _ => Err(fail()),
                },
            },
            (v, DataKind::Bool) => match v.as_num() {
                Some(n) => Ok(TypedValue::Bool(!n.is_zero())),
                None => Err(fail()),
            },
            (v, DataKind::Float) => match v.as_num() {
                Some(n) => Ok(TypedValue::Float(n.as_f64())),
                None => Err(fail()),
            },
            (v, k) if k.is_numeric() => match v.as_num() {
                Some(Num::I(i)) => checked_int_to(i, k).ok_or_else(fail),
                Some(Num::U(u)) => {
                    if k == DataKind::UInt64 {
                        return Ok(TypedValue::UInt64(u));
                    }
                    let i = i64::try_from(u).map_err(|_| fail())?;
                    checked_int_to(i, k).ok_or_else(fail)
                }
                Some(Num::F(f)) => {
                    if f.is_finite() && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                        checked_int_to(f as i64, k).ok_or_else(fail)
                    } else {
                        Err(fail())
                    }
                }
                None => Err(fail()),
            },
            _ => Err(fail()),
        }
    }

    /// Loose ordering across domains: numerics compare by value (sign-aware
    /// across signed/unsigned), text against a numeric is parsed first, text
    /// compares lexicographically, records by id within the same table.
    pub fn compare(&self, other: &TypedValue) -> Option<Ordering> {
        match (self, other) {
            (TypedValue::Text(a), TypedValue::Text(b)) => Some(a.as_str().cmp(b.as_str())),
            (TypedValue::Bool(a), TypedValue::Bool(b)) => Some(a.cmp(b)),
            (
                TypedValue::Record { table: ta, id: ia },
                TypedValue::Record { table: tb, id: ib },
            ) => {
                if ta == tb {
                    Some(ia.cmp(ib))
                } else {
                    None
                }
            }
            (TypedValue::Vector(a), TypedValue::Vector(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            _ => {
                let a = self.as_num_casting().ok()?;
                let b = other.as_num_casting().ok()?;
                num_cmp(a, b)
            }
        }
    }

    /// Loose equality consistent with [`TypedValue::compare`].
    pub fn loose_eq(&self, other: &TypedValue) -> bool {
        matches!(self.compare(other), Some(Ordering::Equal))
    }
}

fn checked_int_to(i: i64, kind: DataKind) -> Option<TypedValue> {
    match kind {
        DataKind::Int8 => i8::try_from(i).ok().map(TypedValue::Int8),
        DataKind::Int16 => i16::try_from(i).ok().map(TypedValue::Int16),
        DataKind::Int32 => i32::try_from(i).ok().map(TypedValue::Int32),
        DataKind::Int64 => Some(TypedValue::Int64(i)),
        DataKind::Time => Some(TypedValue::Time(i)),
        DataKind::UInt8 => u8::try_from(i).ok().map(TypedValue::UInt8),
        DataKind::UInt16 => u16::try_from(i).ok().map(TypedValue::UInt16),
        DataKind::UInt32 => u32::try_from(i).ok().map(TypedValue::UInt32),
        DataKind::UInt64 => u64::try_from(i).ok().map(TypedValue::UInt64),
        DataKind::Float => Some(TypedValue::Float(i as f64)),
        _ => None,
    }
}

fn num_cmp(a: Num, b: Num) -> Option<Ordering> {
    match (a, b) {
        (Num::F(x), _) => x.partial_cmp(&b.as_f64()),
        (_, Num::F(y)) => a.as_f64().partial_cmp(&y),
        (Num::I(x), Num::I(y)) => Some(x.cmp(&y)),
        (Num::U(x), Num::U(y)) => Some(x.cmp(&y)),
        (Num::I(x), Num::U(y)) => Some((x as i128).cmp(&(y as i128))),
        (Num::U(x), Num::I(y)) => Some((x as i128).cmp(&(y as i128))),
    }
}
