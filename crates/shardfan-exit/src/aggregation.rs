// Terminal aggregations applied to the paged, merged sequence
//
// INVARIANTS:
// 1. Sum preserves the numeric type of the first non-null element and never
//    wraps: integer overflow is an error
// 2. Average is weighted by per-shard row counts, never a mean of means
// 3. Nulls are skipped by every aggregation; an empty input yields Null

use std::str::FromStr;

use bigdecimal::BigDecimal;
use log::debug;
use shardfan_core::{ShardError, ShardResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
    Avg,
}

/// Aggregation over the merged rows, optionally over one property of each row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aggregation {
    function: AggregateFunction,
    property: Option<String>,
}

impl Aggregation {
    pub fn new(function: AggregateFunction) -> Self {
        Aggregation {
            function,
            property: None,
        }
    }

    pub fn sum() -> Self {
        Self::new(AggregateFunction::Sum)
    }

    pub fn min() -> Self {
        Self::new(AggregateFunction::Min)
    }

    pub fn max() -> Self {
        Self::new(AggregateFunction::Max)
    }

    /// Weighted average; rows are `(average, count)` tuples, one per shard.
    pub fn avg() -> Self {
        Self::new(AggregateFunction::Avg)
    }

    /// Aggregates the named property of each row instead of the row itself.
    pub fn on(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    pub fn property(&self) -> Option<&str> {
        self.property.as_deref()
    }

    pub fn apply(&self, rows: Vec<Value>) -> ShardResult<Value> {
        let values: Vec<Value> = match &self.property {
            Some(name) => rows
                .iter()
                .map(|row| row.property(name).cloned().unwrap_or(Value::Null))
                .collect(),
            None => rows,
        };

        match self.function {
            AggregateFunction::Sum => sum_values(values),
            AggregateFunction::Min => extreme_value(values, std::cmp::Ordering::Less),
            AggregateFunction::Max => extreme_value(values, std::cmp::Ordering::Greater),
            AggregateFunction::Avg => average_values(values),
        }
    }
}

fn mismatch(expected: &'static str, found: &Value) -> ShardError {
    ShardError::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}

/// Sums numeric values, dispatching on the type of the first non-null one.
///
/// Later values are coerced to that type; floats and decimals added to an
/// integer sum are truncated toward zero.
pub fn sum_values<I>(values: I) -> ShardResult<Value>
where
    I: IntoIterator<Item = Value>,
{
    let mut values = values.into_iter().filter(|v| !v.is_null());
    let first = match values.next() {
        Some(first) => first,
        None => return Ok(Value::Null),
    };

    match first {
        Value::F32(start) => {
            let mut acc = start;
            for value in values {
                acc += value.as_f64().ok_or_else(|| mismatch("numeric", &value))? as f32;
            }
            Ok(Value::F32(acc))
        }
        Value::F64(start) => {
            let mut acc = start;
            for value in values {
                acc += value.as_f64().ok_or_else(|| mismatch("numeric", &value))?;
            }
            Ok(Value::F64(acc))
        }
        Value::Decimal(start) => {
            let mut acc = start;
            for value in values {
                acc = acc + value.as_decimal().ok_or_else(|| mismatch("decimal", &value))?;
            }
            Ok(Value::Decimal(acc))
        }
        ref template if template.is_integer() => {
            let mut acc = template.as_i128().unwrap_or_default();
            for value in values {
                let next = integer_part(&value).ok_or_else(|| mismatch("integer", &value))?;
                acc = acc
                    .checked_add(next)
                    .ok_or_else(|| ShardError::Overflow("integer sum exceeds i128".into()))?;
            }
            narrow_integer(template, acc)
        }
        other => Err(mismatch("numeric", &other)),
    }
}

fn integer_part(value: &Value) -> Option<i128> {
    value.as_i128().or_else(|| {
        value
            .as_f64()
            .map(f64::trunc)
            .filter(|f| f.is_finite() && f.abs() < i128::MAX as f64)
            .map(|f| f as i128)
    })
}

fn narrow_integer(template: &Value, acc: i128) -> ShardResult<Value> {
    let overflow =
        || ShardError::Overflow(format!("sum {} does not fit in {}", acc, template.type_name()));
    let value = match template {
        Value::I8(_) => Value::I8(i8::try_from(acc).map_err(|_| overflow())?),
        Value::I16(_) => Value::I16(i16::try_from(acc).map_err(|_| overflow())?),
        Value::I32(_) => Value::I32(i32::try_from(acc).map_err(|_| overflow())?),
        Value::I64(_) => Value::I64(i64::try_from(acc).map_err(|_| overflow())?),
        Value::U8(_) => Value::U8(u8::try_from(acc).map_err(|_| overflow())?),
        Value::U16(_) => Value::U16(u16::try_from(acc).map_err(|_| overflow())?),
        Value::U32(_) => Value::U32(u32::try_from(acc).map_err(|_| overflow())?),
        Value::U64(_) => Value::U64(u64::try_from(acc).map_err(|_| overflow())?),
        other => return Err(mismatch("integer", other)),
    };
    Ok(value)
}

/// Minimum (`Less`) or maximum (`Greater`) under natural ordering.
fn extreme_value(values: Vec<Value>, wanted: std::cmp::Ordering) -> ShardResult<Value> {
    let mut best: Option<Value> = None;
    for value in values.into_iter().filter(|v| !v.is_null()) {
        best = match best {
            None => Some(value),
            Some(current) => {
                let cmp = value.natural_cmp(&current).ok_or(ShardError::TypeMismatch {
                    expected: current.type_name(),
                    found: value.type_name(),
                })?;
                if cmp == wanted {
                    Some(value)
                } else {
                    Some(current)
                }
            }
        };
    }
    Ok(best.unwrap_or(Value::Null))
}

/// Weighted mean of `(value, weight)` pairs: `sum(value * weight) / sum(weight)`.
///
/// Returns `None` when the total weight is zero.
pub fn weighted_average<I>(pairs: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, u64)>,
{
    let (weighted_sum, total_weight) = pairs
        .into_iter()
        .fold((0.0f64, 0u64), |(sum, total), (value, weight)| {
            (sum + value * weight as f64, total.saturating_add(weight))
        });
    if total_weight == 0 {
        None
    } else {
        Some(weighted_sum / total_weight as f64)
    }
}

/// Splits an average row into `(average, count)`.
///
/// Plain numeric rows count as one row each.
fn average_pair(row: Value) -> ShardResult<Option<(Value, u64)>> {
    let (avg, count) = match row {
        Value::Tuple(mut items) if items.len() == 2 => {
            let count = items.pop().unwrap_or(Value::Null);
            let avg = items.pop().unwrap_or(Value::Null);
            (avg, count)
        }
        scalar if scalar.is_numeric() => {
            debug!("[Aggregation] Average row without count, weighting as one row");
            (scalar, Value::U64(1))
        }
        other => return Err(mismatch("(average, count) tuple", &other)),
    };

    if avg.is_null() {
        return Ok(None);
    }
    if !avg.is_numeric() {
        return Err(mismatch("numeric", &avg));
    }
    let count = count
        .as_i128()
        .and_then(|c| u64::try_from(c).ok())
        .ok_or_else(|| mismatch("non-negative integer count", &count))?;
    Ok(Some((avg, count)))
}

fn average_values(rows: Vec<Value>) -> ShardResult<Value> {
    let mut pairs = Vec::with_capacity(rows.len());
    for row in rows.into_iter().filter(|v| !v.is_null()) {
        if let Some(pair) = average_pair(row)? {
            pairs.push(pair);
        }
    }

    if pairs.iter().any(|(avg, _)| matches!(avg, Value::Decimal(_))) {
        let mut weighted_sum = BigDecimal::from(0u64);
        let mut total: u64 = 0;
        for (avg, count) in pairs {
            let avg = avg.as_decimal().ok_or_else(|| mismatch("decimal", &avg))?;
            weighted_sum = weighted_sum + avg * BigDecimal::from(count);
            total = total
                .checked_add(count)
                .ok_or_else(|| ShardError::Overflow("average row count".into()))?;
        }
        if total == 0 {
            return Ok(Value::Null);
        }
        return Ok(Value::Decimal(weighted_sum / BigDecimal::from(total)));
    }

    let mut float_pairs = Vec::with_capacity(pairs.len());
    for (avg, count) in pairs {
        let avg = avg.as_f64().ok_or_else(|| mismatch("numeric", &avg))?;
        float_pairs.push((avg, count));
    }
    Ok(weighted_average(float_pairs).map_or(Value::Null, Value::F64))
}

/// Parses a decimal literal; used by callers building decimal values.
pub fn decimal(literal: &str) -> ShardResult<Value> {
    BigDecimal::from_str(literal)
        .map(Value::Decimal)
        .map_err(|_| ShardError::TypeMismatch {
            expected: "decimal literal",
            found: "text",
        })
}
