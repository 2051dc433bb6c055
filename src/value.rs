use std::{fmt, time::SystemTime};

use crate::protocol::MetricRecord;

/// A typed scalar accepted by the collector.
///
/// [`fmt::Display`] renders the wire form: floats with exactly six decimal places (`+Inf`, `-Inf`
/// and `NaN` for the non-finite ones), everything else in its natural textual form. The collector only accepts non-negative integers as literal text,
/// negative numbers should be passed as floats.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    F32(f32),
    F64(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Text(String),
    Error(String),
    Null,
}

impl Value {
    /// Wraps an error, rendering its message.
    pub fn error<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Value::Error(error.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::F32(v) => write_float(f, f64::from(*v)),
            Value::F64(v) => write_float(f, *v),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) | Value::Error(v) => f.write_str(v),
            Value::Null => f.write_str("<nil>"),
        }
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        f.write_str("NaN")
    } else if v.is_infinite() {
        f.write_str(if v > 0.0 { "+Inf" } else { "-Inf" })
    } else {
        write!(f, "{:.6}", v)
    }
}

macro_rules! impl_from {
    ($variant:ident, $target:ty, $($t:ty),+) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(<$target>::from(v))
                }
            }
        )+
    };
}

impl_from!(F32, f32, f32);
impl_from!(F64, f64, f64);
impl_from!(Int, i64, i8, i16, i32, i64);
impl_from!(UInt, u64, u8, u16, u32, u64);
impl_from!(Bool, bool, bool);
impl_from!(Text, String, String, &str);

impl From<isize> for Value {
    fn from(v: isize) -> Self {
        // isize is at most 64 bits wide on supported targets
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::UInt(v as u64)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Converts key/value pairs into records reported for `host`.
///
/// `timestamp` stamps every record with its seconds and nanoseconds. `None` leaves both out of the
/// wire form so the collector stamps the values on receipt.
pub fn make_records<I, K, V>(host: &str, pairs: I, timestamp: Option<SystemTime>) -> Vec<MetricRecord>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(key, value)| {
            let record = MetricRecord::new(host, key, value.into());
            match timestamp {
                Some(ts) => record.with_timestamp(ts),
                None => record,
            }
        })
        .collect()
}
