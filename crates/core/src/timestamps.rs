//! UTC normalisation for persisted timestamps.
//!
//! Every timestamp written to the store must carry an explicit UTC offset.
//! Naive values are reinterpreted as UTC; offset values are converted.

use chrono::{DateTime, SubsecRound, Utc};

use crate::types::Timestamp;
use crate::value::{CellValue, Record};

/// Force a timestamp value onto a `+00:00` offset. Non-timestamp values
/// are returned unchanged.
pub fn to_utc(value: &CellValue) -> CellValue {
    match value {
        CellValue::LocalDateTime(naive) => {
            CellValue::DateTime(DateTime::<Utc>::from_naive_utc_and_offset(*naive, Utc).fixed_offset())
        }
        CellValue::DateTime(dt) => CellValue::DateTime(dt.with_timezone(&Utc).fixed_offset()),
        other => other.clone(),
    }
}

/// Returns `true` if `value` is a timestamp carrying a zero offset.
pub fn is_utc(value: &CellValue) -> bool {
    matches!(value, CellValue::DateTime(dt) if dt.offset().local_minus_utc() == 0)
}

/// Re-assert UTC on every timestamp value in a record.
pub fn enforce_utc(record: &mut Record) {
    for value in record.values_mut() {
        if value.is_timestamp() && !is_utc(value) {
            *value = to_utc(value);
        }
    }
}

/// The instant stamped onto every audit column of one batch.
///
/// Truncated to microseconds, the store's timestamp precision, so values
/// read back compare equal to what was written.
pub fn unified_timestamp() -> Timestamp {
    Utc::now().trunc_subsecs(6)
}

/// A batch timestamp as a cell value.
pub fn timestamp_value(ts: Timestamp) -> CellValue {
    CellValue::DateTime(ts.fixed_offset())
}
