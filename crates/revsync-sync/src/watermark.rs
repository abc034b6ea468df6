use chrono::{Days, NaiveDate};
use revsync_adapters::normalize::parse_timestamp;
use revsync_core::{CellValue, ColumnDef, TableRef};
use revsync_storage::Warehouse;
use tracing::{info, warn};

/// Where the next incremental fetch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watermark {
    /// Day before the newest stored date.
    Resume(NaiveDate),
    /// Target is empty; fetch everything.
    FullHistory,
    /// The read failed; refetch from yesterday.
    Fallback { start: NaiveDate, error: String },
}

impl Watermark {
    pub fn start(&self) -> Option<NaiveDate> {
        match self {
            Watermark::Resume(day) => Some(*day),
            Watermark::FullHistory => None,
            Watermark::Fallback { start, .. } => Some(*start),
        }
    }
}

fn day_before(day: NaiveDate) -> NaiveDate {
    day.checked_sub_days(Days::new(1)).unwrap_or(day)
}

/// `MAX(column)` of the target minus one day. A null maximum means a full
/// fetch; a failed read falls back to the day before `today`.
pub async fn resolve_watermark(
    warehouse: &dyn Warehouse,
    target: &TableRef,
    column: &ColumnDef,
    today: NaiveDate,
) -> Watermark {
    let fallback = |error: String| {
        warn!(table = %target, error = %error, "watermark read failed, falling back to yesterday");
        Watermark::Fallback {
            start: day_before(today),
            error,
        }
    };

    let latest = match warehouse.max_value(target, column).await {
        Ok(CellValue::Null) => {
            info!(table = %target, "no watermark, full fetch");
            return Watermark::FullHistory;
        }
        Ok(CellValue::Timestamp(ts)) => ts.date(),
        Ok(CellValue::Text(raw)) => match parse_timestamp(&raw) {
            Some(ts) => ts.date(),
            None => return fallback(format!("unparseable watermark value `{raw}`")),
        },
        Ok(other) => return fallback(format!("unexpected watermark value {other:?}")),
        Err(err) => return fallback(err.to_string()),
    };

    let start = day_before(latest);
    info!(table = %target, watermark = %start, "resuming from watermark");
    Watermark::Resume(start)
}
