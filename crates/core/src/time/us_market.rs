use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc, Weekday};

const EST_OFFSET_SECS: i32 = -5 * 3600;
const EDT_OFFSET_SECS: i32 = -4 * 3600;

// US DST switches at 02:00 local time, which is 07:00 UTC in March (EST) and
// 06:00 UTC in November (EDT).
const DST_START_UTC_HOUR: u32 = 7;
const DST_END_UTC_HOUR: u32 = 6;

/// As-of date for a run: the explicit argument if given, else today's US Eastern date.
///
/// No weekend or holiday rollback happens here; the price source rolls back to the last
/// day with data.
pub fn resolve_as_of_date(
    as_of_date_arg: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<NaiveDate> {
    if let Some(s) = as_of_date_arg {
        return NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid as-of date {s:?} (expected YYYY-MM-DD)"));
    }

    let offset = eastern_offset_at(now_utc)?;
    Ok(now_utc.with_timezone(&offset).date_naive())
}

/// US Eastern offset in effect at a UTC instant.
pub fn eastern_offset_at(now_utc: DateTime<Utc>) -> anyhow::Result<FixedOffset> {
    let year = now_utc.year();
    let (start, end) = dst_bounds(year)?;

    let start_utc = start
        .and_hms_opt(DST_START_UTC_HOUR, 0, 0)
        .context("invalid DST start time")?
        .and_utc();
    let end_utc = end
        .and_hms_opt(DST_END_UTC_HOUR, 0, 0)
        .context("invalid DST end time")?
        .and_utc();

    let secs = if now_utc >= start_utc && now_utc < end_utc {
        EDT_OFFSET_SECS
    } else {
        EST_OFFSET_SECS
    };
    FixedOffset::east_opt(secs).context("invalid US Eastern offset")
}

/// US Eastern offset in effect at local midnight of `date`.
pub fn eastern_offset_on(date: NaiveDate) -> anyhow::Result<FixedOffset> {
    let (start, end) = dst_bounds(date.year())?;
    // Midnight precedes the 02:00 switch, so the switch day itself keeps the old offset.
    let secs = if date > start && date <= end {
        EDT_OFFSET_SECS
    } else {
        EST_OFFSET_SECS
    };
    FixedOffset::east_opt(secs).context("invalid US Eastern offset")
}

/// Local midnight of `date` and of the following day, as UTC instants.
pub fn eastern_day_bounds(date: NaiveDate) -> anyhow::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let next = date + Duration::days(1);
    Ok((local_midnight_utc(date)?, local_midnight_utc(next)?))
}

fn local_midnight_utc(date: NaiveDate) -> anyhow::Result<DateTime<Utc>> {
    let offset = eastern_offset_on(date)?;
    let midnight = date.and_hms_opt(0, 0, 0).context("invalid midnight")?;
    let local = midnight
        .and_local_timezone(offset)
        .single()
        .context("ambiguous local midnight")?;
    Ok(local.with_timezone(&Utc))
}

/// Second Sunday of March and first Sunday of November.
fn dst_bounds(year: i32) -> anyhow::Result<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_weekday_of_month_opt(year, 3, Weekday::Sun, 2)
        .with_context(|| format!("no second Sunday of March {year}"))?;
    let end = NaiveDate::from_weekday_of_month_opt(year, 11, Weekday::Sun, 1)
        .with_context(|| format!("no first Sunday of November {year}"))?;
    Ok((start, end))
}
