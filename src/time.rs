use crate::error::Error;
use chrono::{DateTime, NaiveDate, Utc};

/// Format a unix timestamp as an RFC 1123 HTTP-date,
/// e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_time(utc: i64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp(utc, 0)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch"));
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Current time as a unix timestamp.
pub(crate) fn now_utc() -> i64 {
    Utc::now().timestamp()
}

/// Parse an HTTP-date in any of the three formats servers must accept:
/// RFC 1123 (`Sun, 06 Nov 1994 08:49:37 GMT`), RFC 850
/// (`Sunday, 06-Nov-94 08:49:37 GMT`, two-digit year taken as 20xx) and
/// asctime (`Sun Nov  6 08:49:37 1994`).
///
/// Time zones other than `GMT` and out-of-range fields fail.
pub fn parse_time(s: &str) -> Result<i64, Error> {
    parse_rfc1123(s)
        .or_else(|| parse_rfc850(s))
        .or_else(|| parse_asctime(s))
        .ok_or_else(|| Error::Network(format!("Failed to parse HTTP time '{}'", s)))
}

fn mkgmtime(year: i32, month: u32, day: u32, h: u32, m: u32, s: u32) -> Option<i64> {
    let dt = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(h, m, s)?;
    Some(dt.and_utc().timestamp())
}

fn month(s: &str) -> Option<u32> {
    let m = match s {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(m)
}

fn hms(s: &str) -> Option<(u32, u32, u32)> {
    let mut it = s.split(':');
    let h = it.next()?.parse().ok()?;
    let m = it.next()?.parse().ok()?;
    let sec = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    Some((h, m, sec))
}

// Sun, 06 Nov 1994 08:49:37 GMT
fn parse_rfc1123(s: &str) -> Option<i64> {
    let t: Vec<&str> = s.split_whitespace().collect();
    if t.len() != 6 || !t[0].ends_with(',') {
        return None;
    }
    let day = t[1].parse().ok()?;
    let month = month(t[2])?;
    let year = t[3].parse().ok()?;
    let (h, m, sec) = hms(t[4])?;
    if t[5] != "GMT" {
        return None;
    }
    mkgmtime(year, month, day, h, m, sec)
}

// Sunday, 06-Nov-94 08:49:37 GMT
fn parse_rfc850(s: &str) -> Option<i64> {
    let t: Vec<&str> = s.split_whitespace().collect();
    if t.len() != 4 || !t[0].ends_with(',') {
        return None;
    }
    let mut date = t[1].split('-');
    let day = date.next()?.parse().ok()?;
    let month = month(date.next()?)?;
    let year2: i32 = date.next()?.parse().ok()?;
    if date.next().is_some() || year2 < 0 || year2 > 99 {
        return None;
    }
    let (h, m, sec) = hms(t[2])?;
    if t[3] != "GMT" {
        return None;
    }
    mkgmtime(2000 + year2, month, day, h, m, sec)
}

// Sun Nov  6 08:49:37 1994
fn parse_asctime(s: &str) -> Option<i64> {
    let t: Vec<&str> = s.split_whitespace().collect();
    if t.len() != 5 {
        return None;
    }
    let month = month(t[1])?;
    let day = t[2].parse().ok()?;
    let (h, m, sec) = hms(t[3])?;
    let year = t[4].parse().ok()?;
    mkgmtime(year, month, day, h, m, sec)
}
