//! Conditional-request evaluation (`If-Match`, `If-Unmodified-Since`, `If-None-Match`,
//! `If-Modified-Since`, `If-Range`) and HTTP-date handling.
//!
//! Each header evaluates to a [`CondResult`]; [`evaluate`] combines them in the fixed precedence
//! order and tells the content server whether to answer 304, 412, or carry on (possibly with a
//! `Range` header that survived `If-Range`).

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

use axum::http::Method;

use crate::module::Input;

/// Layout of an IMF-fixdate, the preferred HTTP-date form.
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const RFC850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S";
const ASCTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Outcome of evaluating one conditional header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondResult {
    /// Header absent or not applicable.
    None,
    True,
    False,
}

/// What the content server must do after evaluating all preconditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NotModified,
    PreconditionFailed,
    /// Serve the resource; `range` is the `Range` header still in effect.
    Proceed { range: Option<String> },
}

pub fn format_http_date(t: DateTime<Utc>) -> String {
    t.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an HTTP-date in IMF-fixdate, RFC 850 or asctime form.
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(t) = NaiveDateTime::parse_from_str(text, HTTP_DATE_FORMAT) {
        return Some(t.and_utc());
    }
    if let Some((body, zone)) = text.rsplit_once(' ')
        && zone.chars().all(|c| c.is_ascii_alphabetic())
        && let Ok(t) = NaiveDateTime::parse_from_str(body, RFC850_FORMAT)
    {
        return Some(t.and_utc());
    }
    // asctime pads single-digit days with a space
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&text, ASCTIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// A missing modification time, or the Unix epoch, means "unknown".
pub fn is_zero_time(t: Option<DateTime<Utc>>) -> bool {
    t.is_none_or(|t| t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0)
}

fn trim_ows(s: &str) -> &str {
    s.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}

/// Splits the leading entity tag off `s`, returning the tag and the rest.
pub fn scan_etag(s: &str) -> Option<(&str, &str)> {
    let s = trim_ows(s);
    let start = if s.starts_with("W/") { 2 } else { 0 };
    let bytes = s.as_bytes();
    if bytes.len() - start < 2 || bytes[start] != b'"' {
        return None;
    }
    for (i, &c) in bytes.iter().enumerate().skip(start + 1) {
        match c {
            b'"' => return Some((&s[..=i], &s[i + 1..])),
            0x21 | 0x23..=0x7E | 0x80..=0xFF => {}
            _ => return None,
        }
    }
    None
}

fn etag_strong_match(a: &str, b: &str) -> bool {
    a == b && a.starts_with('"')
}

fn etag_weak_match(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

fn is_read_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

pub fn check_if_match(input: &dyn Input, etag: Option<&str>) -> CondResult {
    let Some(mut list) = input.header("If-Match") else {
        return CondResult::None;
    };
    loop {
        list = trim_ows(list);
        if list.is_empty() {
            break;
        }
        if let Some(rest) = list.strip_prefix(',') {
            list = rest;
            continue;
        }
        if list.starts_with('*') {
            return CondResult::True;
        }
        let Some((tag, rest)) = scan_etag(list) else {
            break;
        };
        if etag.is_some_and(|current| etag_strong_match(tag, current)) {
            return CondResult::True;
        }
        list = rest;
    }
    CondResult::False
}

pub fn check_if_unmodified_since(input: &dyn Input, modtime: Option<DateTime<Utc>>) -> CondResult {
    let Some(header) = input.header("If-Unmodified-Since") else {
        return CondResult::None;
    };
    let Some(modtime) = modtime.filter(|_| !is_zero_time(modtime)) else {
        return CondResult::None;
    };
    match parse_http_date(header) {
        Some(t) if modtime < t + TimeDelta::seconds(1) => CondResult::True,
        Some(_) => CondResult::False,
        None => CondResult::None,
    }
}

pub fn check_if_none_match(input: &dyn Input, etag: Option<&str>) -> CondResult {
    let Some(mut list) = input.header("If-None-Match") else {
        return CondResult::None;
    };
    loop {
        list = trim_ows(list);
        if list.is_empty() {
            break;
        }
        if let Some(rest) = list.strip_prefix(',') {
            list = rest;
            continue;
        }
        if list.starts_with('*') {
            return CondResult::False;
        }
        let Some((tag, rest)) = scan_etag(list) else {
            break;
        };
        if etag.is_some_and(|current| etag_weak_match(tag, current)) {
            return CondResult::False;
        }
        list = rest;
    }
    CondResult::True
}

pub fn check_if_modified_since(input: &dyn Input, modtime: Option<DateTime<Utc>>) -> CondResult {
    if !is_read_method(input.method()) {
        return CondResult::None;
    }
    let Some(header) = input.header("If-Modified-Since") else {
        return CondResult::None;
    };
    let Some(modtime) = modtime.filter(|_| !is_zero_time(modtime)) else {
        return CondResult::None;
    };
    match parse_http_date(header) {
        Some(t) if modtime < t + TimeDelta::seconds(1) => CondResult::False,
        Some(_) => CondResult::True,
        None => {
            tracing::debug!("ignoring unparsable If-Modified-Since: {:?}", header);
            CondResult::None
        }
    }
}

pub fn check_if_range(
    input: &dyn Input,
    etag: Option<&str>,
    modtime: Option<DateTime<Utc>>,
) -> CondResult {
    if !is_read_method(input.method()) {
        return CondResult::None;
    }
    let Some(header) = input.header("If-Range") else {
        return CondResult::None;
    };
    if let Some((tag, _)) = scan_etag(header) {
        return if etag.is_some_and(|current| etag_strong_match(tag, current)) {
            CondResult::True
        } else {
            CondResult::False
        };
    }
    let Some(modtime) = modtime else {
        return CondResult::False;
    };
    match parse_http_date(header) {
        Some(t) if t.timestamp() == modtime.timestamp() => CondResult::True,
        _ => CondResult::False,
    }
}

/// Runs every precondition in precedence order.
///
/// `etag` is the entity tag the caller already put on the response, if any.
pub fn evaluate(input: &dyn Input, etag: Option<&str>, modtime: Option<DateTime<Utc>>) -> Decision {
    let mut ch = check_if_match(input, etag);
    if ch == CondResult::None {
        ch = check_if_unmodified_since(input, modtime);
    }
    if ch == CondResult::False {
        return Decision::PreconditionFailed;
    }

    match check_if_none_match(input, etag) {
        CondResult::False if is_read_method(input.method()) => return Decision::NotModified,
        CondResult::False => return Decision::PreconditionFailed,
        CondResult::None if check_if_modified_since(input, modtime) == CondResult::False => {
            return Decision::NotModified;
        }
        _ => {}
    }

    let range = input
        .header("Range")
        .filter(|r| !r.is_empty())
        .filter(|_| check_if_range(input, etag, modtime) != CondResult::False)
        .map(str::to_string);
    Decision::Proceed { range }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryInput;
    use chrono::TimeZone;

    fn since(name: &str, date: &str) -> MemoryInput {
        MemoryInput::get("/f").with_header(name, date)
    }

    fn modtime() -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn http_date_formats() {
        let want = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(want));
        assert_eq!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), Some(want));
        assert_eq!(parse_http_date("Sun Nov  6 08:49:37 1994"), Some(want));
        assert_eq!(
            parse_http_date("Wed Nov 16 08:49:37 1994"),
            Some(want + TimeDelta::days(10))
        );
        assert_eq!(parse_http_date("yesterday"), None);
        assert_eq!(format_http_date(want), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn etag_scanning() {
        assert_eq!(scan_etag(" \"abc\", \"d\""), Some(("\"abc\"", ", \"d\"")));
        assert_eq!(scan_etag("W/\"weak\""), Some(("W/\"weak\"", "")));
        assert_eq!(scan_etag("abc"), None);
        assert_eq!(scan_etag("\"unterminated"), None);
        assert_eq!(scan_etag("W/"), None);
    }

    /// If-Match passes, then If-None-Match matches: a GET is answered "not modified".
    #[test]
    fn if_none_match_dominates_after_if_match() {
        let input = MemoryInput::get("/f")
            .with_header("If-Match", "\"v1\"")
            .with_header("If-None-Match", "\"v1\"");
        assert_eq!(check_if_match(&input, Some("\"v1\"")), CondResult::True);
        assert_eq!(evaluate(&input, Some("\"v1\""), modtime()), Decision::NotModified);
    }

    #[test]
    fn if_match_failure_is_412() {
        let input = MemoryInput::get("/f").with_header("If-Match", "\"v2\", \"v3\"");
        assert_eq!(evaluate(&input, Some("\"v1\""), modtime()), Decision::PreconditionFailed);

        let star = MemoryInput::get("/f").with_header("If-Match", "*");
        assert_eq!(check_if_match(&star, None), CondResult::True);

        let weak = MemoryInput::get("/f").with_header("If-Match", "W/\"v1\"");
        assert_eq!(check_if_match(&weak, Some("W/\"v1\"")), CondResult::False);
    }

    #[test]
    fn if_none_match_on_write_method_is_412() {
        let input = MemoryInput::post("/f").with_header("If-None-Match", "W/\"v1\"");
        assert_eq!(evaluate(&input, Some("\"v1\""), modtime()), Decision::PreconditionFailed);

        let other = MemoryInput::get("/f").with_header("If-None-Match", "\"v9\"");
        assert_eq!(check_if_none_match(&other, Some("\"v1\"")), CondResult::True);
    }

    #[test]
    fn unmodified_since_uses_second_resolution() {
        let t = modtime().unwrap() + TimeDelta::milliseconds(400);
        let input = since("If-Unmodified-Since", "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(check_if_unmodified_since(&input, Some(t)), CondResult::True);

        let earlier = since("If-Unmodified-Since", "Fri, 01 Mar 2024 11:59:59 GMT");
        assert_eq!(evaluate(&earlier, None, Some(t)), Decision::PreconditionFailed);
        assert_eq!(check_if_unmodified_since(&earlier, None), CondResult::None);
    }

    #[test]
    fn modified_since() {
        let same = since("If-Modified-Since", "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(evaluate(&same, None, modtime()), Decision::NotModified);

        let older = since("If-Modified-Since", "Thu, 29 Feb 2024 12:00:00 GMT");
        assert_eq!(check_if_modified_since(&older, modtime()), CondResult::True);

        let garbage = MemoryInput::get("/f").with_header("If-Modified-Since", "not a date");
        assert_eq!(check_if_modified_since(&garbage, modtime()), CondResult::None);

        let post = MemoryInput::post("/f")
            .with_header("If-Modified-Since", "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(check_if_modified_since(&post, modtime()), CondResult::None);
        assert_eq!(check_if_modified_since(&same, None), CondResult::None);
    }

    /// A stale If-Range downgrades the range request to a full response.
    #[test]
    fn if_range_controls_range() {
        let fresh = MemoryInput::get("/f")
            .with_header("Range", "bytes=0-1")
            .with_header("If-Range", "\"v1\"");
        assert_eq!(
            evaluate(&fresh, Some("\"v1\""), modtime()),
            Decision::Proceed { range: Some("bytes=0-1".to_string()) }
        );

        let stale = MemoryInput::get("/f")
            .with_header("Range", "bytes=0-1")
            .with_header("If-Range", "\"v0\"");
        assert_eq!(evaluate(&stale, Some("\"v1\""), modtime()), Decision::Proceed { range: None });

        let dated = MemoryInput::get("/f")
            .with_header("Range", "bytes=0-1")
            .with_header("If-Range", "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(check_if_range(&dated, None, modtime()), CondResult::True);
        assert_eq!(check_if_range(&dated, None, None), CondResult::False);
    }
}
