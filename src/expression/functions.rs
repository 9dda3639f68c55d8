//! Built-in functions callable from expressions.
//!
//! Every function is pure except `now`, `today`, `uuid`, `random` and
//! `randomInt`, which are re-evaluated each time an expression is
//! resolved. Functions may also be called as methods, in which case the
//! receiver becomes the first argument: `$json.name.upper()` is
//! `upper($json.name)`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac};
use serde_json::{Map, Value};

use super::value::{expect_number, number, strict_eq, to_display, to_number, truthy, type_name};
use super::ExpressionError;

pub type Builtin = fn(&[Value]) -> Result<Value, ExpressionError>;

type FnResult = Result<Value, ExpressionError>;

static NULL: Value = Value::Null;

/// Longest string any function may build.
const MAX_STRING_LEN: usize = 1_000_000;

/// Look up a global function by name.
pub fn lookup(name: &str) -> Option<Builtin> {
    let f: Builtin = match name {
        // string
        "upper" => upper,
        "lower" => lower,
        "trim" => trim,
        "trimStart" => trim_start,
        "trimEnd" => trim_end,
        "capitalize" => capitalize,
        "length" => length,
        "contains" | "includes" => includes,
        "startsWith" => starts_with,
        "endsWith" => ends_with,
        "replace" => replace,
        "split" => split,
        "substring" => substring,
        "padStart" => pad_start,
        "padEnd" => pad_end,
        "repeat" => repeat,
        "indexOf" => index_of,
        "toString" => to_string_fn,
        "concat" => concat,
        "matches" => matches_fn,
        "extract" => extract,
        "base64Encode" => base64_encode,
        "base64Decode" => base64_decode,
        "urlEncode" => url_encode,
        "urlDecode" => url_decode,
        // number
        "toNumber" => to_number_fn,
        "toInt" | "parseInt" => to_int,
        "round" => round,
        "floor" => floor,
        "ceil" => ceil,
        "abs" => abs,
        "min" => min,
        "max" => max,
        "sum" => sum,
        "average" => average,
        "toFixed" => to_fixed,
        "isNumber" => is_number,
        // date
        "now" => now,
        "today" => today,
        "formatDate" => format_date,
        "dateAdd" => date_add,
        "dateDiff" => date_diff,
        "toTimestamp" => to_timestamp,
        "fromTimestamp" => from_timestamp,
        // array
        "first" => first,
        "last" => last,
        "join" => join,
        "unique" => unique,
        "reverse" => reverse,
        "sort" => sort,
        "flatten" => flatten,
        "slice" => slice,
        "compact" => compact,
        "pluck" => pluck,
        // object
        "keys" => keys,
        "values" => values,
        "has" => has,
        "merge" => merge,
        "get" => get,
        "toJson" => to_json,
        "parseJson" => parse_json,
        // hash
        "sha1" => sha1,
        "sha256" => sha256,
        "sha512" => sha512,
        "hmacSha256" => hmac_sha256,
        // identity and randomness
        "uuid" => uuid,
        "random" => random,
        "randomInt" => random_int,
        // type helpers
        "typeOf" => type_of,
        "isNull" => is_null,
        "isEmpty" => is_empty,
        "isString" => is_string,
        "isArray" => is_array,
        "isObject" => is_object,
        "coalesce" => coalesce,
        "ifEmpty" => if_empty,
        _ => return None,
    };
    Some(f)
}

pub fn is_function(name: &str) -> bool {
    lookup(name).is_some()
}

/// Functions that make no sense with a receiver.
const NO_RECEIVER: &[&str] = &["now", "today", "uuid", "random", "randomInt", "fromTimestamp"];

/// Item-batch accessors valid on `$input` and `$node[...]`.
pub const BATCH_METHODS: &[&str] = &["all", "first", "last", "item"];

/// JavaScript method names mapped onto built-ins.
fn method_alias(name: &str) -> Option<&'static str> {
    let target = match name {
        "toUpperCase" => "upper",
        "toLowerCase" => "lower",
        "replaceAll" => "replace",
        "test" => "matches",
        _ => return None,
    };
    Some(target)
}

/// Resolve a method name to the built-in it calls.
pub fn method_target(name: &str) -> Option<&str> {
    if let Some(target) = method_alias(name) {
        return Some(target);
    }
    if is_function(name) && !NO_RECEIVER.contains(&name) {
        return Some(name);
    }
    None
}

pub fn is_method(name: &str) -> bool {
    BATCH_METHODS.contains(&name) || method_target(name).is_some()
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn percent_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

// ============================================================================
// Argument helpers
// ============================================================================

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn text(args: &[Value], index: usize, function: &str) -> Result<String, ExpressionError> {
    match arg(args, index) {
        Value::Array(_) | Value::Object(_) => Err(ExpressionError::Type(format!(
            "{}() expects a string, got {}",
            function,
            type_name(arg(args, index))
        ))),
        other => Ok(to_display(other)),
    }
}

fn integer(args: &[Value], index: usize, function: &str) -> Result<i64, ExpressionError> {
    Ok(expect_number(arg(args, index), function)?.trunc() as i64)
}

fn optional_integer(
    args: &[Value],
    index: usize,
    function: &str,
) -> Result<Option<i64>, ExpressionError> {
    match arg(args, index) {
        Value::Null => Ok(None),
        _ => integer(args, index, function).map(Some),
    }
}

fn array<'a>(args: &'a [Value], index: usize, function: &str) -> Result<&'a Vec<Value>, ExpressionError> {
    match arg(args, index) {
        Value::Array(items) => Ok(items),
        other => Err(ExpressionError::Type(format!(
            "{}() expects an array, got {}",
            function,
            type_name(other)
        ))),
    }
}

fn object<'a>(
    args: &'a [Value],
    index: usize,
    function: &str,
) -> Result<&'a Map<String, Value>, ExpressionError> {
    match arg(args, index) {
        Value::Object(map) => Ok(map),
        other => Err(ExpressionError::Type(format!(
            "{}() expects an object, got {}",
            function,
            type_name(other)
        ))),
    }
}

/// Numbers passed either as varargs or as a single array.
fn numbers(args: &[Value], function: &str) -> Result<Vec<f64>, ExpressionError> {
    let values: &[Value] = match args {
        [Value::Array(items)] => items,
        _ => args,
    };
    values.iter().map(|v| expect_number(v, function)).collect()
}

fn check_len(s: String) -> FnResult {
    if s.len() > MAX_STRING_LEN {
        return Err(ExpressionError::Evaluation(
            "string result exceeds maximum length".to_string(),
        ));
    }
    Ok(Value::String(s))
}

/// Resolve a possibly negative JavaScript-style slice index.
fn clamp_index(index: i64, len: usize) -> usize {
    if index < 0 {
        len.saturating_sub(index.unsigned_abs() as usize)
    } else {
        (index as usize).min(len)
    }
}

// ============================================================================
// String
// ============================================================================

fn upper(args: &[Value]) -> FnResult {
    Ok(Value::String(text(args, 0, "upper")?.to_uppercase()))
}

fn lower(args: &[Value]) -> FnResult {
    Ok(Value::String(text(args, 0, "lower")?.to_lowercase()))
}

fn trim(args: &[Value]) -> FnResult {
    Ok(Value::String(text(args, 0, "trim")?.trim().to_string()))
}

fn trim_start(args: &[Value]) -> FnResult {
    Ok(Value::String(text(args, 0, "trimStart")?.trim_start().to_string()))
}

fn trim_end(args: &[Value]) -> FnResult {
    Ok(Value::String(text(args, 0, "trimEnd")?.trim_end().to_string()))
}

fn capitalize(args: &[Value]) -> FnResult {
    let s = text(args, 0, "capitalize")?;
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    Ok(Value::String(out))
}

fn length(args: &[Value]) -> FnResult {
    let len = match arg(args, 0) {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        other => to_display(other).chars().count(),
    };
    Ok(Value::from(len))
}

fn includes(args: &[Value]) -> FnResult {
    let found = match arg(args, 0) {
        Value::Array(items) => items.iter().any(|v| strict_eq(v, arg(args, 1))),
        Value::Object(map) => map.contains_key(&text(args, 1, "includes")?),
        _ => text(args, 0, "includes")?.contains(&text(args, 1, "includes")?),
    };
    Ok(Value::Bool(found))
}

fn starts_with(args: &[Value]) -> FnResult {
    let s = text(args, 0, "startsWith")?;
    Ok(Value::Bool(s.starts_with(&text(args, 1, "startsWith")?)))
}

fn ends_with(args: &[Value]) -> FnResult {
    let s = text(args, 0, "endsWith")?;
    Ok(Value::Bool(s.ends_with(&text(args, 1, "endsWith")?)))
}

fn replace(args: &[Value]) -> FnResult {
    let s = text(args, 0, "replace")?;
    let from = text(args, 1, "replace")?;
    if from.is_empty() {
        return Ok(Value::String(s));
    }
    check_len(s.replace(&from, &text(args, 2, "replace")?))
}

fn split(args: &[Value]) -> FnResult {
    let s = text(args, 0, "split")?;
    let sep = match arg(args, 1) {
        Value::Null => ",".to_string(),
        _ => text(args, 1, "split")?,
    };
    let parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        s.split(sep.as_str())
            .map(|p| Value::String(p.to_string()))
            .collect()
    };
    Ok(Value::Array(parts))
}

fn substring(args: &[Value]) -> FnResult {
    let chars: Vec<char> = text(args, 0, "substring")?.chars().collect();
    let start = clamp_index(integer(args, 1, "substring")?.max(0), chars.len());
    let end = optional_integer(args, 2, "substring")?
        .map(|e| clamp_index(e.max(0), chars.len()))
        .unwrap_or(chars.len());
    let (start, end) = if start > end { (end, start) } else { (start, end) };
    Ok(Value::String(chars[start..end].iter().collect()))
}

fn pad(args: &[Value], function: &str, at_start: bool) -> FnResult {
    let s = text(args, 0, function)?;
    let width = integer(args, 1, function)?.max(0) as usize;
    if width > MAX_STRING_LEN {
        return Err(ExpressionError::Evaluation(
            "string result exceeds maximum length".to_string(),
        ));
    }
    let fill = match arg(args, 2) {
        Value::Null => " ".to_string(),
        _ => text(args, 2, function)?,
    };
    let current = s.chars().count();
    if current >= width || fill.is_empty() {
        return Ok(Value::String(s));
    }
    let padding: String = fill.chars().cycle().take(width - current).collect();
    Ok(Value::String(if at_start {
        padding + &s
    } else {
        s + &padding
    }))
}

fn pad_start(args: &[Value]) -> FnResult {
    pad(args, "padStart", true)
}

fn pad_end(args: &[Value]) -> FnResult {
    pad(args, "padEnd", false)
}

fn repeat(args: &[Value]) -> FnResult {
    let s = text(args, 0, "repeat")?;
    let count = integer(args, 1, "repeat")?.max(0) as usize;
    if s.len().saturating_mul(count) > MAX_STRING_LEN {
        return Err(ExpressionError::Evaluation(
            "string result exceeds maximum length".to_string(),
        ));
    }
    Ok(Value::String(s.repeat(count)))
}

fn index_of(args: &[Value]) -> FnResult {
    let index = match arg(args, 0) {
        Value::Array(items) => items
            .iter()
            .position(|v| strict_eq(v, arg(args, 1)))
            .map(|i| i as i64),
        _ => {
            let s = text(args, 0, "indexOf")?;
            let needle = text(args, 1, "indexOf")?;
            s.find(&needle).map(|byte| s[..byte].chars().count() as i64)
        }
    };
    Ok(Value::from(index.unwrap_or(-1)))
}

fn to_string_fn(args: &[Value]) -> FnResult {
    Ok(Value::String(to_display(arg(args, 0))))
}

fn concat(args: &[Value]) -> FnResult {
    if let Some(Value::Array(_)) = args.first() {
        let mut out = Vec::new();
        for value in args {
            match value {
                Value::Array(items) => out.extend(items.iter().cloned()),
                other => out.push(other.clone()),
            }
        }
        return Ok(Value::Array(out));
    }
    check_len(args.iter().map(to_display).collect())
}

fn compile_regex(pattern: &str) -> Result<regex_lite::Regex, ExpressionError> {
    regex_lite::Regex::new(pattern)
        .map_err(|e| ExpressionError::Evaluation(format!("invalid pattern: {}", e)))
}

fn matches_fn(args: &[Value]) -> FnResult {
    let s = text(args, 0, "matches")?;
    let re = compile_regex(&text(args, 1, "matches")?)?;
    Ok(Value::Bool(re.is_match(&s)))
}

/// First capture group (or whole match) of a pattern, null when absent.
fn extract(args: &[Value]) -> FnResult {
    let s = text(args, 0, "extract")?;
    let re = compile_regex(&text(args, 1, "extract")?)?;
    Ok(re
        .captures(&s)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
        .map(|m| Value::String(m.as_str().to_string()))
        .unwrap_or(Value::Null))
}

fn base64_encode(args: &[Value]) -> FnResult {
    Ok(Value::String(BASE64.encode(text(args, 0, "base64Encode")?)))
}

fn base64_decode(args: &[Value]) -> FnResult {
    let bytes = BASE64
        .decode(text(args, 0, "base64Decode")?.trim())
        .map_err(|e| ExpressionError::Evaluation(format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes)
        .map(Value::String)
        .map_err(|_| ExpressionError::Evaluation("decoded base64 is not UTF-8".to_string()))
}

fn url_encode(args: &[Value]) -> FnResult {
    Ok(Value::String(percent_encode(&text(args, 0, "urlEncode")?, true)))
}

fn url_decode(args: &[Value]) -> FnResult {
    let s = text(args, 0, "urlDecode")?;
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map(Value::String)
        .map_err(|_| ExpressionError::Evaluation("decoded URL text is not UTF-8".to_string()))
}

// ============================================================================
// Number
// ============================================================================

fn to_number_fn(args: &[Value]) -> FnResult {
    number(expect_number(arg(args, 0), "toNumber")?)
}

fn to_int(args: &[Value]) -> FnResult {
    let value = arg(args, 0);
    if let Value::String(s) = value {
        let digits: String = s
            .trim()
            .chars()
            .enumerate()
            .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
            .map(|(_, c)| c)
            .collect();
        return digits
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| ExpressionError::Type(format!("cannot parse '{}' as an integer", s)));
    }
    number(expect_number(value, "toInt")?.trunc())
}

fn round(args: &[Value]) -> FnResult {
    let n = expect_number(arg(args, 0), "round")?;
    let digits = optional_integer(args, 1, "round")?.unwrap_or(0).clamp(0, 15);
    let factor = 10f64.powi(digits as i32);
    number((n * factor).round() / factor)
}

fn floor(args: &[Value]) -> FnResult {
    number(expect_number(arg(args, 0), "floor")?.floor())
}

fn ceil(args: &[Value]) -> FnResult {
    number(expect_number(arg(args, 0), "ceil")?.ceil())
}

fn abs(args: &[Value]) -> FnResult {
    number(expect_number(arg(args, 0), "abs")?.abs())
}

fn min(args: &[Value]) -> FnResult {
    match numbers(args, "min")?.into_iter().reduce(f64::min) {
        Some(n) => number(n),
        None => Ok(Value::Null),
    }
}

fn max(args: &[Value]) -> FnResult {
    match numbers(args, "max")?.into_iter().reduce(f64::max) {
        Some(n) => number(n),
        None => Ok(Value::Null),
    }
}

fn sum(args: &[Value]) -> FnResult {
    number(numbers(args, "sum")?.into_iter().sum())
}

fn average(args: &[Value]) -> FnResult {
    let values = numbers(args, "average")?;
    if values.is_empty() {
        return Ok(Value::Null);
    }
    number(values.iter().sum::<f64>() / values.len() as f64)
}

fn to_fixed(args: &[Value]) -> FnResult {
    let n = expect_number(arg(args, 0), "toFixed")?;
    let digits = optional_integer(args, 1, "toFixed")?.unwrap_or(0).clamp(0, 20) as usize;
    Ok(Value::String(format!("{:.*}", digits, n)))
}

fn is_number(args: &[Value]) -> FnResult {
    Ok(Value::Bool(arg(args, 0).is_number()))
}

// ============================================================================
// Date
// ============================================================================

fn iso(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub(crate) fn today_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

pub(crate) fn iso_value(dt: DateTime<Utc>) -> Value {
    iso(dt)
}

fn parse_date(value: &Value, function: &str) -> Result<DateTime<Utc>, ExpressionError> {
    let invalid = || ExpressionError::Type(format!("{}() received an invalid date", function));
    match value {
        Value::Number(n) => {
            let ms = n.as_f64().ok_or_else(invalid)? as i64;
            Utc.timestamp_millis_opt(ms).single().ok_or_else(invalid)
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(dt.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

fn now(_args: &[Value]) -> FnResult {
    Ok(iso(Utc::now()))
}

fn today(_args: &[Value]) -> FnResult {
    Ok(iso(today_start(Utc::now())))
}

fn format_date(args: &[Value]) -> FnResult {
    let dt = parse_date(arg(args, 0), "formatDate")?;
    let format = match arg(args, 1) {
        Value::Null => "%Y-%m-%d".to_string(),
        _ => text(args, 1, "formatDate")?,
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(ExpressionError::Evaluation(format!(
            "invalid date format '{}'",
            format
        )));
    }
    Ok(Value::String(dt.format_with_items(items.into_iter()).to_string()))
}

fn date_add(args: &[Value]) -> FnResult {
    let dt = parse_date(arg(args, 0), "dateAdd")?;
    let amount = integer(args, 1, "dateAdd")?;
    let unit = text(args, 2, "dateAdd")?;
    let overflow = || ExpressionError::Evaluation("date arithmetic overflowed".to_string());
    let result = match unit.as_str() {
        "months" | "years" => {
            let months = if unit == "years" {
                amount.checked_mul(12).ok_or_else(overflow)?
            } else {
                amount
            };
            let delta = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?);
            if months >= 0 {
                dt.checked_add_months(delta)
            } else {
                dt.checked_sub_months(delta)
            }
        }
        _ => {
            let delta = unit_duration(&unit, amount)?.ok_or_else(overflow)?;
            dt.checked_add_signed(delta)
        }
    };
    result.map(iso).ok_or_else(overflow)
}

fn unit_duration(unit: &str, amount: i64) -> Result<Option<Duration>, ExpressionError> {
    let duration = match unit {
        "milliseconds" => Duration::try_milliseconds(amount),
        "seconds" => Duration::try_seconds(amount),
        "minutes" => Duration::try_minutes(amount),
        "hours" => Duration::try_hours(amount),
        "days" => Duration::try_days(amount),
        "weeks" => Duration::try_weeks(amount),
        other => {
            return Err(ExpressionError::Evaluation(format!(
                "unknown date unit '{}'",
                other
            )))
        }
    };
    Ok(duration)
}

fn date_diff(args: &[Value]) -> FnResult {
    let from = parse_date(arg(args, 0), "dateDiff")?;
    let to = parse_date(arg(args, 1), "dateDiff")?;
    let unit = match arg(args, 2) {
        Value::Null => "milliseconds".to_string(),
        _ => text(args, 2, "dateDiff")?,
    };
    let millis = (to - from).num_milliseconds() as f64;
    let divisor = match unit.as_str() {
        "milliseconds" => 1.0,
        "seconds" => 1_000.0,
        "minutes" => 60_000.0,
        "hours" => 3_600_000.0,
        "days" => 86_400_000.0,
        "weeks" => 604_800_000.0,
        other => {
            return Err(ExpressionError::Evaluation(format!(
                "unknown date unit '{}'",
                other
            )))
        }
    };
    number((millis / divisor).trunc())
}

fn to_timestamp(args: &[Value]) -> FnResult {
    Ok(Value::from(
        parse_date(arg(args, 0), "toTimestamp")?.timestamp_millis(),
    ))
}

fn from_timestamp(args: &[Value]) -> FnResult {
    let ms = integer(args, 0, "fromTimestamp")?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(iso)
        .ok_or_else(|| ExpressionError::Evaluation(format!("invalid timestamp {}", ms)))
}

// ============================================================================
// Array
// ============================================================================

fn first(args: &[Value]) -> FnResult {
    Ok(array(args, 0, "first")?.first().cloned().unwrap_or(Value::Null))
}

fn last(args: &[Value]) -> FnResult {
    Ok(array(args, 0, "last")?.last().cloned().unwrap_or(Value::Null))
}

fn join(args: &[Value]) -> FnResult {
    let items = array(args, 0, "join")?;
    let sep = match arg(args, 1) {
        Value::Null => ",".to_string(),
        _ => text(args, 1, "join")?,
    };
    check_len(items.iter().map(to_display).collect::<Vec<_>>().join(&sep))
}

fn unique(args: &[Value]) -> FnResult {
    let mut out: Vec<Value> = Vec::new();
    for value in array(args, 0, "unique")? {
        if !out.iter().any(|seen| strict_eq(seen, value)) {
            out.push(value.clone());
        }
    }
    Ok(Value::Array(out))
}

fn reverse(args: &[Value]) -> FnResult {
    match arg(args, 0) {
        Value::Array(items) => Ok(Value::Array(items.iter().rev().cloned().collect())),
        _ => Ok(Value::String(text(args, 0, "reverse")?.chars().rev().collect())),
    }
}

fn sort_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn sort(args: &[Value]) -> FnResult {
    let mut items = array(args, 0, "sort")?.clone();
    items.sort_by(|a, b| {
        sort_rank(a).cmp(&sort_rank(b)).then_with(|| match (a, b) {
            (Value::Number(_), Value::Number(_)) => {
                let x = to_number(a).unwrap_or(0.0);
                let y = to_number(b).unwrap_or(0.0);
                x.total_cmp(&y)
            }
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => to_display(a).cmp(&to_display(b)),
        })
    });
    Ok(Value::Array(items))
}

fn flatten(args: &[Value]) -> FnResult {
    let mut out = Vec::new();
    for value in array(args, 0, "flatten")? {
        match value {
            Value::Array(inner) => out.extend(inner.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    Ok(Value::Array(out))
}

fn slice(args: &[Value]) -> FnResult {
    let start = optional_integer(args, 1, "slice")?.unwrap_or(0);
    let end = optional_integer(args, 2, "slice")?;
    match arg(args, 0) {
        Value::Array(items) => {
            let s = clamp_index(start, items.len());
            let e = end.map(|e| clamp_index(e, items.len())).unwrap_or(items.len());
            Ok(Value::Array(if s < e {
                items[s..e].to_vec()
            } else {
                Vec::new()
            }))
        }
        _ => {
            let chars: Vec<char> = text(args, 0, "slice")?.chars().collect();
            let s = clamp_index(start, chars.len());
            let e = end.map(|e| clamp_index(e, chars.len())).unwrap_or(chars.len());
            Ok(Value::String(if s < e {
                chars[s..e].iter().collect()
            } else {
                String::new()
            }))
        }
    }
}

fn compact(args: &[Value]) -> FnResult {
    Ok(Value::Array(
        array(args, 0, "compact")?
            .iter()
            .filter(|v| !v.is_null())
            .cloned()
            .collect(),
    ))
}

fn pluck(args: &[Value]) -> FnResult {
    let key = text(args, 1, "pluck")?;
    Ok(Value::Array(
        array(args, 0, "pluck")?
            .iter()
            .map(|v| v.get(&key).cloned().unwrap_or(Value::Null))
            .collect(),
    ))
}

// ============================================================================
// Object
// ============================================================================

fn keys(args: &[Value]) -> FnResult {
    Ok(Value::Array(
        object(args, 0, "keys")?
            .keys()
            .map(|k| Value::String(k.clone()))
            .collect(),
    ))
}

fn values(args: &[Value]) -> FnResult {
    Ok(Value::Array(object(args, 0, "values")?.values().cloned().collect()))
}

fn has(args: &[Value]) -> FnResult {
    let key = text(args, 1, "has")?;
    Ok(Value::Bool(object(args, 0, "has")?.contains_key(&key)))
}

fn merge(args: &[Value]) -> FnResult {
    let mut out = Map::new();
    for (index, _) in args.iter().enumerate() {
        for (k, v) in object(args, index, "merge")? {
            out.insert(k.clone(), v.clone());
        }
    }
    Ok(Value::Object(out))
}

/// Dotted-path lookup with an optional default: `get($json, "a.b", 0)`.
fn get(args: &[Value]) -> FnResult {
    let path = text(args, 1, "get")?;
    let mut current = arg(args, 0);
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Ok(arg(args, 2).clone()),
        }
    }
    Ok(current.clone())
}

fn to_json(args: &[Value]) -> FnResult {
    check_len(arg(args, 0).to_string())
}

fn parse_json(args: &[Value]) -> FnResult {
    serde_json::from_str(&text(args, 0, "parseJson")?)
        .map_err(|e| ExpressionError::Evaluation(format!("invalid JSON: {}", e)))
}

// ============================================================================
// Hash
// ============================================================================

fn hash_hex(args: &[Value], function: &str, algorithm: &'static digest::Algorithm) -> FnResult {
    let input = text(args, 0, function)?;
    Ok(Value::String(hex::encode(
        digest::digest(algorithm, input.as_bytes()).as_ref(),
    )))
}

fn sha1(args: &[Value]) -> FnResult {
    hash_hex(args, "sha1", &digest::SHA1_FOR_LEGACY_USE_ONLY)
}

fn sha256(args: &[Value]) -> FnResult {
    hash_hex(args, "sha256", &digest::SHA256)
}

fn sha512(args: &[Value]) -> FnResult {
    hash_hex(args, "sha512", &digest::SHA512)
}

fn hmac_sha256(args: &[Value]) -> FnResult {
    let key = hmac::Key::new(hmac::HMAC_SHA256, text(args, 0, "hmacSha256")?.as_bytes());
    let tag = hmac::sign(&key, text(args, 1, "hmacSha256")?.as_bytes());
    Ok(Value::String(hex::encode(tag.as_ref())))
}

// ============================================================================
// Identity and randomness
// ============================================================================

fn random_u64() -> Result<u64, ExpressionError> {
    let mut bytes = [0u8; 8];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| ExpressionError::Evaluation("random source unavailable".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

fn uuid(_args: &[Value]) -> FnResult {
    Ok(Value::String(uuid::Uuid::new_v4().to_string()))
}

fn random(_args: &[Value]) -> FnResult {
    // 53 random bits give a uniform float in [0, 1)
    let value = (random_u64()? >> 11) as f64 / (1u64 << 53) as f64;
    number(value)
}

/// Uniform integer in `[min, max)`.
fn random_int(args: &[Value]) -> FnResult {
    let min = integer(args, 0, "randomInt")?;
    let max = integer(args, 1, "randomInt")?;
    if max <= min {
        return Err(ExpressionError::Evaluation(
            "randomInt() requires max > min".to_string(),
        ));
    }
    let span = max.abs_diff(min);
    let offset = random_u64()? % span;
    Ok(Value::from(min.wrapping_add(offset as i64)))
}

// ============================================================================
// Type helpers
// ============================================================================

fn type_of(args: &[Value]) -> FnResult {
    Ok(Value::String(type_name(arg(args, 0)).to_string()))
}

fn is_null(args: &[Value]) -> FnResult {
    Ok(Value::Bool(arg(args, 0).is_null()))
}

fn empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_empty(args: &[Value]) -> FnResult {
    Ok(Value::Bool(empty(arg(args, 0))))
}

fn is_string(args: &[Value]) -> FnResult {
    Ok(Value::Bool(arg(args, 0).is_string()))
}

fn is_array(args: &[Value]) -> FnResult {
    Ok(Value::Bool(arg(args, 0).is_array()))
}

fn is_object(args: &[Value]) -> FnResult {
    Ok(Value::Bool(arg(args, 0).is_object()))
}

fn coalesce(args: &[Value]) -> FnResult {
    Ok(args
        .iter()
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

fn if_empty(args: &[Value]) -> FnResult {
    let value = arg(args, 0);
    Ok(if empty(value) {
        arg(args, 1).clone()
    } else {
        value.clone()
    })
}

/// Truthiness as exposed to node implementations (the `if` node uses it).
pub fn is_truthy(value: &Value) -> bool {
    truthy(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: &[Value]) -> FnResult {
        lookup(name).expect("function exists")(args)
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("upper", &[json!("abc")]).unwrap(), json!("ABC"));
        assert_eq!(call("split", &[json!("a,b")]).unwrap(), json!(["a", "b"]));
        assert_eq!(call("substring", &[json!("hello"), json!(1), json!(3)]).unwrap(), json!("el"));
        assert_eq!(call("padStart", &[json!("7"), json!(3), json!("0")]).unwrap(), json!("007"));
        assert_eq!(call("replace", &[json!("a-b-c"), json!("-"), json!("+")]).unwrap(), json!("a+b+c"));
        assert_eq!(call("indexOf", &[json!("héllo"), json!("l")]).unwrap(), json!(2));
        assert_eq!(call("extract", &[json!("order #42"), json!(r"#(\d+)")]).unwrap(), json!("42"));
    }

    #[test]
    fn test_string_functions_reject_objects() {
        assert!(matches!(
            call("upper", &[json!({"a": 1})]),
            Err(ExpressionError::Type(_))
        ));
    }

    #[test]
    fn test_repeat_is_bounded() {
        assert!(call("repeat", &[json!("ab"), json!(10_000_000)]).is_err());
    }

    #[test]
    fn test_number_functions() {
        assert_eq!(call("round", &[json!(2.346), json!(2)]).unwrap(), json!(2.35));
        assert_eq!(call("round", &[json!(2.5)]).unwrap(), json!(3));
        assert_eq!(call("sum", &[json!([1, 2, 3])]).unwrap(), json!(6));
        assert_eq!(call("max", &[json!(1), json!(9), json!(4)]).unwrap(), json!(9));
        assert_eq!(call("toInt", &[json!("42px")]).unwrap(), json!(42));
        assert_eq!(call("toFixed", &[json!(1.5), json!(2)]).unwrap(), json!("1.50"));
    }

    #[test]
    fn test_date_functions() {
        assert_eq!(
            call("dateAdd", &[json!("2024-01-31"), json!(1), json!("months")]).unwrap(),
            json!("2024-02-29T00:00:00.000Z")
        );
        assert_eq!(
            call("dateDiff", &[json!("2024-01-01"), json!("2024-01-08"), json!("days")]).unwrap(),
            json!(7)
        );
        assert_eq!(
            call("formatDate", &[json!("2024-03-05T10:00:00Z"), json!("%d/%m/%Y")]).unwrap(),
            json!("05/03/2024")
        );
        assert_eq!(call("toTimestamp", &[json!("1970-01-01T00:00:01Z")]).unwrap(), json!(1000));
        assert!(call("formatDate", &[json!("2024-01-01"), json!("%Q")]).is_err());
    }

    #[test]
    fn test_array_and_object_functions() {
        assert_eq!(call("unique", &[json!([1, 1, 2])]).unwrap(), json!([1, 2]));
        assert_eq!(call("sort", &[json!([3, "a", 1, null])]).unwrap(), json!([null, 1, 3, "a"]));
        assert_eq!(call("slice", &[json!([1, 2, 3, 4]), json!(-2)]).unwrap(), json!([3, 4]));
        assert_eq!(call("get", &[json!({"a": {"b": [5]}}), json!("a.b.0")]).unwrap(), json!(5));
        assert_eq!(call("get", &[json!({}), json!("x"), json!("d")]).unwrap(), json!("d"));
        assert_eq!(
            call("merge", &[json!({"a": 1}), json!({"b": 2})]).unwrap(),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn test_hash_functions() {
        assert_eq!(
            call("sha256", &[json!("abc")]).unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(
            call("sha1", &[json!("abc")]).unwrap(),
            json!("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
    }

    #[test]
    fn test_random_int_range() {
        for _ in 0..50 {
            let n = call("randomInt", &[json!(3), json!(6)]).unwrap().as_i64().unwrap();
            assert!((3..6).contains(&n));
        }
        assert!(call("randomInt", &[json!(5), json!(5)]).is_err());
    }

    #[test]
    fn test_method_table() {
        assert_eq!(method_target("toUpperCase"), Some("upper"));
        assert_eq!(method_target("join"), Some("join"));
        assert_eq!(method_target("now"), None);
        assert!(is_method("all"));
        assert!(!is_method("call"));
        assert!(!is_method("apply"));
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("a b/c", false), "a%20b/c");
        assert_eq!(percent_encode("a b/c", true), "a%20b%2Fc");
        assert_eq!(call("urlDecode", &[json!("a%20b+c")]).unwrap(), json!("a b c"));
    }
}
