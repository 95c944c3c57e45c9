//! Helper functions registered into every script engine.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Duration as ChronoDuration;
use conduit_core::{validate_target_url, Clock, UrlPolicy};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position};
use serde_json::Value;
use tokio::runtime::Handle;

use super::convert::{dynamic_to_json, json_to_dynamic};
use crate::dates;

/// Longest delay `sleep` accepts.
pub const MAX_SLEEP_MS: i64 = 30_000;

type HelperResult<T> = Result<T, Box<EvalAltResult>>;

/// Everything the helpers close over for one invocation.
#[derive(Clone)]
pub(crate) struct HelperEnv {
    pub clock: Arc<dyn Clock>,
    pub deadline: Instant,
    pub runtime: Handle,
    pub http: Option<reqwest::Client>,
    pub http_timeout: Duration,
    pub url_policy: UrlPolicy,
    pub max_depth: usize,
}

pub(crate) fn register(engine: &mut Engine, env: &HelperEnv) {
    register_dates(engine, env);
    register_strings(engine);
    register_sleep(engine, env);
    register_http(engine, env);

    engine.register_fn("getOr", get_or);
}

fn register_dates(engine: &mut Engine, env: &HelperEnv) {
    let clock = env.clock.clone();
    engine.register_fn("now", move || clock.now_millis());

    engine.register_fn("parseDate", |raw: ImmutableString| -> HelperResult<i64> {
        dates::parse_datetime(&raw)
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| format!("parseDate: unrecognized date '{raw}'").into())
    });
    engine.register_fn("toTimestamp", |value: Dynamic| timestamp_of(&value));
    engine.register_fn("toISOString", |value: Dynamic| -> HelperResult<String> {
        let millis = timestamp_of(&value)?;
        dates::from_millis(millis)
            .map(|dt| dates::to_iso_millis(&dt))
            .ok_or_else(|| format!("toISOString: timestamp {millis} out of range").into())
    });

    engine.register_fn("addMinutes", |at: Dynamic, n: i64| shift(&at, ChronoDuration::try_minutes(n)));
    engine.register_fn("addHours", |at: Dynamic, n: i64| shift(&at, ChronoDuration::try_hours(n)));
    engine.register_fn("addDays", |at: Dynamic, n: i64| shift(&at, ChronoDuration::try_days(n)));
    engine.register_fn("subtractHours", |at: Dynamic, n: i64| {
        shift(&at, ChronoDuration::try_hours(n).map(|d| -d))
    });
    engine.register_fn("subtractDays", |at: Dynamic, n: i64| {
        shift(&at, ChronoDuration::try_days(n).map(|d| -d))
    });
}

fn register_strings(engine: &mut Engine) {
    engine.register_fn("upper", |s: ImmutableString| s.to_uppercase());
    engine.register_fn("lower", |s: ImmutableString| s.to_lowercase());
    engine.register_fn("trimmed", |s: ImmutableString| s.trim().to_string());
    engine.register_fn("formatPhone", |s: ImmutableString| format_phone(&s));
}

fn register_sleep(engine: &mut Engine, env: &HelperEnv) {
    let deadline = env.deadline;
    engine.register_fn("sleep", move |ms: i64| -> HelperResult<()> {
        if !(0..=MAX_SLEEP_MS).contains(&ms) {
            return Err(format!("sleep: {ms}ms is outside 0..={MAX_SLEEP_MS}ms").into());
        }
        let requested = Duration::from_millis(ms.unsigned_abs());
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(requested.min(remaining));
        if requested > remaining {
            return Err(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into());
        }
        Ok(())
    });
}

fn register_http(engine: &mut Engine, env: &HelperEnv) {
    let get_env = env.clone();
    engine.register_fn("httpGet", move |url: ImmutableString| -> HelperResult<Dynamic> {
        let url = checked_url(&url, &get_env.url_policy)?;
        let request = client(&get_env)?.get(url).timeout(get_env.http_timeout);
        send(&get_env.runtime, request)
    });

    let post_env = env.clone();
    engine.register_fn(
        "httpPost",
        move |url: ImmutableString, body: Dynamic| -> HelperResult<Dynamic> {
            let url = checked_url(&url, &post_env.url_policy)?;
            let body = dynamic_to_json(&body, post_env.max_depth)
                .map_err(|e| Box::<EvalAltResult>::from(format!("httpPost: {e}")))?;
            let request = client(&post_env)?.post(url).timeout(post_env.http_timeout).json(&body);
            send(&post_env.runtime, request)
        },
    );
}

fn client(env: &HelperEnv) -> HelperResult<&reqwest::Client> {
    env.http.as_ref().ok_or_else(|| "http: client unavailable".into())
}

fn checked_url(raw: &str, policy: &UrlPolicy) -> HelperResult<reqwest::Url> {
    validate_target_url(raw, policy).map_err(|e| format!("http: {e}").into())
}

fn send(runtime: &Handle, request: reqwest::RequestBuilder) -> HelperResult<Dynamic> {
    runtime.block_on(fetch(request))
}

async fn fetch(request: reqwest::RequestBuilder) -> HelperResult<Dynamic> {
    let response = request.send().await.map_err(|e| format!("http: request failed: {e}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("http: status {}", status.as_u16()).into());
    }
    let text = response.text().await.map_err(|e| format!("http: reading body: {e}"))?;
    Ok(match serde_json::from_str::<Value>(&text) {
        Ok(json) => json_to_dynamic(&json),
        Err(_) => Dynamic::from(ImmutableString::from(text)),
    })
}

fn timestamp_of(value: &Dynamic) -> HelperResult<i64> {
    if let Ok(ms) = value.as_int() {
        return Ok(ms);
    }
    if let Ok(f) = value.as_float() {
        return Ok(f as i64);
    }
    if let Some(raw) = value.read_lock::<ImmutableString>() {
        return dates::parse_datetime(&raw)
            .map(|dt| dt.timestamp_millis())
            .ok_or_else(|| format!("unrecognized date '{}'", raw.as_str()).into());
    }
    Err(format!("expected a date or epoch millis, got {}", value.type_name()).into())
}

fn shift(at: &Dynamic, delta: Option<ChronoDuration>) -> HelperResult<i64> {
    let base = timestamp_of(at)?;
    delta
        .and_then(|d| base.checked_add(d.num_milliseconds()))
        .ok_or_else(|| "date arithmetic overflow".into())
}

fn format_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => format!("({}) {}-{}", &digits[..3], &digits[3..6], &digits[6..]),
        11 if digits.starts_with('1') => {
            format!("+1 ({}) {}-{}", &digits[1..4], &digits[4..7], &digits[7..])
        },
        _ => raw.trim().to_string(),
    }
}

fn get_or(source: Dynamic, path: ImmutableString, default: Dynamic) -> Dynamic {
    let mut current = source;
    for key in path.split('.').filter(|k| !k.is_empty()) {
        let next = current.read_lock::<Map>().and_then(|map| map.get(key).cloned());
        match next {
            Some(value) => current = value,
            None => return default,
        }
    }
    if current.is_unit() {
        default
    } else {
        current
    }
}
