use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, warn};

use crate::alarm::model::Alarm;
use crate::app::App;
use crate::error::{CommandError, EngineError, StoreError};
use crate::format::format_next_fire;
use crate::store::TimerPreset;
use crate::timer::engine::TimerSpec;

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

pub struct ApiServer {
    local_addr: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, app: Arc<App>) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let local_addr = server.server_addr().to_ip();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::spawn(move || run_server_loop(server, app, stop_for_thread));

        Ok(Self {
            local_addr,
            stop,
            http_join: Some(http_join),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(server: Server, app: Arc<App>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &app),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn handle_request(mut request: tiny_http::Request, app: &App) {
    let Some(remote_addr) = request.remote_addr().copied() else {
        let _ = send_json(request, StatusCode(400), &json!({ "error": "missing remote address" }));
        return;
    };
    if !is_loopback(remote_addr.ip()) {
        let _ = send_json(request, StatusCode(403), &json!({ "error": "forbidden: localhost only" }));
        return;
    }

    let mut body = String::new();
    if let Err(err) = request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
    {
        let _ = send_json(request, StatusCode(400), &json!({ "error": format!("unreadable body: {err}") }));
        return;
    }

    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, query) = split_path_query(&url);
    let reply = route(app, &method, path, query, &body);
    debug!(%method, path, status = reply.status, "api request");
    if let Err(err) = send_json(request, StatusCode(reply.status), &reply.body) {
        warn!(error = %format!("{err:#}"), "failed to send API response");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::not_found(err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownTimer(_) => Self::not_found(err.to_string()),
            EngineError::Stopped => Self::internal(err.to_string()),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Store(err) => err.into(),
            CommandError::Engine(err) => err.into(),
        }
    }
}

type ApiResult = Result<ApiReply, ApiError>;

fn ok<T: Serialize>(body: &T) -> ApiResult {
    reply(200, body)
}

fn created<T: Serialize>(body: &T) -> ApiResult {
    reply(201, body)
}

fn reply<T: Serialize>(status: u16, body: &T) -> ApiResult {
    let body = serde_json::to_value(body)
        .map_err(|err| ApiError::internal(format!("failed to encode response: {err}")))?;
    Ok(ApiReply { status, body })
}

pub fn route(app: &App, method: &Method, path: &str, query: &str, body: &str) -> ApiReply {
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let result = match segments.as_slice() {
        ["health"] => match method {
            Method::Get => health(app),
            _ => Err(method_not_allowed()),
        },
        ["v1", "timers", rest @ ..] => timer_routes(app, method, rest, query, body),
        ["v1", "stopwatch", rest @ ..] => stopwatch_routes(app, method, rest),
        ["v1", "alarms", rest @ ..] => alarm_routes(app, method, rest, body),
        ["v1", "presets", rest @ ..] => preset_routes(app, method, rest, body),
        ["v1", "upcoming"] => match method {
            Method::Get => upcoming(app),
            _ => Err(method_not_allowed()),
        },
        _ => Err(ApiError::not_found(format!("no route for {path}"))),
    };
    result.unwrap_or_else(|err| ApiReply {
        status: err.status,
        body: json!({ "error": err.message }),
    })
}

fn method_not_allowed() -> ApiError {
    ApiError {
        status: 405,
        message: "method not allowed".to_string(),
    }
}

fn health(app: &App) -> ApiResult {
    let snapshot = app.timers.latest();
    ok(&json!({
        "status": "ok",
        "timers": snapshot.timers.len(),
        "ticking": snapshot.ticking,
        "pending_wakes": app.wake_scheduler().pending_count(),
        "exact_wakes": app.scheduling.can_schedule_exact(),
    }))
}

fn timer_routes(app: &App, method: &Method, rest: &[&str], query: &str, body: &str) -> ApiResult {
    match (method, rest) {
        (Method::Get, []) => {
            let snapshot = app.timers.snapshot()?;
            ok(&json!({ "timers": snapshot.timers, "ticking": snapshot.ticking }))
        }
        (Method::Post, []) => {
            let spec: TimerSpec = parse_body(body)?;
            created(&app.timers.start_adhoc(spec)?)
        }
        (Method::Post, ["preset", id]) => created(&app.presets.start(parse_id(id)?)?),
        (Method::Put, [id]) => {
            let spec: TimerSpec = parse_body(body)?;
            if query_param(query, "start") == Some("true") {
                app.timers.edit_and_start(id, spec)?;
            } else {
                app.timers.edit(id, spec)?;
            }
            timer_view(app, id)
        }
        (Method::Delete, [id]) => ok(&json!({ "removed": app.timers.remove(id)? })),
        (Method::Post, [id, action]) => {
            let changed = match *action {
                "pause" => app.timers.pause(id)?,
                "resume" | "start" => app.timers.resume(id)?,
                "reset" => app.timers.reset(id)?,
                "add-minute" => app.timers.add_minute(id)?,
                "acknowledge" => app.timers.acknowledge(id)?,
                other => return Err(ApiError::not_found(format!("unknown timer action '{other}'"))),
            };
            let view = timer_view(app, id)?;
            ok(&json!({ "changed": changed, "timer": view.body }))
        }
        (_, [] | [_] | [_, _]) => Err(method_not_allowed()),
        _ => Err(ApiError::not_found("no such timer route")),
    }
}

fn timer_view(app: &App, id: &str) -> ApiResult {
    let snapshot = app.timers.snapshot()?;
    match snapshot.timer(id) {
        Some(view) => ok(view),
        None => Err(EngineError::UnknownTimer(id.to_string()).into()),
    }
}

fn stopwatch_routes(app: &App, method: &Method, rest: &[&str]) -> ApiResult {
    match (method, rest) {
        (Method::Get, []) => ok(&app.timers.snapshot()?.stopwatch),
        (Method::Post, ["lap"]) => created(&app.timers.record_lap()?),
        (Method::Post, [action]) => {
            let changed = match *action {
                "start" => app.timers.stopwatch_start()?,
                "pause" => app.timers.stopwatch_pause()?,
                "reset" => app.timers.stopwatch_reset()?,
                other => {
                    return Err(ApiError::not_found(format!(
                        "unknown stopwatch action '{other}'"
                    )));
                }
            };
            let snapshot = app.timers.snapshot()?;
            ok(&json!({ "changed": changed, "stopwatch": snapshot.stopwatch }))
        }
        (_, [] | [_]) => Err(method_not_allowed()),
        _ => Err(ApiError::not_found("no such stopwatch route")),
    }
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

fn alarm_routes(app: &App, method: &Method, rest: &[&str], body: &str) -> ApiResult {
    match (method, rest) {
        (Method::Get, []) => ok(&app.alarms.list()?),
        (Method::Post, []) => {
            let alarm: Alarm = parse_body(body)?;
            let (saved, outcome) = app.alarms.add(&alarm)?;
            created(&json!({ "alarm": saved, "schedule": outcome }))
        }
        (Method::Get, [id]) => ok(&app.alarms.get(parse_id(id)?)?),
        (Method::Put, [id]) => {
            let mut alarm: Alarm = parse_body(body)?;
            alarm.id = parse_id(id)?;
            let outcome = app.alarms.update(&alarm)?;
            ok(&json!({ "alarm": app.alarms.get(alarm.id)?, "schedule": outcome }))
        }
        (Method::Delete, [id]) => {
            app.alarms.delete(parse_id(id)?)?;
            ok(&json!({ "deleted": true }))
        }
        (Method::Post, [id, "toggle"]) => {
            let request: ToggleRequest = parse_body(body)?;
            let outcome = app.alarms.toggle(parse_id(id)?, request.enabled)?;
            ok(&json!({ "enabled": request.enabled, "schedule": outcome }))
        }
        (Method::Post, [id, "dismiss"]) => {
            ok(&json!({ "schedule": app.firing.dismiss(parse_id(id)?)? }))
        }
        (Method::Post, [id, "snooze"]) => {
            ok(&json!({ "schedule": app.firing.snooze(parse_id(id)?)? }))
        }
        (_, [] | [_]) => Err(method_not_allowed()),
        _ => Err(ApiError::not_found("no such alarm route")),
    }
}

fn preset_routes(app: &App, method: &Method, rest: &[&str], body: &str) -> ApiResult {
    match (method, rest) {
        (Method::Get, []) => ok(&app.presets.list()?),
        (Method::Post, []) => {
            let preset: TimerPreset = parse_body(body)?;
            if preset.duration_seconds == 0 {
                return Err(ApiError::bad_request("duration_seconds must be greater than zero"));
            }
            created(&app.presets.save(&preset)?)
        }
        (Method::Delete, [id]) => {
            app.presets.delete(parse_id(id)?)?;
            ok(&json!({ "deleted": true }))
        }
        (_, [] | [_]) => Err(method_not_allowed()),
        _ => Err(ApiError::not_found("no such preset route")),
    }
}

fn upcoming(app: &App) -> ApiResult {
    let now = app.alarms.now();
    let summary = app.alarms.upcoming()?;
    ok(&json!({
        "next_fire": summary.next_fire,
        "active_count": summary.active_count,
        "next_fire_text": format_next_fire(summary.next_fire, app.settings.time_format),
        "time_until": summary.time_until_text(now),
    }))
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid id '{raw}'")))
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}
