//! Bridge from MCP tool calls to a running robot's AIDev HTTP endpoints.
//!
//! The port comes from the robot's own `.aiport` file and the bearer token
//! from our state file. Client assembly happens under the supervisor lock;
//! the HTTP round trip does not, so a slow robot never blocks status queries.

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::io::Read;
use std::time::Duration;

use crate::args::{GetMessagesArgs, SendMessageArgs};
use crate::state::{read_state, state_path};
use crate::supervisor::{pid_alive, read_aiport, Supervisor, AIPORT_FILE_NAME};

pub const SEND_MESSAGE_ENDPOINT: &str = "/aidev/send_message";
pub const GET_MESSAGES_ENDPOINT: &str = "/aidev/get_messages";

/// Response bodies are truncated here before parsing.
pub const MAX_RESPONSE_BYTES: u64 = 1 << 20;

const SEND_TIMEOUT: Duration = Duration::from_secs(4);
const GET_TIMEOUT_SLACK: Duration = Duration::from_millis(1500);
const GET_TIMEOUT_FLOOR: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AidevClient {
    base_url: String,
    token: String,
}

impl AidevClient {
    /// Locate a live robot for `robot_dir` and capture its port and token.
    pub fn for_robot(sup: &Supervisor, robot_dir: &str) -> Result<Self> {
        let _guard = sup.lock();

        let dir = sup.resolve(robot_dir);
        let state_file = state_path(&dir);
        let Some(record) = read_state(&state_file)? else {
            bail!(
                "no state file found at {}; start the robot first",
                state_file.display()
            );
        };
        if !pid_alive(record.pid) {
            bail!(
                "robot pid {} recorded in {} is not running",
                record.pid,
                state_file.display()
            );
        }
        let aiport_file = dir.join(AIPORT_FILE_NAME);
        let port = read_aiport(&dir)?;
        if port.is_empty() {
            bail!(
                "robot has not published its port yet ({} missing or empty)",
                aiport_file.display()
            );
        }
        let port = parse_port(&port)
            .with_context(|| format!("invalid port in {}", aiport_file.display()))?;
        if record.auth_token.trim().is_empty() {
            bail!("state file {} has no auth_token", state_file.display());
        }

        Ok(Self {
            base_url: format!("http://127.0.0.1:{port}"),
            token: record.auth_token,
        })
    }

    /// POST `payload` as JSON and return the decoded JSON object reply.
    pub fn post(&self, endpoint: &str, payload: &Value, timeout: Duration) -> Result<Map<String, Value>> {
        let url = format!("{}{endpoint}", self.base_url);
        let body = serde_json::to_string(payload)?;

        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(0)
            .build();
        let resp = match agent
            .post(&url)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_string(&body)
        {
            Ok(r) => r,
            // Non-2xx replies still carry a body worth reading.
            Err(ureq::Error::Status(_, r)) => r,
            Err(e) => bail!("POST {url}: {e}"),
        };

        let status = resp.status();
        let mut raw = Vec::new();
        resp.into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut raw)
            .with_context(|| format!("read response from {url}"))?;
        let parsed = parse_object(&raw).with_context(|| format!("decode response from {url}"));

        if status >= 300 {
            if let Ok(obj) = &parsed {
                if let Some(Value::String(msg)) = obj.get("error") {
                    bail!("{msg}");
                }
            }
            bail!("aidev {endpoint} returned HTTP {status}");
        }
        parsed
    }
}

/// Plain ASCII decimal, 1..=65535. Anything else could redirect the bearer token.
fn parse_port(text: &str) -> Result<u16> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        bail!("{text:?} is not a decimal port");
    }
    match text.parse::<u16>() {
        Ok(0) => bail!("port 0 is not usable"),
        Ok(port) => Ok(port),
        Err(e) => bail!("{text:?}: {e}"),
    }
}

fn parse_object(raw: &[u8]) -> Result<Map<String, Value>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(obj) => Ok(obj),
        _ => bail!("response is not a JSON object"),
    }
}

pub fn send_message_payload(args: &SendMessageArgs, default_protocol: &str) -> Value {
    let mut payload = json!({
        "as_user": args.as_user,
        "text": args.text,
        "hidden": args.hidden,
    });
    let protocol = if args.protocol.is_empty() { default_protocol } else { args.protocol.as_str() };
    for (key, val) in [
        ("protocol", protocol),
        ("channel", args.channel.as_str()),
        ("thread_id", args.thread_id.as_str()),
    ] {
        if !val.is_empty() {
            payload[key] = json!(val);
        }
    }
    if args.direct {
        payload["direct"] = json!(true);
    }
    payload
}

pub fn get_messages_payload(args: &GetMessagesArgs, default_protocol: &str) -> Value {
    let mut payload = json!({
        "viewer": args.viewer,
        "all": args.all,
        "after_cursor": args.after_cursor,
        "timeout_ms": args.timeout_ms,
    });
    let protocol = if args.protocol.is_empty() { default_protocol } else { args.protocol.as_str() };
    if !protocol.is_empty() {
        payload["protocol"] = json!(protocol);
    }
    if args.limit > 0 {
        payload["limit"] = json!(args.limit);
    }
    payload
}

/// The robot may hold a long poll for `timeout_ms`; leave slack on top.
pub fn get_messages_timeout(timeout_ms: u64) -> Duration {
    (Duration::from_millis(timeout_ms) + GET_TIMEOUT_SLACK).max(GET_TIMEOUT_FLOOR)
}

pub fn send_message(sup: &Supervisor, args: &SendMessageArgs, default_protocol: &str) -> Result<Value> {
    let client = AidevClient::for_robot(sup, &args.robot_dir)?;
    let payload = send_message_payload(args, default_protocol);
    let reply = client.post(SEND_MESSAGE_ENDPOINT, &payload, SEND_TIMEOUT)?;
    Ok(Value::Object(reply))
}

pub fn get_messages(sup: &Supervisor, args: &GetMessagesArgs, default_protocol: &str) -> Result<Value> {
    let client = AidevClient::for_robot(sup, &args.robot_dir)?;
    let payload = get_messages_payload(args, default_protocol);
    let reply = client.post(
        GET_MESSAGES_ENDPOINT,
        &payload,
        get_messages_timeout(args.timeout_ms),
    )?;
    Ok(Value::Object(reply))
}
