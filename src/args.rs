//! Typed views over the loosely typed `arguments` object of a `tools/call`.
//!
//! Every tool gets its own argument struct and a coercion routine. A call is
//! coerced wholesale into a [`ToolCall`] before any side effect happens, so a
//! single bad argument rejects the whole call.

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Accessors over a tool's argument map.
pub struct Args<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    /// `None` for both an absent key and an explicit `null`.
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|v| !v.is_null())
    }

    pub fn required_string(&self, name: &str) -> Result<String> {
        let Some(v) = self.get(name) else {
            bail!("missing required argument: {name}");
        };
        let Some(s) = v.as_str() else {
            bail!("argument {name} must be a string");
        };
        let s = s.trim();
        if s.is_empty() {
            bail!("argument {name} must not be empty");
        }
        Ok(s.to_string())
    }

    pub fn optional_string(&self, name: &str) -> Result<String> {
        match self.get(name) {
            None => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.trim().to_string()),
            Some(_) => bail!("argument {name} must be a string"),
        }
    }

    pub fn optional_string_list(&self, name: &str) -> Result<Vec<String>> {
        let Some(v) = self.get(name) else {
            return Ok(Vec::new());
        };
        let Some(items) = v.as_array() else {
            bail!("argument {name} must be an array of strings");
        };
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("argument {name}[{i}] must be a string"))
            })
            .collect()
    }

    pub fn optional_string_map(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let Some(v) = self.get(name) else {
            return Ok(BTreeMap::new());
        };
        let Some(obj) = v.as_object() else {
            bail!("argument {name} must be an object of strings");
        };
        obj.iter()
            .map(|(k, item)| {
                item.as_str()
                    .map(|s| (k.clone(), s.to_string()))
                    .ok_or_else(|| anyhow!("argument {name}.{k} must be a string"))
            })
            .collect()
    }

    pub fn optional_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => bail!("argument {name} must be a boolean"),
        }
    }

    /// Integers pass through; other JSON numbers are truncated toward zero.
    pub fn optional_int(&self, name: &str, default: i64) -> Result<i64> {
        let Some(v) = self.get(name) else {
            return Ok(default);
        };
        let Value::Number(n) = v else {
            bail!("argument {name} must be an integer");
        };
        if let Some(i) = n.as_i64() {
            return Ok(i);
        }
        match n.as_f64() {
            Some(f) if f.is_finite() => Ok(f.trunc() as i64),
            _ => bail!("argument {name} must be an integer"),
        }
    }

    pub fn optional_non_negative_int(&self, name: &str, default: u64) -> Result<u64> {
        let default = i64::try_from(default).unwrap_or(i64::MAX);
        let n = self.optional_int(name, default)?;
        if n < 0 {
            bail!("argument {name} must be non-negative");
        }
        Ok(n as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartArgs {
    pub robot_dir: String,
    pub gopherbot_binary: String,
    pub auth_token: String,
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RobotDirArgs {
    pub robot_dir: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendMessageArgs {
    pub robot_dir: String,
    pub as_user: String,
    pub text: String,
    pub protocol: String,
    pub channel: String,
    pub thread_id: String,
    pub hidden: bool,
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMessagesArgs {
    pub robot_dir: String,
    pub viewer: String,
    pub protocol: String,
    pub all: bool,
    pub after_cursor: u64,
    /// Clamped to zero; zero lets the robot apply its own default wait.
    pub timeout_ms: u64,
    /// Clamped to zero; zero means "no limit" and is not forwarded.
    pub limit: u64,
}

/// A fully coerced tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    StartRobot(StartArgs),
    StopRobot(RobotDirArgs),
    RobotStatus(RobotDirArgs),
    SendMessage(SendMessageArgs),
    GetMessages(GetMessagesArgs),
}

impl ToolCall {
    pub fn parse(name: &str, arguments: &Map<String, Value>) -> Result<Self> {
        let args = Args::new(arguments);
        let call = match name {
            "start_robot" => ToolCall::StartRobot(StartArgs {
                robot_dir: args.required_string("robot_dir")?,
                gopherbot_binary: args.optional_string("gopherbot_binary")?,
                auth_token: args.optional_string("auth_token")?,
                extra_args: args.optional_string_list("extra_args")?,
                env: args.optional_string_map("env")?,
            }),
            "stop_robot" => ToolCall::StopRobot(RobotDirArgs {
                robot_dir: args.required_string("robot_dir")?,
            }),
            "robot_status" => ToolCall::RobotStatus(RobotDirArgs {
                robot_dir: args.required_string("robot_dir")?,
            }),
            "send_message" => ToolCall::SendMessage(SendMessageArgs {
                robot_dir: args.required_string("robot_dir")?,
                as_user: args.required_string("as_user")?,
                text: args.required_string("text")?,
                protocol: args.optional_string("protocol")?,
                channel: args.optional_string("channel")?,
                thread_id: args.optional_string("thread_id")?,
                hidden: args.optional_bool("hidden", false)?,
                direct: args.optional_bool("direct", false)?,
            }),
            "get_messages" => ToolCall::GetMessages(GetMessagesArgs {
                robot_dir: args.required_string("robot_dir")?,
                viewer: args.optional_string("viewer")?,
                protocol: args.optional_string("protocol")?,
                all: args.optional_bool("all", false)?,
                after_cursor: args.optional_non_negative_int("after_cursor", 0)?,
                timeout_ms: args.optional_int("timeout_ms", 0)?.max(0) as u64,
                limit: args.optional_int("limit", 0)?.max(0) as u64,
            }),
            other => bail!("unknown tool: {other}"),
        };
        Ok(call)
    }
}
