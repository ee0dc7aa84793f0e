use std::fmt;
use std::io::{stderr, stdout, Write};

use anyhow::{anyhow, Result};
use humantime::format_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::LoggingConfig;

const CAPTURE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(anyhow!("unsupported log level: {other}")),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn current_timestamp() -> String {
    format_rfc3339(std::time::SystemTime::now()).to_string()
}

fn write_fallback(entry: &Map<String, Value>) {
    if let Ok(serialized) = serde_json::to_string(entry) {
        let level = entry
            .get("level")
            .and_then(|v| v.as_str())
            .unwrap_or("info");
        if matches!(level, "warn" | "error") {
            let _ = writeln!(stderr(), "{}", serialized);
        } else {
            let _ = writeln!(stdout(), "{}", serialized);
        }
    }
}

/// Structured JSON logger scoped to one compilation pass.
///
/// Every entry at or above the threshold is captured; echoing to the process
/// streams is opt-in.
#[derive(Debug)]
pub struct Logger {
    threshold: Level,
    echo: bool,
    tag_stack: Vec<Map<String, Value>>,
    captured: Vec<Value>,
    truncated: bool,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(&LoggingConfig::default())
    }
}

impl Logger {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            threshold: config.level,
            echo: config.echo,
            tag_stack: Vec::new(),
            captured: Vec::new(),
            truncated: false,
        }
    }

    /// Returns whether anything was pushed; only then should the caller pop.
    pub fn push_tags(&mut self, tags: Map<String, Value>) -> bool {
        let tags: Map<String, Value> = tags
            .into_iter()
            .filter(|(_, value)| matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)))
            .collect();
        if tags.is_empty() {
            return false;
        }
        self.tag_stack.push(tags);
        true
    }

    pub fn pop_tags(&mut self) {
        self.tag_stack.pop();
    }

    fn scope_tags(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for map in &self.tag_stack {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    pub fn log(&mut self, level: Level, message: impl Into<String>, data: Option<Value>) {
        if level < self.threshold {
            return;
        }
        let mut entry = Map::new();
        entry.insert("level".to_string(), Value::String(level.as_str().to_string()));
        entry.insert("message".to_string(), Value::String(message.into()));
        if let Some(data @ Value::Object(_)) = data {
            entry.insert("data".to_string(), data);
        }
        let tags = self.scope_tags();
        if !tags.is_empty() {
            entry.insert("tags".to_string(), Value::Object(tags));
        }
        entry.insert("timestamp".to_string(), Value::String(current_timestamp()));

        if self.echo {
            write_fallback(&entry);
        }
        self.capture(Value::Object(entry));
    }

    fn capture(&mut self, entry: Value) {
        if self.captured.len() >= CAPTURE_LIMIT {
            if !self.truncated {
                let notice = json!({
                    "level": "warn",
                    "message": "log buffer truncated",
                    "tags": { "component": "logging", "reason": "log-overflow" },
                    "timestamp": current_timestamp()
                });
                self.captured.push(notice);
                self.truncated = true;
            }
            return;
        }
        self.captured.push(entry);
    }

    pub fn debug(&mut self, message: impl Into<String>, data: Option<Value>) {
        self.log(Level::Debug, message, data);
    }

    pub fn info(&mut self, message: impl Into<String>, data: Option<Value>) {
        self.log(Level::Info, message, data);
    }

    pub fn warn(&mut self, message: impl Into<String>, data: Option<Value>) {
        self.log(Level::Warn, message, data);
    }

    pub fn entries(&self) -> &[Value] {
        &self.captured
    }

    pub fn take_entries(&mut self) -> Vec<Value> {
        self.truncated = false;
        std::mem::take(&mut self.captured)
    }
}

/// Messages of captured entries at exactly `level`.
pub fn messages_at(entries: &[Value], level: Level) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| entry.get("level").and_then(Value::as_str) == Some(level.as_str()))
        .filter_map(|entry| entry.get("message").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn entries_below_threshold_are_dropped() {
        let mut logger = Logger::new(&LoggingConfig {
            level: Level::Warn,
            echo: false,
        });
        logger.info("quiet", None);
        logger.warn("loud", Some(json!({ "node": "app" })));
        assert_eq!(logger.entries().len(), 1);
        let entry = &logger.entries()[0];
        assert_eq!(entry["message"], "loud");
        assert_eq!(entry["data"]["node"], "app");
        assert!(entry["timestamp"].as_str().is_some());
    }

    #[test]
    fn tag_scopes_merge_and_restore() {
        let mut logger = Logger::default();
        assert!(logger.push_tags(tags(json!({ "component": "assembler" }))));
        assert!(logger.push_tags(tags(json!({ "node": "app", "nested": { "x": 1 } }))));
        logger.info("inside", None);
        logger.pop_tags();
        logger.info("outside", None);
        logger.pop_tags();
        logger.info("bare", None);
        let entries = logger.entries();
        assert_eq!(entries[0]["tags"], json!({ "component": "assembler", "node": "app" }));
        assert_eq!(entries[1]["tags"], json!({ "component": "assembler" }));
        assert!(entries[2].get("tags").is_none());
        assert!(!logger.push_tags(Map::new()));
    }

    #[test]
    fn capture_is_bounded() {
        let mut logger = Logger::default();
        for index in 0..(CAPTURE_LIMIT + 10) {
            logger.info(format!("entry {index}"), None);
        }
        assert_eq!(logger.entries().len(), CAPTURE_LIMIT + 1);
        assert_eq!(
            messages_at(logger.entries(), Level::Warn),
            vec!["log buffer truncated".to_string()]
        );
    }

    #[test]
    fn levels_parse_by_name() {
        assert_eq!(Level::parse("debug").unwrap(), Level::Debug);
        assert!(Level::parse("fatal").is_err());
    }
}
