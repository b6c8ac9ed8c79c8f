//! Argument helpers for the command line tool.

use chrono::{DateTime, Local};
use dcrpc_client::EventFilter;
use dcrpc_core::Notification;
use serde_json::Value;

/// Positional call parameters. Each argument is read as JSON; anything that
/// does not parse is passed as a plain string.
pub fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}

pub fn event_filter(methods: &[String], account: Option<u64>, chat: Option<u64>) -> EventFilter {
    let mut filter = methods
        .iter()
        .fold(EventFilter::all(), |filter, method| filter.method(method.as_str()));
    if let Some(account) = account {
        filter = filter.account(account);
    }
    if let Some(chat) = chat {
        filter = filter.chat(chat);
    }
    filter
}

/// One output line per event.
pub fn format_event(time: DateTime<Local>, event: &Notification) -> String {
    format!(
        "[{}] {} {}",
        time.format("%H:%M:%S%.3f"),
        event.method,
        event.params
    )
}
