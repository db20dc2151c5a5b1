//! Output formatting for the command line.

use chrono::{DateTime, Local};
use colored::*;
use serde_json::{Value, json};

use xenstore_client::{Event, Node};

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn slashes(path: &[u8]) -> usize {
    path.iter().filter(|b| **b == b'/').count()
}

/// `xenstore-ls` style lines: one indented `name = "value"` per node below
/// `top`. The top node itself is not printed.
pub fn tree_lines(top: &[u8], nodes: &[Node]) -> Vec<String> {
    let depth = slashes(top) + usize::from(top != b"/");
    nodes
        .iter()
        .filter(|node| node.path != top)
        .map(|node| {
            let name = node.path.rsplit(|b| *b == b'/').next().unwrap_or_default();
            let indent = " ".repeat(slashes(&node.path).saturating_sub(depth));
            format!("{}{} = \"{}\"", indent, lossy(name), lossy(&node.value))
        })
        .collect()
}

pub fn tree_json(nodes: &[Node]) -> Value {
    Value::Array(
        nodes
            .iter()
            .map(|node| {
                json!({
                    "path": lossy(&node.path),
                    "value": lossy(&node.value),
                    "children": node.children.iter().map(|c| lossy(c)).collect::<Vec<_>>(),
                })
            })
            .collect(),
    )
}

/// One permission entry, spelled out.
pub fn permission_line(perm: &[u8], owner: bool) -> String {
    let access = match perm.first() {
        Some(b'r') => "read",
        Some(b'w') => "write",
        Some(b'b') => "read/write",
        Some(b'n') => "none",
        _ => "unknown",
    };
    let domid = lossy(perm.get(1..).unwrap_or_default());
    if owner {
        format!("{} owner dom{} (others: {})", lossy(perm).green(), domid, access)
    } else {
        format!("{} dom{}: {}", lossy(perm), domid, access)
    }
}

pub fn event_line(at: DateTime<Local>, event: &Event) -> String {
    format!(
        "{} {} {}",
        at.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
        event.path_lossy().cyan(),
        event.token_lossy().yellow()
    )
}
