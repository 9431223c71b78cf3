//! Plain-text views of documents and rosters for the terminal.

use std::fmt::Write;

use relaypad_apps::{editor_fragment, Mindmap, Poll, TodoList, Whiteboard, Wiki};
use relaypad_collab::{display_name, AppKind, RosterEntry};

use crate::profiles::ProfileNames;
use yrs::{Doc, GetString, Transact};

pub fn document(app: AppKind, doc: &Doc) -> String {
    let mut out = format!("── {app} ──\n");
    match app {
        AppKind::Editor => {
            let fragment = editor_fragment(doc);
            out.push_str(&fragment.get_string(&doc.transact()));
        }
        AppKind::Todo => {
            for item in TodoList::new(doc).items() {
                let mark = if item.completed { 'x' } else { ' ' };
                let _ = write!(out, "[{mark}] {}", item.text);
                if let Some(assignee) = item.assignee {
                    let _ = write!(out, " @{}", assignee.name);
                }
                out.push('\n');
            }
        }
        AppKind::Poll => {
            let poll = Poll::new(doc);
            let _ = writeln!(out, "{}", poll.question());
            for option in poll.options() {
                let _ = writeln!(out, "  {:>3}  {}", option.votes.len(), option.text);
            }
        }
        AppKind::Whiteboard => {
            let paths = Whiteboard::new(doc).paths();
            let drawing = paths.iter().filter(|p| !p.is_complete).count();
            let _ = write!(out, "{} strokes, {drawing} in progress", paths.len());
        }
        AppKind::Wiki => {
            for page in Wiki::new(doc).pages() {
                let _ = writeln!(out, "• {}", page.title);
            }
        }
        AppKind::Mindmap => {
            let map = Mindmap::new(doc);
            let _ = write!(
                out,
                "{} nodes, {} edges, {} layout",
                map.nodes().len(),
                map.edges().len(),
                map.layout()
            );
        }
    }
    out.trim_end().to_string()
}

/// Names come from presence state first, then from profile metadata.
pub fn roster(entries: &[RosterEntry], profiles: &ProfileNames) -> String {
    if entries.is_empty() {
        return "nobody else here".to_string();
    }
    let names: Vec<String> = entries
        .iter()
        .map(|entry| {
            let name = display_name(&entry.state).or_else(|| profiles.get(&entry.public_key));
            match name {
                Some(name) => format!("{name} ({})", entry.client_id),
                None => entry.client_id.to_string(),
            }
        })
        .collect();
    format!("here: {}", names.join(", "))
}
