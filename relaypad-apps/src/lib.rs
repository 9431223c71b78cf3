//! Collaborative app models on top of a shared yrs document.
//!
//! Each adapter wraps a [`yrs::Doc`] (usually the one owned by a
//! `relaypad_collab::DocumentSession`) and exposes typed operations over
//! fixed root names. Every operation runs in a single transaction, so it
//! reaches peers as a single update.
//!
//! | adapter | roots |
//! |---|---|
//! | [`TodoList`] | `todo-data`, `todo-order` |
//! | [`Poll`] | `poll-question`, `poll-options`, `poll-settings` |
//! | [`Whiteboard`] | `whiteboard-paths` |
//! | [`Wiki`] | `wiki-pages` |
//! | [`Mindmap`] | `mindmap-nodes`, `mindmap-edges`, `mindmap-settings` |
//! | [`editor_fragment`] | `prosemirror` |

pub mod editor;
pub mod error;
pub mod mindmap;
pub mod poll;
pub mod todo;
mod value;
pub mod whiteboard;
pub mod wiki;

pub use editor::{editor_fragment, EDITOR_FRAGMENT};
pub use error::AppError;
pub use mindmap::{Layout, Mindmap, SyncStats};
pub use poll::{Poll, PollOption, PollSettings, SettingsPatch, Voter};
pub use todo::{Assignee, TodoItem, TodoList};
pub use whiteboard::{DrawPath, Whiteboard};
pub use wiki::{Wiki, WikiPage};
