//! Shared to-do list.
//!
//! Items live in a map keyed by id (`todo-data`) so that field edits never
//! conflict with reordering; display order is a separate array of ids
//! (`todo-order`).

use std::sync::Arc;

use relaypad_collab::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use yrs::{Any, Array, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, Transact, TransactionMut};

use crate::value::{self, to_any};
use crate::AppError;

pub const ITEMS: &str = "todo-data";
pub const ORDER: &str = "todo-order";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub completed: bool,
    pub created_at: u64,
    pub assignee: Option<Assignee>,
    pub due_date: Option<u64>,
}

pub struct TodoList {
    doc: Doc,
    items: MapRef,
    order: ArrayRef,
    clock: Arc<dyn Clock>,
}

impl TodoList {
    pub fn new(doc: &Doc) -> Self {
        Self {
            items: doc.get_or_insert_map(ITEMS),
            order: doc.get_or_insert_array(ORDER),
            doc: doc.clone(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adds an item at the top of the list and returns its id.
    pub fn add_item(&self, text: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut txn = self.doc.transact_mut();
        self.items.insert(
            &mut txn,
            id.as_str(),
            MapPrelim::from_iter([
                ("id", Any::from(id.as_str())),
                ("text", Any::from(text)),
                ("completed", Any::Bool(false)),
                ("createdAt", Any::Number(self.clock.now_millis() as f64)),
            ]),
        );
        self.order.insert(&mut txn, 0, id.as_str());
        id
    }

    pub fn toggle_item(&self, id: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(item) = self.item(&txn, id) else {
            return false;
        };
        let completed = value::boolean(item.get(&txn, "completed")).unwrap_or(false);
        item.insert(&mut txn, "completed", !completed);
        true
    }

    pub fn delete_item(&self, id: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let removed = self.items.remove(&mut txn, id).is_some();
        if let Some(index) = self.position(&txn, id) {
            self.order.remove(&mut txn, index);
        }
        removed
    }

    pub fn update_text(&self, id: &str, text: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(item) = self.item(&txn, id) else {
            return false;
        };
        item.insert(&mut txn, "text", text);
        true
    }

    /// Assigns a user, or clears the assignment with `None`.
    pub fn assign(&self, id: &str, assignee: Option<&Assignee>) -> Result<bool, AppError> {
        let encoded = assignee.map(to_any).transpose()?;
        let mut txn = self.doc.transact_mut();
        let Some(item) = self.item(&txn, id) else {
            return Ok(false);
        };
        match encoded {
            Some(assignee) => {
                item.insert(&mut txn, "assignee", assignee);
            }
            None => {
                item.remove(&mut txn, "assignee");
            }
        }
        Ok(true)
    }

    pub fn set_due_date(&self, id: &str, due: Option<u64>) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(item) = self.item(&txn, id) else {
            return false;
        };
        match due {
            Some(millis) => {
                item.insert(&mut txn, "dueDate", Any::Number(millis as f64));
            }
            None => {
                item.remove(&mut txn, "dueDate");
            }
        }
        true
    }

    /// Moves the item at `from` to `to`. `to` may equal the length (append).
    pub fn move_item(&self, from: u32, to: u32) -> Result<(), AppError> {
        let mut txn = self.doc.transact_mut();
        let len = self.order.len(&txn);
        if from >= len {
            return Err(AppError::OutOfBounds { index: from, len });
        }
        if to > len {
            return Err(AppError::OutOfBounds { index: to, len });
        }
        if from == to {
            return Ok(());
        }
        let Some(id) = value::string(self.order.get(&txn, from)) else {
            return Ok(());
        };
        self.order.remove(&mut txn, from);
        let to = to.min(self.order.len(&txn));
        self.order.insert(&mut txn, to, id);
        Ok(())
    }

    /// Replaces the order with `ids`. Ids present in the document but
    /// missing from `ids` (added concurrently) are kept at the end.
    pub fn reorder(&self, ids: &[String]) {
        let mut txn = self.doc.transact_mut();
        let current = self.ordered_ids(&txn);
        let missing: Vec<String> = current.into_iter().filter(|id| !ids.contains(id)).collect();

        let len = self.order.len(&txn);
        self.order.remove_range(&mut txn, 0, len);
        for id in ids.iter().chain(&missing) {
            self.order.push_back(&mut txn, id.as_str());
        }
    }

    pub fn items(&self) -> Vec<TodoItem> {
        let txn = self.doc.transact();
        self.ordered_ids(&txn)
            .into_iter()
            .filter_map(|id| {
                let item = self.item(&txn, &id)?;
                Some(TodoItem {
                    id: value::string(item.get(&txn, "id")).unwrap_or(id),
                    text: value::string(item.get(&txn, "text")).unwrap_or_default(),
                    completed: value::boolean(item.get(&txn, "completed")).unwrap_or(false),
                    created_at: value::millis(item.get(&txn, "createdAt")).unwrap_or_default(),
                    assignee: value::decode(item.get(&txn, "assignee")),
                    due_date: value::millis(item.get(&txn, "dueDate")),
                })
            })
            .collect()
    }

    fn item<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        match self.items.get(txn, id)? {
            Out::YMap(item) => Some(item),
            _ => None,
        }
    }

    fn ordered_ids<T: ReadTxn>(&self, txn: &T) -> Vec<String> {
        self.order
            .iter(txn)
            .filter_map(|out| value::string(Some(out)))
            .collect()
    }

    fn position(&self, txn: &TransactionMut<'_>, id: &str) -> Option<u32> {
        self.ordered_ids(txn)
            .iter()
            .position(|candidate| candidate == id)
            .map(|index| index as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sync, update_count};
    use relaypad_collab::ManualClock;

    fn texts(list: &TodoList) -> Vec<String> {
        list.items().into_iter().map(|item| item.text).collect()
    }

    #[test]
    fn test_add_puts_item_on_top() {
        let doc = Doc::new();
        let list = TodoList::new(&doc).with_clock(Arc::new(ManualClock::new(1_700_000_000)));
        list.add_item("first");
        let id = list.add_item("second");

        assert_eq!(texts(&list), vec!["second", "first"]);
        let top = &list.items()[0];
        assert_eq!(top.id, id);
        assert!(!top.completed);
        assert_eq!(top.created_at, 1_700_000_000_000);
    }

    #[test]
    fn test_edit_fields() {
        let doc = Doc::new();
        let list = TodoList::new(&doc);
        let id = list.add_item("draft");

        assert!(list.toggle_item(&id));
        assert!(list.update_text(&id, "final"));
        assert!(list.set_due_date(&id, Some(86_400_000)));
        let ada = Assignee { name: "ada".into(), color: "#FF0000".into(), pubkey: None };
        assert!(list.assign(&id, Some(&ada)).unwrap());

        let item = &list.items()[0];
        assert!(item.completed);
        assert_eq!(item.text, "final");
        assert_eq!(item.due_date, Some(86_400_000));
        assert_eq!(item.assignee.as_ref(), Some(&ada));

        assert!(list.assign(&id, None).unwrap());
        assert!(list.set_due_date(&id, None));
        let item = &list.items()[0];
        assert_eq!(item.assignee, None);
        assert_eq!(item.due_date, None);

        assert!(!list.toggle_item("missing"));
    }

    #[test]
    fn test_delete_removes_from_order() {
        let doc = Doc::new();
        let list = TodoList::new(&doc);
        let a = list.add_item("a");
        list.add_item("b");
        assert!(list.delete_item(&a));
        assert!(!list.delete_item(&a));
        assert_eq!(texts(&list), vec!["b"]);
    }

    #[test]
    fn test_move_item() {
        let doc = Doc::new();
        let list = TodoList::new(&doc);
        for text in ["c", "b", "a"] {
            list.add_item(text);
        }
        list.move_item(0, 3).unwrap();
        assert_eq!(texts(&list), vec!["b", "c", "a"]);
        list.move_item(2, 0).unwrap();
        assert_eq!(texts(&list), vec!["a", "b", "c"]);
        assert!(matches!(list.move_item(5, 0), Err(AppError::OutOfBounds { index: 5, len: 3 })));
    }

    #[test]
    fn test_each_action_is_one_update() {
        let doc = Doc::new();
        let list = TodoList::new(&doc);
        let (count, _sub) = update_count(&doc);

        let id = list.add_item("atomic");
        list.set_due_date(&id, Some(1));
        list.reorder(&[id]);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reorder_keeps_concurrent_additions() {
        let alice_doc = Doc::new();
        let bob_doc = Doc::new();
        let alice = TodoList::new(&alice_doc);
        let bob = TodoList::new(&bob_doc);

        let a = alice.add_item("a");
        let b = alice.add_item("b");
        sync(&alice_doc, &bob_doc);

        alice.reorder(&[a.clone(), b.clone()]);
        bob.add_item("late");
        sync(&alice_doc, &bob_doc);
        sync(&bob_doc, &alice_doc);

        assert_eq!(texts(&alice), texts(&bob));
        let merged = texts(&alice);
        assert_eq!(merged.len(), 3);
        assert!(merged.contains(&"late".to_string()));
        let pos = |t: &str| merged.iter().position(|x| x == t).unwrap();
        assert!(pos("a") < pos("b"));
    }
}
