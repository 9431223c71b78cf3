//! Shared wiki: a map of pages (`wiki-pages`), each with a title, a
//! modification time and its own collaborative text.

use std::sync::Arc;

use relaypad_collab::{Clock, SystemClock};
use yrs::{Any, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, TextPrelim, TextRef, Transact};

use crate::value;

pub const PAGES: &str = "wiki-pages";
pub const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    pub last_modified: u64,
}

pub struct Wiki {
    doc: Doc,
    pages: MapRef,
    clock: Arc<dyn Clock>,
}

impl Wiki {
    pub fn new(doc: &Doc) -> Self {
        Self {
            pages: doc.get_or_insert_map(PAGES),
            doc: doc.clone(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn create_page(&self, title: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut txn = self.doc.transact_mut();
        let page = self.pages.insert(
            &mut txn,
            id.as_str(),
            MapPrelim::from_iter([
                ("title", Any::from(title)),
                ("lastModified", Any::Number(self.clock.now_millis() as f64)),
            ]),
        );
        page.insert(&mut txn, "content", TextPrelim::new(""));
        id
    }

    pub fn delete_page(&self, id: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        self.pages.remove(&mut txn, id).is_some()
    }

    pub fn set_title(&self, id: &str, title: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(page) = self.page(&txn, id) else {
            return false;
        };
        page.insert(&mut txn, "title", title);
        page.insert(&mut txn, "lastModified", Any::Number(self.clock.now_millis() as f64));
        true
    }

    /// The page body. Edits through it replicate like any other text.
    pub fn content(&self, id: &str) -> Option<TextRef> {
        let txn = self.doc.transact();
        match self.page(&txn, id)?.get(&txn, "content")? {
            Out::YText(text) => Some(text),
            _ => None,
        }
    }

    /// Pages sorted by title, case-insensitively.
    pub fn pages(&self) -> Vec<WikiPage> {
        let txn = self.doc.transact();
        let mut pages: Vec<WikiPage> = self
            .pages
            .iter(&txn)
            .filter_map(|(id, out)| match out {
                Out::YMap(page) => Some(WikiPage {
                    id: id.to_string(),
                    title: value::string(page.get(&txn, "title"))
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| UNTITLED.to_string()),
                    last_modified: value::millis(page.get(&txn, "lastModified")).unwrap_or_default(),
                }),
                _ => None,
            })
            .collect();
        pages.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        pages
    }

    fn page<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        match self.pages.get(txn, id)? {
            Out::YMap(page) => Some(page),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sync;
    use relaypad_collab::ManualClock;
    use std::time::Duration;
    use yrs::{GetString, Text};

    #[test]
    fn test_pages_sorted_by_title() {
        let doc = Doc::new();
        let wiki = Wiki::new(&doc);
        wiki.create_page("zebra");
        wiki.create_page("Apple");
        wiki.create_page("mango");
        let titles: Vec<String> = wiki.pages().into_iter().map(|p| p.title).collect();
        assert_eq!(titles, vec!["Apple", "mango", "zebra"]);
    }

    #[test]
    fn test_set_title_touches_modified() {
        let doc = Doc::new();
        let clock = ManualClock::new(1_000);
        let wiki = Wiki::new(&doc).with_clock(Arc::new(clock.clone()));
        let id = wiki.create_page("");
        assert_eq!(wiki.pages()[0].title, UNTITLED);
        assert_eq!(wiki.pages()[0].last_modified, 1_000_000);

        clock.advance(Duration::from_secs(5));
        assert!(wiki.set_title(&id, "Home"));
        let page = &wiki.pages()[0];
        assert_eq!(page.title, "Home");
        assert_eq!(page.last_modified, 1_005_000);

        assert!(wiki.delete_page(&id));
        assert!(wiki.pages().is_empty());
        assert!(!wiki.set_title(&id, "gone"));
    }

    #[test]
    fn test_page_content_replicates() {
        let one = Doc::new();
        let two = Doc::new();
        let wiki = Wiki::new(&one);
        let id = wiki.create_page("Notes");
        {
            let body = wiki.content(&id).unwrap();
            let mut txn = one.transact_mut();
            body.insert(&mut txn, 0, "hello wiki");
        }
        sync(&one, &two);

        let remote = Wiki::new(&two);
        let body = remote.content(&id).unwrap();
        assert_eq!(body.get_string(&two.transact()), "hello wiki");
        assert!(remote.content("missing").is_none());
    }
}
