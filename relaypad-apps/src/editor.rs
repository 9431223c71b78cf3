//! Rich-text editor document. The editor binding owns the structure of the
//! fragment; this crate only names it so every peer uses the same root.

use yrs::{Doc, XmlFragmentRef};

pub const EDITOR_FRAGMENT: &str = "prosemirror";

pub fn editor_fragment(doc: &Doc) -> XmlFragmentRef {
    doc.get_or_insert_xml_fragment(EDITOR_FRAGMENT)
}
