//! Shared freehand whiteboard: an array of stroke maps (`whiteboard-paths`).

use yrs::{Any, Array, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, Transact};

use crate::value;

pub const PATHS: &str = "whiteboard-paths";

#[derive(Debug, Clone, PartialEq)]
pub struct DrawPath {
    pub id: String,
    pub points: Vec<[f64; 2]>,
    pub color: String,
    pub width: f64,
    pub is_complete: bool,
}

pub struct Whiteboard {
    doc: Doc,
    paths: ArrayRef,
}

fn point(x: f64, y: f64) -> Any {
    Any::from(vec![Any::Number(x), Any::Number(y)])
}

fn read_points(out: Option<Out>) -> Vec<[f64; 2]> {
    value::decode::<Vec<Vec<f64>>>(out)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| match p.as_slice() {
            [x, y] => Some([*x, *y]),
            _ => None,
        })
        .collect()
}

impl Whiteboard {
    pub fn new(doc: &Doc) -> Self {
        Self {
            paths: doc.get_or_insert_array(PATHS),
            doc: doc.clone(),
        }
    }

    /// Starts a stroke at (`x`, `y`) and returns its id.
    pub fn start_path(&self, x: f64, y: f64, color: &str, width: f64) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut txn = self.doc.transact_mut();
        self.paths.push_back(
            &mut txn,
            MapPrelim::from_iter([
                ("id", Any::from(id.as_str())),
                ("points", Any::from(vec![point(x, y)])),
                ("color", Any::from(color)),
                ("width", Any::Number(width)),
                ("isComplete", Any::Bool(false)),
            ]),
        );
        id
    }

    /// Appends a point. The whole point list is rewritten, so concurrent
    /// appends to one stroke resolve to the last writer.
    pub fn update_path(&self, id: &str, x: f64, y: f64) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(path) = self.find(&txn, id) else {
            return false;
        };
        let mut points: Vec<Any> = read_points(path.get(&txn, "points"))
            .into_iter()
            .map(|[px, py]| point(px, py))
            .collect();
        points.push(point(x, y));
        path.insert(&mut txn, "points", Any::from(points));
        true
    }

    pub fn end_path(&self, id: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(path) = self.find(&txn, id) else {
            return false;
        };
        path.insert(&mut txn, "isComplete", true);
        true
    }

    pub fn clear(&self) {
        let mut txn = self.doc.transact_mut();
        let len = self.paths.len(&txn);
        self.paths.remove_range(&mut txn, 0, len);
    }

    /// Removes the most recent stroke, whoever drew it.
    pub fn undo(&self) -> bool {
        let mut txn = self.doc.transact_mut();
        let len = self.paths.len(&txn);
        if len == 0 {
            return false;
        }
        self.paths.remove(&mut txn, len - 1);
        true
    }

    pub fn paths(&self) -> Vec<DrawPath> {
        let txn = self.doc.transact();
        self.paths
            .iter(&txn)
            .filter_map(|out| match out {
                Out::YMap(path) => Some(DrawPath {
                    id: value::string(path.get(&txn, "id")).unwrap_or_default(),
                    points: read_points(path.get(&txn, "points")),
                    color: value::string(path.get(&txn, "color")).unwrap_or_default(),
                    width: value::number(path.get(&txn, "width")).unwrap_or(1.0),
                    is_complete: value::boolean(path.get(&txn, "isComplete")).unwrap_or(false),
                }),
                _ => None,
            })
            .collect()
    }

    /// Searches newest first; the stroke being drawn is almost always last.
    fn find<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<MapRef> {
        let strokes: Vec<Out> = self.paths.iter(txn).collect();
        strokes.into_iter().rev().find_map(|out| match out {
            Out::YMap(path) if value::string(path.get(txn, "id")).as_deref() == Some(id) => Some(path),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sync;

    #[test]
    fn test_stroke_lifecycle() {
        let doc = Doc::new();
        let board = Whiteboard::new(&doc);
        let id = board.start_path(1.0, 2.0, "#000000", 3.0);
        assert!(board.update_path(&id, 4.5, 6.0));
        assert!(board.end_path(&id));

        let paths = board.paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].points, vec![[1.0, 2.0], [4.5, 6.0]]);
        assert_eq!(paths[0].width, 3.0);
        assert!(paths[0].is_complete);
        assert!(!board.update_path("missing", 0.0, 0.0));
    }

    #[test]
    fn test_undo_and_clear() {
        let doc = Doc::new();
        let board = Whiteboard::new(&doc);
        board.start_path(0.0, 0.0, "red", 1.0);
        let second = board.start_path(1.0, 1.0, "blue", 1.0);
        assert!(board.undo());
        assert!(board.paths().iter().all(|p| p.id != second));
        board.clear();
        assert!(board.paths().is_empty());
        assert!(!board.undo());
    }

    #[test]
    fn test_strokes_from_two_peers() {
        let one = Doc::new();
        let two = Doc::new();
        Whiteboard::new(&one).start_path(0.0, 0.0, "red", 1.0);
        Whiteboard::new(&two).start_path(5.0, 5.0, "blue", 2.0);
        sync(&one, &two);
        sync(&two, &one);

        let colors = |doc: &Doc| -> Vec<String> {
            Whiteboard::new(doc).paths().into_iter().map(|p| p.color).collect()
        };
        assert_eq!(colors(&one).len(), 2);
        assert_eq!(colors(&one), colors(&two));
    }
}
