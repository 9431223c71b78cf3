//! Shared poll: a question, options with votes, and settings.
//!
//! Votes are kept per option as a JSON-encoded string so that a vote is a
//! single register write. Older documents may hold a plain array instead;
//! both are read.

use serde::{Deserialize, Serialize};
use yrs::{Any, Array, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Text, TextRef, Transact};

use crate::value;

pub const QUESTION: &str = "poll-question";
pub const OPTIONS: &str = "poll-options";
pub const SETTINGS: &str = "poll-settings";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub creator_id: Option<String>,
    pub votes: Vec<Voter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSettings {
    pub allow_user_options: bool,
    pub anonymous: bool,
    pub multi_select: bool,
}

/// Partial settings update; `None` leaves a field as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub allow_user_options: Option<bool>,
    pub anonymous: Option<bool>,
    pub multi_select: Option<bool>,
}

pub struct Poll {
    doc: Doc,
    question: TextRef,
    options: ArrayRef,
    settings: MapRef,
}

fn parse_votes(out: Option<Out>) -> Vec<Voter> {
    match out {
        Some(Out::Any(Any::String(encoded))) if !encoded.is_empty() => {
            serde_json::from_str(&encoded).unwrap_or_else(|e| {
                log::warn!("Ignoring malformed votes {encoded:?}: {e}");
                Vec::new()
            })
        }
        Some(legacy @ Out::Any(Any::Array(_))) => value::decode(Some(legacy)).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn encode_votes(votes: &[Voter]) -> String {
    serde_json::to_string(votes).unwrap_or_else(|_| "[]".to_string())
}

impl Poll {
    pub fn new(doc: &Doc) -> Self {
        Self {
            question: doc.get_or_insert_text(QUESTION),
            options: doc.get_or_insert_array(OPTIONS),
            settings: doc.get_or_insert_map(SETTINGS),
            doc: doc.clone(),
        }
    }

    pub fn set_question(&self, question: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.question.len(&txn);
        self.question.remove_range(&mut txn, 0, len);
        self.question.insert(&mut txn, 0, question);
    }

    pub fn question(&self) -> String {
        self.question.get_string(&self.doc.transact())
    }

    pub fn add_option(&self, text: &str, creator_id: Option<&str>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let creator = creator_id.map(Any::from).unwrap_or(Any::Undefined);
        let mut txn = self.doc.transact_mut();
        self.options.push_back(
            &mut txn,
            MapPrelim::from_iter([
                ("id", Any::from(id.as_str())),
                ("text", Any::from(text)),
                ("creatorId", creator),
                ("votes", Any::from("[]")),
            ]),
        );
        id
    }

    pub fn delete_option(&self, id: &str) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some(index) = self.find(&txn, id).map(|(index, _)| index) else {
            return false;
        };
        self.options.remove(&mut txn, index);
        true
    }

    /// Toggles `voter`'s vote on `option_id`. Unless multi-select is on,
    /// the voter is first removed from every other option.
    pub fn vote(&self, option_id: &str, voter: &Voter) -> bool {
        let mut txn = self.doc.transact_mut();
        let Some((_, target)) = self.find(&txn, option_id) else {
            return false;
        };

        let multi_select = value::boolean(self.settings.get(&txn, "multiSelect")).unwrap_or(false);
        if !multi_select {
            for option in self.option_maps(&txn) {
                if value::string(option.get(&txn, "id")).as_deref() == Some(option_id) {
                    continue;
                }
                let votes = parse_votes(option.get(&txn, "votes"));
                let kept: Vec<Voter> = votes.iter().filter(|v| v.name != voter.name).cloned().collect();
                if kept.len() != votes.len() {
                    option.insert(&mut txn, "votes", encode_votes(&kept));
                }
            }
        }

        let mut votes = parse_votes(target.get(&txn, "votes"));
        if votes.iter().any(|v| v.name == voter.name) {
            votes.retain(|v| v.name != voter.name);
        } else {
            votes.push(voter.clone());
        }
        target.insert(&mut txn, "votes", encode_votes(&votes));
        true
    }

    pub fn reset_votes(&self) {
        let mut txn = self.doc.transact_mut();
        for option in self.option_maps(&txn) {
            option.insert(&mut txn, "votes", "[]");
        }
    }

    pub fn update_settings(&self, patch: SettingsPatch) {
        let mut txn = self.doc.transact_mut();
        let fields = [
            ("allowUserOptions", patch.allow_user_options),
            ("anonymous", patch.anonymous),
            ("multiSelect", patch.multi_select),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                self.settings.insert(&mut txn, key, value);
            }
        }
    }

    pub fn settings(&self) -> PollSettings {
        let txn = self.doc.transact();
        let flag = |key: &str| value::boolean(self.settings.get(&txn, key)).unwrap_or(false);
        PollSettings {
            allow_user_options: flag("allowUserOptions"),
            anonymous: flag("anonymous"),
            multi_select: flag("multiSelect"),
        }
    }

    pub fn options(&self) -> Vec<PollOption> {
        let txn = self.doc.transact();
        self.option_maps(&txn)
            .into_iter()
            .map(|option| PollOption {
                id: value::string(option.get(&txn, "id")).unwrap_or_default(),
                text: value::string(option.get(&txn, "text")).unwrap_or_default(),
                creator_id: value::string(option.get(&txn, "creatorId")),
                votes: parse_votes(option.get(&txn, "votes")),
            })
            .collect()
    }

    fn option_maps<T: ReadTxn>(&self, txn: &T) -> Vec<MapRef> {
        self.options
            .iter(txn)
            .filter_map(|out| match out {
                Out::YMap(option) => Some(option),
                _ => None,
            })
            .collect()
    }

    fn find<T: ReadTxn>(&self, txn: &T, id: &str) -> Option<(u32, MapRef)> {
        self.options.iter(txn).enumerate().find_map(|(index, out)| match out {
            Out::YMap(option) if value::string(option.get(txn, "id")).as_deref() == Some(id) => {
                Some((index as u32, option))
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sync;

    fn voter(name: &str) -> Voter {
        Voter { name: name.into(), color: "#00FF00".into() }
    }

    fn tally(poll: &Poll) -> Vec<(String, Vec<String>)> {
        poll.options()
            .into_iter()
            .map(|o| (o.text, o.votes.into_iter().map(|v| v.name).collect()))
            .collect()
    }

    #[test]
    fn test_question_replaced() {
        let doc = Doc::new();
        let poll = Poll::new(&doc);
        poll.set_question("Lunch?");
        poll.set_question("Dinner?");
        assert_eq!(poll.question(), "Dinner?");
    }

    #[test]
    fn test_single_select_moves_vote() {
        let doc = Doc::new();
        let poll = Poll::new(&doc);
        let pizza = poll.add_option("pizza", None);
        let soup = poll.add_option("soup", Some("ada"));

        assert!(poll.vote(&pizza, &voter("ada")));
        assert!(poll.vote(&soup, &voter("ada")));
        assert_eq!(
            tally(&poll),
            vec![("pizza".into(), vec![]), ("soup".into(), vec!["ada".to_string()])]
        );
        assert_eq!(poll.options()[1].creator_id.as_deref(), Some("ada"));
        assert_eq!(poll.options()[0].creator_id, None);

        // Voting again toggles off.
        poll.vote(&soup, &voter("ada"));
        assert!(poll.options().iter().all(|o| o.votes.is_empty()));
        assert!(!poll.vote("missing", &voter("ada")));
    }

    #[test]
    fn test_multi_select_keeps_votes() {
        let doc = Doc::new();
        let poll = Poll::new(&doc);
        poll.update_settings(SettingsPatch { multi_select: Some(true), ..Default::default() });
        assert!(poll.settings().multi_select);
        assert!(!poll.settings().anonymous);

        let a = poll.add_option("a", None);
        let b = poll.add_option("b", None);
        poll.vote(&a, &voter("ben"));
        poll.vote(&b, &voter("ben"));
        assert!(poll.options().iter().all(|o| o.votes.len() == 1));

        poll.reset_votes();
        assert!(poll.options().iter().all(|o| o.votes.is_empty()));
        assert!(poll.delete_option(&a));
        assert_eq!(poll.options().len(), 1);
    }

    #[test]
    fn test_votes_from_two_peers_merge() {
        let one = Doc::new();
        let two = Doc::new();
        let first = Poll::new(&one);
        let option = first.add_option("yes", None);
        sync(&one, &two);

        let second = Poll::new(&two);
        second.vote(&option, &voter("ben"));
        sync(&two, &one);
        assert_eq!(first.options()[0].votes, vec![voter("ben")]);
    }

    #[test]
    fn test_legacy_and_malformed_votes() {
        assert_eq!(parse_votes(Some(Out::Any(Any::from("not json")))), Vec::<Voter>::new());
        assert_eq!(parse_votes(Some(Out::Any(Any::from("")))), Vec::<Voter>::new());
        let legacy = crate::value::json_to_any(&serde_json::json!([{"name": "old", "color": "#000000"}])).unwrap();
        assert_eq!(parse_votes(Some(Out::Any(legacy))), vec![Voter { name: "old".into(), color: "#000000".into() }]);
    }
}
