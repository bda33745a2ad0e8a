//! Server-originated mutation events.
//!
//! Frames on the event channel are JSON objects; only frames of the form
//! `{"type": "event", "content": <Event>}` carry an [`Event`]. Every event
//! has a `type` discriminator and the `session_id` of the client whose
//! request caused it, so a client can recognize its own echoes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::DocumentRecord;

/// Discriminator of an [`Event`], used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    AddEntry,
    UpdateEntry,
    DeleteEntry,
    UpdateNote,
    UpdateTag,
    DeleteTag,
    AddUser,
    UpdateUser,
    DeleteUser,
    Login,
    Logout,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::AddEntry,
        EventKind::UpdateEntry,
        EventKind::DeleteEntry,
        EventKind::UpdateNote,
        EventKind::UpdateTag,
        EventKind::DeleteTag,
        EventKind::AddUser,
        EventKind::UpdateUser,
        EventKind::DeleteUser,
        EventKind::Login,
        EventKind::Logout,
    ];

    /// Kinds that mutate the document index.
    pub const LIBRARY: [EventKind; 6] = [
        EventKind::AddEntry,
        EventKind::UpdateEntry,
        EventKind::DeleteEntry,
        EventKind::UpdateNote,
        EventKind::UpdateTag,
        EventKind::DeleteTag,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::AddEntry => "add_entry",
            EventKind::UpdateEntry => "update_entry",
            EventKind::DeleteEntry => "delete_entry",
            EventKind::UpdateNote => "update_note",
            EventKind::UpdateTag => "update_tag",
            EventKind::DeleteTag => "delete_tag",
            EventKind::AddUser => "add_user",
            EventKind::UpdateUser => "update_user",
            EventKind::DeleteUser => "delete_user",
            EventKind::Login => "login",
            EventKind::Logout => "logout",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown event type: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AddEntry(EntryChange),
    UpdateEntry(EntryChange),
    DeleteEntry(EntryChange),
    UpdateNote(NoteChange),
    UpdateTag(TagChange),
    DeleteTag(TagChange),
    AddUser(UserChange),
    UpdateUser(UserChange),
    DeleteUser(UserChange),
    Login(UserChange),
    Logout(UserChange),
}

/// A document was created, updated, or deleted. `datapoint_summary` is the
/// new summary, `None` for deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryChange {
    pub uuid: String,
    #[serde(default)]
    pub datapoint_summary: Option<DocumentRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteChange {
    #[serde(default)]
    pub uuid: Option<String>,
    pub note: String,
}

/// A tag was renamed (`dst_tag` set) or deleted (`dst_tag` absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagChange {
    pub src_tag: String,
    #[serde(default)]
    pub dst_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserChange {
    pub username: String,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub mandatory_tags: Vec<String>,
    #[serde(default)]
    pub has_avatar: bool,
    #[serde(default)]
    pub max_storage: i64,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::AddEntry(_) => EventKind::AddEntry,
            EventPayload::UpdateEntry(_) => EventKind::UpdateEntry,
            EventPayload::DeleteEntry(_) => EventKind::DeleteEntry,
            EventPayload::UpdateNote(_) => EventKind::UpdateNote,
            EventPayload::UpdateTag(_) => EventKind::UpdateTag,
            EventPayload::DeleteTag(_) => EventKind::DeleteTag,
            EventPayload::AddUser(_) => EventKind::AddUser,
            EventPayload::UpdateUser(_) => EventKind::UpdateUser,
            EventPayload::DeleteUser(_) => EventKind::DeleteUser,
            EventPayload::Login(_) => EventKind::Login,
            EventPayload::Logout(_) => EventKind::Logout,
        }
    }

    /// `true` if the event was caused by the client owning `session_id`.
    pub fn is_echo_of(&self, session_id: &str) -> bool {
        !self.session_id.is_empty() && self.session_id == session_id
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for frames that are not event envelopes and for events
/// of a type this client does not know, so that server-side additions do not
/// break older clients. Malformed JSON and malformed known events are errors.
pub fn parse_frame(text: &str) -> Result<Option<Event>> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.kind != "event" {
        debug!(frame_type = %envelope.kind, "ignoring non-event frame");
        return Ok(None);
    }
    let event_type = envelope
        .content
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    if event_type.parse::<EventKind>().is_err() {
        debug!(event_type, "ignoring unknown event type");
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(envelope.content)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_event() {
        let frame = r#"{"type": "event", "content": {
            "type": "update_entry", "session_id": "s1", "uuid": "d1",
            "datapoint_summary": {"uuid": "d1", "title": "New", "tags": ["a -> b"], "time_added": 10}
        }}"#;
        let event = parse_frame(frame).unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::UpdateEntry);
        assert_eq!(event.session_id, "s1");
        match event.payload {
            EventPayload::UpdateEntry(change) => {
                let rec = change.datapoint_summary.unwrap();
                assert_eq!(rec.title, "New");
                assert!(rec.tags.contains("a->b"));
                assert_eq!(rec.time_added, 10.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn parses_tag_and_user_events() {
        let tag = parse_frame(
            r#"{"type":"event","content":{"type":"delete_tag","session_id":"x","src_tag":"a","dst_tag":null}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            tag.payload,
            EventPayload::DeleteTag(TagChange {
                src_tag: "a".into(),
                dst_tag: None
            })
        );

        let user = parse_frame(
            r#"{"type":"event","content":{"type":"login","session_id":"x","username":"ada","user_info":{"username":"ada","is_admin":true}}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(user.kind(), EventKind::Login);
    }

    #[test]
    fn ignores_unknown_and_non_event_frames() {
        assert!(parse_frame(r#"{"type":"event","content":{"type":"future_kind","session_id":"x"}}"#)
            .unwrap()
            .is_none());
        assert!(parse_frame(r#"{"type":"pong"}"#).unwrap().is_none());
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!(matches!("nope".parse::<EventKind>(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn echo_detection() {
        let event = Event {
            session_id: "me".into(),
            payload: EventPayload::UpdateNote(NoteChange {
                uuid: Some("d".into()),
                note: String::new(),
            }),
        };
        assert!(event.is_echo_of("me"));
        assert!(!event.is_echo_of("other"));
    }
}
