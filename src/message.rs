use crate::models::{FeatureFlag, Segment};
use eventsource_client as es;
use serde::Deserialize;
use std::{
    collections::HashMap,
    convert::{TryFrom, TryInto},
};
use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("Failed to parse put data: {0}")]
    ParsePut(serde_json::Error),

    #[error("Missing the data field")]
    MissingData,

    #[error(transparent)]
    ParsePatch(#[from] FromPatchDataError),

    #[error("Unable to parse event payload: {0}")]
    ParsePayload(serde_json::Error),
}

/// Parsed message from the stream
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum Message {
    Put(InitData),
    Patch(Update),
    Delete(Update),
    Unknown,
}

impl TryFrom<es::Event> for Message {
    type Error = MessageParseError;

    fn try_from(event: es::Event) -> Result<Self, Self::Error> {
        let name = &event.event_type;
        trace!(%name, "reading SSE event");

        let payload: MessagePayload =
            serde_json::from_str(&event.data).map_err(MessageParseError::ParsePayload)?;

        match name.as_str() {
            "put" => {
                let data = payload.data.ok_or(MessageParseError::MissingData)?;
                // parse into specific struct
                let full_data: InitData =
                    serde_json::from_value(data).map_err(MessageParseError::ParsePut)?;
                trace!(
                    num_flags = full_data.flags.len(),
                    num_segments = full_data.segments.len(),
                    "parsed init data"
                );
                Ok(Self::Put(full_data))
            }
            // change or delete a single record
            "patch" | "delete" => {
                // convert to path-based update
                let update: Update = payload.try_into()?;
                trace!(?update, "parsed update");
                Ok(match name.as_str() {
                    "patch" => Self::Patch(update),
                    "delete" => Self::Delete(update),
                    _ => unreachable!(),
                })
            }
            // unknown
            _ => {
                warn!(%name, "unknown event type");
                Ok(Message::Unknown)
            }
        }
    }
}

/// Data used to initially populate a [Store](crate::store::Store)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InitData {
    /// Config for all flags
    pub flags: HashMap<String, FeatureFlag>,
    /// All segment definitions
    pub segments: HashMap<String, Segment>,
}

/// Update Payload (parsed from json)
#[derive(Debug, Deserialize)]
struct MessagePayload {
    /// updated path
    path: String,
    /// updated record
    data: Option<serde_json::Value>,
    /// version (used for deletion)
    version: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum FromPatchDataError {
    #[error("Update path is unknown")]
    UnknownPath,

    #[error("Missing record key")]
    MissingKey,

    #[error("Failed to read record payload")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Used in [Message]
///
/// Describes the change of a single record
/// (add, update or delete)
#[derive(Debug)]
pub enum Update {
    /// a flag changed
    Flag {
        key: String,
        data: Option<FeatureFlag>,
        version: Option<u64>,
    },
    /// a segment changed
    Segment {
        key: String,
        data: Option<Segment>,
        version: Option<u64>,
    },
    /// any type of record we haven't implemented
    Unknown,
}

impl TryFrom<MessagePayload> for Update {
    type Error = FromPatchDataError;

    fn try_from(pl: MessagePayload) -> Result<Self, Self::Error> {
        // paths look like /flags/KEY or /segments/KEY
        let mut parts = pl.path.split('/').filter(|part| !part.is_empty());

        // first path segment is the type of record
        let kind = parts.next().ok_or(FromPatchDataError::UnknownPath)?;
        match kind {
            "flags" => {
                let key = parts.next().ok_or(FromPatchDataError::MissingKey)?.into();
                let data = pl.data.map(serde_json::from_value).transpose()?;
                Ok(Self::Flag {
                    key,
                    data,
                    version: pl.version,
                })
            }
            "segments" => {
                let key = parts.next().ok_or(FromPatchDataError::MissingKey)?.into();
                let data = pl.data.map(serde_json::from_value).transpose()?;
                Ok(Self::Segment {
                    key,
                    data,
                    version: pl.version,
                })
            }
            // path we don't handle yet
            _ => Ok(Self::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    fn payload(path: &str, data: Option<serde_json::Value>, version: Option<u64>) -> MessagePayload {
        MessagePayload {
            path: path.into(),
            data,
            version,
        }
    }

    #[test]
    fn flag_patch_path_routes_to_flag_update() {
        let update: Update = payload(
            "/flags/my-flag",
            Some(serde_json::json!({"key": "my-flag", "version": 2})),
            None,
        )
        .try_into()
        .expect("parse update");
        match update {
            Update::Flag { key, data, .. } => {
                assert_eq!(key, "my-flag");
                assert_eq!(data.expect("flag data").version, 2);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn segment_delete_path_routes_to_segment_update() {
        let update: Update = payload("/segments/my-segment", None, Some(9))
            .try_into()
            .expect("parse update");
        match update {
            Update::Segment { key, data, version } => {
                assert_eq!(key, "my-segment");
                assert!(data.is_none());
                assert_eq!(version, Some(9));
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn unhandled_paths_are_tolerated() {
        let update: Update = payload("/widgets/x", None, None).try_into().expect("parse");
        assert!(matches!(update, Update::Unknown));
    }

    #[test]
    fn put_payload_parses_flags_and_segments() {
        let raw = r#"{
            "path": "/",
            "data": {
                "flags": {"f": {"key": "f", "version": 1}},
                "segments": {"s": {"key": "s", "version": 1}}
            }
        }"#;
        let payload: MessagePayload = serde_json::from_str(raw).expect("parse payload");
        let data: InitData =
            serde_json::from_value(payload.data.expect("data")).expect("parse init data");
        assert_eq!(data.flags.len(), 1);
        assert_eq!(data.segments.len(), 1);
    }
}
