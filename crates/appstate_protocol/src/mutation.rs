//! Mutations: the SET/REMOVE delta records that make up a collection.

use crate::cbor::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Well-known action names found in the first element of a mutation index.
pub mod action_names {
    /// Chat archived/unarchived.
    pub const ARCHIVE: &str = "archive";
    /// Chat pinned/unpinned.
    pub const PIN: &str = "pin_v1";
    /// Chat muted/unmuted.
    pub const MUTE: &str = "mute";
    /// Message starred/unstarred.
    pub const STAR: &str = "star";
    /// Chat marked read/unread.
    pub const MARK_READ: &str = "markChatAsRead";
    /// Chat deleted.
    pub const DELETE_CHAT: &str = "deleteChat";
    /// Chat cleared.
    pub const CLEAR_CHAT: &str = "clearChat";
    /// Contact metadata.
    pub const CONTACT: &str = "contact";
    /// Own push name.
    pub const PUSH_NAME: &str = "setting_pushName";
    /// Label created/edited/deleted.
    pub const LABEL_EDIT: &str = "label_edit";
    /// Label attached to a chat.
    pub const LABEL_ASSOCIATION: &str = "label_jid";
    /// Locale setting.
    pub const LOCALE: &str = "setting_locale";
}

/// Type of mutation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Value set or replaced.
    Set,
    /// Value removed.
    Remove,
}

impl Operation {
    /// Converts to the numeric code covered by the value MAC.
    pub fn to_code(&self) -> u8 {
        match self {
            Operation::Set => 0x01,
            Operation::Remove => 0x02,
        }
    }
}

/// Index of a mutation within its collection.
///
/// Encoded on the wire as a JSON array of strings. The first element is the
/// action name, the rest identify the target (chat JID, message ID, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationIndex(Vec<String>);

impl MutationIndex {
    /// Creates an index from an action name and its target components.
    pub fn new<I, S>(action: &str, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![action.to_string()];
        all.extend(parts.into_iter().map(Into::into));
        Self(all)
    }

    /// Returns the action name (first component).
    pub fn action_name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Returns all components.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Encodes to the JSON bytes that the index MAC is computed over.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Vec<String> cannot fail.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// Decodes from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let parts: Vec<String> = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::malformed(format!("mutation index: {e}")))?;
        if parts.is_empty() {
            return Err(ProtocolError::malformed("mutation index is empty"));
        }
        Ok(Self(parts))
    }
}

/// The semantic payload of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncAction {
    /// Archive state of a chat.
    Archive {
        /// Whether the chat is archived.
        archived: bool,
    },
    /// Pin state of a chat.
    Pin {
        /// Whether the chat is pinned.
        pinned: bool,
    },
    /// Mute state of a chat.
    Mute {
        /// Whether the chat is muted.
        muted: bool,
        /// When the mute ends (unix millis), if temporary.
        mute_end_timestamp: Option<i64>,
    },
    /// Star state of a message.
    Star {
        /// Whether the message is starred.
        starred: bool,
    },
    /// Read state of a chat.
    MarkRead {
        /// Whether the chat is read.
        read: bool,
    },
    /// Chat deletion.
    DeleteChat,
    /// Chat history cleared.
    ClearChat {
        /// Whether starred messages were deleted too.
        delete_starred: bool,
        /// Whether media was deleted too.
        delete_media: bool,
    },
    /// Contact metadata.
    Contact {
        /// Full display name.
        full_name: Option<String>,
        /// First name.
        first_name: Option<String>,
    },
    /// Own push name.
    PushName {
        /// The name.
        name: String,
    },
    /// Label definition.
    LabelEdit {
        /// Label name.
        name: String,
        /// Label color index.
        color: i32,
        /// Whether the label was deleted.
        deleted: bool,
    },
    /// Label attached to or detached from a chat.
    LabelAssociation {
        /// Whether the label is attached.
        labeled: bool,
    },
    /// Locale setting.
    Locale {
        /// Locale identifier.
        locale: String,
    },
    /// Any other named setting, carried opaquely.
    Setting {
        /// Setting name.
        name: String,
        /// Raw setting value.
        value: Vec<u8>,
    },
}

/// Timestamped action payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActionValue {
    /// When the action was performed (unix millis).
    pub timestamp: u64,
    /// The action, absent for REMOVE mutations.
    pub action: Option<SyncAction>,
}

impl SyncActionValue {
    /// Creates a value carrying an action.
    pub fn new(timestamp: u64, action: SyncAction) -> Self {
        Self {
            timestamp,
            action: Some(action),
        }
    }

    /// Creates a value without an action.
    pub fn empty(timestamp: u64) -> Self {
        Self {
            timestamp,
            action: None,
        }
    }
}

/// Plaintext content of an encrypted mutation value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncActionData {
    /// JSON-encoded mutation index.
    pub index: Vec<u8>,
    /// The action value.
    pub value: SyncActionValue,
    /// Random padding hiding the payload length.
    pub padding: Vec<u8>,
    /// Action schema version.
    pub version: u32,
}

impl SyncActionData {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes, "sync action data")
    }
}

/// A decoded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// SET or REMOVE.
    pub operation: Operation,
    /// Index within the collection.
    pub index: MutationIndex,
    /// Timestamped action.
    pub value: SyncActionValue,
    /// Action schema version.
    pub version: u32,
}

impl Mutation {
    /// Creates a SET mutation.
    pub fn set(index: MutationIndex, value: SyncActionValue, version: u32) -> Self {
        Self {
            operation: Operation::Set,
            index,
            value,
            version,
        }
    }

    /// Creates a REMOVE mutation.
    pub fn remove(index: MutationIndex, timestamp: u64, version: u32) -> Self {
        Self {
            operation: Operation::Remove,
            index,
            value: SyncActionValue::empty(timestamp),
            version,
        }
    }

    /// Returns the action timestamp.
    pub fn timestamp(&self) -> u64 {
        self.value.timestamp
    }

    /// Returns the action name used to find a handler.
    pub fn action_name(&self) -> &str {
        self.index.action_name()
    }

    /// Builds the plaintext payload for encryption.
    pub fn to_action_data(&self, padding: Vec<u8>) -> SyncActionData {
        SyncActionData {
            index: self.index.to_bytes(),
            value: self.value.clone(),
            padding,
            version: self.version,
        }
    }

    /// Rebuilds a mutation from a decrypted payload.
    pub fn from_action_data(operation: Operation, data: SyncActionData) -> ProtocolResult<Self> {
        Ok(Self {
            operation,
            index: MutationIndex::from_bytes(&data.index)?,
            value: data.value,
            version: data.version,
        })
    }
}

impl AsRef<Mutation> for Mutation {
    fn as_ref(&self) -> &Mutation {
        self
    }
}
