//! Sync request and response documents.
//!
//! Request:
//!
//! ```text
//! <iq xmlns="w:sync:app:state" type="set">
//!   <sync>
//!     <collection name="regular" return_snapshot="false" version="12">
//!       <patch>cbor PatchRecord</patch>            (push only)
//!     </collection>
//!   </sync>
//! </iq>
//! ```
//!
//! Response:
//!
//! ```text
//! <iq type="result">
//!   <sync>
//!     <collection name="regular" version="14" has_more_patches="false">
//!       <patches><patch>cbor PatchRecord</patch>...</patches>
//!       <snapshot>cbor SnapshotRecord | <external>cbor reference</external></snapshot>
//!     </collection>
//!   </sync>
//! </iq>
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::node::Node;
use crate::patch_type::PatchType;
use crate::records::{ExternalBlobReference, PatchRecord, SnapshotRecord};

/// Namespace of app state sync requests.
pub const SYNC_XMLNS: &str = "w:sync:app:state";

/// A parsed sync request (server side view).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// Target collection.
    pub patch_type: PatchType,
    /// Client's current version; absent on first sync.
    pub version: Option<u64>,
    /// Whether the client asks for a snapshot.
    pub return_snapshot: bool,
    /// Patches pushed by the client.
    pub patches: Vec<PatchRecord>,
}

/// Where a snapshot's content lives.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotSource {
    /// Inline in the response.
    Inline(SnapshotRecord),
    /// Stored on the media host.
    External(ExternalBlobReference),
}

/// Normalized sync response for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// The collection.
    pub collection_name: PatchType,
    /// Server version reported for the collection.
    pub version: u64,
    /// Whether further pages remain.
    pub has_more: bool,
    /// Patches in server order.
    pub patches: Vec<PatchRecord>,
    /// Snapshot, if the server chose to send one.
    pub snapshot: Option<SnapshotSource>,
}

impl SyncResponse {
    /// Creates an empty response at `version`.
    pub fn new(collection_name: PatchType, version: u64) -> Self {
        Self {
            collection_name,
            version,
            has_more: false,
            patches: Vec::new(),
            snapshot: None,
        }
    }

    /// Encodes into a response document.
    pub fn to_node(&self) -> ProtocolResult<Node> {
        let mut children = Vec::new();

        if let Some(snapshot) = &self.snapshot {
            let node = match snapshot {
                SnapshotSource::Inline(record) => {
                    Node::new("snapshot").with_bytes(record.encode()?)
                }
                SnapshotSource::External(reference) => Node::new("snapshot")
                    .with_children(vec![Node::new("external").with_bytes(reference.encode()?)]),
            };
            children.push(node);
        }

        if !self.patches.is_empty() {
            let patches = self
                .patches
                .iter()
                .map(|p| Ok(Node::new("patch").with_bytes(p.encode()?)))
                .collect::<ProtocolResult<Vec<_>>>()?;
            children.push(Node::new("patches").with_children(patches));
        }

        let collection = Node::new("collection")
            .with_attr("name", self.collection_name)
            .with_attr("version", self.version)
            .with_attr("has_more_patches", self.has_more)
            .with_children(children);

        Ok(result_iq(collection))
    }
}

fn result_iq(collection: Node) -> Node {
    Node::new("iq")
        .with_attr("type", "result")
        .with_children(vec![Node::new("sync").with_children(vec![collection])])
}

fn request_iq(collection: Node) -> Node {
    Node::new("iq")
        .with_attr("xmlns", SYNC_XMLNS)
        .with_attr("type", "set")
        .with_children(vec![Node::new("sync").with_children(vec![collection])])
}

fn collection_node(patch_type: PatchType, version: u64) -> Node {
    let first_sync = version == 0;
    let node = Node::new("collection")
        .with_attr("name", patch_type)
        .with_attr("return_snapshot", first_sync);
    if first_sync {
        node
    } else {
        node.with_attr("version", version)
    }
}

/// Builds a push request carrying one encrypted patch.
///
/// `version` is the local version the patch builds on. On first sync
/// (version 0) a snapshot is requested and the version is omitted.
pub fn build_push_request(
    patch_type: PatchType,
    version: u64,
    patch: &PatchRecord,
) -> ProtocolResult<Node> {
    let collection = collection_node(patch_type, version)
        .with_children(vec![Node::new("patch").with_bytes(patch.encode()?)]);
    Ok(request_iq(collection))
}

/// Builds a pull request starting at the last known version.
pub fn build_pull_request(patch_type: PatchType, version: u64) -> Node {
    request_iq(collection_node(patch_type, version))
}

/// Builds an error response for a collection.
pub fn build_error_response(patch_type: PatchType, code: u16, text: &str) -> Node {
    let collection = Node::new("collection")
        .with_attr("name", patch_type)
        .with_attr("type", "error")
        .with_children(vec![error_node(code, text)]);
    result_iq(collection)
}

fn error_node(code: u16, text: &str) -> Node {
    Node::new("error").with_attr("code", code).with_attr("text", text)
}

fn parse_error(node: &Node) -> ProtocolError {
    let Some(error) = node.child("error") else {
        return ProtocolError::malformed(format!(
            "<{}> of type error has no <error> child",
            node.tag
        ));
    };
    let code = error
        .attr("code")
        .and_then(|c| c.parse::<u16>().ok())
        .unwrap_or(500);
    ProtocolError::ServerError {
        code,
        text: error.attr("text").unwrap_or_default().to_string(),
    }
}

fn single_collection(iq: &Node) -> ProtocolResult<&Node> {
    if iq.attr("type") == Some("error") {
        return Err(parse_error(iq));
    }
    iq.required_child("sync")?.required_child("collection")
}

/// Parses a sync response for `expected`.
pub fn parse_sync_response(iq: &Node, expected: PatchType) -> ProtocolResult<SyncResponse> {
    let collection = single_collection(iq)?;

    let name = collection.required_attr("name")?;
    if name != expected.as_str() {
        return Err(ProtocolError::UnexpectedCollection {
            expected: expected.to_string(),
            actual: name.to_string(),
        });
    }

    if collection.attr("type") == Some("error") {
        return Err(parse_error(collection));
    }

    let version = collection.attr_u64("version")?.unwrap_or(0);
    let has_more = collection.attr_bool("has_more_patches");

    let patches = match collection.child("patches") {
        Some(patches) => patches
            .children_with_tag("patch")
            .map(|p| PatchRecord::decode(p.required_bytes()?))
            .collect::<ProtocolResult<Vec<_>>>()?,
        None => Vec::new(),
    };

    let snapshot = collection.child("snapshot").map(parse_snapshot).transpose()?;

    Ok(SyncResponse {
        collection_name: expected,
        version,
        has_more,
        patches,
        snapshot,
    })
}

fn parse_snapshot(node: &Node) -> ProtocolResult<SnapshotSource> {
    if let Some(external) = node.child("external") {
        return Ok(SnapshotSource::External(ExternalBlobReference::decode(
            external.required_bytes()?,
        )?));
    }
    Ok(SnapshotSource::Inline(SnapshotRecord::decode(node.required_bytes()?)?))
}

/// Parses a sync request (the server side of [`build_push_request`] and
/// [`build_pull_request`]).
pub fn parse_sync_request(iq: &Node) -> ProtocolResult<SyncRequest> {
    if iq.attr("xmlns") != Some(SYNC_XMLNS) {
        return Err(ProtocolError::malformed("request is not an app state sync iq"));
    }
    let collection = single_collection(iq)?;
    let patch_type = PatchType::from_name(collection.required_attr("name")?)?;
    let patches = collection
        .children_with_tag("patch")
        .map(|p| PatchRecord::decode(p.required_bytes()?))
        .collect::<ProtocolResult<Vec<_>>>()?;

    Ok(SyncRequest {
        patch_type,
        version: collection.attr_u64("version")?,
        return_snapshot: collection.attr_bool("return_snapshot"),
        patches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Operation;
    use crate::records::{KeyId, MutationRecord};

    fn patch(version: u64) -> PatchRecord {
        PatchRecord {
            version,
            mutations: vec![MutationRecord {
                operation: Operation::Set,
                index_mac: vec![1; 32],
                value_blob: vec![2; 64],
                key_id: KeyId::new([7]),
            }],
            external_mutations: None,
            patch_mac: vec![3; 32],
            key_id: KeyId::new([7]),
            device_index: None,
        }
    }

    #[test]
    fn first_sync_requests_snapshot_without_version() {
        let request = build_pull_request(PatchType::Regular, 0);
        let parsed = parse_sync_request(&request).unwrap();
        assert_eq!(parsed.patch_type, PatchType::Regular);
        assert!(parsed.return_snapshot);
        assert_eq!(parsed.version, None);
        assert!(parsed.patches.is_empty());
    }

    #[test]
    fn pull_from_known_version() {
        let request = build_pull_request(PatchType::RegularLow, 42);
        let collection = request
            .required_child("sync")
            .unwrap()
            .required_child("collection")
            .unwrap();
        assert_eq!(collection.attr("version"), Some("42"));
        assert_eq!(collection.attr("return_snapshot"), Some("false"));
    }

    #[test]
    fn push_request_embeds_patch() {
        let request = build_push_request(PatchType::CriticalBlock, 5, &patch(6)).unwrap();
        let parsed = parse_sync_request(&request).unwrap();
        assert_eq!(parsed.version, Some(5));
        assert!(!parsed.return_snapshot);
        assert_eq!(parsed.patches, vec![patch(6)]);
    }

    #[test]
    fn response_with_patches_and_snapshot() {
        let response = SyncResponse {
            collection_name: PatchType::Regular,
            version: 9,
            has_more: true,
            patches: vec![patch(8), patch(9)],
            snapshot: Some(SnapshotSource::Inline(SnapshotRecord {
                version: 7,
                records: vec![],
                mac: vec![0; 32],
                key_id: KeyId::new([7]),
            })),
        };

        let node = response.to_node().unwrap();
        let parsed = parse_sync_response(&node, PatchType::Regular).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn external_snapshot_reference() {
        let reference = ExternalBlobReference {
            direct_path: "/snap".into(),
            media_key: vec![1; 32],
            file_sha256: vec![2; 32],
            file_size: 10,
        };
        let mut response = SyncResponse::new(PatchType::Regular, 45);
        response.snapshot = Some(SnapshotSource::External(reference.clone()));

        let parsed = parse_sync_response(&response.to_node().unwrap(), PatchType::Regular).unwrap();
        assert_eq!(parsed.snapshot, Some(SnapshotSource::External(reference)));
        assert!(!parsed.has_more);
    }

    #[test]
    fn collection_error_is_surfaced() {
        let node = build_error_response(PatchType::Regular, 409, "conflict");
        let err = parse_sync_response(&node, PatchType::Regular).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ServerError {
                code: 409,
                text: "conflict".into()
            }
        );
        assert!(err.is_retryable_server_error());
    }

    #[test]
    fn iq_error_is_surfaced() {
        let node = Node::new("iq")
            .with_attr("type", "error")
            .with_children(vec![Node::new("error").with_attr("code", 401)]);
        let err = parse_sync_response(&node, PatchType::Regular).unwrap_err();
        assert!(matches!(err, ProtocolError::ServerError { code: 401, .. }));
    }

    #[test]
    fn wrong_collection_is_rejected() {
        let node = SyncResponse::new(PatchType::RegularHigh, 1).to_node().unwrap();
        let err = parse_sync_response(&node, PatchType::Regular).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedCollection { .. }));
    }

    #[test]
    fn garbage_patch_bytes_are_malformed() {
        let node = result_iq(
            Node::new("collection")
                .with_attr("name", "regular")
                .with_attr("version", 1)
                .with_children(vec![Node::new("patches")
                    .with_children(vec![Node::new("patch").with_bytes(vec![0xFF, 0x00])])]),
        );
        let err = parse_sync_response(&node, PatchType::Regular).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedRecord { .. }));
    }
}
