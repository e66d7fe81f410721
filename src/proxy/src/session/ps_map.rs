//! Prepared-statement registry. The proxy hands every client-visible PREPARE
//! an internal id and rewrites it to the per-backend external id on each
//! forward, so one client id works across all backends.

use crate::parser::type_mask::TypeMask;
use crate::protocol::mysql::constants::{PS_DIRECT_EXEC_ID, PS_ID_OFFSET};
use crate::session::BackendId;
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct PsEntry {
    pub internal_id: u32,
    /// Server-assigned id on each backend that has seen the PREPARE.
    pub external_ids: HashMap<BackendId, u32>,
    pub param_count: u16,
    /// Type mask of the prepared body, reused for every EXECUTE.
    pub type_mask: TypeMask,
    pub route_to_last_used: bool,
    /// Parameter type metadata from the most recent execute that carried it.
    pub exec_metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TextPsEntry {
    pub type_mask: TypeMask,
    pub route_to_last_used: bool,
}

/// What a COM_STMT_CLOSE for an id did. An unknown id is silently accepted
/// when the history still has the PREPARE's recorded response (the close
/// raced connection creation); otherwise it is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    SilentlyIgnored,
    UnknownId,
}

#[derive(Debug, Default)]
pub struct PsMap {
    binary: HashMap<u32, PsEntry>,
    text: HashMap<String, TextPsEntry>,
    next_internal: u32,
    /// Most recently prepared internal id, the direct-exec sentinel target.
    prev_id: u32,
}

impl PsMap {
    pub fn new() -> Self {
        Self {
            binary: HashMap::new(),
            text: HashMap::new(),
            next_internal: 1,
            prev_id: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.binary.is_empty() && self.text.is_empty()
    }

    /// Register a binary PREPARE the moment it is routed; the internal id is
    /// what the client will see in the response.
    pub fn register_prepare(&mut self, type_mask: TypeMask, route_to_last_used: bool) -> u32 {
        let internal_id = self.next_internal;
        self.next_internal = self.next_internal.wrapping_add(1).max(1);
        self.register_prepare_with_id(internal_id, type_mask, route_to_last_used);
        internal_id
    }

    /// Register a PREPARE under an externally assigned internal id. The
    /// session uses its command id here so that close-after-reconnect can be
    /// checked against the recorded history responses.
    pub fn register_prepare_with_id(
        &mut self,
        internal_id: u32,
        type_mask: TypeMask,
        route_to_last_used: bool,
    ) {
        self.binary.insert(
            internal_id,
            PsEntry {
                internal_id,
                type_mask,
                route_to_last_used,
                ..Default::default()
            },
        );
        self.prev_id = internal_id;
    }

    pub fn register_text(&mut self, name: &str, entry: TextPsEntry) {
        self.text.insert(name.to_string(), entry);
    }

    pub fn text(&self, name: &str) -> Option<&TextPsEntry> {
        let entry = self.text.get(name);
        if entry.is_none() {
            warn!("Using unknown prepared statement with ID '{name}'");
        }
        entry
    }

    pub fn erase_text(&mut self, name: &str) {
        if self.text.remove(name).is_none() {
            warn!("Closing unknown prepared statement with ID '{name}'");
        }
    }

    /// Resolve the id found in a PS command, mapping the direct-exec
    /// sentinel to the most recently prepared statement.
    pub fn resolve(&self, id: u32) -> u32 {
        if id == PS_DIRECT_EXEC_ID && self.prev_id != 0 {
            self.prev_id
        } else {
            id
        }
    }

    pub fn get(&self, internal_id: u32) -> Option<&PsEntry> {
        self.binary.get(&internal_id)
    }

    pub fn get_mut(&mut self, internal_id: u32) -> Option<&mut PsEntry> {
        self.binary.get_mut(&internal_id)
    }

    /// Record the backend's external id from its PREPARE response.
    pub fn store_external(&mut self, internal_id: u32, backend: BackendId, external_id: u32) {
        if let Some(entry) = self.binary.get_mut(&internal_id) {
            entry.external_ids.insert(backend, external_id);
        }
    }

    pub fn set_param_count(&mut self, internal_id: u32, param_count: u16) {
        if param_count != 0 {
            if let Some(entry) = self.binary.get_mut(&internal_id) {
                entry.param_count = param_count;
            }
        }
    }

    pub fn external_id(&self, internal_id: u32, backend: BackendId) -> Option<u32> {
        self.binary
            .get(&internal_id)?
            .external_ids
            .get(&backend)
            .copied()
    }

    /// Close an id, preserving the source asymmetry: an id whose PREPARE
    /// response exists in the history but which was never registered here is
    /// silently accepted, anything else unknown is an error.
    pub fn close(&mut self, internal_id: u32, history_has_response: bool) -> CloseOutcome {
        if self.binary.remove(&internal_id).is_some() {
            if self.prev_id == internal_id {
                self.prev_id = 0;
            }
            CloseOutcome::Closed
        } else if history_has_response {
            CloseOutcome::SilentlyIgnored
        } else {
            warn!("Closing unknown prepared statement with ID {internal_id}");
            CloseOutcome::UnknownId
        }
    }

    /// Drop everything; CHANGE_USER and RESET_CONNECTION invalidate all
    /// prepared statements on the server side.
    pub fn clear(&mut self) {
        self.binary.clear();
        self.text.clear();
        self.prev_id = 0;
    }

    pub fn backend_ids_for(&self, backend: BackendId) -> Vec<(u32, u32)> {
        self.binary
            .values()
            .filter_map(|e| e.external_ids.get(&backend).map(|ext| (e.internal_id, *ext)))
            .collect()
    }
}

/// Read the 4-byte statement id of a COM_STMT_* payload.
pub fn extract_ps_id(payload: &[u8]) -> Option<u32> {
    if payload.len() < PS_ID_OFFSET + 4 {
        return None;
    }
    Some(LittleEndian::read_u32(
        &payload[PS_ID_OFFSET..PS_ID_OFFSET + 4],
    ))
}

/// Overwrite the statement id in place before forwarding to a backend.
pub fn rewrite_ps_id(payload: &mut [u8], external_id: u32) {
    if payload.len() >= PS_ID_OFFSET + 4 {
        LittleEndian::write_u32(&mut payload[PS_ID_OFFSET..PS_ID_OFFSET + 4], external_id);
    }
}

/// Substitute the internal id into a COM_STMT_PREPARE response's id field.
pub fn substitute_prepare_response_id(payload: &mut [u8], internal_id: u32) -> Option<u32> {
    if payload.len() < 5 || payload[0] != 0 {
        return None;
    }
    let server_id = LittleEndian::read_u32(&payload[1..5]);
    LittleEndian::write_u32(&mut payload[1..5], internal_id);
    Some(server_id)
}

const EXECUTE_FIXED_PREFIX: usize = 1 + 4 + 1 + 4; // cmd, id, flags, iterations

/// Parameter type metadata of a COM_STMT_EXECUTE, present only when the
/// new-params-bound flag is set.
pub fn execute_metadata(payload: &[u8], param_count: u16) -> Option<&[u8]> {
    if param_count == 0 {
        return None;
    }
    let null_bitmap_len = (param_count as usize + 7) / 8;
    let flag_offset = EXECUTE_FIXED_PREFIX + null_bitmap_len;
    if payload.len() <= flag_offset || payload[flag_offset] != 1 {
        return None;
    }
    let types_len = 2 * param_count as usize;
    payload.get(flag_offset + 1..flag_offset + 1 + types_len)
}

/// When a re-executing client omits the parameter metadata, splice the most
/// recent metadata it sent back into the packet; the server would otherwise
/// reject the execute.
pub fn splice_execute_metadata(
    payload: &[u8],
    param_count: u16,
    metadata: &[u8],
) -> Option<Vec<u8>> {
    if param_count == 0 {
        return None;
    }
    let null_bitmap_len = (param_count as usize + 7) / 8;
    let flag_offset = EXECUTE_FIXED_PREFIX + null_bitmap_len;
    if payload.len() <= flag_offset || payload[flag_offset] != 0 {
        return None;
    }
    let mut spliced = Vec::with_capacity(payload.len() + metadata.len());
    spliced.extend_from_slice(&payload[..flag_offset]);
    spliced.push(1);
    spliced.extend_from_slice(metadata);
    spliced.extend_from_slice(&payload[flag_offset + 1..]);
    Some(spliced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute_payload(id: u32, param_count: u16, bound: bool, types: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x17]; // COM_STMT_EXECUTE
        payload.extend_from_slice(&id.to_le_bytes());
        payload.push(0); // flags
        payload.extend_from_slice(&1_u32.to_le_bytes()); // iterations
        payload.extend(std::iter::repeat(0).take((param_count as usize + 7) / 8));
        payload.push(bound as u8);
        if bound {
            payload.extend_from_slice(types);
        }
        payload.extend_from_slice(&[0x05, 0x00]); // one value
        payload
    }

    #[test]
    fn internal_id_maps_to_per_backend_external_ids() {
        let mut map = PsMap::new();
        let internal = map.register_prepare(TypeMask::READ, false);
        assert_eq!(internal, 1);
        map.store_external(internal, 1, 101);
        map.store_external(internal, 2, 77);
        map.set_param_count(internal, 1);

        assert_eq!(map.external_id(internal, 1), Some(101));
        assert_eq!(map.external_id(internal, 2), Some(77));
        assert_eq!(map.get(internal).unwrap().param_count, 1);

        // rewrite towards backend 2
        let mut payload = execute_payload(internal, 1, true, &[0x08, 0x00]);
        rewrite_ps_id(&mut payload, map.external_id(internal, 2).unwrap());
        assert_eq!(extract_ps_id(&payload), Some(77));
    }

    #[test]
    fn direct_exec_sentinel_resolves_to_latest() {
        let mut map = PsMap::new();
        let first = map.register_prepare(TypeMask::READ, false);
        let second = map.register_prepare(TypeMask::WRITE, false);
        assert_eq!(map.resolve(PS_DIRECT_EXEC_ID), second);
        assert_eq!(map.resolve(first), first);
    }

    #[test]
    fn close_asymmetry() {
        let mut map = PsMap::new();
        let known = map.register_prepare(TypeMask::READ, false);
        assert_eq!(map.close(known, false), CloseOutcome::Closed);
        // a close racing connection creation is silently accepted
        assert_eq!(map.close(999, true), CloseOutcome::SilentlyIgnored);
        assert_eq!(map.close(999, false), CloseOutcome::UnknownId);
    }

    #[test]
    fn close_removes_from_every_backend_view() {
        let mut map = PsMap::new();
        let internal = map.register_prepare(TypeMask::READ, false);
        map.store_external(internal, 1, 11);
        map.store_external(internal, 2, 22);
        map.close(internal, false);
        assert_eq!(map.external_id(internal, 1), None);
        assert_eq!(map.external_id(internal, 2), None);
        assert!(map.is_empty());
    }

    #[test]
    fn prepare_response_id_substitution() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&101_u32.to_le_bytes());
        payload.extend_from_slice(&[1, 0, 1, 0, 0, 0, 0]);
        let server_id = substitute_prepare_response_id(&mut payload, 17).unwrap();
        assert_eq!(server_id, 101);
        assert_eq!(LittleEndian::read_u32(&payload[1..5]), 17);
    }

    #[test]
    fn metadata_extract_and_splice() {
        let with_meta = execute_payload(5, 1, true, &[0x08, 0x00]);
        assert_eq!(execute_metadata(&with_meta, 1), Some(&[0x08, 0x00][..]));

        let without_meta = execute_payload(5, 1, false, &[]);
        assert_eq!(execute_metadata(&without_meta, 1), None);

        let spliced = splice_execute_metadata(&without_meta, 1, &[0x08, 0x00]).unwrap();
        assert_eq!(execute_metadata(&spliced, 1), Some(&[0x08, 0x00][..]));
        // the value bytes after the flag survive
        assert_eq!(&spliced[spliced.len() - 2..], &[0x05, 0x00]);
    }

    #[test]
    fn text_ps_round_trip() {
        let mut map = PsMap::new();
        map.register_text(
            "stmt1",
            TextPsEntry {
                type_mask: TypeMask::READ,
                route_to_last_used: false,
            },
        );
        assert_eq!(map.text("stmt1").unwrap().type_mask, TypeMask::READ);
        map.erase_text("stmt1");
        assert!(map.text("stmt1").is_none());
    }
}
