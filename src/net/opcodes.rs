//! Opcode tables. The concrete opcode values are deployment content, not
//! core logic: each supported protocol revision carries its own table, and
//! a YAML table file can replace the built-in ones entirely. The table is
//! resolved once at startup and never mutated afterwards.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Semantic type of an inbound (client-to-server) packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    Handshake,
    AuthLogin,
    RequestRoster,
    CharacterSelect,
    Ping,
    Say,
    Logout,
    WhoRequest,
}

impl InboundKind {
    pub fn name(self) -> &'static str {
        match self {
            InboundKind::Handshake => "handshake",
            InboundKind::AuthLogin => "auth_login",
            InboundKind::RequestRoster => "request_roster",
            InboundKind::CharacterSelect => "character_select",
            InboundKind::Ping => "ping",
            InboundKind::Say => "say",
            InboundKind::Logout => "logout",
            InboundKind::WhoRequest => "who_request",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "handshake" => InboundKind::Handshake,
            "auth_login" => InboundKind::AuthLogin,
            "request_roster" => InboundKind::RequestRoster,
            "character_select" => InboundKind::CharacterSelect,
            "ping" => InboundKind::Ping,
            "say" => InboundKind::Say,
            "logout" => InboundKind::Logout,
            "who_request" => InboundKind::WhoRequest,
            _ => return None,
        })
    }
}

/// Server-to-client opcodes. A plain struct rather than a map: every
/// message type must have a code, so lookups cannot fail at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OutboundOpcodes {
    pub key_init: u8,
    pub auth_result: u8,
    pub roster: u8,
    pub enter_world: u8,
    pub pong: u8,
    pub system_message: u8,
    pub chat_say: u8,
    pub disconnect: u8,
    /// Primary opcode introducing an extended (sub-opcode) packet.
    pub extended: u8,
    pub ex_who: u16,
}

#[derive(Debug, Clone)]
pub struct OpcodeTable {
    pub revision: u32,
    /// Primary opcode that introduces an extended inbound packet.
    pub extended_inbound: u8,
    inbound: HashMap<u8, InboundKind>,
    inbound_extended: HashMap<u16, InboundKind>,
    pub out: OutboundOpcodes,
}

impl OpcodeTable {
    pub fn inbound_kind(&self, opcode: u8) -> Option<InboundKind> {
        self.inbound.get(&opcode).copied()
    }

    pub fn inbound_extended_kind(&self, sub_opcode: u16) -> Option<InboundKind> {
        self.inbound_extended.get(&sub_opcode).copied()
    }

    pub fn inbound_entries(&self) -> impl Iterator<Item = (u8, InboundKind)> + '_ {
        self.inbound.iter().map(|(code, kind)| (*code, *kind))
    }

    pub fn inbound_extended_entries(&self) -> impl Iterator<Item = (u16, InboundKind)> + '_ {
        self.inbound_extended
            .iter()
            .map(|(code, kind)| (*code, *kind))
    }

    /// Built-in table for a supported protocol revision.
    pub fn for_revision(revision: u32) -> Option<Self> {
        match revision {
            REVISION_830 => Some(builtin_830()),
            REVISION_831 => Some(builtin_831()),
            _ => None,
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, String> {
        let spec: TableSpec =
            serde_yaml::from_str(text).map_err(|err| format!("opcode table parse failed: {err}"))?;
        spec.build()
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| format!("opcode table read failed for {}: {}", path.display(), err))?;
        Self::from_yaml_str(&text)
    }
}

pub const REVISION_830: u32 = 830;
pub const REVISION_831: u32 = 831;

fn builtin_outbound() -> OutboundOpcodes {
    OutboundOpcodes {
        key_init: 0x2e,
        auth_result: 0x0a,
        roster: 0x13,
        enter_world: 0x15,
        pong: 0x5a,
        system_message: 0x64,
        chat_say: 0x4a,
        disconnect: 0x7e,
        extended: 0xfe,
        ex_who: 0x005b,
    }
}

fn builtin_830() -> OpcodeTable {
    let inbound = HashMap::from([
        (0x0e, InboundKind::Handshake),
        (0x2b, InboundKind::AuthLogin),
        (0x0d, InboundKind::RequestRoster),
        (0x12, InboundKind::CharacterSelect),
        (0x59, InboundKind::Ping),
        (0x49, InboundKind::Say),
        (0x00, InboundKind::Logout),
    ]);
    let inbound_extended = HashMap::from([(0x0001, InboundKind::WhoRequest)]);
    OpcodeTable {
        revision: REVISION_830,
        extended_inbound: 0xd0,
        inbound,
        inbound_extended,
        out: builtin_outbound(),
    }
}

// Revision 831 moved the credential and chat opcodes; everything else is
// shared with 830.
fn builtin_831() -> OpcodeTable {
    let mut table = builtin_830();
    table.revision = REVISION_831;
    table.inbound.remove(&0x2b);
    table.inbound.remove(&0x49);
    table.inbound.insert(0x08, InboundKind::AuthLogin);
    table.inbound.insert(0x38, InboundKind::Say);
    table
}

#[derive(Debug, Deserialize)]
struct TableSpec {
    revision: u32,
    extended_inbound: u8,
    inbound: HashMap<u8, String>,
    #[serde(default)]
    inbound_extended: HashMap<u16, String>,
    outbound: OutboundOpcodes,
}

impl TableSpec {
    fn build(self) -> Result<OpcodeTable, String> {
        let mut inbound = HashMap::new();
        for (code, name) in &self.inbound {
            let kind = InboundKind::from_name(name)
                .ok_or_else(|| format!("unknown inbound packet kind '{name}'"))?;
            if *code == self.extended_inbound {
                return Err(format!(
                    "inbound opcode 0x{code:02x} collides with the extended opcode"
                ));
            }
            inbound.insert(*code, kind);
        }
        let mut inbound_extended = HashMap::new();
        for (code, name) in &self.inbound_extended {
            let kind = InboundKind::from_name(name)
                .ok_or_else(|| format!("unknown inbound packet kind '{name}'"))?;
            inbound_extended.insert(*code, kind);
        }
        if !inbound.values().any(|kind| *kind == InboundKind::Handshake) {
            return Err("opcode table has no handshake opcode".to_string());
        }
        Ok(OpcodeTable {
            revision: self.revision,
            extended_inbound: self.extended_inbound,
            inbound,
            inbound_extended,
            out: self.outbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_revisions_cover_every_inbound_kind() {
        for revision in [REVISION_830, REVISION_831] {
            let table = OpcodeTable::for_revision(revision).expect("builtin");
            let mut kinds: Vec<InboundKind> = table.inbound.values().copied().collect();
            kinds.extend(table.inbound_extended.values().copied());
            for kind in [
                InboundKind::Handshake,
                InboundKind::AuthLogin,
                InboundKind::RequestRoster,
                InboundKind::CharacterSelect,
                InboundKind::Ping,
                InboundKind::Say,
                InboundKind::Logout,
                InboundKind::WhoRequest,
            ] {
                assert!(kinds.contains(&kind), "rev {revision} missing {kind:?}");
            }
        }
    }

    #[test]
    fn revisions_differ_in_credential_opcode() {
        let r830 = OpcodeTable::for_revision(REVISION_830).expect("830");
        let r831 = OpcodeTable::for_revision(REVISION_831).expect("831");
        assert_eq!(r830.inbound_kind(0x2b), Some(InboundKind::AuthLogin));
        assert_eq!(r831.inbound_kind(0x2b), None);
        assert_eq!(r831.inbound_kind(0x08), Some(InboundKind::AuthLogin));
    }

    #[test]
    fn unsupported_revision_is_rejected() {
        assert!(OpcodeTable::for_revision(1).is_none());
    }

    #[test]
    fn yaml_table_parses() {
        let table = OpcodeTable::from_yaml_str(
            "revision: 900\n\
             extended_inbound: 208\n\
             inbound:\n  14: handshake\n  43: auth_login\n  18: character_select\n\
             inbound_extended:\n  1: who_request\n\
             outbound:\n  key_init: 46\n  auth_result: 10\n  roster: 19\n\
             \x20 enter_world: 21\n  pong: 90\n  system_message: 100\n\
             \x20 chat_say: 74\n  disconnect: 126\n  extended: 254\n  ex_who: 91\n",
        )
        .expect("table");
        assert_eq!(table.revision, 900);
        assert_eq!(table.inbound_kind(14), Some(InboundKind::Handshake));
        assert_eq!(table.inbound_extended_kind(1), Some(InboundKind::WhoRequest));
        assert_eq!(table.out.ex_who, 91);
    }

    #[test]
    fn yaml_table_rejects_unknown_kind() {
        let err = OpcodeTable::from_yaml_str(
            "revision: 900\nextended_inbound: 208\n\
             inbound:\n  14: teleport\n\
             outbound:\n  key_init: 46\n  auth_result: 10\n  roster: 19\n\
             \x20 enter_world: 21\n  pong: 90\n  system_message: 100\n\
             \x20 chat_say: 74\n  disconnect: 126\n  extended: 254\n  ex_who: 91\n",
        )
        .unwrap_err();
        assert!(err.contains("teleport"), "{err}");
    }

    #[test]
    fn yaml_table_requires_handshake() {
        let err = OpcodeTable::from_yaml_str(
            "revision: 900\nextended_inbound: 208\n\
             inbound:\n  43: auth_login\n\
             outbound:\n  key_init: 46\n  auth_result: 10\n  roster: 19\n\
             \x20 enter_world: 21\n  pong: 90\n  system_message: 100\n\
             \x20 chat_say: 74\n  disconnect: 126\n  extended: 254\n  ex_who: 91\n",
        )
        .unwrap_err();
        assert!(err.contains("handshake"), "{err}");
    }
}
