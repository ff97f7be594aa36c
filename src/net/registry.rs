//! Opcode dispatch table. Built once at startup from the configured
//! opcode table and immutable afterwards, so the hot lookup path is
//! lock-free by construction. Unknown opcodes resolve to
//! [`Resolution::Unknown`]; the caller logs and drops the packet, the
//! connection stays up.

use std::collections::HashMap;

use crate::net::client_packets::{
    decode_auth_login, decode_character_select, decode_handshake, decode_logout, decode_ping,
    decode_request_roster, decode_say, decode_who_request, ClientPacket,
};
use crate::net::opcodes::{InboundKind, OpcodeTable};
use crate::net::packet::PacketReader;

pub type DecodeFn = fn(&mut PacketReader) -> Result<ClientPacket, String>;

#[derive(Clone, Copy)]
pub struct HandlerBinding {
    pub kind: InboundKind,
    pub decode: DecodeFn,
}

pub enum Resolution<'a> {
    Handler(&'a HandlerBinding),
    Unknown { opcode: u8, sub_opcode: Option<u16> },
}

pub struct HandlerRegistry {
    table: OpcodeTable,
    primary: HashMap<u8, HandlerBinding>,
    extended: HashMap<u16, HandlerBinding>,
}

impl HandlerRegistry {
    pub fn new(table: OpcodeTable) -> Self {
        let mut primary = HashMap::new();
        let mut extended = HashMap::new();
        for (opcode, kind) in table.inbound_entries() {
            primary.insert(opcode, binding_for(kind));
        }
        for (sub_opcode, kind) in table.inbound_extended_entries() {
            extended.insert(sub_opcode, binding_for(kind));
        }
        Self {
            table,
            primary,
            extended,
        }
    }

    pub fn table(&self) -> &OpcodeTable {
        &self.table
    }

    /// Consumes the opcode path from the cursor and resolves the decoder.
    /// A truncated extended header is malformed, not merely unknown.
    pub fn resolve(&self, reader: &mut PacketReader) -> Result<Resolution<'_>, String> {
        let opcode = reader
            .read_u8()
            .ok_or_else(|| "packet body is empty".to_string())?;
        if opcode == self.table.extended_inbound {
            let sub_opcode = reader
                .read_u16_le()
                .ok_or_else(|| "extended packet missing sub-opcode".to_string())?;
            return Ok(match self.extended.get(&sub_opcode) {
                Some(binding) => Resolution::Handler(binding),
                None => Resolution::Unknown {
                    opcode,
                    sub_opcode: Some(sub_opcode),
                },
            });
        }
        Ok(match self.primary.get(&opcode) {
            Some(binding) => Resolution::Handler(binding),
            None => Resolution::Unknown {
                opcode,
                sub_opcode: None,
            },
        })
    }
}

fn binding_for(kind: InboundKind) -> HandlerBinding {
    let decode: DecodeFn = match kind {
        InboundKind::Handshake => decode_handshake,
        InboundKind::AuthLogin => decode_auth_login,
        InboundKind::RequestRoster => decode_request_roster,
        InboundKind::CharacterSelect => decode_character_select,
        InboundKind::Ping => decode_ping,
        InboundKind::Say => decode_say,
        InboundKind::Logout => decode_logout,
        InboundKind::WhoRequest => decode_who_request,
    };
    HandlerBinding { kind, decode }
}
