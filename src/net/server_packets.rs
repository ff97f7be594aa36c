//! Server-to-client packet builders. Each builder is a pure function from
//! already-resolved data to a packet body; nothing here reads shared
//! state, blocks, or fails. Broadcast bodies are built once and shared.

use crate::entities::player::{PlayerRecord, RosterEntry};
use crate::net::cipher::HANDSHAKE_KEY_BYTES;
use crate::net::opcodes::OpcodeTable;
use crate::net::packet::PacketWriter;

/// Reason byte carried by the disconnect notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCode {
    ServerShutdown = 0x01,
    ProtocolViolation = 0x02,
    AuthFailed = 0x03,
    AuthUnavailable = 0x04,
    IdleTimeout = 0x05,
    DuplicateLogin = 0x06,
    SlowConsumer = 0x07,
}

pub fn build_key_init(
    table: &OpcodeTable,
    key_half: &[u8; HANDSHAKE_KEY_BYTES],
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(2 + 4 + HANDSHAKE_KEY_BYTES);
    writer.write_u8(table.out.key_init);
    writer.write_u8(0x01); // protocol accepted
    writer.write_u32_le(table.revision);
    writer.write_bytes(key_half);
    writer.into_vec()
}

pub fn build_auth_ok(table: &OpcodeTable) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.auth_result);
    writer.write_u8(0x00);
    writer.into_vec()
}

pub fn build_auth_fail(table: &OpcodeTable, reason: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.auth_result);
    writer.write_u8(0x01);
    writer.write_string_utf16(reason);
    writer.into_vec()
}

pub fn build_character_roster(table: &OpcodeTable, entries: &[RosterEntry]) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.roster);
    writer.write_u8(entries.len().min(u8::MAX as usize) as u8);
    for entry in entries.iter().take(u8::MAX as usize) {
        writer.write_u32_le(entry.player_id.0);
        writer.write_string_utf16(&entry.name);
        writer.write_u16_le(entry.level);
    }
    writer.into_vec()
}

pub fn build_enter_world(table: &OpcodeTable, player: &PlayerRecord) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.enter_world);
    writer.write_u32_le(player.id.0);
    writer.write_string_utf16(&player.name);
    writer.into_vec()
}

pub fn build_pong(table: &OpcodeTable, echo: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(table.out.pong);
    writer.write_u32_le(echo);
    writer.into_vec()
}

pub fn build_system_message(table: &OpcodeTable, text: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.system_message);
    writer.write_string_utf16(text);
    writer.into_vec()
}

pub fn build_chat_say(table: &OpcodeTable, speaker: &str, channel: u8, text: &str) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.chat_say);
    writer.write_u8(channel);
    writer.write_string_utf16(speaker);
    writer.write_string_utf16(text);
    writer.into_vec()
}

pub fn build_disconnect_notice(table: &OpcodeTable, code: DisconnectCode) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(2);
    writer.write_u8(table.out.disconnect);
    writer.write_u8(code as u8);
    writer.into_vec()
}

pub fn build_ex_who_response(table: &OpcodeTable, names: &[String]) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.write_u8(table.out.extended);
    writer.write_u16_le(table.out.ex_who);
    writer.write_u16_le(names.len().min(u16::MAX as usize) as u16);
    for name in names.iter().take(u16::MAX as usize) {
        writer.write_string_utf16(name);
    }
    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::player::PlayerId;
    use crate::net::opcodes::REVISION_830;
    use crate::net::packet::PacketReader;

    fn table() -> OpcodeTable {
        OpcodeTable::for_revision(REVISION_830).expect("table")
    }

    #[test]
    fn key_init_carries_revision_and_key_half() {
        let table = table();
        let half = [0xab; HANDSHAKE_KEY_BYTES];
        let body = build_key_init(&table, &half);
        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u8(), Some(table.out.key_init));
        assert_eq!(reader.read_u8(), Some(0x01));
        assert_eq!(reader.read_u32_le(), Some(table.revision));
        assert_eq!(reader.read_bytes(HANDSHAKE_KEY_BYTES), Some(&half[..]));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn roster_lists_entries_in_order() {
        let table = table();
        let entries = vec![
            RosterEntry {
                player_id: PlayerId(42),
                name: "Kael".to_string(),
                level: 12,
            },
            RosterEntry {
                player_id: PlayerId(7),
                name: "Mira".to_string(),
                level: 3,
            },
        ];
        let body = build_character_roster(&table, &entries);
        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u8(), Some(table.out.roster));
        assert_eq!(reader.read_u8(), Some(2));
        assert_eq!(reader.read_u32_le(), Some(42));
        assert_eq!(reader.read_string_utf16(64).as_deref(), Some("Kael"));
        assert_eq!(reader.read_u16_le(), Some(12));
        assert_eq!(reader.read_u32_le(), Some(7));
        assert_eq!(reader.read_string_utf16(64).as_deref(), Some("Mira"));
        assert_eq!(reader.read_u16_le(), Some(3));
    }

    #[test]
    fn ex_who_uses_extended_opcode_path() {
        let table = table();
        let names = vec!["Kael".to_string(), "Mira".to_string()];
        let body = build_ex_who_response(&table, &names);
        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u8(), Some(0xfe));
        assert_eq!(reader.read_u16_le(), Some(table.out.ex_who));
        assert_eq!(reader.read_u16_le(), Some(2));
        assert_eq!(reader.read_string_utf16(64).as_deref(), Some("Kael"));
        assert_eq!(reader.read_string_utf16(64).as_deref(), Some("Mira"));
    }

    #[test]
    fn auth_fail_carries_reason_text() {
        let table = table();
        let body = build_auth_fail(&table, "account unknown");
        let mut reader = PacketReader::new(&body);
        assert_eq!(reader.read_u8(), Some(table.out.auth_result));
        assert_eq!(reader.read_u8(), Some(0x01));
        assert_eq!(
            reader.read_string_utf16(64).as_deref(),
            Some("account unknown")
        );
    }

    #[test]
    fn disconnect_notice_is_two_bytes() {
        let table = table();
        let body = build_disconnect_notice(&table, DisconnectCode::IdleTimeout);
        assert_eq!(body, vec![table.out.disconnect, 0x05]);
    }
}
