//! Client-to-server packet bodies as a closed variant set, with one free
//! decode function per kind. Decoders receive the cursor positioned after
//! the opcode bytes and fail with a descriptive message on truncated or
//! out-of-range fields.

use crate::net::auth::SessionKey;
use crate::net::packet::PacketReader;

pub const MAX_ACCOUNT_CHARS: usize = 32;
pub const MAX_SAY_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Handshake { revision: u32 },
    AuthLogin { account: String, key: SessionKey },
    RequestRoster,
    CharacterSelect { player_id: u32 },
    Ping { echo: u32 },
    Say { channel: u8, text: String },
    Logout,
    WhoRequest,
}

impl ClientPacket {
    pub fn name(&self) -> &'static str {
        match self {
            ClientPacket::Handshake { .. } => "handshake",
            ClientPacket::AuthLogin { .. } => "auth_login",
            ClientPacket::RequestRoster => "request_roster",
            ClientPacket::CharacterSelect { .. } => "character_select",
            ClientPacket::Ping { .. } => "ping",
            ClientPacket::Say { .. } => "say",
            ClientPacket::Logout => "logout",
            ClientPacket::WhoRequest => "who_request",
        }
    }
}

pub fn decode_handshake(reader: &mut PacketReader) -> Result<ClientPacket, String> {
    let revision = reader
        .read_u32_le()
        .ok_or_else(|| "handshake missing protocol revision".to_string())?;
    Ok(ClientPacket::Handshake { revision })
}

pub fn decode_auth_login(reader: &mut PacketReader) -> Result<ClientPacket, String> {
    let account = reader
        .read_string_utf16(MAX_ACCOUNT_CHARS)
        .ok_or_else(|| "auth login missing account".to_string())?;
    if account.trim().is_empty() {
        return Err("auth login account is empty".to_string());
    }
    let mut words = [0u32; 4];
    for (idx, word) in words.iter_mut().enumerate() {
        *word = reader
            .read_u32_le()
            .ok_or_else(|| format!("auth login missing session key word {idx}"))?;
    }
    Ok(ClientPacket::AuthLogin {
        account,
        key: SessionKey {
            login_ok: [words[0], words[1]],
            play_ok: [words[2], words[3]],
        },
    })
}

pub fn decode_request_roster(_reader: &mut PacketReader) -> Result<ClientPacket, String> {
    Ok(ClientPacket::RequestRoster)
}

pub fn decode_character_select(reader: &mut PacketReader) -> Result<ClientPacket, String> {
    let player_id = reader
        .read_u32_le()
        .ok_or_else(|| "character select missing player id".to_string())?;
    Ok(ClientPacket::CharacterSelect { player_id })
}

pub fn decode_ping(reader: &mut PacketReader) -> Result<ClientPacket, String> {
    let echo = reader
        .read_u32_le()
        .ok_or_else(|| "ping missing echo".to_string())?;
    Ok(ClientPacket::Ping { echo })
}

pub fn decode_say(reader: &mut PacketReader) -> Result<ClientPacket, String> {
    let channel = reader
        .read_u8()
        .ok_or_else(|| "say missing channel".to_string())?;
    let text = reader
        .read_string_utf16(MAX_SAY_CHARS)
        .ok_or_else(|| "say missing text".to_string())?;
    if text.is_empty() {
        return Err("say text is empty".to_string());
    }
    Ok(ClientPacket::Say { channel, text })
}

pub fn decode_logout(_reader: &mut PacketReader) -> Result<ClientPacket, String> {
    Ok(ClientPacket::Logout)
}

pub fn decode_who_request(_reader: &mut PacketReader) -> Result<ClientPacket, String> {
    Ok(ClientPacket::WhoRequest)
}
