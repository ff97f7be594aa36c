use serde::Deserialize;

/// Identity of a player entity inside the shared world registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct PlayerId(pub u32);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The slice of player state the network core needs: identity and the
/// account it belongs to. Everything else about a player lives with the
/// world simulation, which this crate only talks to through the registry.
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub account: String,
}

/// One selectable character in the roster sent after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RosterEntry {
    pub player_id: PlayerId,
    pub name: String,
    #[serde(default = "default_level")]
    pub level: u16,
}

fn default_level() -> u16 {
    1
}
