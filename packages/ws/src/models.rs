use dicebox_session::models::{Player, PlayerId, RollRecord, RollType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::AsRefStr;

/// Messages a client may send to its session coordinator.
#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type")]
pub enum InboundPayload {
    Join(JoinRequest),
    Roll(RollRequest),
    Ping(EmptyPayload),
    Leave(EmptyPayload),
    GetHistory(EmptyPayload),
}

impl std::fmt::Display for InboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct EmptyPayload {}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub player_name: String,
}

/// A roll as sent on the wire: the declared type plus the type-specific
/// fields, which are kept verbatim and only validated against the declared
/// type's required fields.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RollRequest {
    pub roll_type: RollType,
    #[serde(flatten)]
    pub fields: Value,
}

/// Messages a session coordinator may send to clients.
#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type")]
pub enum OutboundPayload {
    Welcome(WelcomePayload),
    PlayerJoined(PlayerJoinedPayload),
    PlayerLeft(PlayerLeftPayload),
    RollResult(RollResultPayload),
    History(HistoryPayload),
    Pong(EmptyPayload),
    Error(ErrorPayload),
}

impl std::fmt::Display for OutboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Snapshot sent to a connection the moment it joins: its assigned player id,
/// the live roster, and the replay window of recent rolls.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub player_id: PlayerId,
    pub roster: Vec<Player>,
    pub recent_rolls: Vec<RollRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoinedPayload {
    pub player: Player,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeftPayload {
    pub player_id: PlayerId,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RollResultPayload {
    pub record: RollRecord,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub records: Vec<RollRecord>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
}
