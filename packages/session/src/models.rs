use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

/// Number of characters in a session identifier.
pub const SESSION_ID_LEN: usize = 6;

/// Server-assigned player identifier, unique within a session.
pub type PlayerId = i64;

/// Monotonic roll record identifier, unique within a session.
pub type RollId = i64;

/// A six-character room code addressing a session.
///
/// Case is preserved as received; sessions are addressed by the literal
/// token, so two differently-cased identifiers name two different sessions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid session ID format")]
pub struct InvalidSessionId;

impl SessionId {
    /// Validates that `value` is exactly [`SESSION_ID_LEN`] ASCII
    /// alphanumeric characters. No other work is performed.
    ///
    /// # Errors
    ///
    /// * If `value` fails the shape check
    pub fn parse(value: &str) -> Result<Self, InvalidSessionId> {
        if value.len() == SESSION_ID_LEN && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(value.to_owned()))
        } else {
            Err(InvalidSessionId)
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A participant in a session.
///
/// Inactive players remain for history attribution but are excluded from the
/// live roster sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub joined_at: i64,
    pub last_seen: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RollType {
    Check,
    Damage,
    Gm,
}

/// One immutable, persisted roll event.
///
/// The `payload` is the type-specific JSON the client sent, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollRecord {
    pub id: RollId,
    pub player_id: PlayerId,
    pub player_name: String,
    pub roll_type: RollType,
    pub payload: Value,
    pub total: i64,
    pub result_text: String,
    pub timestamp: i64,
}

/// A roll about to be appended; id and timestamp are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRollRecord {
    pub player_id: PlayerId,
    pub player_name: String,
    pub roll_type: RollType,
    pub payload: Value,
    pub total: i64,
    pub result_text: String,
}

/// Typed view of a `check` roll payload.
///
/// The wire payload itself is persisted and re-broadcast verbatim; views only
/// validate required fields and derive the total from the client-rolled dice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRoll {
    pub hope_value: i64,
    pub fear_value: i64,
    #[serde(default)]
    pub advantage: i64,
    #[serde(default)]
    pub modifier: i64,
}

impl CheckRoll {
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.hope_value + self.fear_value + self.advantage + self.modifier
    }

    #[must_use]
    pub fn result_text(&self) -> String {
        match self.hope_value.cmp(&self.fear_value) {
            std::cmp::Ordering::Greater => format!("{} with Hope", self.total()),
            std::cmp::Ordering::Less => format!("{} with Fear", self.total()),
            std::cmp::Ordering::Equal => "Critical Success!".to_owned(),
        }
    }
}

/// Typed view of a `damage` roll payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageRoll {
    pub dice_count: u32,
    pub dice_type: u32,
    pub roll_values: Vec<i64>,
    #[serde(default)]
    pub bonus_die: i64,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub resistance: bool,
}

impl DamageRoll {
    #[must_use]
    pub fn total(&self) -> i64 {
        let mut total = self.roll_values.iter().sum::<i64>() + self.bonus_die;
        if self.critical {
            // critical damage adds the maximum possible dice result
            total += i64::from(self.dice_count) * i64::from(self.dice_type);
        }
        if self.resistance {
            total /= 2;
        }
        total
    }

    #[must_use]
    pub fn result_text(&self) -> String {
        let mut text = format!("{}d{}", self.dice_count, self.dice_type);
        if self.bonus_die != 0 {
            text.push_str(&format!("{:+}", self.bonus_die));
        }
        text.push_str(" damage");
        if self.critical {
            text.push_str(" (critical)");
        }
        if self.resistance {
            text.push_str(" (resisted)");
        }
        text
    }
}

/// Typed view of a `gm` roll payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmRoll {
    pub d20_value: i64,
    #[serde(default)]
    pub advantage: i64,
    #[serde(default)]
    pub modifier: i64,
    #[serde(default)]
    pub private: bool,
}

impl GmRoll {
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.d20_value + self.advantage + self.modifier
    }

    #[must_use]
    pub fn result_text(&self) -> String {
        if self.private {
            format!("Private GM roll: {}", self.total())
        } else {
            format!("GM roll: {}", self.total())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn session_id_accepts_six_alphanumerics() {
        assert_eq!(SessionId::parse("AB12CD").unwrap().as_str(), "AB12CD");
        assert_eq!(SessionId::parse("abc123").unwrap().as_str(), "abc123");
        assert_eq!(SessionId::parse("000000").unwrap().as_str(), "000000");
    }

    #[test]
    fn session_id_preserves_case() {
        let lower = SessionId::parse("ab12cd").unwrap();
        let upper = SessionId::parse("AB12CD").unwrap();
        assert_eq!(lower.as_str(), "ab12cd");
        assert_ne!(lower, upper);
    }

    #[test]
    fn session_id_rejects_bad_shapes() {
        for input in [
            "", "AB12C", "AB12CDE", "ABC-12", "AB 2CD", "AB12C!", "ÄB12CD", "AB12\nD",
        ] {
            assert_eq!(SessionId::parse(input), Err(InvalidSessionId), "{input:?}");
        }
    }

    #[test]
    fn check_roll_totals_hope_fear_and_modifier() {
        let roll = CheckRoll {
            hope_value: 8,
            fear_value: 7,
            advantage: 0,
            modifier: 0,
        };
        assert_eq!(roll.total(), 15);
        assert_eq!(roll.result_text(), "15 with Hope");
    }

    #[test]
    fn check_roll_tie_is_a_critical_success() {
        let roll = CheckRoll {
            hope_value: 6,
            fear_value: 6,
            advantage: 0,
            modifier: 2,
        };
        assert_eq!(roll.total(), 14);
        assert_eq!(roll.result_text(), "Critical Success!");
    }

    #[test]
    fn damage_roll_applies_critical_and_resistance() {
        let base = DamageRoll {
            dice_count: 2,
            dice_type: 8,
            roll_values: vec![3, 5],
            bonus_die: 2,
            critical: false,
            resistance: false,
        };
        assert_eq!(base.total(), 10);
        assert_eq!(base.result_text(), "2d8+2 damage");

        let critical = DamageRoll {
            critical: true,
            ..base.clone()
        };
        assert_eq!(critical.total(), 26);
        assert_eq!(critical.result_text(), "2d8+2 damage (critical)");

        let resisted = DamageRoll {
            resistance: true,
            ..base
        };
        assert_eq!(resisted.total(), 5);
        assert_eq!(resisted.result_text(), "2d8+2 damage (resisted)");
    }

    #[test]
    fn gm_roll_totals_and_flags_privacy() {
        let roll = GmRoll {
            d20_value: 13,
            advantage: 2,
            modifier: 1,
            private: false,
        };
        assert_eq!(roll.total(), 16);
        assert_eq!(roll.result_text(), "GM roll: 16");

        let private = GmRoll {
            private: true,
            ..roll
        };
        assert_eq!(private.result_text(), "Private GM roll: 16");
    }
}
