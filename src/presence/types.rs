use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::vec2::Vec2;

/// Opaque participant identity (the auth user id)
pub type ParticipantId = String;

/// Facing direction of an avatar
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction '{0}'")]
pub struct ParseDirectionError(String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(ParseDirectionError(other.to_string())),
        }
    }
}

/// One movement-controller reading for the local participant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Floor-plan position
    pub position: Vec2,
    pub direction: Direction,
    pub is_moving: bool,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl PositionSample {
    pub fn new(position: Vec2, direction: Direction, is_moving: bool, timestamp: u64) -> Self {
        Self {
            position,
            direction,
            is_moving,
            timestamp,
        }
    }

    /// Idle sample at `position`, facing `direction`
    pub fn idle(position: Vec2, direction: Direction, timestamp: u64) -> Self {
        Self::new(position, direction, false, timestamp)
    }
}

/// Last-known state of a remote participant, as rendered by the UI
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub position: Vec2,
    pub direction: Direction,
    pub is_moving: bool,
    /// Timestamp of the sample or row this state came from
    pub updated_at: u64,
}

impl Participant {
    pub fn from_sample(id: ParticipantId, name: String, sample: &PositionSample) -> Self {
        Self {
            id,
            name,
            position: sample.position,
            direction: sample.direction,
            is_moving: sample.is_moving,
            updated_at: sample.timestamp,
        }
    }

    pub fn from_snapshot(row: &PresenceSnapshot) -> Self {
        Self {
            id: row.user_id.clone(),
            name: row.username.clone(),
            position: Vec2::new(row.position_x, row.position_y),
            direction: row.direction,
            is_moving: row.is_moving,
            updated_at: row.last_seen,
        }
    }
}

/// Durable presence row, at most one per identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub user_id: ParticipantId,
    pub username: String,
    pub position_x: f32,
    pub position_y: f32,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub is_moving: bool,
    /// Wall-clock milliseconds; non-decreasing per identity
    pub last_seen: u64,
}

impl PresenceSnapshot {
    pub fn from_sample(user_id: &str, username: &str, sample: &PositionSample) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            position_x: sample.position.x,
            position_y: sample.position.y,
            direction: sample.direction,
            is_moving: sample.is_moving,
            last_seen: sample.timestamp,
        }
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.position_x, self.position_y)
    }
}
