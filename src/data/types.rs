use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream identifiers arrive as either numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Ident {
    Int(i64),
    Text(String),
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::Int(n) => write!(f, "{}", n),
            Ident::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A single tip as delivered inside a `data:` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTip {
    pub id: Ident,
    pub league_id: Ident,
    pub market: String,
    pub outcome: String,
    pub period: i64,
    pub point: f64,
    pub alerted: f64,
    pub nvp: f64,
    pub home: String,
    pub away: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Home,
    Away,
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Team::Home => write!(f, "home"),
            Team::Away => write!(f, "away"),
        }
    }
}

/// Normalized record accepted by the bet ingestion endpoint.
///
/// `team` is always serialized; an absent team is sent as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub home: String,
    pub away: String,
    pub points: f64,
    pub is_first_half: bool,
    pub team: Option<Team>,
    pub market_type: String,
    pub odds: f64,
    pub outcome: String,
}
