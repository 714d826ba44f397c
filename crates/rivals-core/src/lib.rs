//! Core domain model for Rivals: local rows, per-user sync state, and the typed
//! records remote payloads are decoded into before anything is persisted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rivals-core";

/// Tag stored on placeholder users whose gamer tag is not known yet.
pub const UNKNOWN_PLAYER_TAG: &str = "Unknown Player";

/// Stable identifier assigned by the remote API.
pub type ExternalId = i64;

/// Remote identity plus bearer token for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub remote_user_id: ExternalId,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub remote_id: Option<ExternalId>,
    pub tag: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub is_placeholder: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn credentials(&self) -> Option<Credentials> {
        let remote_user_id = self.remote_id?;
        let access_token = self
            .access_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())?;
        Some(Credentials {
            remote_user_id,
            access_token: access_token.to_string(),
        })
    }

    pub fn display_tag(&self) -> &str {
        self.tag
            .as_deref()
            .filter(|t| !is_blank_tag(t))
            .unwrap_or(UNKNOWN_PLAYER_TAG)
    }
}

/// A tag carries no information when it is empty or the placeholder marker.
pub fn is_blank_tag(tag: &str) -> bool {
    let tag = tag.trim();
    tag.is_empty() || tag == UNKNOWN_PLAYER_TAG
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentImage {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: i64,
    pub external_id: ExternalId,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub is_online: Option<bool>,
    pub venue_name: Option<String>,
    pub venue_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country_code: Option<String>,
    pub images: Vec<TournamentImage>,
    pub events_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub external_id: ExternalId,
    pub tournament_id: i64,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub num_entrants: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: i64,
    pub external_id: ExternalId,
    pub event_id: i64,
    pub round: Option<String>,
    pub round_number: Option<i64>,
    pub identifier: Option<String>,
    pub full_round_text: Option<String>,
    pub display_score: Option<String>,
    pub winner_external_id: Option<ExternalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParticipation {
    pub user_id: i64,
    pub event_id: i64,
    pub final_placement: Option<i64>,
    pub entrant_id: Option<ExternalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchParticipation {
    pub user_id: i64,
    pub match_id: i64,
    pub is_winner: bool,
}

/// Terminal classification of the last finished sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Warning,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    InProgress,
}

/// Per-user sync state. A user with no stored row is idle with no history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: i64,
    pub phase: SyncPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    pub last_message: Option<String>,
}

impl SyncState {
    pub fn idle(user_id: i64) -> Self {
        Self {
            user_id,
            phase: SyncPhase::Idle,
            started_at: None,
            finished_at: None,
            last_status: None,
            last_message: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.phase == SyncPhase::InProgress
    }

    /// An in-progress sync that started before `now - stale_after` was abandoned.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match (self.phase, self.started_at) {
            (SyncPhase::InProgress, Some(started_at)) => started_at < now - stale_after,
            (SyncPhase::InProgress, None) => true,
            (SyncPhase::Idle, _) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpponentRecord {
    pub opponent_user_id: i64,
    pub opponent_tag: String,
    pub wins: i64,
    pub losses: i64,
}

impl OpponentRecord {
    pub fn total(&self) -> i64 {
        self.wins + self.losses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WinLoss {
    pub wins: i64,
    pub losses: i64,
}

// Typed remote records. The adapter layer converts raw GraphQL payloads into
// these; importers and the store never look at untyped JSON.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTournament {
    pub id: ExternalId,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
    pub is_online: Option<bool>,
    pub venue_name: Option<String>,
    pub venue_address: Option<String>,
    pub city: Option<String>,
    pub addr_state: Option<String>,
    pub country_code: Option<String>,
    pub images: Vec<TournamentImage>,
}

impl RemoteTournament {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_at.and_then(unix_to_utc)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_at.and_then(unix_to_utc)
    }
}

fn unix_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub id: ExternalId,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub num_entrants: Option<i64>,
    /// Owning tournament, when the payload embeds it (match feed only).
    pub tournament_id: Option<ExternalId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub user_id: Option<ExternalId>,
    pub gamer_tag: Option<String>,
}

/// One side of a match: one or more participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteEntrant {
    pub id: Option<ExternalId>,
    pub participants: Vec<RemoteParticipant>,
}

impl RemoteEntrant {
    pub fn contains_user(&self, remote_user_id: ExternalId) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id == Some(remote_user_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStanding {
    pub placement: Option<i64>,
    pub entrant: RemoteEntrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMatch {
    pub id: ExternalId,
    pub round: Option<String>,
    pub identifier: Option<String>,
    pub full_round_text: Option<String>,
    pub display_score: Option<String>,
    pub winner_id: Option<ExternalId>,
    pub slots: Vec<RemoteEntrant>,
    /// Owning event, when the payload embeds it (match feed only).
    pub event: Option<RemoteEvent>,
}

impl RemoteMatch {
    /// Best-effort integer round; losers-bracket rounds stay negative.
    pub fn round_number(&self) -> Option<i64> {
        self.round.as_deref().and_then(|r| r.trim().parse().ok())
    }

    pub fn entrant_won(&self, entrant: &RemoteEntrant) -> bool {
        match (self.winner_id, entrant.id) {
            (Some(winner), Some(entrant_id)) => winner == entrant_id,
            _ => false,
        }
    }

    pub fn tournament_id(&self) -> Option<ExternalId> {
        self.event.as_ref().and_then(|e| e.tournament_id)
    }
}

/// Normalized per-event record every query strategy produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: RemoteEvent,
    pub standings: Vec<RemoteStanding>,
    pub matches: Vec<RemoteMatch>,
}

impl EventPayload {
    pub fn bare(event: RemoteEvent) -> Self {
        Self {
            event,
            standings: Vec::new(),
            matches: Vec::new(),
        }
    }

    pub fn standing_for(&self, remote_user_id: ExternalId) -> Option<&RemoteStanding> {
        self.standings
            .iter()
            .find(|s| s.entrant.contains_user(remote_user_id))
    }
}
