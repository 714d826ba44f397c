//! start.gg adapter: fixed query shapes, the `StartggApi` seam importers call
//! through, and boundary decoding of GraphQL payloads into typed records.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rivals_core::{
    ExternalId, EventPayload, RemoteEntrant, RemoteEvent, RemoteMatch, RemoteParticipant,
    RemoteStanding, RemoteTournament, TournamentImage,
};
use rivals_storage::{ApiError, GraphqlExecutor, GraphqlRequest, HttpClientConfig, Page, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

pub mod queries;

pub const CRATE_NAME: &str = "rivals-adapters";

/// One page of an event's sets, plus the event standings riding along with it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSetsPage {
    pub standings: Vec<RemoteStanding>,
    pub matches: Page<RemoteMatch>,
}

/// The remote calls the importers need. Every method maps to one fixed query.
#[async_trait]
pub trait StartggApi: Send + Sync {
    async fn user_tournaments(
        &self,
        token: &str,
        user_id: ExternalId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RemoteTournament>, ApiError>;

    /// Combined shape: every event with standings and this user's sets.
    async fn tournament_with_sets(
        &self,
        token: &str,
        tournament_id: ExternalId,
        user_id: ExternalId,
    ) -> Result<Vec<EventPayload>, ApiError>;

    /// Simple shape: events only.
    async fn tournament_events(
        &self,
        token: &str,
        tournament_id: ExternalId,
    ) -> Result<Vec<RemoteEvent>, ApiError>;

    async fn event_sets(
        &self,
        token: &str,
        event_id: ExternalId,
        user_id: ExternalId,
        page: u32,
    ) -> Result<EventSetsPage, ApiError>;

    /// The player's global match feed, each set carrying its event and tournament.
    async fn user_sets(
        &self,
        token: &str,
        user_id: ExternalId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RemoteMatch>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct StartggClient {
    executor: Arc<GraphqlExecutor>,
}

impl StartggClient {
    pub fn new(executor: Arc<GraphqlExecutor>) -> Self {
        Self { executor }
    }

    pub fn from_config(config: &HttpClientConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(GraphqlExecutor::from_config(config, limiter)?)))
    }

    async fn run(
        &self,
        token: &str,
        operation: &'static str,
        query: &'static str,
        variables: JsonValue,
    ) -> Result<JsonValue, ApiError> {
        let request = GraphqlRequest {
            operation,
            query,
            variables,
        };
        self.executor.execute(token, &request).await
    }
}

#[async_trait]
impl StartggApi for StartggClient {
    async fn user_tournaments(
        &self,
        token: &str,
        user_id: ExternalId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RemoteTournament>, ApiError> {
        let data = self
            .run(
                token,
                "UserTournaments",
                queries::USER_TOURNAMENTS,
                json!({ "userId": user_id, "page": page, "perPage": per_page }),
            )
            .await?;
        decode_user_tournaments(data)
    }

    async fn tournament_with_sets(
        &self,
        token: &str,
        tournament_id: ExternalId,
        user_id: ExternalId,
    ) -> Result<Vec<EventPayload>, ApiError> {
        let data = self
            .run(
                token,
                "TournamentEvents",
                queries::TOURNAMENT_WITH_SETS,
                json!({ "tournamentId": tournament_id, "userId": user_id }),
            )
            .await?;
        decode_tournament_with_sets(data, tournament_id)
    }

    async fn tournament_events(
        &self,
        token: &str,
        tournament_id: ExternalId,
    ) -> Result<Vec<RemoteEvent>, ApiError> {
        let data = self
            .run(
                token,
                "TournamentSimple",
                queries::TOURNAMENT_EVENTS,
                json!({ "tournamentId": tournament_id }),
            )
            .await?;
        decode_tournament_events(data, tournament_id)
    }

    async fn event_sets(
        &self,
        token: &str,
        event_id: ExternalId,
        user_id: ExternalId,
        page: u32,
    ) -> Result<EventSetsPage, ApiError> {
        let data = self
            .run(
                token,
                "EventSets",
                queries::EVENT_SETS,
                json!({ "eventId": event_id, "userId": user_id, "page": page }),
            )
            .await?;
        decode_event_sets(data, event_id)
    }

    async fn user_sets(
        &self,
        token: &str,
        user_id: ExternalId,
        page: u32,
        per_page: u32,
    ) -> Result<Page<RemoteMatch>, ApiError> {
        let data = self
            .run(
                token,
                "UserSets",
                queries::USER_SETS,
                json!({ "userId": user_id, "page": page, "perPage": per_page }),
            )
            .await?;
        decode_user_sets(data)
    }
}

// Wire shapes. start.gg serializes IDs as numbers or strings depending on the
// field, and unstarted sets carry ids like "preview_1234_0".

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireScalar {
    Number(i64),
    Text(String),
}

impl WireScalar {
    fn numeric(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for WireScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

fn id_of(scalar: &Option<WireScalar>) -> Option<i64> {
    scalar.as_ref().and_then(WireScalar::numeric)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePageInfo {
    #[serde(default)]
    total_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConnection<T> {
    nodes: Option<Vec<Option<T>>>,
    #[serde(default)]
    page_info: Option<WirePageInfo>,
}

impl<T> WireConnection<T> {
    fn total_pages(&self) -> Option<u32> {
        self.page_info.as_ref().and_then(|p| p.total_pages)
    }

    fn into_nodes(self) -> impl Iterator<Item = T> {
        self.nodes.unwrap_or_default().into_iter().flatten()
    }
}

#[derive(Debug, Deserialize)]
struct WireImage {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTournament {
    #[serde(default)]
    id: Option<WireScalar>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    start_at: Option<i64>,
    #[serde(default)]
    end_at: Option<i64>,
    #[serde(default)]
    is_online: Option<bool>,
    #[serde(default)]
    venue_name: Option<String>,
    #[serde(default)]
    venue_address: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    addr_state: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    images: Option<Vec<Option<WireImage>>>,
}

#[derive(Debug, Deserialize)]
struct WireUserRef {
    #[serde(default)]
    id: Option<WireScalar>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireParticipant {
    #[serde(default)]
    gamer_tag: Option<String>,
    #[serde(default)]
    user: Option<WireUserRef>,
}

#[derive(Debug, Deserialize)]
struct WireEntrant {
    #[serde(default)]
    id: Option<WireScalar>,
    #[serde(default)]
    participants: Option<Vec<Option<WireParticipant>>>,
}

#[derive(Debug, Deserialize)]
struct WireStanding {
    #[serde(default)]
    placement: Option<i64>,
    #[serde(default)]
    entrant: Option<WireEntrant>,
}

#[derive(Debug, Deserialize)]
struct WireSlot {
    #[serde(default)]
    standing: Option<WireStanding>,
    #[serde(default)]
    entrant: Option<WireEntrant>,
}

#[derive(Debug, Deserialize)]
struct WireTournamentRef {
    #[serde(default)]
    id: Option<WireScalar>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    #[serde(default)]
    id: Option<WireScalar>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    num_entrants: Option<i64>,
    #[serde(default)]
    tournament: Option<WireTournamentRef>,
    #[serde(default)]
    standings: Option<WireConnection<WireStanding>>,
    #[serde(default)]
    sets: Option<WireConnection<WireSet>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSet {
    #[serde(default)]
    id: Option<WireScalar>,
    #[serde(default)]
    round: Option<WireScalar>,
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    full_round_text: Option<String>,
    #[serde(default)]
    display_score: Option<String>,
    #[serde(default)]
    winner_id: Option<WireScalar>,
    #[serde(default)]
    slots: Option<Vec<Option<WireSlot>>>,
    #[serde(default)]
    event: Option<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct UserTournamentsData {
    #[serde(default)]
    user: Option<UserTournamentsNode>,
}

#[derive(Debug, Deserialize)]
struct UserTournamentsNode {
    #[serde(default)]
    tournaments: Option<WireConnection<WireTournament>>,
}

#[derive(Debug, Deserialize)]
struct TournamentData {
    #[serde(default)]
    tournament: Option<TournamentNode>,
}

#[derive(Debug, Deserialize)]
struct TournamentNode {
    #[serde(default)]
    events: Option<Vec<Option<WireEvent>>>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(default)]
    event: Option<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct UserSetsData {
    #[serde(default)]
    user: Option<UserSetsNode>,
}

#[derive(Debug, Deserialize)]
struct UserSetsNode {
    #[serde(default)]
    player: Option<PlayerSetsNode>,
}

#[derive(Debug, Deserialize)]
struct PlayerSetsNode {
    #[serde(default)]
    sets: Option<WireConnection<WireSet>>,
}

fn parse<T: DeserializeOwned>(data: JsonValue, shape: &str) -> Result<T, ApiError> {
    serde_json::from_value(data).map_err(|e| ApiError::Decode(format!("{shape}: {e}")))
}

fn convert_tournament(wire: WireTournament) -> Option<RemoteTournament> {
    let Some(id) = id_of(&wire.id) else {
        debug!(id = ?wire.id, "skipping tournament without a numeric id");
        return None;
    };
    let images = wire
        .images
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter_map(|img| {
            img.url.map(|url| TournamentImage {
                kind: img.kind,
                url,
            })
        })
        .collect();
    Some(RemoteTournament {
        id,
        name: wire.name,
        slug: wire.slug,
        start_at: wire.start_at,
        end_at: wire.end_at,
        is_online: wire.is_online,
        venue_name: wire.venue_name,
        venue_address: wire.venue_address,
        city: wire.city,
        addr_state: wire.addr_state,
        country_code: wire.country_code,
        images,
    })
}

fn convert_entrant(wire: WireEntrant) -> RemoteEntrant {
    RemoteEntrant {
        id: id_of(&wire.id),
        participants: wire
            .participants
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .map(|p| RemoteParticipant {
                user_id: p.user.as_ref().and_then(|u| id_of(&u.id)),
                gamer_tag: p.gamer_tag.filter(|t| !t.trim().is_empty()),
            })
            .collect(),
    }
}

fn convert_standing(wire: WireStanding) -> Option<RemoteStanding> {
    let entrant = wire.entrant?;
    Some(RemoteStanding {
        placement: wire.placement,
        entrant: convert_entrant(entrant),
    })
}

fn convert_event(wire: &WireEvent) -> Option<RemoteEvent> {
    let id = id_of(&wire.id)?;
    Some(RemoteEvent {
        id,
        name: wire.name.clone(),
        slug: wire.slug.clone(),
        num_entrants: wire.num_entrants,
        tournament_id: wire.tournament.as_ref().and_then(|t| id_of(&t.id)),
    })
}

fn convert_set(wire: WireSet) -> Option<RemoteMatch> {
    let Some(id) = id_of(&wire.id) else {
        debug!(set_id = ?wire.id.as_ref().map(ToString::to_string), "skipping preview set");
        return None;
    };
    let slots = wire
        .slots
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter_map(|slot| slot.entrant.or_else(|| slot.standing.and_then(|s| s.entrant)))
        .map(convert_entrant)
        .collect();
    Some(RemoteMatch {
        id,
        round: wire.round.map(|r| r.to_string()),
        identifier: wire.identifier,
        full_round_text: wire.full_round_text,
        display_score: wire.display_score,
        winner_id: id_of(&wire.winner_id),
        slots,
        event: wire.event.as_ref().and_then(convert_event),
    })
}

fn convert_sets(conn: Option<WireConnection<WireSet>>) -> Page<RemoteMatch> {
    match conn {
        Some(conn) => {
            let total_pages = conn.total_pages();
            Page::new(conn.into_nodes().filter_map(convert_set).collect(), total_pages)
        }
        None => Page::new(Vec::new(), Some(0)),
    }
}

fn convert_standings(conn: Option<WireConnection<WireStanding>>) -> Vec<RemoteStanding> {
    conn.map(|c| c.into_nodes().filter_map(convert_standing).collect())
        .unwrap_or_default()
}

/// A missing `user` yields an empty final page rather than an error.
pub fn decode_user_tournaments(data: JsonValue) -> Result<Page<RemoteTournament>, ApiError> {
    let data: UserTournamentsData = parse(data, "user tournaments")?;
    let Some(conn) = data.user.and_then(|u| u.tournaments) else {
        return Ok(Page::new(Vec::new(), Some(0)));
    };
    let total_pages = conn.total_pages();
    let items = conn.into_nodes().filter_map(convert_tournament).collect();
    Ok(Page::new(items, total_pages))
}

fn tournament_events_of(
    data: JsonValue,
    tournament_id: ExternalId,
) -> Result<Vec<WireEvent>, ApiError> {
    let data: TournamentData = parse(data, "tournament")?;
    let tournament = data.tournament.ok_or_else(|| {
        ApiError::Decode(format!("no tournament data returned for tournament {tournament_id}"))
    })?;
    Ok(tournament.events.unwrap_or_default().into_iter().flatten().collect())
}

pub fn decode_tournament_with_sets(
    data: JsonValue,
    tournament_id: ExternalId,
) -> Result<Vec<EventPayload>, ApiError> {
    let events = tournament_events_of(data, tournament_id)?;
    Ok(events
        .into_iter()
        .filter_map(|wire| {
            let event = convert_event(&wire)?;
            Some(EventPayload {
                event,
                standings: convert_standings(wire.standings),
                matches: convert_sets(wire.sets).items,
            })
        })
        .collect())
}

pub fn decode_tournament_events(
    data: JsonValue,
    tournament_id: ExternalId,
) -> Result<Vec<RemoteEvent>, ApiError> {
    let events = tournament_events_of(data, tournament_id)?;
    Ok(events.iter().filter_map(convert_event).collect())
}

pub fn decode_event_sets(data: JsonValue, event_id: ExternalId) -> Result<EventSetsPage, ApiError> {
    let data: EventData = parse(data, "event sets")?;
    let event = data
        .event
        .ok_or_else(|| ApiError::Decode(format!("no event data returned for event {event_id}")))?;
    Ok(EventSetsPage {
        standings: convert_standings(event.standings),
        matches: convert_sets(event.sets),
    })
}

/// A user without a linked player has no feed: an empty final page.
pub fn decode_user_sets(data: JsonValue) -> Result<Page<RemoteMatch>, ApiError> {
    let data: UserSetsData = parse(data, "user sets")?;
    let sets = data.user.and_then(|u| u.player).and_then(|p| p.sets);
    Ok(convert_sets(sets))
}
