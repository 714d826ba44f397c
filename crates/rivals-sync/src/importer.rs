use std::collections::HashMap;
use std::sync::Arc;

use rivals_adapters::StartggApi;
use rivals_core::{
    Credentials, Event, EventPayload, MatchParticipation, RemoteMatch, RemoteTournament, Tournament,
    User,
};
use rivals_storage::{ApiError, Page, Paginator, Store, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::identity::IdentityReconciler;
use crate::{SyncConfig, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub tournaments: usize,
    pub events: usize,
    pub matches: usize,
    pub participations: usize,
}

impl std::ops::AddAssign for ImportCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.tournaments += rhs.tournaments;
        self.events += rhs.events;
        self.matches += rhs.matches;
        self.participations += rhs.participations;
    }
}

/// Result of one importer call.
///
/// `success` is false only when a remote failure aborted the call. Per-record
/// persistence failures are recorded in `messages` while the import carries on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportOutcome {
    pub success: bool,
    pub messages: Vec<String>,
    pub counts: ImportCounts,
}

impl ImportOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn failed(messages: Vec<String>) -> Self {
        Self {
            success: false,
            messages,
            counts: ImportCounts::default(),
        }
    }

    fn fail_with(&mut self, err: &ApiError) {
        self.success = false;
        self.messages.extend(err.messages());
    }

    /// Succeeded without a single recorded problem.
    pub fn is_clean(&self) -> bool {
        self.success && self.messages.is_empty()
    }

    /// Logical AND of two passes over the same tournament.
    fn merge(mut self, other: ImportOutcome) -> Self {
        self.success &= other.success;
        self.messages.extend(other.messages);
        self.counts += other.counts;
        self
    }
}

fn require_credentials(user: &User) -> Result<Credentials, SyncError> {
    user.credentials().ok_or_else(|| {
        SyncError::Configuration("User authentication details for StartGG are missing.".to_string())
    })
}

/// Walks the user's remote tournament list and upserts every tournament.
#[derive(Clone)]
pub struct TournamentImporter {
    store: Store,
    api: Arc<dyn StartggApi>,
    per_page: u32,
}

impl TournamentImporter {
    pub fn new(store: Store, api: Arc<dyn StartggApi>, config: &SyncConfig) -> Self {
        Self {
            store,
            api,
            per_page: config.tournaments_per_page,
        }
    }

    pub async fn import(&self, user: &User) -> ImportOutcome {
        let creds = match require_credentials(user) {
            Ok(creds) => creds,
            Err(err) => {
                warn!(user_id = user.id, "cannot sync tournaments: {err}");
                return ImportOutcome::failed(vec![err.to_string()]);
            }
        };

        let api = self.api.as_ref();
        let token = creds.access_token.as_str();
        let (remote_user_id, per_page) = (creds.remote_user_id, self.per_page);
        let mut pages = Paginator::new(move |page| {
            api.user_tournaments(token, remote_user_id, page, per_page)
        });

        let mut outcome = ImportOutcome::ok();
        while let Some(batch) = pages.next_batch().await {
            let tournaments = match batch {
                Ok(tournaments) => tournaments,
                Err(err) => {
                    warn!(user_id = user.id, error = %err, "tournament list fetch failed");
                    outcome.fail_with(&err);
                    return outcome;
                }
            };
            if tournaments.is_empty() {
                debug!(user_id = user.id, page = pages.pages_fetched(), "empty tournament page; done");
                break;
            }
            for remote in &tournaments {
                self.persist(user, remote, &mut outcome).await;
            }
        }

        info!(
            user_id = user.id,
            tournaments = outcome.counts.tournaments,
            "synced tournaments"
        );
        outcome
    }

    async fn persist(&self, user: &User, remote: &RemoteTournament, outcome: &mut ImportOutcome) {
        let tournament = match self.store.upsert_tournament(remote).await {
            Ok(tournament) => tournament,
            Err(err) => {
                let name = remote.name.as_deref().unwrap_or("(unnamed)");
                warn!(external_id = remote.id, error = %err, "failed to save tournament");
                outcome
                    .messages
                    .push(format!("Failed to save tournament {name}: {err}"));
                return;
            }
        };
        outcome.counts.tournaments += 1;

        if let Err(err) = self
            .store
            .add_tournament_participation(user.id, tournament.id)
            .await
        {
            warn!(tournament_id = tournament.id, error = %err, "failed to save tournament participation");
            outcome
                .messages
                .push(format!("Failed to save participation for tournament {}: {err}", tournament.external_id));
        }
    }
}

/// Remote query shape used to gather one tournament's events and matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Tournament, events, standings and the user's sets in one request.
    Combined,
    /// Events first, then each event's sets and standings page by page.
    Fallback,
    /// The user's global match feed filtered down to this tournament.
    DirectFeed,
}

impl QueryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Combined => "combined",
            Self::Fallback => "fallback",
            Self::DirectFeed => "direct_feed",
        }
    }
}

/// Normalized output of one strategy, ready for persistence.
#[derive(Debug, Default)]
struct Gathered {
    payloads: Vec<EventPayload>,
    failures: Vec<ApiError>,
}

impl Gathered {
    fn complexity_rejected(&self) -> bool {
        self.failures.iter().any(ApiError::is_complexity_rejection)
    }
}

/// Imports events, standings and matches for one tournament.
#[derive(Clone)]
pub struct EventImporter {
    store: Store,
    api: Arc<dyn StartggApi>,
    reconciler: IdentityReconciler,
    direct_feed_max_pages: u32,
    direct_feed_per_page: u32,
    event_sets_max_pages: u32,
}

impl EventImporter {
    pub fn new(store: Store, api: Arc<dyn StartggApi>, config: &SyncConfig) -> Self {
        Self {
            reconciler: IdentityReconciler::new(store.clone()),
            store,
            api,
            direct_feed_max_pages: config.direct_feed_max_pages,
            direct_feed_per_page: config.direct_feed_per_page,
            event_sets_max_pages: config.event_sets_max_pages,
        }
    }

    pub async fn import(&self, tournament: &Tournament, user: &User) -> ImportOutcome {
        if tournament.external_id <= 0 {
            warn!(tournament_id = tournament.id, "tournament has no remote id");
            return ImportOutcome::failed(vec!["Tournament details are missing.".to_string()]);
        }
        let creds = match require_credentials(user) {
            Ok(creds) => creds,
            Err(err) => {
                warn!(user_id = user.id, "cannot sync events: {err}");
                return ImportOutcome::failed(vec![err.to_string()]);
            }
        };

        let combined = self.gather(QueryStrategy::Combined, tournament, &creds).await;
        let primary = if combined.complexity_rejected() {
            info!(
                tournament = tournament.external_id,
                "query complexity too high; retrying with per-event queries"
            );
            let fallback = self.gather(QueryStrategy::Fallback, tournament, &creds).await;
            self.apply(QueryStrategy::Fallback, fallback, tournament, user, &creds)
                .await
        } else {
            self.apply(QueryStrategy::Combined, combined, tournament, user, &creds)
                .await
        };

        let feed = self.gather(QueryStrategy::DirectFeed, tournament, &creds).await;
        let direct = self
            .apply(QueryStrategy::DirectFeed, feed, tournament, user, &creds)
            .await;

        let outcome = primary.merge(direct);
        info!(
            tournament = tournament.external_id,
            success = outcome.success,
            events = outcome.counts.events,
            matches = outcome.counts.matches,
            "synced tournament events"
        );
        outcome
    }

    async fn gather(
        &self,
        strategy: QueryStrategy,
        tournament: &Tournament,
        creds: &Credentials,
    ) -> Gathered {
        match strategy {
            QueryStrategy::Combined => self.gather_combined(tournament, creds).await,
            QueryStrategy::Fallback => self.gather_fallback(tournament, creds).await,
            QueryStrategy::DirectFeed => self.gather_direct_feed(tournament, creds).await,
        }
    }

    /// Persists whatever a strategy gathered; its fetch failures fail the outcome.
    async fn apply(
        &self,
        strategy: QueryStrategy,
        gathered: Gathered,
        tournament: &Tournament,
        user: &User,
        creds: &Credentials,
    ) -> ImportOutcome {
        let mut outcome = ImportOutcome::ok();
        for err in &gathered.failures {
            warn!(
                tournament = tournament.external_id,
                strategy = strategy.as_str(),
                error = %err,
                "event query failed"
            );
            outcome.fail_with(err);
        }
        for payload in &gathered.payloads {
            self.persist_event(tournament, user, creds, payload, &mut outcome)
                .await;
        }
        outcome
    }

    async fn gather_combined(&self, tournament: &Tournament, creds: &Credentials) -> Gathered {
        match self
            .api
            .tournament_with_sets(&creds.access_token, tournament.external_id, creds.remote_user_id)
            .await
        {
            Ok(payloads) => Gathered {
                payloads,
                failures: Vec::new(),
            },
            Err(err) => Gathered {
                payloads: Vec::new(),
                failures: vec![err],
            },
        }
    }

    async fn gather_fallback(&self, tournament: &Tournament, creds: &Credentials) -> Gathered {
        let events = match self
            .api
            .tournament_events(&creds.access_token, tournament.external_id)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                return Gathered {
                    payloads: Vec::new(),
                    failures: vec![err],
                }
            }
        };

        let mut gathered = Gathered::default();
        for event in events {
            let api = self.api.as_ref();
            let token = creds.access_token.as_str();
            let (event_id, user_id) = (event.id, creds.remote_user_id);
            let mut pages = Paginator::new(move |page| async move {
                let fetched = api.event_sets(token, event_id, user_id, page).await?;
                let total_pages = fetched.matches.total_pages;
                Ok::<_, ApiError>(Page::new(
                    vec![(fetched.standings, fetched.matches.items)],
                    total_pages,
                ))
            })
            .with_max_pages(self.event_sets_max_pages);

            let mut payload = EventPayload::bare(event);
            while let Some(batch) = pages.next_batch().await {
                match batch {
                    Ok(items) => {
                        for (standings, matches) in items {
                            // Standings ride along on every page; keep the first copy.
                            if payload.standings.is_empty() {
                                payload.standings = standings;
                            }
                            payload.matches.extend(matches);
                        }
                    }
                    Err(err) => gathered.failures.push(err),
                }
            }
            gathered.payloads.push(payload);
        }
        gathered
    }

    async fn gather_direct_feed(&self, tournament: &Tournament, creds: &Credentials) -> Gathered {
        let api = self.api.as_ref();
        let token = creds.access_token.as_str();
        let (remote_user_id, per_page) = (creds.remote_user_id, self.direct_feed_per_page);
        let mut pages = Paginator::new(move |page| api.user_sets(token, remote_user_id, page, per_page))
        .with_max_pages(self.direct_feed_max_pages);

        let mut gathered = Gathered::default();
        let mut by_event: HashMap<i64, usize> = HashMap::new();
        while let Some(batch) = pages.next_batch().await {
            let matches = match batch {
                Ok(matches) => matches,
                Err(err) => {
                    gathered.failures.push(err);
                    break;
                }
            };
            for m in matches {
                if m.tournament_id() != Some(tournament.external_id) {
                    continue;
                }
                let Some(event) = m.event.clone() else {
                    continue;
                };
                let slot = *by_event.entry(event.id).or_insert_with(|| {
                    gathered.payloads.push(EventPayload::bare(event));
                    gathered.payloads.len() - 1
                });
                gathered.payloads[slot].matches.push(m);
            }
        }
        debug!(
            tournament = tournament.external_id,
            pages = pages.pages_fetched(),
            events = gathered.payloads.len(),
            "direct feed scanned"
        );
        gathered
    }

    async fn persist_event(
        &self,
        tournament: &Tournament,
        user: &User,
        creds: &Credentials,
        payload: &EventPayload,
        outcome: &mut ImportOutcome,
    ) {
        let event_name = payload.event.name.as_deref().unwrap_or("(unnamed)");
        let event = match self.store.upsert_event(tournament.id, &payload.event).await {
            Ok(event) => event,
            Err(err) => {
                warn!(external_id = payload.event.id, error = %err, "failed to save event");
                outcome
                    .messages
                    .push(format!("Failed to save event {event_name}: {err}"));
                return;
            }
        };
        outcome.counts.events += 1;

        if let Some(standing) = payload.standing_for(creds.remote_user_id) {
            if let Err(err) = self
                .store
                .upsert_event_participation(user.id, event.id, standing.placement, standing.entrant.id)
                .await
            {
                warn!(event_id = event.id, error = %err, "failed to save event participation");
                outcome
                    .messages
                    .push(format!("Failed to save participation for event {event_name}: {err}"));
            }
        }

        for remote in &payload.matches {
            self.persist_match(&event, remote, outcome).await;
        }
    }

    async fn persist_match(&self, event: &Event, remote: &RemoteMatch, outcome: &mut ImportOutcome) {
        let stored = match self.store.upsert_match(event.id, remote).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(external_id = remote.id, error = %err, "failed to save match");
                outcome.messages.push(format!("Failed to save match: {err}"));
                return;
            }
        };
        outcome.counts.matches += 1;

        for entrant in &remote.slots {
            let is_winner = remote.entrant_won(entrant);
            for participant in &entrant.participants {
                let Some(remote_user_id) = participant.user_id else {
                    debug!(match_id = remote.id, "participant without a user account; skipped");
                    continue;
                };
                let result = self
                    .link_participant(stored.id, remote_user_id, participant.gamer_tag.as_deref(), is_winner)
                    .await;
                match result {
                    Ok(_) => outcome.counts.participations += 1,
                    Err(err) => {
                        warn!(match_id = stored.id, remote_user_id, error = %err, "failed to save match participation");
                        outcome
                            .messages
                            .push(format!("Failed to save match participation: {err}"));
                    }
                }
            }
        }
    }

    async fn link_participant(
        &self,
        match_id: i64,
        remote_user_id: i64,
        gamer_tag: Option<&str>,
        is_winner: bool,
    ) -> Result<MatchParticipation, StoreError> {
        let local = self.reconciler.resolve(remote_user_id, gamer_tag).await?;
        self.store
            .upsert_match_participation(local.id, match_id, is_winner)
            .await
    }
}
