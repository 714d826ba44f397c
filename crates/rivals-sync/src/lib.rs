//! Sync engine: tournament and event importers, identity reconciliation, and the
//! per-user orchestrator that guards and sequences a full history sync.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rivals_adapters::{StartggApi, StartggClient};
use rivals_core::{SyncState, SyncStatus, User};
use rivals_storage::{
    HttpClientConfig, RateLimitConfig, RateLimiter, RetryPolicy, Store, StoreError,
    DEFAULT_ENDPOINT,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod identity;
mod importer;

pub use identity::IdentityReconciler;
pub use importer::{EventImporter, ImportCounts, ImportOutcome, QueryStrategy, TournamentImporter};

pub const CRATE_NAME: &str = "rivals-sync";

pub const ALREADY_SYNCING_MESSAGE: &str = "A sync is already in progress. Please wait until it completes.";
pub const SUCCESS_MESSAGE: &str = "Successfully synced all tournaments, events, and matches.";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: u32,
    pub rate_limit_requests: usize,
    pub rate_limit_window_secs: u64,
    pub tournaments_per_page: u32,
    pub direct_feed_per_page: u32,
    pub direct_feed_max_pages: u32,
    pub event_sets_max_pages: u32,
    pub stale_sync_minutes: i64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://rivals.db?mode=rwc".to_string(),
            api_url: DEFAULT_ENDPOINT.to_string(),
            user_agent: "rivals-sync/0.1".to_string(),
            http_timeout_secs: 30,
            max_attempts: 3,
            rate_limit_requests: 80,
            rate_limit_window_secs: 60,
            tournaments_per_page: 50,
            direct_feed_per_page: 50,
            direct_feed_max_pages: 5,
            event_sets_max_pages: 50,
            stale_sync_minutes: 30,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            web_port: 8000,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            api_url: std::env::var("STARTGG_API_URL").unwrap_or(defaults.api_url),
            user_agent: std::env::var("RIVALS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("RIVALS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            max_attempts: env_or("RIVALS_MAX_ATTEMPTS", defaults.max_attempts),
            rate_limit_requests: env_or("RIVALS_RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
            rate_limit_window_secs: env_or(
                "RIVALS_RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            ),
            tournaments_per_page: env_or("RIVALS_TOURNAMENTS_PER_PAGE", defaults.tournaments_per_page),
            direct_feed_per_page: env_or("RIVALS_DIRECT_FEED_PER_PAGE", defaults.direct_feed_per_page),
            direct_feed_max_pages: env_or(
                "RIVALS_DIRECT_FEED_MAX_PAGES",
                defaults.direct_feed_max_pages,
            ),
            event_sets_max_pages: env_or("RIVALS_EVENT_SETS_MAX_PAGES", defaults.event_sets_max_pages),
            stale_sync_minutes: env_or("RIVALS_STALE_SYNC_MINUTES", defaults.stale_sync_minutes),
            scheduler_enabled: std::env::var("RIVALS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("RIVALS_SYNC_CRON").unwrap_or(defaults.sync_cron),
            web_port: env_or("RIVALS_WEB_PORT", defaults.web_port),
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_requests,
            window: Duration::from_secs(self.rate_limit_window_secs),
            ..RateLimitConfig::default()
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            endpoint: self.api_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_sync_minutes)
    }

    /// Production client with its own rate limiter.
    pub fn build_client(&self) -> Result<StartggClient> {
        let limiter = Arc::new(RateLimiter::new(self.rate_limit()));
        StartggClient::from_config(&self.http_client(), limiter).context("building start.gg client")
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Configuration(String),
    #[error("unknown user {0}")]
    UnknownUser(i64),
    #[error("{}", ALREADY_SYNCING_MESSAGE)]
    AlreadySyncing,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadySyncing,
}

/// Terminal result of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub user_id: i64,
    pub status: SyncStatus,
    pub message: String,
    pub counts: ImportCounts,
}

/// Sync state as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusView {
    pub in_progress: bool,
    pub stale: bool,
    #[serde(flatten)]
    pub state: SyncState,
}

/// Classifies a run from the tournament pass and every event pass.
pub fn classify(tournaments: &ImportOutcome, events: &[ImportOutcome]) -> (SyncStatus, String) {
    if !tournaments.success {
        return (
            SyncStatus::Error,
            format!("Failed to sync tournaments: {}", tournaments.messages.join(", ")),
        );
    }

    if tournaments.is_clean() && events.iter().all(ImportOutcome::is_clean) {
        return (SyncStatus::Success, SUCCESS_MESSAGE.to_string());
    }

    let mut problems: Vec<&str> = Vec::new();
    for message in tournaments
        .messages
        .iter()
        .chain(events.iter().flat_map(|e| e.messages.iter()))
    {
        if !problems.contains(&message.as_str()) {
            problems.push(message);
        }
    }
    (
        SyncStatus::Warning,
        format!("Synced tournaments, but some events failed: {}", problems.join(", ")),
    )
}

/// Per-user state machine over the importer chain.
///
/// `idle -> in_progress` only through the atomic start guard; every run that
/// got past the guard ends with a recorded outcome and the user back at idle,
/// including runs whose chain panicked.
#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Store,
    tournaments: TournamentImporter,
    events: EventImporter,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(store: Store, api: Arc<dyn StartggApi>, config: SyncConfig) -> Self {
        Self {
            tournaments: TournamentImporter::new(store.clone(), api.clone(), &config),
            events: EventImporter::new(store.clone(), api, &config),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn load_user(&self, user_id: i64) -> Result<User, SyncError> {
        self.store
            .user_by_id(user_id)
            .await?
            .ok_or(SyncError::UnknownUser(user_id))
    }

    /// The guard alone: flips the user to in-progress unless a live sync holds it.
    pub async fn start(&self, user_id: i64) -> Result<StartOutcome, SyncError> {
        self.load_user(user_id).await?;
        let started = self
            .store
            .try_begin_sync(user_id, Utc::now(), self.config.stale_after())
            .await?;
        if started {
            Ok(StartOutcome::Started)
        } else {
            info!(user_id, "sync already in progress; start rejected");
            Ok(StartOutcome::AlreadySyncing)
        }
    }

    /// Runs a full sync inline and returns its report.
    pub async fn sync_now(&self, user_id: i64) -> Result<SyncReport, SyncError> {
        match self.start(user_id).await? {
            StartOutcome::Started => self.run_and_finish(user_id).await,
            StartOutcome::AlreadySyncing => Err(SyncError::AlreadySyncing),
        }
    }

    /// Passes the guard, then runs the sync on a background task.
    pub async fn spawn_sync(&self, user_id: i64) -> Result<StartOutcome, SyncError> {
        let outcome = self.start(user_id).await?;
        if outcome == StartOutcome::Started {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.run_and_finish(user_id).await {
                    error!(user_id, error = %err, "background sync could not record its outcome");
                }
            });
        }
        Ok(outcome)
    }

    pub async fn status(&self, user_id: i64) -> Result<SyncStatusView, SyncError> {
        self.load_user(user_id).await?;
        let state = self.store.sync_state(user_id).await?;
        Ok(SyncStatusView {
            in_progress: state.is_in_progress(),
            stale: state.is_stale(Utc::now(), self.config.stale_after()),
            state,
        })
    }

    /// Schedules a background sync for every user with credentials.
    pub async fn sync_all(&self) -> Result<usize, SyncError> {
        let users = self.store.users_with_credentials().await?;
        let mut started = 0;
        for user in users {
            match self.spawn_sync(user.id).await {
                Ok(StartOutcome::Started) => started += 1,
                Ok(StartOutcome::AlreadySyncing) => {}
                Err(err) => warn!(user_id = user.id, error = %err, "scheduled sync failed to start"),
            }
        }
        info!(started, "scheduled sync dispatched");
        Ok(started)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let orchestrator = self.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                if let Err(err) = orchestrator.sync_all().await {
                    error!(error = %err, "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn run_and_finish(&self, user_id: i64) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, user_id);

        // A panic in the chain surfaces here as a JoinError.
        let this = self.clone();
        let chain = tokio::spawn(async move { this.run_chain(user_id).await }.instrument(span.clone()));
        let (status, message, counts) = match chain.await {
            Ok(result) => result,
            Err(join_err) => {
                error!(parent: &span, user_id, error = %join_err, "sync chain aborted");
                (
                    SyncStatus::Error,
                    format!("A critical error occurred: {join_err}"),
                    ImportCounts::default(),
                )
            }
        };

        self.store
            .finish_sync(user_id, status, &message, Utc::now())
            .await?;
        info!(parent: &span, status = %status, "sync finished");
        Ok(SyncReport {
            run_id,
            user_id,
            status,
            message,
            counts,
        })
    }

    async fn run_chain(&self, user_id: i64) -> (SyncStatus, String, ImportCounts) {
        let user = match self.load_user(user_id).await {
            Ok(user) => user,
            Err(err) => {
                return (
                    SyncStatus::Error,
                    format!("Failed to sync tournaments: {err}"),
                    ImportCounts::default(),
                )
            }
        };

        let tournament_outcome = self.tournaments.import(&user).await;
        let mut counts = tournament_outcome.counts;
        if !tournament_outcome.success {
            let (status, message) = classify(&tournament_outcome, &[]);
            return (status, message, counts);
        }

        let mut event_outcomes = Vec::new();
        match self.store.tournaments_for_user(user.id).await {
            Ok(tournaments) => {
                for tournament in &tournaments {
                    let outcome = self.events.import(tournament, &user).await;
                    counts += outcome.counts;
                    event_outcomes.push(outcome);
                }
            }
            Err(err) => event_outcomes.push(ImportOutcome {
                success: false,
                messages: vec![format!("Failed to load tournaments: {err}")],
                counts: ImportCounts::default(),
            }),
        }

        let (status, message) = classify(&tournament_outcome, &event_outcomes);
        (status, message, counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use rivals_adapters::EventSetsPage;
    use rivals_core::{
        EventPayload, ExternalId, RemoteEntrant, RemoteEvent, RemoteMatch, RemoteParticipant,
        RemoteStanding, RemoteTournament, SyncPhase,
    };
    use rivals_storage::{ApiError, NewUser, Page};

    /// In-memory remote API that records every call it receives.
    #[derive(Default)]
    struct FakeApi {
        pub tournaments: Vec<RemoteTournament>,
        pub tournaments_error: Option<ApiError>,
        pub combined: HashMap<ExternalId, Result<Vec<EventPayload>, ApiError>>,
        pub events: HashMap<ExternalId, Vec<RemoteEvent>>,
        /// Keyed by (event id, page).
        pub event_sets: HashMap<(ExternalId, u32), Result<EventSetsPage, ApiError>>,
        pub feed: Vec<RemoteMatch>,
        pub feed_error: Option<ApiError>,
        pub panic_on_combined: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    #[async_trait]
    impl StartggApi for FakeApi {
        async fn user_tournaments(
            &self,
            _token: &str,
            user_id: ExternalId,
            page: u32,
            _per_page: u32,
        ) -> Result<Page<RemoteTournament>, ApiError> {
            self.record(format!("user_tournaments:{user_id}:{page}"));
            if let Some(err) = &self.tournaments_error {
                return Err(err.clone());
            }
            Ok(Page::new(self.tournaments.clone(), Some(1)))
        }

        async fn tournament_with_sets(
            &self,
            _token: &str,
            tournament_id: ExternalId,
            _user_id: ExternalId,
        ) -> Result<Vec<EventPayload>, ApiError> {
            self.record(format!("tournament_with_sets:{tournament_id}"));
            if self.panic_on_combined {
                panic!("combined query exploded");
            }
            self.combined
                .get(&tournament_id)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn tournament_events(
            &self,
            _token: &str,
            tournament_id: ExternalId,
        ) -> Result<Vec<RemoteEvent>, ApiError> {
            self.record(format!("tournament_events:{tournament_id}"));
            Ok(self.events.get(&tournament_id).cloned().unwrap_or_default())
        }

        async fn event_sets(
            &self,
            _token: &str,
            event_id: ExternalId,
            _user_id: ExternalId,
            page: u32,
        ) -> Result<EventSetsPage, ApiError> {
            self.record(format!("event_sets:{event_id}:{page}"));
            self.event_sets
                .get(&(event_id, page))
                .cloned()
                .unwrap_or_else(|| {
                    Ok(EventSetsPage {
                        standings: Vec::new(),
                        matches: Page::new(Vec::new(), Some(page)),
                    })
                })
        }

        async fn user_sets(
            &self,
            _token: &str,
            user_id: ExternalId,
            page: u32,
            _per_page: u32,
        ) -> Result<Page<RemoteMatch>, ApiError> {
            self.record(format!("user_sets:{user_id}:{page}"));
            if let Some(err) = &self.feed_error {
                return Err(err.clone());
            }
            Ok(Page::new(self.feed.clone(), Some(1)))
        }
    }

    fn tournament(id: ExternalId, name: &str) -> RemoteTournament {
        RemoteTournament {
            id,
            name: Some(name.to_string()),
            slug: Some(format!("tournament/{}", name.to_lowercase().replace(' ', "-"))),
            start_at: Some(1_700_000_000),
            end_at: Some(1_700_086_400),
            is_online: Some(false),
            venue_name: None,
            venue_address: None,
            city: Some("Seattle".to_string()),
            addr_state: Some("WA".to_string()),
            country_code: Some("US".to_string()),
            images: Vec::new(),
        }
    }

    fn event(id: ExternalId, name: &str) -> RemoteEvent {
        RemoteEvent {
            id,
            name: Some(name.to_string()),
            slug: None,
            num_entrants: Some(16),
            tournament_id: None,
        }
    }

    fn entrant(id: ExternalId, user_id: ExternalId, tag: &str) -> RemoteEntrant {
        RemoteEntrant {
            id: Some(id),
            participants: vec![RemoteParticipant {
                user_id: Some(user_id),
                gamer_tag: Some(tag.to_string()),
            }],
        }
    }

    fn standing(placement: i64, entrant: RemoteEntrant) -> RemoteStanding {
        RemoteStanding {
            placement: Some(placement),
            entrant,
        }
    }

    fn set(id: ExternalId, winner: ExternalId, slots: Vec<RemoteEntrant>) -> RemoteMatch {
        RemoteMatch {
            id,
            round: Some("1".to_string()),
            identifier: Some("A".to_string()),
            full_round_text: Some("Winners Round 1".to_string()),
            display_score: Some("2 - 0".to_string()),
            winner_id: Some(winner),
            slots,
            event: None,
        }
    }

    fn complexity_error() -> ApiError {
        ApiError::Query(vec![
            "Your query complexity is too high. A maximum of 1000 objects may be returned by each request."
                .to_string(),
        ])
    }

    async fn store() -> Store {
        Store::in_memory().await.unwrap()
    }

    async fn register(store: &Store, remote_id: i64, token: Option<&str>) -> User {
        store
            .register_user(&NewUser {
                email: format!("player{remote_id}@example.com"),
                remote_id: Some(remote_id),
                tag: Some("Hero".to_string()),
                access_token: token.map(str::to_string),
            })
            .await
            .unwrap()
    }

    fn winter_clash() -> FakeApi {
        let me = entrant(1, 77, "Hero");
        let rival = entrant(2, 88, "Rival");
        FakeApi {
            tournaments: vec![tournament(501, "Winter Clash")],
            combined: HashMap::from([(
                501,
                Ok(vec![EventPayload {
                    event: event(9001, "SF6 Singles"),
                    standings: vec![standing(1, me.clone()), standing(2, rival.clone())],
                    matches: vec![set(55001, 1, vec![me, rival])],
                }]),
            )]),
            ..FakeApi::default()
        }
    }

    fn orchestrator(store: &Store, api: &Arc<FakeApi>) -> SyncOrchestrator {
        SyncOrchestrator::new(store.clone(), api.clone(), SyncConfig::default())
    }

    #[tokio::test]
    async fn full_sync_populates_history_and_head_to_head() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(winter_clash());

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.message, SUCCESS_MESSAGE);
        assert_eq!(report.counts.tournaments, 1);
        assert_eq!(report.counts.events, 1);
        assert_eq!(report.counts.matches, 1);

        let tournaments = store.tournaments_for_user(user.id).await.unwrap();
        assert_eq!(tournaments.len(), 1);
        assert_eq!(tournaments[0].name.as_deref(), Some("Winter Clash"));
        assert_eq!(tournaments[0].events_count, 1);

        let sf6 = store.event_by_external_id(9001).await.unwrap().unwrap();
        let placement = store.event_participation(user.id, sf6.id).await.unwrap().unwrap();
        assert_eq!(placement.final_placement, Some(1));

        let rival = store.user_by_remote_id(88).await.unwrap().unwrap();
        assert!(rival.is_placeholder);
        assert_eq!(rival.tag.as_deref(), Some("Rival"));

        let h2h = store.head_to_head(user.id).await.unwrap();
        assert_eq!(h2h.len(), 1);
        assert_eq!(h2h[0].opponent_tag, "Rival");
        assert_eq!((h2h[0].wins, h2h[0].losses), (1, 0));

        let state = store.sync_state(user.id).await.unwrap();
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.last_status, Some(SyncStatus::Success));
        assert!(state.finished_at.is_some());

        assert_eq!(api.count("tournament_with_sets:501"), 1);
        assert_eq!(api.count("tournament_events"), 0);
        assert_eq!(api.count("user_sets:77"), 1);
    }

    #[tokio::test]
    async fn resync_converges_on_the_same_rows() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(winter_clash());
        let sync = orchestrator(&store, &api);

        sync.sync_now(user.id).await.unwrap();
        let first = store.counts().await.unwrap();
        let report = sync.sync_now(user.id).await.unwrap();

        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(store.counts().await.unwrap(), first);
        let h2h = store.head_to_head(user.id).await.unwrap();
        assert_eq!((h2h[0].wins, h2h[0].losses), (1, 0));
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_remote_calls() {
        let store = store().await;
        let user = register(&store, 77, None).await;
        let api = Arc::new(winter_clash());

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Error);
        assert_eq!(
            report.message,
            "Failed to sync tournaments: User authentication details for StartGG are missing."
        );
        assert!(api.calls().is_empty());

        let state = store.sync_state(user.id).await.unwrap();
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.last_status, Some(SyncStatus::Error));
    }

    #[tokio::test]
    async fn tournament_list_failure_is_an_error_and_skips_events() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(FakeApi {
            tournaments_error: Some(ApiError::HttpStatus { status: 500 }),
            ..winter_clash()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Error);
        assert_eq!(
            report.message,
            "Failed to sync tournaments: API request failed with status 500"
        );
        assert_eq!(api.count("tournament_with_sets"), 0);
        assert_eq!(api.count("user_sets"), 0);
    }

    #[tokio::test]
    async fn complexity_rejection_falls_back_once_per_tournament() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let me = entrant(1, 77, "Hero");
        let rival = entrant(2, 88, "Rival");
        let page = |m| -> Result<EventSetsPage, ApiError> {
            Ok(EventSetsPage {
                standings: vec![standing(3, me.clone())],
                matches: Page::new(vec![m], Some(2)),
            })
        };
        let api = Arc::new(FakeApi {
            tournaments: vec![tournament(501, "Winter Clash")],
            combined: HashMap::from([(501, Err(complexity_error()))]),
            events: HashMap::from([(501, vec![event(9001, "SF6 Singles")])]),
            event_sets: HashMap::from([
                ((9001, 1), page(set(55001, 1, vec![me.clone(), rival.clone()]))),
                ((9001, 2), page(set(55003, 2, vec![me.clone(), rival.clone()]))),
            ]),
            ..FakeApi::default()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Success, "{}", report.message);
        assert_eq!(api.count("tournament_with_sets:501"), 1);
        assert_eq!(api.count("tournament_events:501"), 1);
        assert_eq!(api.count("event_sets:9001:1"), 1);
        assert_eq!(api.count("event_sets:9001:2"), 1);
        assert_eq!(api.count("event_sets:9001:3"), 0);

        assert!(store.match_by_external_id(55001).await.unwrap().is_some());
        assert!(store.match_by_external_id(55003).await.unwrap().is_some());
        let sf6 = store.event_by_external_id(9001).await.unwrap().unwrap();
        let placement = store.event_participation(user.id, sf6.id).await.unwrap().unwrap();
        assert_eq!(placement.final_placement, Some(3));

        let h2h = store.head_to_head(user.id).await.unwrap();
        assert_eq!((h2h[0].wins, h2h[0].losses), (1, 1));
    }

    #[tokio::test]
    async fn fallback_page_failure_surfaces_as_warning() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(FakeApi {
            tournaments: vec![tournament(501, "Winter Clash")],
            combined: HashMap::from([(501, Err(complexity_error()))]),
            events: HashMap::from([(501, vec![event(9001, "SF6 Singles"), event(9002, "Tekken 8")])]),
            event_sets: HashMap::from([((9001, 1), Err(ApiError::HttpStatus { status: 400 }))]),
            ..FakeApi::default()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Warning);
        assert_eq!(
            report.message,
            "Synced tournaments, but some events failed: API request failed with status 400"
        );
        assert!(!report.message.contains("complexity"));
        // the failing event still gets its row, and the other event is untouched by the failure
        assert!(store.event_by_external_id(9001).await.unwrap().is_some());
        assert_eq!(api.count("event_sets:9002:1"), 1);
    }

    #[tokio::test]
    async fn repeated_event_failures_are_reported_once() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(FakeApi {
            tournaments: vec![tournament(501, "Winter Clash"), tournament(502, "Spring Fling")],
            feed_error: Some(ApiError::Query(vec!["Boom".to_string()])),
            ..winter_clash()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Warning);
        assert_eq!(
            report.message,
            "Synced tournaments, but some events failed: GraphQL Error: Boom"
        );
        assert_eq!(api.count("user_sets"), 2);
        // the combined pass still landed
        assert!(store.match_by_external_id(55001).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn direct_feed_adds_matches_for_this_tournament_only() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let me = entrant(1, 77, "Hero");
        let other = entrant(3, 99, "Stranger");
        let here = RemoteEvent {
            tournament_id: Some(501),
            ..event(9001, "SF6 Singles")
        };
        let elsewhere = RemoteEvent {
            tournament_id: Some(777),
            ..event(9500, "Elsewhere")
        };
        let mut feed_here = set(55002, 3, vec![me.clone(), other.clone()]);
        feed_here.event = Some(here);
        let mut feed_elsewhere = set(56000, 1, vec![me, other]);
        feed_elsewhere.event = Some(elsewhere);
        let api = Arc::new(FakeApi {
            feed: vec![feed_here, feed_elsewhere],
            ..winter_clash()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert!(store.match_by_external_id(55002).await.unwrap().is_some());
        assert!(store.match_by_external_id(56000).await.unwrap().is_none());
        assert!(store.event_by_external_id(9500).await.unwrap().is_none());

        let h2h = store.head_to_head(user.id).await.unwrap();
        let stranger = h2h.iter().find(|r| r.opponent_tag == "Stranger").unwrap();
        assert_eq!((stranger.wins, stranger.losses), (0, 1));
    }

    #[tokio::test]
    async fn a_failed_match_write_does_not_stop_the_batch() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        sqlx::query(
            "CREATE TRIGGER reject_match BEFORE INSERT ON matches \
             WHEN NEW.external_id = 55002 BEGIN SELECT RAISE(ABORT, 'match rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let me = entrant(1, 77, "Hero");
        let rival = entrant(2, 88, "Rival");
        let api = Arc::new(FakeApi {
            tournaments: vec![tournament(501, "Winter Clash")],
            combined: HashMap::from([(
                501,
                Ok(vec![EventPayload {
                    event: event(9001, "SF6 Singles"),
                    standings: vec![standing(1, me.clone())],
                    matches: vec![
                        set(55001, 1, vec![me.clone(), rival.clone()]),
                        set(55002, 1, vec![me.clone(), rival.clone()]),
                        set(55004, 2, vec![me, rival]),
                    ],
                }]),
            )]),
            ..FakeApi::default()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Warning);
        assert!(
            report
                .message
                .starts_with("Synced tournaments, but some events failed: Failed to save match:"),
            "{}",
            report.message
        );
        assert!(report.message.contains("match rejected"));
        assert_eq!(report.counts.matches, 2);

        assert!(store.match_by_external_id(55001).await.unwrap().is_some());
        assert!(store.match_by_external_id(55002).await.unwrap().is_none());
        assert!(store.match_by_external_id(55004).await.unwrap().is_some());
        let h2h = store.head_to_head(user.id).await.unwrap();
        assert_eq!((h2h[0].wins, h2h[0].losses), (1, 1));

        let state = store.sync_state(user.id).await.unwrap();
        assert_eq!(state.last_status, Some(SyncStatus::Warning));
    }

    #[tokio::test]
    async fn a_running_sync_blocks_a_second_start() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(winter_clash());
        let sync = orchestrator(&store, &api);

        assert_eq!(sync.start(user.id).await.unwrap(), StartOutcome::Started);
        let before = store.sync_state(user.id).await.unwrap();

        let err = sync.sync_now(user.id).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadySyncing));
        assert_eq!(err.to_string(), ALREADY_SYNCING_MESSAGE);
        assert_eq!(sync.spawn_sync(user.id).await.unwrap(), StartOutcome::AlreadySyncing);

        assert!(api.calls().is_empty());
        assert_eq!(store.sync_state(user.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn an_abandoned_sync_can_be_taken_over() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(winter_clash());
        let sync = orchestrator(&store, &api);

        let long_ago = Utc::now() - Duration::minutes(45);
        assert!(store
            .try_begin_sync(user.id, long_ago, Duration::minutes(30))
            .await
            .unwrap());
        assert!(sync.status(user.id).await.unwrap().stale);

        let report = sync.sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn a_panicking_chain_still_finishes_the_sync() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(FakeApi {
            panic_on_combined: true,
            ..winter_clash()
        });

        let report = orchestrator(&store, &api).sync_now(user.id).await.unwrap();
        assert_eq!(report.status, SyncStatus::Error);
        assert!(report.message.starts_with("A critical error occurred"));

        let state = store.sync_state(user.id).await.unwrap();
        assert_eq!(state.phase, SyncPhase::Idle);
        assert_eq!(state.last_status, Some(SyncStatus::Error));
    }

    #[tokio::test]
    async fn unknown_users_are_rejected() {
        let store = store().await;
        let api = Arc::new(winter_clash());
        let err = orchestrator(&store, &api).sync_now(4242).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownUser(4242)));
    }

    #[tokio::test]
    async fn background_sync_reaches_idle() {
        let store = store().await;
        let user = register(&store, 77, Some("tok")).await;
        let api = Arc::new(winter_clash());
        let sync = orchestrator(&store, &api);

        assert_eq!(sync.spawn_sync(user.id).await.unwrap(), StartOutcome::Started);
        let mut view = sync.status(user.id).await.unwrap();
        for _ in 0..100 {
            if !view.in_progress {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            view = sync.status(user.id).await.unwrap();
        }
        assert!(!view.in_progress);
        assert_eq!(view.state.last_status, Some(SyncStatus::Success));
    }

    #[tokio::test]
    async fn sync_all_only_starts_users_with_credentials() {
        let store = store().await;
        register(&store, 77, Some("tok")).await;
        register(&store, 78, None).await;
        let api = Arc::new(winter_clash());

        assert_eq!(orchestrator(&store, &api).sync_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduler_is_opt_in() {
        let store = store().await;
        let api = Arc::new(FakeApi::default());
        assert!(orchestrator(&store, &api)
            .maybe_build_scheduler()
            .await
            .unwrap()
            .is_none());

        let config = SyncConfig {
            scheduler_enabled: true,
            ..SyncConfig::default()
        };
        let sync = SyncOrchestrator::new(store, api, config);
        assert!(sync.maybe_build_scheduler().await.unwrap().is_some());
    }

    #[test]
    fn classification_follows_the_worst_outcome() {
        let clean = ImportOutcome {
            success: true,
            ..ImportOutcome::default()
        };
        let soft = ImportOutcome {
            success: true,
            messages: vec!["Failed to save match: locked".to_string()],
            ..ImportOutcome::default()
        };
        let failed = ImportOutcome {
            success: false,
            messages: vec!["GraphQL Error: nope".to_string()],
            ..ImportOutcome::default()
        };

        assert_eq!(classify(&clean, &[clean.clone()]).0, SyncStatus::Success);
        assert_eq!(classify(&clean, &[]).0, SyncStatus::Success);
        assert_eq!(
            classify(&clean, &[soft.clone(), failed.clone(), failed.clone()]),
            (
                SyncStatus::Warning,
                "Synced tournaments, but some events failed: Failed to save match: locked, GraphQL Error: nope"
                    .to_string()
            )
        );
        assert_eq!(classify(&soft, &[clean]).0, SyncStatus::Warning);
        assert_eq!(
            classify(&failed, &[]),
            (
                SyncStatus::Error,
                "Failed to sync tournaments: GraphQL Error: nope".to_string()
            )
        );
    }

    #[test]
    fn config_defaults_match_the_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.rate_limit().max_requests, 80);
        assert_eq!(config.rate_limit().window, StdDuration::from_secs(60));
        assert_eq!(config.http_client().retry.max_attempts, 3);
        assert_eq!(config.stale_after(), Duration::minutes(30));
        assert_eq!(config.direct_feed_max_pages, 5);
        assert!(!config.scheduler_enabled);
    }
}
