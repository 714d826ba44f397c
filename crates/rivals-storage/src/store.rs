use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rivals_core::{
    is_blank_tag, Event, EventParticipation, ExternalId, Match, MatchParticipation, OpponentRecord,
    RemoteEvent, RemoteMatch, RemoteTournament, SyncPhase, SyncState, SyncStatus, Tournament,
    TournamentImage, User, WinLoss, UNKNOWN_PLAYER_TAG,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::debug;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Account registration input. A user with a remote id and token can be synced.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub remote_id: Option<ExternalId>,
    pub tag: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounts {
    pub users: i64,
    pub tournaments: i64,
    pub events: i64,
    pub matches: i64,
}

pub fn placeholder_email(remote_id: ExternalId) -> String {
    format!("startgg-{remote_id}@placeholder.invalid")
}

/// Local relational store. Every write is a single keyed upsert so concurrent
/// importer passes touching the same external id converge on one row.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

const USER_COLUMNS: &str =
    "id, email, remote_id, tag, access_token, is_placeholder, created_at, updated_at";
const TOURNAMENT_COLUMNS: &str = "id, external_id, name, slug, start_at, end_at, is_online, \
     venue_name, venue_address, city, state, country_code, images, events_count";
const EVENT_COLUMNS: &str = "id, external_id, tournament_id, name, slug, num_entrants";
const MATCH_COLUMNS: &str = "id, external_id, event_id, round, round_number, identifier, \
     full_round_text, display_score, winner_external_id";

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Fresh migrated in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // users

    /// Creates or updates a real account. An existing placeholder carrying the
    /// same remote id is claimed instead of duplicated.
    pub async fn register_user(&self, new_user: &NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let tag = new_user
            .tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !is_blank_tag(t));
        let sql = format!(
            r#"
            INSERT INTO users (email, remote_id, tag, access_token, is_placeholder, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
            ON CONFLICT(remote_id) DO UPDATE SET
                email = excluded.email,
                tag = COALESCE(excluded.tag, users.tag),
                access_token = COALESCE(excluded.access_token, users.access_token),
                is_placeholder = 0,
                updated_at = excluded.updated_at
            ON CONFLICT(email) DO UPDATE SET
                remote_id = COALESCE(excluded.remote_id, users.remote_id),
                tag = COALESCE(excluded.tag, users.tag),
                access_token = COALESCE(excluded.access_token, users.access_token),
                is_placeholder = 0,
                updated_at = excluded.updated_at
            RETURNING {USER_COLUMNS}
            "#
        );
        let row: UserRow = sqlx::query_as(&sql)
            .bind(new_user.email.trim())
            .bind(new_user.remote_id)
            .bind(tag)
            .bind(new_user.access_token.as_deref())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    pub async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn user_by_remote_id(&self, remote_id: ExternalId) -> Result<Option<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE remote_id = ?1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Find-or-create keyed on the remote id unique constraint.
    ///
    /// A stored tag that is blank (missing, empty, or the unknown-player marker)
    /// is replaced by a non-blank candidate; a known tag is never blanked.
    pub async fn upsert_placeholder_user(
        &self,
        remote_id: ExternalId,
        candidate_tag: Option<&str>,
    ) -> Result<User, StoreError> {
        let now = Utc::now();
        let candidate = candidate_tag.map(str::trim).filter(|t| !is_blank_tag(t));
        let sql = format!(
            r#"
            INSERT INTO users (email, remote_id, tag, is_placeholder, created_at, updated_at)
            VALUES (?1, ?2, COALESCE(?3, ?4), 1, ?5, ?5)
            ON CONFLICT(remote_id) DO UPDATE SET
                tag = CASE
                    WHEN ?3 IS NOT NULL
                     AND (users.tag IS NULL OR TRIM(users.tag) = '' OR users.tag = ?4)
                    THEN ?3
                    ELSE users.tag
                END,
                updated_at = CASE
                    WHEN ?3 IS NOT NULL
                     AND (users.tag IS NULL OR TRIM(users.tag) = '' OR users.tag = ?4)
                    THEN ?5
                    ELSE users.updated_at
                END
            RETURNING {USER_COLUMNS}
            "#
        );
        let row: UserRow = sqlx::query_as(&sql)
            .bind(placeholder_email(remote_id))
            .bind(remote_id)
            .bind(candidate)
            .bind(UNKNOWN_PLAYER_TAG)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    /// Users that carry both a remote identity and an access token.
    pub async fn users_with_credentials(&self) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE remote_id IS NOT NULL AND access_token IS NOT NULL AND TRIM(access_token) <> '' \
             ORDER BY id"
        );
        let rows: Vec<UserRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // tournaments

    pub async fn upsert_tournament(&self, remote: &RemoteTournament) -> Result<Tournament, StoreError> {
        let now = Utc::now();
        let images = if remote.images.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&remote.images)
                    .map_err(|e| StoreError::InvalidValue(format!("tournament images: {e}")))?,
            )
        };
        let sql = format!(
            r#"
            INSERT INTO tournaments (
                external_id, name, slug, start_at, end_at, is_online, venue_name, venue_address,
                city, state, country_code, images, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                slug = excluded.slug,
                start_at = COALESCE(excluded.start_at, tournaments.start_at),
                end_at = COALESCE(excluded.end_at, tournaments.end_at),
                is_online = excluded.is_online,
                venue_name = excluded.venue_name,
                venue_address = excluded.venue_address,
                city = excluded.city,
                state = excluded.state,
                country_code = excluded.country_code,
                images = COALESCE(excluded.images, tournaments.images),
                updated_at = excluded.updated_at
            RETURNING {TOURNAMENT_COLUMNS}
            "#
        );
        let row: TournamentRow = sqlx::query_as(&sql)
            .bind(remote.id)
            .bind(remote.name.as_deref())
            .bind(remote.slug.as_deref())
            .bind(remote.start_time())
            .bind(remote.end_time())
            .bind(remote.is_online)
            .bind(remote.venue_name.as_deref())
            .bind(remote.venue_address.as_deref())
            .bind(remote.city.as_deref())
            .bind(remote.addr_state.as_deref())
            .bind(remote.country_code.as_deref())
            .bind(images)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Tournament::try_from(row)
    }

    /// Returns true when the participation did not exist yet.
    pub async fn add_tournament_participation(
        &self,
        user_id: i64,
        tournament_id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_tournament_participations (user_id, tournament_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, tournament_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(tournament_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn tournaments_for_user(&self, user_id: i64) -> Result<Vec<Tournament>, StoreError> {
        let sql = format!(
            r#"
            SELECT {cols}
              FROM tournaments t
              JOIN user_tournament_participations p ON p.tournament_id = t.id
             WHERE p.user_id = ?1
             ORDER BY t.start_at IS NULL, t.start_at DESC, t.id
            "#,
            cols = prefixed(TOURNAMENT_COLUMNS, "t")
        );
        let rows: Vec<TournamentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Tournament::try_from).collect()
    }

    pub async fn tournament_by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<Tournament>, StoreError> {
        let sql = format!("SELECT {TOURNAMENT_COLUMNS} FROM tournaments WHERE external_id = ?1");
        let row: Option<TournamentRow> = sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Tournament::try_from).transpose()
    }

    // events

    pub async fn upsert_event(&self, tournament_id: i64, remote: &RemoteEvent) -> Result<Event, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"
            INSERT INTO events (external_id, tournament_id, name, slug, num_entrants, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(external_id) DO UPDATE SET
                tournament_id = excluded.tournament_id,
                name = COALESCE(excluded.name, events.name),
                slug = COALESCE(excluded.slug, events.slug),
                num_entrants = COALESCE(excluded.num_entrants, events.num_entrants),
                updated_at = excluded.updated_at
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let row: EventRow = sqlx::query_as(&sql)
            .bind(remote.id)
            .bind(tournament_id)
            .bind(remote.name.as_deref())
            .bind(remote.slug.as_deref())
            .bind(remote.num_entrants)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE tournaments
               SET events_count = (SELECT COUNT(*) FROM events WHERE tournament_id = ?1)
             WHERE id = ?1
            "#,
        )
        .bind(tournament_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(row.into())
    }

    pub async fn upsert_event_participation(
        &self,
        user_id: i64,
        event_id: i64,
        final_placement: Option<i64>,
        entrant_id: Option<ExternalId>,
    ) -> Result<EventParticipation, StoreError> {
        let row: EventParticipationRow = sqlx::query_as(
            r#"
            INSERT INTO user_event_participations (user_id, event_id, final_placement, entrant_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(user_id, event_id) DO UPDATE SET
                final_placement = excluded.final_placement,
                entrant_id = COALESCE(excluded.entrant_id, user_event_participations.entrant_id),
                updated_at = excluded.updated_at
            RETURNING user_id, event_id, final_placement, entrant_id
            "#,
        )
        .bind(user_id)
        .bind(event_id)
        .bind(final_placement)
        .bind(entrant_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn events_for_tournament(&self, tournament_id: i64) -> Result<Vec<Event>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE tournament_id = ?1 ORDER BY id");
        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(tournament_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Events the user has a recorded placement in.
    pub async fn events_for_user(&self, user_id: i64) -> Result<Vec<Event>, StoreError> {
        let sql = format!(
            r#"
            SELECT {cols}
              FROM events e
              JOIN user_event_participations p ON p.event_id = e.id
             WHERE p.user_id = ?1
             ORDER BY e.id
            "#,
            cols = prefixed(EVENT_COLUMNS, "e")
        );
        let rows: Vec<EventRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn event_by_external_id(&self, external_id: ExternalId) -> Result<Option<Event>, StoreError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE external_id = ?1");
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn event_participation(
        &self,
        user_id: i64,
        event_id: i64,
    ) -> Result<Option<EventParticipation>, StoreError> {
        let row: Option<EventParticipationRow> = sqlx::query_as(
            "SELECT user_id, event_id, final_placement, entrant_id \
             FROM user_event_participations WHERE user_id = ?1 AND event_id = ?2",
        )
        .bind(user_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    // matches

    pub async fn upsert_match(&self, event_id: i64, remote: &RemoteMatch) -> Result<Match, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO matches (
                external_id, event_id, round, round_number, identifier, full_round_text,
                display_score, winner_external_id, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(external_id) DO UPDATE SET
                event_id = excluded.event_id,
                round = excluded.round,
                round_number = excluded.round_number,
                identifier = excluded.identifier,
                full_round_text = excluded.full_round_text,
                display_score = excluded.display_score,
                winner_external_id = excluded.winner_external_id,
                updated_at = excluded.updated_at
            RETURNING {MATCH_COLUMNS}
            "#
        );
        let row: MatchRow = sqlx::query_as(&sql)
            .bind(remote.id)
            .bind(event_id)
            .bind(remote.round.as_deref())
            .bind(remote.round_number())
            .bind(remote.identifier.as_deref())
            .bind(remote.full_round_text.as_deref())
            .bind(remote.display_score.as_deref())
            .bind(remote.winner_id)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    pub async fn upsert_match_participation(
        &self,
        user_id: i64,
        match_id: i64,
        is_winner: bool,
    ) -> Result<MatchParticipation, StoreError> {
        let row: MatchParticipationRow = sqlx::query_as(
            r#"
            INSERT INTO user_match_participations (user_id, match_id, is_winner, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(user_id, match_id) DO UPDATE SET
                is_winner = excluded.is_winner,
                updated_at = excluded.updated_at
            RETURNING user_id, match_id, is_winner
            "#,
        )
        .bind(user_id)
        .bind(match_id)
        .bind(is_winner)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn match_by_external_id(&self, external_id: ExternalId) -> Result<Option<Match>, StoreError> {
        let sql = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE external_id = ?1");
        let row: Option<MatchRow> = sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn match_participations(&self, match_id: i64) -> Result<Vec<MatchParticipation>, StoreError> {
        let rows: Vec<MatchParticipationRow> = sqlx::query_as(
            "SELECT user_id, match_id, is_winner FROM user_match_participations \
             WHERE match_id = ?1 ORDER BY user_id",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // sync state

    pub async fn sync_state(&self, user_id: i64) -> Result<SyncState, StoreError> {
        let row: Option<SyncStateRow> = sqlx::query_as(
            "SELECT user_id, in_progress, started_at, finished_at, last_status, last_message \
             FROM sync_states WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => SyncState::try_from(row),
            None => Ok(SyncState::idle(user_id)),
        }
    }

    /// Atomically moves the user to in-progress.
    ///
    /// Returns false without touching the row when a sync is already running,
    /// unless that sync started before `now - stale_after`.
    pub async fn try_begin_sync(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let cutoff = now - stale_after;
        let result = sqlx::query(
            r#"
            INSERT INTO sync_states (user_id, in_progress, started_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET
                in_progress = 1,
                started_at = excluded.started_at
            WHERE sync_states.in_progress = 0
               OR sync_states.started_at IS NULL
               OR julianday(sync_states.started_at) < julianday(?3)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let started = result.rows_affected() > 0;
        debug!(user_id, started, "sync start guard evaluated");
        Ok(started)
    }

    pub async fn finish_sync(
        &self,
        user_id: i64,
        status: SyncStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncState, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_states (user_id, in_progress, finished_at, last_status, last_message)
            VALUES (?1, 0, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                in_progress = 0,
                finished_at = excluded.finished_at,
                last_status = excluded.last_status,
                last_message = excluded.last_message
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        self.sync_state(user_id).await
    }

    // read path

    pub async fn win_loss(&self, user_id: i64) -> Result<WinLoss, StoreError> {
        let (wins, losses): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(CASE WHEN is_winner THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN is_winner THEN 0 ELSE 1 END), 0)
              FROM user_match_participations
             WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(WinLoss { wins, losses })
    }

    /// Per-opponent record. Opponents are participants of the same match on
    /// the other side of the result, so doubles partners are not counted.
    pub async fn head_to_head(&self, user_id: i64) -> Result<Vec<OpponentRecord>, StoreError> {
        let rows: Vec<OpponentRow> = sqlx::query_as(
            r#"
            SELECT o.user_id AS opponent_user_id,
                   u.tag AS opponent_tag,
                   SUM(CASE WHEN me.is_winner THEN 1 ELSE 0 END) AS wins,
                   SUM(CASE WHEN me.is_winner THEN 0 ELSE 1 END) AS losses
              FROM user_match_participations me
              JOIN user_match_participations o
                ON o.match_id = me.match_id
               AND o.user_id <> me.user_id
               AND o.is_winner <> me.is_winner
              JOIN users u ON u.id = o.user_id
             WHERE me.user_id = ?1
             GROUP BY o.user_id, u.tag
             ORDER BY COUNT(*) DESC, wins DESC, o.user_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| OpponentRecord {
                opponent_user_id: row.opponent_user_id,
                opponent_tag: row
                    .opponent_tag
                    .filter(|t| !is_blank_tag(t))
                    .unwrap_or_else(|| UNKNOWN_PLAYER_TAG.to_string()),
                wins: row.wins,
                losses: row.losses,
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<EntityCounts, StoreError> {
        let (users, tournaments, events, matches): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM users),
                   (SELECT COUNT(*) FROM tournaments),
                   (SELECT COUNT(*) FROM events),
                   (SELECT COUNT(*) FROM matches)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(EntityCounts {
            users,
            tournaments,
            events,
            matches,
        })
    }
}

fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    email: String,
    remote_id: Option<i64>,
    tag: Option<String>,
    access_token: Option<String>,
    is_placeholder: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            remote_id: row.remote_id,
            tag: row.tag,
            access_token: row.access_token,
            is_placeholder: row.is_placeholder,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TournamentRow {
    id: i64,
    external_id: i64,
    name: Option<String>,
    slug: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    is_online: Option<bool>,
    venue_name: Option<String>,
    venue_address: Option<String>,
    city: Option<String>,
    state: Option<String>,
    country_code: Option<String>,
    images: Option<String>,
    events_count: i64,
}

impl TryFrom<TournamentRow> for Tournament {
    type Error = StoreError;

    fn try_from(row: TournamentRow) -> Result<Self, Self::Error> {
        let images: Vec<TournamentImage> = match row.images.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
                StoreError::InvalidValue(format!("tournament {} images: {e}", row.external_id))
            })?,
            _ => Vec::new(),
        };
        Ok(Self {
            id: row.id,
            external_id: row.external_id,
            name: row.name,
            slug: row.slug,
            start_at: row.start_at,
            end_at: row.end_at,
            is_online: row.is_online,
            venue_name: row.venue_name,
            venue_address: row.venue_address,
            city: row.city,
            state: row.state,
            country_code: row.country_code,
            images,
            events_count: row.events_count,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    external_id: i64,
    tournament_id: i64,
    name: Option<String>,
    slug: Option<String>,
    num_entrants: Option<i64>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            external_id: row.external_id,
            tournament_id: row.tournament_id,
            name: row.name,
            slug: row.slug,
            num_entrants: row.num_entrants,
        }
    }
}

#[derive(Debug, FromRow)]
struct MatchRow {
    id: i64,
    external_id: i64,
    event_id: i64,
    round: Option<String>,
    round_number: Option<i64>,
    identifier: Option<String>,
    full_round_text: Option<String>,
    display_score: Option<String>,
    winner_external_id: Option<i64>,
}

impl From<MatchRow> for Match {
    fn from(row: MatchRow) -> Self {
        Self {
            id: row.id,
            external_id: row.external_id,
            event_id: row.event_id,
            round: row.round,
            round_number: row.round_number,
            identifier: row.identifier,
            full_round_text: row.full_round_text,
            display_score: row.display_score,
            winner_external_id: row.winner_external_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct EventParticipationRow {
    user_id: i64,
    event_id: i64,
    final_placement: Option<i64>,
    entrant_id: Option<i64>,
}

impl From<EventParticipationRow> for EventParticipation {
    fn from(row: EventParticipationRow) -> Self {
        Self {
            user_id: row.user_id,
            event_id: row.event_id,
            final_placement: row.final_placement,
            entrant_id: row.entrant_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct MatchParticipationRow {
    user_id: i64,
    match_id: i64,
    is_winner: bool,
}

impl From<MatchParticipationRow> for MatchParticipation {
    fn from(row: MatchParticipationRow) -> Self {
        Self {
            user_id: row.user_id,
            match_id: row.match_id,
            is_winner: row.is_winner,
        }
    }
}

#[derive(Debug, FromRow)]
struct SyncStateRow {
    user_id: i64,
    in_progress: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_status: Option<String>,
    last_message: Option<String>,
}

impl TryFrom<SyncStateRow> for SyncState {
    type Error = StoreError;

    fn try_from(row: SyncStateRow) -> Result<Self, Self::Error> {
        let last_status = row
            .last_status
            .as_deref()
            .map(SyncStatus::from_str)
            .transpose()
            .map_err(StoreError::InvalidValue)?;
        Ok(Self {
            user_id: row.user_id,
            phase: if row.in_progress {
                SyncPhase::InProgress
            } else {
                SyncPhase::Idle
            },
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_status,
            last_message: row.last_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct OpponentRow {
    opponent_user_id: i64,
    opponent_tag: Option<String>,
    wins: i64,
    losses: i64,
}
