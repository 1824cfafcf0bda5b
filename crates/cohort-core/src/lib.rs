//! Domain core for the cohort segmentation engine.
//!
//! Holds the data model, the typed error with its closed kind
//! classification, the fixed-format `until` clock rules, percentage
//! sampling, the store traits, the orchestrating services, and the
//! expiration sweeper. Persistence lives behind the store traits; the
//! SQLite implementation is in `cohort-store-sqlite`.

#![allow(clippy::missing_errors_doc)]

use std::fmt::{Display, Formatter};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

pub const MIN_PERCENT: u8 = 1;
pub const MAX_PERCENT: u8 = 100;
pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 3000;
pub const MIN_MONTH: u8 = 1;
pub const MAX_MONTH: u8 = 12;

pub type CohortResult<T> = Result<T, CohortError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CohortError {
    #[error("user not found")]
    UserNotFound,
    #[error("segment not found")]
    SegmentNotFound,
    #[error("user with this username already exists")]
    UsernameTaken,
    #[error("segment with this slug already exists")]
    SlugTaken,
    #[error("{0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Closed classification of [`CohortError`] used by transports to pick a
/// response class and a log level. The `kind` match is exhaustive, so a new
/// error variant cannot ship without a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    Internal,
}

impl CohortError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound | Self::SegmentNotFound => ErrorKind::NotFound,
            Self::UsernameTaken | Self::SlugTaken => ErrorKind::Conflict,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wraps a store-level failure with the name of the failing operation.
    pub fn internal(operation: &str, err: impl Display) -> Self {
        Self::Internal(format!("{operation}: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Data model

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "userID")]
    pub user_id: u64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(rename = "segmentID")]
    pub segment_id: u64,
    pub slug: String,
    pub percent: Option<u8>,
}

/// One entry of the bulk membership upsert: `until` is already normalized
/// to storage form (or absent for a permanent membership).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub segment_id: u64,
    pub until: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Remove,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One membership change event, appended whenever an edge is inserted or
/// deleted. `segment_slug` is resolved at write time and may be empty for
/// edges orphaned by segment deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(rename = "userID")]
    pub user_id: u64,
    pub segment_slug: String,
    pub operation: Operation,
    pub datetime: String,
}

// ---------------------------------------------------------------------------
// Request forms

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

impl NewUser {
    pub fn validate(&self) -> CohortResult<()> {
        for (field, value) in [
            ("username", &self.username),
            ("firstName", &self.first_name),
            ("lastName", &self.last_name),
        ] {
            if value.trim().is_empty() {
                return Err(CohortError::InvalidInput(format!(
                    "field {field} is required"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSegment {
    pub slug: String,
    pub percent: Option<u8>,
}

impl NewSegment {
    pub fn validate(&self) -> CohortResult<()> {
        if self.slug.trim().is_empty() {
            return Err(CohortError::InvalidInput(
                "field slug is required".to_string(),
            ));
        }

        if let Some(percent) = self.percent {
            if !(MIN_PERCENT..=MAX_PERCENT).contains(&percent) {
                return Err(CohortError::InvalidInput(format!(
                    "percent must be in [{MIN_PERCENT}, {MAX_PERCENT}]"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentAssignment {
    pub segment_slug: String,
    pub until: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMemberships {
    #[serde(default)]
    pub segments_to_add: Vec<SegmentAssignment>,
    #[serde(default)]
    pub segments_to_remove: Vec<String>,
}

impl EditMemberships {
    /// Checks every `until` against the wire format. The orchestrator parses
    /// again when it normalizes, so a transport that skips this still cannot
    /// persist a malformed value.
    pub fn validate(&self) -> CohortResult<()> {
        for assignment in &self.segments_to_add {
            if let Some(until) = &assignment.until {
                parse_until(until)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub year: i32,
    pub month: u8,
}

impl HistoryQuery {
    pub fn validate(&self) -> CohortResult<()> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&self.year) {
            return Err(CohortError::InvalidInput(format!(
                "year must be in [{MIN_YEAR}, {MAX_YEAR}]"
            )));
        }

        if !(MIN_MONTH..=MAX_MONTH).contains(&self.month) {
            return Err(CohortError::InvalidInput(format!(
                "month must be in [{MIN_MONTH}, {MAX_MONTH}]"
            )));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock rules for `until`

/// Wire and storage pattern for `until`, shown in validation errors.
pub const UNTIL_PATTERN: &str = "YYYY-MM-DD HH:MM";

const UNTIL_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

/// Fixed wall-clock-to-storage correction applied to every `until` before it
/// is persisted. A deployment constant, never derived from the host
/// timezone; changing it changes observable expiry behavior.
pub const UNTIL_STORAGE_OFFSET: Duration = Duration::hours(3);

pub fn parse_until(value: &str) -> CohortResult<PrimitiveDateTime> {
    PrimitiveDateTime::parse(value, UNTIL_FORMAT).map_err(|_| {
        CohortError::InvalidInput(format!(
            "field until is invalid, expected format {UNTIL_PATTERN}"
        ))
    })
}

pub fn format_until(value: PrimitiveDateTime) -> CohortResult<String> {
    value
        .format(UNTIL_FORMAT)
        .map_err(|err| CohortError::internal("format until", err))
}

/// Parses a wire `until`, subtracts [`UNTIL_STORAGE_OFFSET`], and re-renders
/// in the same format: `"2023-06-01 15:00"` becomes `"2023-06-01 12:00"`.
pub fn normalize_until(value: &str) -> CohortResult<String> {
    format_until(parse_until(value)? - UNTIL_STORAGE_OFFSET)
}

/// Current UTC wall clock, truncated to the resolution `until` carries.
#[must_use]
pub fn now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

// ---------------------------------------------------------------------------
// Percentage sampling

/// Picks `floor(ids.len() * percent / 100)` ids uniformly without
/// replacement. Output order is unspecified and selection is reseeded per
/// call; callers must not rely on determinism.
#[must_use]
pub fn sample_percent(ids: &[u64], percent: u8) -> Vec<u64> {
    let take = ids.len() * usize::from(percent) / 100;
    let mut rng = rand::thread_rng();
    ids.choose_multiple(&mut rng, take).copied().collect()
}

// ---------------------------------------------------------------------------
// Store traits
//
// Every existence check and mutation below is an independent round trip:
// there is no transaction spanning a check and the mutation that follows it.
// The store's own uniqueness constraints are the only backstop for races,
// and implementations must surface those violations as Conflict-kind errors.

pub trait UserDirectory {
    fn insert_user(&self, user: &NewUser) -> CohortResult<u64>;
    fn update_user(&self, user: &User) -> CohortResult<()>;
    fn delete_user(&self, user_id: u64) -> CohortResult<()>;
    fn user_by_id(&self, user_id: u64) -> CohortResult<Option<User>>;
    fn user_by_username(&self, username: &str) -> CohortResult<Option<User>>;
    fn all_user_ids(&self) -> CohortResult<Vec<u64>>;
}

pub trait SegmentCatalog {
    fn insert_segment(&self, segment: &NewSegment) -> CohortResult<u64>;
    /// Deletes the catalog row only. Membership edges referencing the
    /// segment are left behind; see `segments_for_user`, which joins on the
    /// catalog and therefore stops listing them.
    fn delete_segment(&self, slug: &str) -> CohortResult<()>;
    fn segment_by_slug(&self, slug: &str) -> CohortResult<Option<Segment>>;
}

pub trait MembershipStore {
    /// Bulk insert-or-update keyed on (user, segment). An existing row keeps
    /// every field except `until`. All-or-nothing at the statement level.
    fn upsert_memberships(&self, user_id: u64, updates: &[MembershipUpdate]) -> CohortResult<()>;
    /// Bulk insert with no expiration; rows that already exist are left
    /// untouched, so enrollment never clobbers a time-limited membership.
    fn enroll_users(&self, segment_id: u64, user_ids: &[u64]) -> CohortResult<()>;
    /// Deletes matching rows; zero matches is a silent no-op.
    fn remove_memberships(&self, user_id: u64, segment_ids: &[u64]) -> CohortResult<()>;
    fn segments_for_user(&self, user_id: u64) -> CohortResult<Vec<Segment>>;
    /// Deletes every row whose `until` is set and earlier than `now`;
    /// returns the number removed.
    fn purge_expired(&self, now: PrimitiveDateTime) -> CohortResult<usize>;
}

pub trait HistoryStore {
    fn history_for_month(&self, year: i32, month: u8) -> CohortResult<Vec<HistoryRecord>>;
}

// ---------------------------------------------------------------------------
// Orchestrating services

pub struct UserService<D> {
    directory: Arc<D>,
}

impl<D> Clone for UserService<D> {
    fn clone(&self) -> Self {
        Self { directory: Arc::clone(&self.directory) }
    }
}

impl<D: UserDirectory> UserService<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }

    pub fn create_user(&self, form: &NewUser) -> CohortResult<User> {
        form.validate()?;

        if self.directory.user_by_username(&form.username)?.is_some() {
            return Err(CohortError::UsernameTaken);
        }

        let user_id = self.directory.insert_user(form)?;

        Ok(User {
            user_id,
            username: form.username.clone(),
            first_name: form.first_name.clone(),
            last_name: form.last_name.clone(),
        })
    }

    pub fn edit_user(&self, user_id: u64, form: &NewUser) -> CohortResult<User> {
        form.validate()?;

        let mut user = self
            .directory
            .user_by_id(user_id)?
            .ok_or(CohortError::UserNotFound)?;

        if user.username != form.username {
            if self.directory.user_by_username(&form.username)?.is_some() {
                return Err(CohortError::UsernameTaken);
            }

            user.username = form.username.clone();
        }

        user.first_name = form.first_name.clone();
        user.last_name = form.last_name.clone();

        self.directory.update_user(&user)?;

        Ok(user)
    }

    pub fn delete_user(&self, user_id: u64) -> CohortResult<()> {
        self.directory
            .user_by_id(user_id)?
            .ok_or(CohortError::UserNotFound)?;

        self.directory.delete_user(user_id)
    }

    pub fn user_by_id(&self, user_id: u64) -> CohortResult<User> {
        self.directory
            .user_by_id(user_id)?
            .ok_or(CohortError::UserNotFound)
    }
}

pub struct SegmentService<S, D> {
    store: Arc<S>,
    directory: Arc<D>,
}

impl<S, D> Clone for SegmentService<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            directory: Arc::clone(&self.directory),
        }
    }
}

impl<S, D> SegmentService<S, D>
where
    S: SegmentCatalog + MembershipStore,
    D: UserDirectory,
{
    pub fn new(store: Arc<S>, directory: Arc<D>) -> Self {
        Self { store, directory }
    }

    /// Creates the segment, then (for a percent segment) enrolls a random
    /// sample of the current population. The catalog row must exist before
    /// enrollment since the edges reference its id. On a duplicate slug the
    /// directory and the sampler are never consulted.
    pub fn create_segment(&self, form: &NewSegment) -> CohortResult<Segment> {
        form.validate()?;

        if self.store.segment_by_slug(&form.slug)?.is_some() {
            return Err(CohortError::SlugTaken);
        }

        let segment_id = self.store.insert_segment(form)?;
        let segment = Segment {
            segment_id,
            slug: form.slug.clone(),
            percent: form.percent,
        };

        if let Some(percent) = segment.percent {
            let population = self.directory.all_user_ids()?;
            let enroll = sample_percent(&population, percent);
            self.store.enroll_users(segment_id, &enroll)?;
        }

        Ok(segment)
    }

    pub fn delete_segment(&self, slug: &str) -> CohortResult<()> {
        self.store
            .segment_by_slug(slug)?
            .ok_or(CohortError::SegmentNotFound)?;

        self.store.delete_segment(slug)
    }

    pub fn segment_by_slug(&self, slug: &str) -> CohortResult<Segment> {
        self.store
            .segment_by_slug(slug)?
            .ok_or(CohortError::SegmentNotFound)
    }

    pub fn user_segments(&self, user_id: u64) -> CohortResult<Vec<Segment>> {
        self.directory
            .user_by_id(user_id)?
            .ok_or(CohortError::UserNotFound)?;

        self.store.segments_for_user(user_id)
    }

    /// Resolves every slug up front, failing fast on the first unknown one,
    /// then applies the add and remove lists as two independent store calls.
    /// Neither call is rolled back if the other fails.
    pub fn edit_user_segments(
        &self,
        user_id: u64,
        form: &EditMemberships,
    ) -> CohortResult<Vec<Segment>> {
        self.directory
            .user_by_id(user_id)?
            .ok_or(CohortError::UserNotFound)?;

        let mut updates = Vec::with_capacity(form.segments_to_add.len());
        for assignment in &form.segments_to_add {
            let segment = self
                .store
                .segment_by_slug(&assignment.segment_slug)?
                .ok_or(CohortError::SegmentNotFound)?;
            let until = assignment
                .until
                .as_deref()
                .map(normalize_until)
                .transpose()?;
            updates.push(MembershipUpdate {
                segment_id: segment.segment_id,
                until,
            });
        }

        let mut remove_ids = Vec::with_capacity(form.segments_to_remove.len());
        for slug in &form.segments_to_remove {
            let segment = self
                .store
                .segment_by_slug(slug)?
                .ok_or(CohortError::SegmentNotFound)?;
            remove_ids.push(segment.segment_id);
        }

        if !updates.is_empty() {
            self.store.upsert_memberships(user_id, &updates)?;
        }

        if !remove_ids.is_empty() {
            self.store.remove_memberships(user_id, &remove_ids)?;
        }

        self.store.segments_for_user(user_id)
    }
}

// ---------------------------------------------------------------------------
// History export

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryExport {
    pub file_name: String,
    pub csv: String,
}

pub struct HistoryService<H> {
    history: Arc<H>,
}

impl<H> Clone for HistoryService<H> {
    fn clone(&self) -> Self {
        Self { history: Arc::clone(&self.history) }
    }
}

impl<H: HistoryStore> HistoryService<H> {
    pub fn new(history: Arc<H>) -> Self {
        Self { history }
    }

    pub fn month_csv(&self, query: &HistoryQuery) -> CohortResult<HistoryExport> {
        query.validate()?;

        let records = self.history.history_for_month(query.year, query.month)?;

        Ok(HistoryExport {
            file_name: format!("history-{}-{}.csv", query.year, query.month),
            csv: render_history_csv(&records),
        })
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([';', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[must_use]
pub fn render_history_csv(records: &[HistoryRecord]) -> String {
    let mut out = String::from("user_id;slug;operation;datetime\n");
    for record in records {
        out.push_str(&format!(
            "{};{};{};{}\n",
            record.user_id,
            csv_field(&record.segment_slug),
            record.operation,
            csv_field(&record.datetime),
        ));
    }

    out
}

// ---------------------------------------------------------------------------
// Expiration sweeper

pub const DEFAULT_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Background task that purges expired memberships on a fixed interval.
///
/// Owns its worker thread: dropping the handle (or calling [`Sweeper::stop`])
/// wakes the thread and ends the loop, so tests can run it deterministically.
/// In the service the handle is held for the life of the process and never
/// drained on shutdown. Purge failures are logged, never propagated.
pub struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn start<S>(store: Arc<S>, interval: std::time::Duration) -> CohortResult<Self>
    where
        S: MembershipStore + Send + Sync + 'static,
    {
        let (stop, wake) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("membership-sweeper".to_string())
            .spawn(move || sweep_loop(store.as_ref(), interval, &wake))
            .map_err(|err| CohortError::internal("spawn membership sweeper", err))?;

        Ok(Self { stop, handle })
    }

    /// Wakes the worker and joins it. Only tests and orderly teardown call
    /// this; the service leaves the sweeper running.
    pub fn stop(self) {
        let Self { stop, handle } = self;
        drop(stop);
        if handle.join().is_err() {
            tracing::error!("membership sweeper thread panicked");
        }
    }
}

fn sweep_loop<S: MembershipStore>(
    store: &S,
    interval: std::time::Duration,
    wake: &Receiver<()>,
) {
    loop {
        match wake.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        match store.purge_expired(now_utc()) {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "purged expired memberships"),
            Err(err) => tracing::error!(error = %err, "membership sweep failed"),
        }
    }
}
