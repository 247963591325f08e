//! Error types for lakesync.
//!
//! All errors that can occur within the synchronizer are represented by
//! [`SyncError`]. Errors are propagated via `Result<T, SyncError>` throughout
//! the codebase.
//!
//! # Error Classification
//!
//! Errors are classified into the taxonomy from the design: connection/auth
//! errors (never retried within a cycle), schema-violation and encoding
//! errors (recovered locally by the bulk writer), transaction-aborted
//! errors (recovered by per-row isolation), cursor stalls (mark the table
//! `ERROR`, resume next cycle), and plain transient errors (retried by the
//! scheduler on the next cycle).
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct encapsulates exponential backoff with jitter.
//! The scheduler uses this to decide whether and when to retry a table whose
//! last cycle ended in a retryable error.

use std::fmt;

/// Primary error type for the synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ── Connection / auth — fail the cycle for this table, don't retry locally ──
    /// The source or lake database could not be reached.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Credentials were rejected by the source or lake.
    #[error("authentication error: {0}")]
    AuthError(String),

    // ── Schema-violation — recover via ALTER + retry once ──────────────
    /// A NOT NULL constraint was violated on upsert; the writer relaxes the
    /// column and retries the batch once.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    // ── Transaction aborted — recover via per-row isolation ─────────────
    /// PG 25P02 ("current transaction is aborted") and siblings.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    // ── Bad encoding — recover via per-row isolation ────────────────────
    /// A malformed literal was rejected by PostgreSQL.
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    // ── Cursor stall — mark ERROR, leave cursor where it is ─────────────
    /// The chunk loop exceeded its iteration or time cap without progress.
    #[error("cursor stall: {0}")]
    CursorStall(String),

    // ── Duplicate PK in batch — caller bug or no-PK CDC duplicate ───────
    /// The same conflict target appeared twice in one VALUES list and was
    /// not collapsed before reaching PostgreSQL.
    #[error("duplicate primary key in batch: {0}")]
    DuplicatePkInBatch(String),

    // ── Transient — always retried by the scheduler ─────────────────────
    /// A statement-level timeout or other transient failure.
    #[error("transient error: {0}")]
    Transient(String),

    // ── Table not found / not configured ────────────────────────────────
    #[error("table not found in catalog: {0}")]
    NotFound(String),

    /// Caller passed an invalid argument (e.g. empty PK column list).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── Internal — should not happen ─────────────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl SyncError {
    /// Whether this error is retryable by the scheduler on the next cycle.
    ///
    /// Connection errors, transient errors, and cursor stalls are
    /// retryable — the underlying condition may clear on its own.
    /// Auth errors, schema mismatches (already recovered or permanently
    /// broken), and internal errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionError(_) | SyncError::Transient(_) | SyncError::CursorStall(_)
        )
    }

    /// Whether this error should count toward suspending a table (i.e. be
    /// surfaced as a real failure rather than a transient hiccup).
    pub fn counts_toward_suspension(&self) -> bool {
        !matches!(self, SyncError::Transient(_))
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Connection,
    Schema,
    Data,
    Internal,
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErrorKind::Connection => write!(f, "CONNECTION"),
            SyncErrorKind::Schema => write!(f, "SCHEMA"),
            SyncErrorKind::Data => write!(f, "DATA"),
            SyncErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl SyncError {
    /// Classify the error for monitoring and alerting.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::ConnectionError(_) | SyncError::AuthError(_) => SyncErrorKind::Connection,
            SyncError::SchemaMismatch(_) => SyncErrorKind::Schema,
            SyncError::TransactionAborted(_)
            | SyncError::BadEncoding(_)
            | SyncError::CursorStall(_)
            | SyncError::DuplicatePkInBatch(_)
            | SyncError::Transient(_)
            | SyncError::NotFound(_)
            | SyncError::InvalidArgument(_) => SyncErrorKind::Data,
            SyncError::InternalError(_) => SyncErrorKind::Internal,
        }
    }

    /// Classify a raw PostgreSQL error message into the writer's recovery
    /// taxonomy (spec §4.3.2 / §7). Returns `None` when no recovery policy
    /// applies and the error should propagate as fatal.
    pub fn classify_pg_message(msg: &str) -> Option<SyncError> {
        if msg.contains("violates not-null constraint") {
            Some(SyncError::SchemaMismatch(msg.to_string()))
        } else if msg.contains("current transaction is aborted") || msg.contains("previously aborted") {
            Some(SyncError::TransactionAborted(msg.to_string()))
        } else if msg.contains("invalid input syntax") || msg.contains("not a valid binary digit") {
            Some(SyncError::BadEncoding(msg.to_string()))
        } else {
            None
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for retryable cycle failures.
///
/// Used by the cycle scheduler to decide whether a failed table should be
/// retried on the very next cycle, deferred, or left for an operator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt
    /// number (0-based). Exponential backoff `base * 2^attempt`, capped at
    /// `max_delay_ms`, with deterministic ±25% jitter by attempt parity.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ── Per-table retry state ───────────────────────────────────────────────────

/// Tracks retry state for a single table in the scheduler.
///
/// Stored in-memory by the scheduler (not persisted). Reset when a cycle
/// succeeds or the process restarts.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Number of consecutive retryable failures.
    pub attempts: u32,
    /// Timestamp (epoch millis) when the next retry is allowed.
    pub next_retry_at_ms: u64,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_retry_at_ms: 0,
        }
    }

    /// Record a retryable failure and compute the next retry time.
    ///
    /// Returns `true` if another retry is allowed, `false` if max attempts
    /// are exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now_ms: u64) -> bool {
        self.attempts += 1;
        if policy.should_retry(self.attempts) {
            self.next_retry_at_ms = now_ms + policy.backoff_ms(self.attempts - 1);
            true
        } else {
            false
        }
    }

    /// Reset retry state after a successful cycle.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at_ms = 0;
    }

    /// Whether the table is currently in a retry-backoff period.
    pub fn is_in_backoff(&self, now_ms: u64) -> bool {
        self.attempts > 0 && now_ms < self.next_retry_at_ms
    }
}
