//! Contracts shared by the workspace and run services.
//!
//! The scheduler only ever talks to workspaces and runs through the
//! [`WorkspaceService`](crate::workspace::WorkspaceService) and
//! [`RunService`](crate::run::RunService) traits; this module holds the
//! pagination and error types those traits share.

use std::future::Future;

use thiserror::Error;

use crate::db::DbError;
use crate::workspace::LockError;

/// Largest page a listing will return.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors returned by workspace and run services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("run {run_id} has status {status}; expected {expected}")]
    InvalidRunStatus {
        run_id: String,
        status: String,
        expected: &'static str,
    },

    #[error("database error: {0}")]
    Database(#[from] DbError),
}

impl ServiceError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns true if the resource no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if a lock attempt was rejected because of the current holder.
    pub fn is_already_locked(&self) -> bool {
        matches!(self, Self::Lock(LockError::AlreadyLocked))
    }

    /// Returns true if a run was not in the status an operation requires.
    pub fn is_invalid_run_status(&self) -> bool {
        matches!(self, Self::InvalidRunStatus { .. })
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        ServiceError::Database(DbError::Query(err))
    }
}

/// Page selection for list operations. Page numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub page_number: u32,
    pub page_size: u32,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: MAX_PAGE_SIZE,
        }
    }
}

impl PageOptions {
    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Number of items preceding this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.max(1) - 1) * u64::from(self.limit())
    }
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub current_page: u32,
    pub total_pages: u32,
    pub total_count: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, opts: PageOptions, total_count: u64) -> Self {
        let limit = u64::from(opts.limit());
        let total_pages = u32::try_from(total_count.div_ceil(limit)).unwrap_or(u32::MAX);
        Self {
            items,
            current_page: opts.page_number.max(1),
            total_pages,
            total_count,
        }
    }

    /// The next page number, if there is one.
    pub fn next_page(&self) -> Option<u32> {
        (self.current_page < self.total_pages).then(|| self.current_page + 1)
    }
}

/// Fetch every page of a listing and concatenate the items.
pub async fn list_all<T, F, Fut>(mut fetch: F) -> ServiceResult<Vec<T>>
where
    F: FnMut(PageOptions) -> Fut,
    Fut: Future<Output = ServiceResult<Page<T>>>,
{
    let mut opts = PageOptions::default();
    let mut items = Vec::new();
    loop {
        let page = fetch(opts).await?;
        let next = page.next_page();
        items.extend(page.items);
        match next {
            Some(page_number) => opts.page_number = page_number,
            None => return Ok(items),
        }
    }
}
