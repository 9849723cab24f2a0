use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;

pub const TITLE_MAX_LEN: usize = 255;
pub const DESCRIPTION_MAX_LEN: usize = 1000;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_LIMIT: u64 = 10;
pub const MAX_LIMIT: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    /// Returns a copy with every present field of `changes` applied.
    pub fn apply(&self, changes: TodoChanges, now: DateTime<Utc>) -> Todo {
        Todo {
            id: self.id,
            title: changes.title.unwrap_or_else(|| self.title.clone()),
            description: changes
                .description
                .unwrap_or_else(|| self.description.clone()),
            completed: changes.completed.unwrap_or(self.completed),
            created_at: self.created_at,
            updated_at: self.next_update(now),
        }
    }

    pub fn toggled(&self, now: DateTime<Utc>) -> Todo {
        Todo {
            completed: !self.completed,
            updated_at: self.next_update(now),
            ..self.clone()
        }
    }

    // updated_at must move forward even when the clock has not.
    fn next_update(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        }
    }
}

/// Current time at the precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTodo {
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
}

impl NewTodo {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            completed: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Partial update. `description: Some(None)` clears the description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoChanges {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub completed: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Completed,
    Pending,
}

impl StatusFilter {
    pub fn completed(self) -> Option<bool> {
        match self {
            StatusFilter::All => None,
            StatusFilter::Completed => Some(true),
            StatusFilter::Pending => Some(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: StatusFilter,
    pub page: u64,
    pub limit: u64,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: StatusFilter::All,
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl ListQuery {
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: u64,
    pub total_pages: u64,
    pub total_items: u64,
    pub items_per_page: u64,
}

impl Pagination {
    pub fn new(query: &ListQuery, total_items: u64) -> Self {
        Self {
            current_page: query.page,
            total_pages: total_items.div_ceil(query.limit),
            total_items,
            items_per_page: query.limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TodoPage {
    pub todos: Vec<Todo>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total: u64,
    pub completed: u64,
    pub pending: u64,
    pub completion_rate: f64,
}

impl Stats {
    pub fn from_counts(total: u64, completed: u64) -> Self {
        let completion_rate = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        Self {
            total,
            completed,
            pending: total.saturating_sub(completed),
            completion_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl Health {
    pub fn ok() -> Self {
        Self {
            status: "OK",
            timestamp: Utc::now(),
        }
    }
}
