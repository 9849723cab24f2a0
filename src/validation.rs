//! Request validation.
//!
//! Every rule set inspects raw request input and either yields the typed value
//! the data-access layer expects or the complete list of rule violations.
//! Nothing here touches storage.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    ListQuery, NewTodo, StatusFilter, TodoChanges, DEFAULT_LIMIT, DEFAULT_PAGE,
    DESCRIPTION_MAX_LEN, MAX_LIMIT, TITLE_MAX_LEN,
};

const TITLE_REQUIRED: &str = "Title is required";
const TITLE_LENGTH: &str = "Title must be between 1 and 255 characters";
const DESCRIPTION_LENGTH: &str = "Description cannot exceed 1000 characters";
const COMPLETED_BOOLEAN: &str = "Completed must be a boolean value";
const ID_POSITIVE: &str = "ID must be a positive integer";
const STATUS_VALUES: &str = "Status must be either \"completed\" or \"pending\"";
const PAGE_POSITIVE: &str = "Page must be a positive integer";
const LIMIT_RANGE: &str = "Limit must be between 1 and 100";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: &'static str,
    pub message: &'static str,
}

impl Violation {
    pub fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

pub type Checked<T> = Result<T, Vec<Violation>>;

/// Raw query string of the list endpoint, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

pub fn create(body: &Value) -> Checked<NewTodo> {
    let mut violations = Vec::new();

    let title = text(body.get("title"));
    if title.as_deref().map_or(true, str::is_empty) {
        violations.push(Violation::new("title", TITLE_REQUIRED));
    }
    if !title_fits(title.as_deref().unwrap_or_default()) {
        violations.push(Violation::new("title", TITLE_LENGTH));
    }

    let description = optional_description(body, &mut violations);
    let completed = optional_completed(body, &mut violations);

    if !violations.is_empty() {
        return Err(violations);
    }
    Ok(NewTodo {
        title: title.map(Cow::into_owned).unwrap_or_default(),
        description: description.flatten(),
        completed: completed.unwrap_or(false),
    })
}

pub fn update(body: &Value) -> Checked<TodoChanges> {
    let mut violations = Vec::new();

    let title = match body.get("title") {
        None => None,
        Some(value) => {
            let title = text(Some(value)).map(Cow::into_owned).unwrap_or_default();
            if !title_fits(&title) {
                violations.push(Violation::new("title", TITLE_LENGTH));
            }
            Some(title)
        }
    };

    let description = optional_description(body, &mut violations);
    let completed = optional_completed(body, &mut violations);

    if !violations.is_empty() {
        return Err(violations);
    }
    Ok(TodoChanges {
        title,
        description,
        completed,
    })
}

pub fn id(raw: &str) -> Checked<i64> {
    match raw.parse::<i64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(vec![Violation::new("id", ID_POSITIVE)]),
    }
}

pub fn list_query(params: &ListParams) -> Checked<ListQuery> {
    let mut violations = Vec::new();

    let filter = match params.status.as_deref() {
        None => StatusFilter::All,
        Some("completed") => StatusFilter::Completed,
        Some("pending") => StatusFilter::Pending,
        Some(_) => {
            violations.push(Violation::new("status", STATUS_VALUES));
            StatusFilter::All
        }
    };

    let page = match params.page.as_deref().map(str::parse::<u64>) {
        None => DEFAULT_PAGE,
        Some(Ok(page)) if page >= 1 => page,
        Some(_) => {
            violations.push(Violation::new("page", PAGE_POSITIVE));
            DEFAULT_PAGE
        }
    };

    let limit = match params.limit.as_deref().map(str::parse::<u64>) {
        None => DEFAULT_LIMIT,
        Some(Ok(limit)) if (1..=MAX_LIMIT).contains(&limit) => limit,
        Some(_) => {
            violations.push(Violation::new("limit", LIMIT_RANGE));
            DEFAULT_LIMIT
        }
    };

    if !violations.is_empty() {
        return Err(violations);
    }
    Ok(ListQuery {
        filter,
        page,
        limit,
    })
}

/// Combines two independently checked inputs, keeping every violation.
pub fn both<A, B>(a: Checked<A>, b: Checked<B>) -> Checked<(A, B)> {
    match (a, b) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(mut a), Err(b)) => {
            a.extend(b);
            Err(a)
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

pub fn title_fits(title: &str) -> bool {
    (1..=TITLE_MAX_LEN).contains(&title.chars().count())
}

pub fn description_fits(description: &str) -> bool {
    description.chars().count() <= DESCRIPTION_MAX_LEN
}

// `Some(None)` means an explicit null, which clears the field.
fn optional_description(body: &Value, violations: &mut Vec<Violation>) -> Option<Option<String>> {
    let value = body.get("description")?;
    let description = text(Some(value)).map(Cow::into_owned);
    if !description_fits(description.as_deref().unwrap_or_default()) {
        violations.push(Violation::new("description", DESCRIPTION_LENGTH));
    }
    Some(description)
}

fn optional_completed(body: &Value, violations: &mut Vec<Violation>) -> Option<bool> {
    let value = body.get("completed")?;
    let completed = boolean(value);
    if completed.is_none() {
        violations.push(Violation::new("completed", COMPLETED_BOOLEAN));
    }
    completed
}

fn text(value: Option<&Value>) -> Option<Cow<'_, str>> {
    match value? {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

fn boolean(value: &Value) -> Option<bool> {
    if let Value::Bool(b) = value {
        return Some(*b);
    }
    match &*text(Some(value))? {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
