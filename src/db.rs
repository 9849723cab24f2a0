use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::{self, NewTodo, Stats, StatusFilter, Todo, TodoChanges};
use crate::validation::{description_fits, title_fits};

const COLUMNS: &str = "id, title, description, completed, created_at, updated_at";

/// Shared handle to the todo store.
///
/// All statements go through a single connection; each operation holds the
/// lock for its whole read-modify-write.
pub struct Database {
    conn: Mutex<Connection>,
}

pub struct Page {
    pub todos: Vec<Todo>,
    pub total: u64,
}

impl Database {
    pub fn connect<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening database at {}", path.as_ref().display()))?;
        let db = Self::from_connection(conn);
        db.ping().context("database did not answer")?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        let db = Self::from_connection(conn);
        db.ping()?;
        Ok(db)
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn ping(&self) -> StoreResult<()> {
        self.conn()?.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Creates the schema if it is missing. Never drops or alters data.
    pub fn migrate(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS todos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_todos_created_at ON todos (created_at);
            "#,
        )?;
        Ok(())
    }

    pub fn find_page(&self, filter: StatusFilter, limit: u64, offset: u64) -> StoreResult<Page> {
        let (clause, mut args) = filter_clause(filter);
        let conn = self.conn()?;

        let total = count_with(&conn, clause, &args)?;

        args.push(Value::Integer(clamp(limit)));
        args.push(Value::Integer(clamp(offset)));
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM todos {clause} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))?;
        let todos = stmt
            .query_map(params_from_iter(args), todo_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(?filter, limit, offset, total, returned = todos.len(), "listed todos");
        Ok(Page { todos, total })
    }

    pub fn find_by_id(&self, id: i64) -> StoreResult<Option<Todo>> {
        find_with(&*self.conn()?, id)
    }

    pub fn create(&self, new: NewTodo) -> StoreResult<Todo> {
        guard_fields(&new.title, new.description.as_deref())?;

        let now = models::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO todos (title, description, completed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![new.title, new.description, new.completed, format_datetime(&now)],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, "created todo");

        Ok(Todo {
            id,
            title: new.title,
            description: new.description,
            completed: new.completed,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update(&self, id: i64, changes: TodoChanges) -> StoreResult<Todo> {
        let conn = self.conn()?;
        let current = find_with(&conn, id)?.ok_or(StoreError::NotFound)?;
        let updated = current.apply(changes, models::now());
        guard_fields(&updated.title, updated.description.as_deref())?;
        save(&conn, &updated)?;
        debug!(id, "updated todo");
        Ok(updated)
    }

    pub fn toggle(&self, id: i64) -> StoreResult<Todo> {
        let conn = self.conn()?;
        let current = find_with(&conn, id)?.ok_or(StoreError::NotFound)?;
        let toggled = current.toggled(models::now());
        save(&conn, &toggled)?;
        debug!(id, completed = toggled.completed, "toggled todo");
        Ok(toggled)
    }

    pub fn delete(&self, id: i64) -> StoreResult<()> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM todos WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        debug!(id, "deleted todo");
        Ok(())
    }

    pub fn count(&self, filter: StatusFilter) -> StoreResult<u64> {
        let (clause, args) = filter_clause(filter);
        count_with(&*self.conn()?, clause, &args)
    }

    /// Total and completed counts, read together so `completed <= total`.
    pub fn stats(&self) -> StoreResult<Stats> {
        let conn = self.conn()?;
        let (all, _) = filter_clause(StatusFilter::All);
        let total = count_with(&conn, all, &[])?;
        let (done, args) = filter_clause(StatusFilter::Completed);
        let completed = count_with(&conn, done, &args)?;
        Ok(Stats::from_counts(total, completed))
    }

    /// Completed todos, most recently changed first.
    pub fn find_completed(&self) -> StoreResult<Vec<Todo>> {
        self.query_all(&format!(
            "SELECT {COLUMNS} FROM todos WHERE completed = 1 ORDER BY updated_at DESC, id DESC"
        ))
    }

    /// Pending todos, newest first.
    pub fn find_pending(&self) -> StoreResult<Vec<Todo>> {
        self.query_all(&format!(
            "SELECT {COLUMNS} FROM todos WHERE completed = 0 ORDER BY created_at DESC, id DESC"
        ))
    }

    /// Fills an empty table with a handful of sample todos. Returns how many
    /// rows were inserted.
    pub fn seed_demo(&self) -> StoreResult<usize> {
        if self.count(StatusFilter::All)? > 0 {
            return Ok(0);
        }

        let demo = [
            ("Learn Vue.js", "Complete the Vue.js tutorial and build a sample project", false),
            ("Set up Express API", "Create a RESTful API with Express and PostgreSQL", true),
            ("Write unit tests", "Add comprehensive test coverage for the API endpoints", false),
            ("Deploy to production", "Set up CI/CD pipeline and deploy the application", false),
            ("Buy groceries", "Milk, bread, eggs, and vegetables for the week", false),
        ];
        for (title, description, completed) in demo {
            self.create(NewTodo {
                title: title.to_string(),
                description: Some(description.to_string()),
                completed,
            })?;
        }
        Ok(demo.len())
    }

    fn query_all(&self, sql: &str) -> StoreResult<Vec<Todo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let todos = stmt
            .query_map([], todo_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(todos)
    }
}

fn filter_clause(filter: StatusFilter) -> (&'static str, Vec<Value>) {
    match filter.completed() {
        Some(completed) => ("WHERE completed = ?", vec![Value::Integer(completed as i64)]),
        None => ("", Vec::new()),
    }
}

fn count_with(conn: &Connection, clause: &str, args: &[Value]) -> StoreResult<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM todos {clause}"),
        params_from_iter(args),
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn find_with(conn: &Connection, id: i64) -> StoreResult<Option<Todo>> {
    let todo = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM todos WHERE id = ?1"),
            params![id],
            todo_from_row,
        )
        .optional()?;
    Ok(todo)
}

fn save(conn: &Connection, todo: &Todo) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE todos SET title = ?1, description = ?2, completed = ?3, updated_at = ?4
         WHERE id = ?5",
        params![
            todo.title,
            todo.description,
            todo.completed,
            format_datetime(&todo.updated_at),
            todo.id
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

fn guard_fields(title: &str, description: Option<&str>) -> StoreResult<()> {
    let mut problems = Vec::new();
    if title.trim().is_empty() {
        problems.push("title cannot be empty".to_string());
    }
    if !title_fits(title) {
        problems.push("title must be between 1 and 255 characters".to_string());
    }
    if !description.map_or(true, description_fits) {
        problems.push("description cannot exceed 1000 characters".to_string());
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Invalid(problems))
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn todo_from_row(row: &Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        completed: row.get(3)?,
        created_at: parse_datetime(row, 4)?,
        updated_at: parse_datetime(row, 5)?,
    })
}

fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = database();
        db.create(NewTodo::new("keep me")).unwrap();
        db.migrate().unwrap();
        assert_eq!(db.count(StatusFilter::All).unwrap(), 1);
    }

    #[test]
    fn create_assigns_id_and_equal_timestamps() {
        let db = database();
        let todo = db
            .create(NewTodo::new("Buy milk").with_description("2 litres"))
            .unwrap();

        assert!(todo.id >= 1);
        assert!(!todo.completed);
        assert_eq!(todo.created_at, todo.updated_at);
        assert_eq!(db.find_by_id(todo.id).unwrap(), Some(todo));
    }

    #[test]
    fn create_guards_field_lengths() {
        let db = database();
        let err = db.create(NewTodo::new("")).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref problems) if problems.len() == 1));

        let err = db
            .create(NewTodo::new("x".repeat(256)).with_description("y".repeat(1001)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref problems) if problems.len() == 2));
        assert_eq!(db.count(StatusFilter::All).unwrap(), 0);
    }

    #[test]
    fn update_applies_only_present_fields() {
        let db = database();
        let todo = db
            .create(NewTodo::new("Buy milk").with_description("semi-skimmed"))
            .unwrap();

        let updated = db
            .update(
                todo.id,
                TodoChanges {
                    completed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(updated.completed);
        assert_eq!(updated.title, "Buy milk");
        assert_eq!(updated.description.as_deref(), Some("semi-skimmed"));
        assert!(updated.updated_at > todo.updated_at);
        assert_eq!(db.find_by_id(todo.id).unwrap(), Some(updated));
    }

    #[test]
    fn guard_rejects_blank_titles() {
        let db = database();
        let err = db.create(NewTodo::new("   ")).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref problems) if problems == &["title cannot be empty"]));

        let todo = db.create(NewTodo::new("real title")).unwrap();
        let err = db
            .update(
                todo.id,
                TodoChanges {
                    title: Some("\t\n".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(db.find_by_id(todo.id).unwrap().unwrap().title, "real title");
    }

    #[test]
    fn stats_reads_both_counts() {
        let db = database();
        assert_eq!(db.stats().unwrap(), Stats::from_counts(0, 0));

        let first = db.create(NewTodo::new("one")).unwrap();
        db.create(NewTodo::new("two")).unwrap();
        db.toggle(first.id).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!((stats.total, stats.completed, stats.pending), (2, 1, 1));
        assert_eq!(stats.completion_rate, 50.0);
    }

    #[test]
    fn update_rejects_oversized_title() {
        let db = database();
        let todo = db.create(NewTodo::new("short")).unwrap();
        let err = db
            .update(
                todo.id,
                TodoChanges {
                    title: Some("t".repeat(300)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(db.find_by_id(todo.id).unwrap().unwrap().title, "short");
    }

    #[test]
    fn missing_ids_are_not_found() {
        let db = database();
        assert_eq!(db.find_by_id(99).unwrap(), None);
        assert!(matches!(db.toggle(99), Err(StoreError::NotFound)));
        assert!(matches!(db.delete(99), Err(StoreError::NotFound)));
        assert!(matches!(
            db.update(99, TodoChanges::default()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn toggle_flips_and_moves_updated_at() {
        let db = database();
        let todo = db.create(NewTodo::new("flip")).unwrap();

        let once = db.toggle(todo.id).unwrap();
        let twice = db.toggle(todo.id).unwrap();

        assert!(once.completed);
        assert!(!twice.completed);
        assert!(once.updated_at > todo.updated_at);
        assert!(twice.updated_at > once.updated_at);
        assert_eq!(twice.created_at, todo.created_at);
    }

    #[test]
    fn delete_removes_row() {
        let db = database();
        let todo = db.create(NewTodo::new("gone soon")).unwrap();
        db.delete(todo.id).unwrap();
        assert_eq!(db.find_by_id(todo.id).unwrap(), None);
    }

    #[test]
    fn find_page_filters_orders_and_counts() {
        let db = database();
        for i in 0..5 {
            let todo = db.create(NewTodo::new(format!("todo {i}"))).unwrap();
            if i % 2 == 0 {
                db.toggle(todo.id).unwrap();
            }
        }

        let page = db.find_page(StatusFilter::All, 2, 0).unwrap();
        assert_eq!(page.total, 5);
        let titles: Vec<_> = page.todos.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["todo 4", "todo 3"]);

        let last = db.find_page(StatusFilter::All, 2, 4).unwrap();
        assert_eq!(last.todos.len(), 1);
        assert_eq!(last.todos[0].title, "todo 0");

        let completed = db.find_page(StatusFilter::Completed, 10, 0).unwrap();
        assert_eq!(completed.total, 3);
        assert!(completed.todos.iter().all(|t| t.completed));

        let pending = db.find_page(StatusFilter::Pending, 10, 0).unwrap();
        assert_eq!(pending.total, 2);
        assert!(pending.todos.iter().all(|t| !t.completed));
    }

    #[test]
    fn find_page_past_the_end_is_empty() {
        let db = database();
        db.create(NewTodo::new("only")).unwrap();
        let page = db.find_page(StatusFilter::All, 10, u64::MAX).unwrap();
        assert!(page.todos.is_empty());
        assert_eq!(page.total, 1);
    }

    #[test]
    fn canned_queries_split_by_completion() {
        let db = database();
        let first = db.create(NewTodo::new("first")).unwrap();
        let second = db.create(NewTodo::new("second")).unwrap();
        db.create(NewTodo::new("third")).unwrap();
        db.toggle(second.id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.toggle(first.id).unwrap();

        let completed: Vec<_> = db
            .find_completed()
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(completed, vec!["first", "second"]);

        let pending: Vec<_> = db
            .find_pending()
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(pending, vec!["third"]);
    }

    #[test]
    fn seed_demo_only_fills_empty_table() {
        let db = database();
        assert_eq!(db.seed_demo().unwrap(), 5);
        assert_eq!(db.count(StatusFilter::Completed).unwrap(), 1);
        assert_eq!(db.seed_demo().unwrap(), 0);
        assert_eq!(db.count(StatusFilter::All).unwrap(), 5);
    }

    #[test]
    fn queries_fail_without_schema() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.count(StatusFilter::All), Err(StoreError::Sqlite(_))));
    }
}
