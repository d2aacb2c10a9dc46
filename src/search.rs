//! Filterable full-text search over projected index rows.
//!
//! The SQL is assembled by [`SearchSql`], which AND-composes optional clauses in
//! a fixed order (types, page range, character, scene, tags) with every user
//! value bound as a parameter. The same builder drives the local index and the
//! server's project-scoped tables, so both sides answer a query identically.

use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::index_db::IndexStore;
use crate::projection::DocType;

pub(crate) const DEFAULT_LIMIT: usize = 100;
pub(crate) const MAX_LIMIT: usize = 1_000;
const SNIPPET_TOKENS: i64 = 12;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) character: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) scene: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) page_from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) page_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SearchResult {
    pub(crate) doc_id: String,
    #[serde(rename = "type")]
    pub(crate) doc_type: String,
    pub(crate) path: String,
    #[serde(default)]
    pub(crate) page_id: Option<String>,
    #[serde(default)]
    pub(crate) snippet: Option<String>,
}

/// One query/result contract, several stores.
pub(crate) trait SearchBackend {
    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>>;
    fn where_used(&self, doc_id: &str) -> Result<Vec<SearchResult>>;
    fn where_used_by_path(&self, path: &str) -> Result<Vec<SearchResult>>;
}

/// Table names and optional scoping column for a concrete store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchTables {
    pub(crate) docs: &'static str,
    pub(crate) fts: &'static str,
    pub(crate) crossrefs: &'static str,
    /// Column present on `docs` and `crossrefs` that partitions rows (e.g. `project_id`).
    pub(crate) scope_column: Option<&'static str>,
}

pub(crate) const LOCAL_TABLES: SearchTables = SearchTables {
    docs: "search_docs",
    fts: "search_fts",
    crossrefs: "crossrefs",
    scope_column: None,
};

/// A query after validation and normalization.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValidQuery {
    pub(crate) fts: Option<String>,
    pub(crate) character: Option<String>,
    pub(crate) scene: Option<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) types: Vec<DocType>,
    pub(crate) page_from: Option<i64>,
    pub(crate) page_to: Option<i64>,
    pub(crate) limit: i64,
    pub(crate) offset: i64,
}

impl SearchQuery {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub(crate) fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<ValidQuery> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(VaultError::invalid(format!("limit must be between 1 and {MAX_LIMIT}")));
        }
        let limit = i64::try_from(limit)
            .map_err(|_| VaultError::invalid(format!("limit must be between 1 and {MAX_LIMIT}")))?;
        let offset = self.offset.unwrap_or(0);
        let offset = i64::try_from(offset)
            .map_err(|_| VaultError::invalid(format!("offset {offset} exceeds {}", i64::MAX)))?;
        if let (Some(from), Some(to)) = (self.page_from, self.page_to) {
            if from > to {
                return Err(VaultError::invalid(format!("page range {from}..{to} is inverted")));
            }
        }

        let fts = match self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => {
                let expr = fts_expression(text);
                if expr.is_empty() {
                    return Err(VaultError::invalid(format!("no searchable terms in {text:?}")));
                }
                Some(expr)
            }
            None => None,
        };

        let mut tags = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            let tag = tag.trim().trim_start_matches('@').to_lowercase();
            if tag.is_empty() {
                return Err(VaultError::invalid("empty tag in filter"));
            }
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let mut types = Vec::with_capacity(self.types.len());
        for raw in &self.types {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(VaultError::invalid("empty type in filter"));
            }
            let Some(doc_type) = DocType::parse(raw) else {
                return Err(VaultError::invalid(format!("unknown document type: {raw}")));
            };
            if !types.contains(&doc_type) {
                types.push(doc_type);
            }
        }

        Ok(ValidQuery {
            fts,
            character: non_empty(self.character.as_deref()),
            scene: non_empty(self.scene.as_deref()),
            tags,
            types,
            page_from: self.page_from,
            page_to: self.page_to,
            limit,
            offset,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Quote every alphanumeric term so FTS5 syntax in user input is inert.
/// Terms are implicitly ANDed.
pub(crate) fn fts_expression(text: &str) -> String {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn fold(value: &str) -> String {
    value.to_lowercase()
}

/// Install `fold(text)`, a Unicode-aware `lower()`. SQLite's own `lower()`
/// only folds ASCII.
pub(crate) fn register_fold(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "fold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<String> = ctx.get(0)?;
            Ok(value.map(|v| fold(&v)))
        },
    )?;
    Ok(())
}

const ORDER_BY: &str = "ORDER BY d.page_number IS NULL, d.page_number, d.doc_id";

pub(crate) struct SearchSql {
    conditions: Vec<String>,
    bind_values: Vec<Value>,
}

impl SearchSql {
    fn new() -> Self {
        Self {
            conditions: Vec::new(),
            bind_values: Vec::new(),
        }
    }

    /// Bind a value and return its `?N` placeholder.
    fn bind(&mut self, value: impl Into<Value>) -> String {
        self.bind_values.push(value.into());
        format!("?{}", self.bind_values.len())
    }

    fn scope(&mut self, alias: &str, tables: &SearchTables, scope: Option<&str>) {
        if let (Some(column), Some(value)) = (tables.scope_column, scope) {
            let p = self.bind(value.to_string());
            self.conditions.push(format!("{alias}.{column} = {p}"));
        }
    }

    fn filters(&mut self, query: &ValidQuery) {
        if !query.types.is_empty() {
            let placeholders: Vec<String> = query
                .types
                .iter()
                .map(|t| self.bind(t.as_str().to_string()))
                .collect();
            self.conditions
                .push(format!("d.doc_type IN ({})", placeholders.join(", ")));
        }
        if let Some(from) = query.page_from {
            let p = self.bind(from);
            self.conditions.push(format!("d.page_number >= {p}"));
        }
        if let Some(to) = query.page_to {
            let p = self.bind(to);
            self.conditions.push(format!("d.page_number <= {p}"));
        }
        if let Some(character) = &query.character {
            let folded = like_escape(&fold(character));
            let id = self.bind(character.clone());
            let attribution = self.bind(format!("%{folded}:%"));
            let token = self.bind(format!("%character:{folded}%"));
            self.conditions.push(format!(
                "(d.character_id = {id} \
                 OR fold(d.text) LIKE {attribution} ESCAPE '\\' \
                 OR fold(d.path) LIKE {token} ESCAPE '\\')"
            ));
        }
        if let Some(scene) = &query.scene {
            let folded = like_escape(&fold(scene));
            let token = self.bind(format!("%location:{folded}%"));
            let text = self.bind(format!("%{folded}%"));
            self.conditions.push(format!(
                "(fold(d.path) LIKE {token} ESCAPE '\\' OR fold(d.text) LIKE {text} ESCAPE '\\')"
            ));
        }
        for tag in &query.tags {
            let p = self.bind(format!("% {} %", like_escape(tag)));
            self.conditions.push(format!("d.tags LIKE {p} ESCAPE '\\'"));
        }
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    fn page(&mut self, query: &ValidQuery) -> String {
        let limit = self.bind(query.limit);
        let offset = self.bind(query.offset);
        format!("LIMIT {limit} OFFSET {offset}")
    }

    /// Build the statement for `query` against `tables`.
    pub(crate) fn search(tables: &SearchTables, scope: Option<&str>, query: &ValidQuery) -> (String, Vec<Value>) {
        let mut sql = Self::new();
        let fts = tables.fts;
        let docs = tables.docs;
        let statement = match &query.fts {
            Some(expr) => {
                let m = sql.bind(expr.clone());
                sql.conditions.push(format!("{fts} MATCH {m}"));
                sql.scope("d", tables, scope);
                sql.filters(query);
                let page = sql.page(query);
                format!(
                    "SELECT d.doc_id, d.doc_type, d.path, d.page_id,
                            snippet({fts}, 0, '[', ']', '…', {SNIPPET_TOKENS})
                     FROM {fts} JOIN {docs} d ON d.id = {fts}.rowid
                     {} {ORDER_BY} {page}",
                    sql.where_clause()
                )
            }
            None => {
                sql.scope("d", tables, scope);
                sql.filters(query);
                let page = sql.page(query);
                format!(
                    "SELECT d.doc_id, d.doc_type, d.path, d.page_id, NULL
                     FROM {docs} d {} {ORDER_BY} {page}",
                    sql.where_clause()
                )
            }
        };
        (statement, sql.bind_values)
    }

    /// Documents referencing `target` (a doc id) or any doc at `target` (a path).
    pub(crate) fn where_used(tables: &SearchTables, scope: Option<&str>, target: WhereUsed<'_>) -> (String, Vec<Value>) {
        let mut sql = Self::new();
        let docs = tables.docs;
        let crossrefs = tables.crossrefs;
        match target {
            WhereUsed::DocId(id) => {
                let p = sql.bind(id.to_string());
                sql.conditions.push(format!("x.to_id = {p}"));
            }
            WhereUsed::Path(path) => {
                let p = sql.bind(path.to_string());
                let mut inner = format!("SELECT t.doc_id FROM {docs} t WHERE t.path = {p}");
                if let (Some(column), Some(value)) = (tables.scope_column, scope) {
                    let s = sql.bind(value.to_string());
                    inner.push_str(&format!(" AND t.{column} = {s}"));
                }
                sql.conditions.push(format!("x.to_id IN ({inner})"));
            }
        }
        sql.scope("x", tables, scope);
        let join_scope = match tables.scope_column {
            Some(column) => format!(" AND d.{column} = x.{column}"),
            None => String::new(),
        };
        let statement = format!(
            "SELECT DISTINCT d.doc_id, d.doc_type, d.path, d.page_id, NULL, d.page_number
             FROM {crossrefs} x JOIN {docs} d ON d.doc_id = x.from_id{join_scope}
             {} {ORDER_BY}",
            sql.where_clause()
        );
        (statement, sql.bind_values)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WhereUsed<'a> {
    DocId(&'a str),
    Path(&'a str),
}

pub(crate) fn run(conn: &Connection, statement: &str, bind_values: Vec<Value>) -> Result<Vec<SearchResult>> {
    let mut stmt = conn.prepare(statement)?;
    let rows = stmt.query_map(params_from_iter(bind_values), |row| {
        Ok(SearchResult {
            doc_id: row.get(0)?,
            doc_type: row.get(1)?,
            path: row.get(2)?,
            page_id: row.get(3)?,
            snippet: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn search_with(
    conn: &Connection,
    tables: &SearchTables,
    scope: Option<&str>,
    query: &SearchQuery,
) -> Result<Vec<SearchResult>> {
    let valid = query.validate()?;
    let (statement, bind_values) = SearchSql::search(tables, scope, &valid);
    run(conn, &statement, bind_values)
}

pub(crate) fn where_used_with(
    conn: &Connection,
    tables: &SearchTables,
    scope: Option<&str>,
    target: WhereUsed<'_>,
) -> Result<Vec<SearchResult>> {
    let (statement, bind_values) = SearchSql::where_used(tables, scope, target);
    run(conn, &statement, bind_values)
}

impl SearchBackend for IndexStore {
    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let conn = self.connect()?;
        search_with(&conn, &LOCAL_TABLES, None, query)
    }

    fn where_used(&self, doc_id: &str) -> Result<Vec<SearchResult>> {
        let conn = self.connect()?;
        where_used_with(&conn, &LOCAL_TABLES, None, WhereUsed::DocId(doc_id))
    }

    fn where_used_by_path(&self, path: &str) -> Result<Vec<SearchResult>> {
        let conn = self.connect()?;
        where_used_with(&conn, &LOCAL_TABLES, None, WhereUsed::Path(path))
    }
}
