//! Knowledge graph stored beside the chunk index.
//!
//! Entities are named nodes with a free-form type; relations are directed,
//! named edges between two entities. Both live in the same SQLite file as
//! the index. Sync never writes them, and a full reindex copies them into
//! the rebuilt file before it replaces the live one.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::MemoryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEntity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphRelation {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub description: Option<String>,
    pub updated_at: i64,
}

/// Input for [`KnowledgeGraph::add_entity`]. Without an `id` a new one is
/// generated; with one, the existing entity is updated in place.
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub id: Option<String>,
    pub name: String,
    pub entity_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRelation {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One edge seen from a given entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphConnection {
    pub relation: String,
    pub direction: Direction,
    /// The entity at the other end.
    pub other: GraphEntity,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WholeGraph {
    pub nodes: Vec<GraphEntity>,
    pub edges: Vec<GraphRelation>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn entity_from_row(row: &sqlx::sqlite::SqliteRow) -> GraphEntity {
    GraphEntity {
        id: row.get("id"),
        name: row.get("name"),
        entity_type: row.get("type"),
        description: row.get("description"),
        updated_at: row.get("updated_at"),
    }
}

/// `%`, `_` and the escape character itself are literal in a search query.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Graph operations over one index database.
pub struct KnowledgeGraph<'a> {
    pool: &'a SqlitePool,
}

impl<'a> KnowledgeGraph<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update an entity. Returns its id.
    pub async fn add_entity(&self, entity: &NewEntity) -> Result<String> {
        let name = entity.name.trim();
        let entity_type = entity.entity_type.trim();
        if name.is_empty() || entity_type.is_empty() {
            bail!("graph entity needs a name and a type");
        }
        let id = non_blank(entity.id.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO entities (id, name, type, description, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                type = excluded.type,
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(entity_type)
        .bind(non_blank(entity.description.as_deref()))
        .bind(now)
        .execute(self.pool)
        .await
        .context("Failed to store graph entity")?;
        Ok(id)
    }

    /// Insert or update a relation. Both endpoints must already exist.
    pub async fn add_relation(&self, relation: &NewRelation) -> Result<()> {
        let name = relation.relation.trim();
        if name.is_empty() {
            bail!("graph relation needs a name");
        }
        for id in [&relation.source_id, &relation.target_id] {
            if self.entity(id).await?.is_none() {
                return Err(MemoryError::UnknownEntity(id.clone()).into());
            }
        }
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO relations (source_id, target_id, relation, description, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_id, target_id, relation) DO UPDATE SET
                description = excluded.description,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&relation.source_id)
        .bind(&relation.target_id)
        .bind(name)
        .bind(non_blank(relation.description.as_deref()))
        .bind(now)
        .execute(self.pool)
        .await
        .context("Failed to store graph relation")?;
        Ok(())
    }

    pub async fn entity(&self, id: &str) -> Result<Option<GraphEntity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(row.as_ref().map(entity_from_row))
    }

    /// Exact, case-insensitive name lookup. With duplicate names the most
    /// recently updated entity wins.
    pub async fn find_entity(&self, name: &str) -> Result<Option<GraphEntity>> {
        let row = sqlx::query(
            "SELECT * FROM entities WHERE lower(name) = lower(?) ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(name.trim())
        .fetch_optional(self.pool)
        .await?;
        Ok(row.as_ref().map(entity_from_row))
    }

    /// Entities whose name contains `query`, ignoring ASCII case.
    pub async fn search_entities(&self, query: &str, limit: usize) -> Result<Vec<GraphEntity>> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM entities WHERE name LIKE ? ESCAPE '\\' ORDER BY name, id LIMIT ?",
        )
        .bind(like_pattern(query))
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.iter().map(entity_from_row).collect())
    }

    /// Outgoing edges first, then incoming ones.
    pub async fn connections(&self, entity_id: &str) -> Result<Vec<GraphConnection>> {
        let mut connections = Vec::new();
        for (direction, join, filter) in [
            (Direction::Outgoing, "r.target_id", "r.source_id"),
            (Direction::Incoming, "r.source_id", "r.target_id"),
        ] {
            let sql = format!(
                r#"
                SELECT r.relation, r.description AS relation_description,
                       e.id, e.name, e.type, e.description, e.updated_at
                FROM relations r
                JOIN entities e ON {join} = e.id
                WHERE {filter} = ?
                ORDER BY r.relation, e.name
                "#
            );
            let rows = sqlx::query(&sql).bind(entity_id).fetch_all(self.pool).await?;
            connections.extend(rows.iter().map(|row| GraphConnection {
                relation: row.get("relation"),
                direction,
                other: entity_from_row(row),
                description: row.get("relation_description"),
            }));
        }
        Ok(connections)
    }

    /// Describe the named entities and their immediate connections as plain
    /// text for a prompt. Unknown names are skipped.
    pub async fn graph_context(&self, names: &[String]) -> Result<String> {
        let mut lines = Vec::new();
        for name in names {
            let Some(entity) = self.find_entity(name).await? else {
                continue;
            };
            let connections = self.connections(&entity.id).await?;
            render_entity(&mut lines, &entity, &connections);
        }
        Ok(lines.join("\n"))
    }

    pub async fn whole_graph(&self) -> Result<WholeGraph> {
        let nodes = sqlx::query("SELECT * FROM entities ORDER BY name, id")
            .fetch_all(self.pool)
            .await?
            .iter()
            .map(entity_from_row)
            .collect();
        let edges = sqlx::query(
            "SELECT * FROM relations ORDER BY source_id, target_id, relation",
        )
        .fetch_all(self.pool)
        .await?
        .iter()
        .map(|row| GraphRelation {
            source_id: row.get("source_id"),
            target_id: row.get("target_id"),
            relation: row.get("relation"),
            description: row.get("description"),
            updated_at: row.get("updated_at"),
        })
        .collect();
        Ok(WholeGraph { nodes, edges })
    }
}

fn render_entity(lines: &mut Vec<String>, entity: &GraphEntity, connections: &[GraphConnection]) {
    lines.push(format!("Entity: {} ({})", entity.name, entity.entity_type));
    if let Some(description) = &entity.description {
        lines.push(format!("  Description: {}", description));
    }
    if !connections.is_empty() {
        lines.push("  Connections:".to_string());
        for c in connections {
            let relation = match c.direction {
                Direction::Outgoing => c.relation.clone(),
                Direction::Incoming => format!("(inverse) {}", c.relation),
            };
            let mut line = format!(
                "    - {} -> {} ({})",
                relation, c.other.name, c.other.entity_type
            );
            if let Some(note) = &c.description {
                line.push_str(&format!(" NOTE: {}", note));
            }
            lines.push(line);
        }
    }
    lines.push(String::new());
}

/// Copy every entity and relation from `from` into `to`, replacing rows with
/// the same key. Returns the number of rows copied.
pub async fn copy_graph(from: &SqlitePool, to: &SqlitePool) -> Result<u64> {
    let entities = sqlx::query("SELECT id, name, type, description, updated_at FROM entities")
        .fetch_all(from)
        .await
        .context("Failed to read graph entities")?;
    let relations = sqlx::query(
        "SELECT source_id, target_id, relation, description, updated_at FROM relations",
    )
    .fetch_all(from)
    .await
    .context("Failed to read graph relations")?;

    let mut tx = to.begin().await?;
    for row in &entities {
        sqlx::query(
            "INSERT OR REPLACE INTO entities (id, name, type, description, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(row.get::<String, _>("id"))
        .bind(row.get::<String, _>("name"))
        .bind(row.get::<String, _>("type"))
        .bind(row.get::<Option<String>, _>("description"))
        .bind(row.get::<i64, _>("updated_at"))
        .execute(&mut *tx)
        .await?;
    }
    for row in &relations {
        sqlx::query(
            "INSERT OR REPLACE INTO relations (source_id, target_id, relation, description, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(row.get::<String, _>("source_id"))
        .bind(row.get::<String, _>("target_id"))
        .bind(row.get::<String, _>("relation"))
        .bind(row.get::<Option<String>, _>("description"))
        .bind(row.get::<i64, _>("updated_at"))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok((entities.len() + relations.len()) as u64)
}
