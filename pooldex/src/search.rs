//! Search over the index for pool browsers.
//!
//! [`ItemQuery`] covers a fixed set of filters (type, name prefix, tag set,
//! pool, overridden rows). The SQL is assembled from those filters only and
//! every user supplied value is bound as a parameter. A tag filter matches
//! items carrying all requested tags. Results are ordered by name, then uuid,
//! then pool precedence, so paging with `limit`/`offset` is deterministic.

use rusqlite::types::Type;
use serde::Serialize;
use uuid::Uuid;

use crate::db::{extra_columns, read_item_row, AttrValue, ItemRow, PoolIndex, Result};
use crate::item::ObjectType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemQuery {
    object_type: ObjectType,
    name_prefix: Option<String>,
    tags: Vec<String>,
    pool: Option<Uuid>,
    include_overridden: bool,
    limit: Option<usize>,
    offset: usize,
}

/// One search result with the item's tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub row: ItemRow,
    pub tags: Vec<String>,
}

impl ItemQuery {
    pub fn new(object_type: ObjectType) -> Self {
        Self {
            object_type,
            name_prefix: None,
            tags: Vec::new(),
            pool: None,
            include_overridden: true,
            limit: None,
            offset: 0,
        }
    }

    /// Case-insensitive (ASCII) name prefix. Empty matches everything.
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.name_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tags.sort();
        self.tags.dedup();
        self
    }

    pub fn pool(mut self, pool: Uuid) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Hide rows shadowed by a higher-precedence pool.
    pub fn hide_overridden(mut self) -> Self {
        self.include_overridden = false;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// SQL text and its positional parameters.
    fn to_sql(&self) -> (String, Vec<AttrValue>) {
        let table = self.object_type.table();
        let mut columns = vec!["t.uuid", "t.pool_uuid", "t.name", "t.filename", "t.overridden"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        columns.extend(extra_columns(self.object_type).iter().map(|(name, _)| format!("t.{}", name)));

        let mut params: Vec<AttrValue> = Vec::new();
        let mut sql = format!(
            "SELECT {}, (SELECT json_group_array(tag) FROM (SELECT g.tag AS tag FROM tags g
                WHERE g.uuid = t.uuid AND g.pool_uuid = t.pool_uuid AND g.type = ? ORDER BY g.tag))
             FROM {} t LEFT JOIN pools p ON p.uuid = t.pool_uuid WHERE 1 = 1",
            columns.join(", "),
            table
        );
        params.push(self.object_type.as_str().into());

        if let Some(prefix) = &self.name_prefix {
            sql.push_str(" AND t.name LIKE ? ESCAPE '\\'");
            params.push(format!("{}%", escape_like(prefix)).into());
        }
        if let Some(pool) = &self.pool {
            sql.push_str(" AND t.pool_uuid = ?");
            params.push(pool.to_string().into());
        }
        if !self.include_overridden {
            sql.push_str(" AND t.overridden = 0");
        }
        if !self.tags.is_empty() {
            let placeholders = vec!["?"; self.tags.len()].join(", ");
            sql.push_str(&format!(
                " AND (SELECT COUNT(DISTINCT g.tag) FROM tags g
                    WHERE g.uuid = t.uuid AND g.pool_uuid = t.pool_uuid AND g.type = ?
                    AND g.tag IN ({})) >= ?",
                placeholders
            ));
            params.push(self.object_type.as_str().into());
            params.extend(self.tags.iter().map(|t| AttrValue::from(t.as_str())));
            params.push(self.tags.len().into());
        }

        sql.push_str(" ORDER BY t.name ASC, t.uuid ASC, p.precedence IS NULL, p.precedence ASC");
        match self.limit {
            Some(limit) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                params.push(limit.into());
                params.push(self.offset.into());
            }
            None if self.offset > 0 => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                params.push(self.offset.into());
            }
            None => {}
        }
        (sql, params)
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl PoolIndex {
    pub fn search(&self, query: &ItemQuery) -> Result<Vec<SearchHit>> {
        let (sql, params) = query.to_sql();
        let tags_column = 5 + extra_columns(query.object_type).len();
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let hits = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let tags: Option<String> = row.get(tags_column)?;
                let tags = match tags {
                    Some(json) => serde_json::from_str::<Vec<String>>(&json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(tags_column, Type::Text, Box::new(e))
                    })?,
                    None => Vec::new(),
                };
                Ok(SearchHit {
                    row: read_item_row(query.object_type, row)?,
                    tags,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(hits)
    }

    /// Items of `ty` carrying every tag in `tags`.
    pub fn query_by_tag(&self, ty: ObjectType, tags: &[&str]) -> Result<Vec<SearchHit>> {
        self.search(&ItemQuery::new(ty).tags(tags.iter().copied()))
    }

    pub fn query_by_name_prefix(&self, ty: ObjectType, prefix: &str) -> Result<Vec<SearchHit>> {
        self.search(&ItemQuery::new(ty).name_prefix(prefix))
    }
}
