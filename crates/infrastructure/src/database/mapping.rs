//! 行映射与过滤条件到 SQL 的转换

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskhub_core::models::{FilterOp, ListQuery};
use taskhub_core::{HubError, HubResult};

/// JSON 列的读写辅助
pub struct MappingHelpers;

impl MappingHelpers {
    pub fn json_column<T: DeserializeOwned>(row: &SqliteRow, field: &str) -> HubResult<T> {
        let text: String = row.try_get(field)?;
        serde_json::from_str(&text)
            .map_err(|e| HubError::Serialization(format!("解析字段 {field} 失败: {e}")))
    }

    pub fn to_json<T: Serialize>(value: &T) -> HubResult<String> {
        Ok(serde_json::to_string(value)?)
    }
}

/// 过滤字段的列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
}

/// 可过滤字段：(API 字段名, 列名, 类型)
pub type FieldMap = &'static [(&'static str, &'static str, ColumnKind)];

pub const TASK_FIELDS: FieldMap = &[
    ("id", "id", ColumnKind::Integer),
    ("createUser", "create_user", ColumnKind::Text),
    ("kind", "kind", ColumnKind::Text),
    ("addon", "addon", ColumnKind::Text),
    ("name", "name", ColumnKind::Text),
    ("locator", "locator", ColumnKind::Text),
    ("state", "state", ColumnKind::Text),
    ("application.id", "application_id", ColumnKind::Integer),
    ("application.name", "application_name", ColumnKind::Text),
    ("platform.id", "platform_id", ColumnKind::Integer),
    ("platform.name", "platform_name", ColumnKind::Text),
    ("taskGroup.id", "task_group_id", ColumnKind::Integer),
];

pub const GROUP_FIELDS: FieldMap = &[
    ("id", "id", ColumnKind::Integer),
    ("name", "name", ColumnKind::Text),
    ("kind", "kind", ColumnKind::Text),
    ("addon", "addon", ColumnKind::Text),
    ("state", "state", ColumnKind::Text),
    ("mode", "mode", ColumnKind::Text),
    ("createUser", "create_user", ColumnKind::Text),
];

/// 绑定参数
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
}

/// 生成的 WHERE 子句及其参数
#[derive(Debug, Default)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl WhereClause {
    pub fn bind<'q>(
        &'q self,
        mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for param in &self.params {
            query = match param {
                SqlValue::Text(s) => query.bind(s.as_str()),
                SqlValue::Integer(i) => query.bind(*i),
            };
        }
        query
    }

    pub fn bind_scalar<'q, O>(
        &'q self,
        mut query: sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
        for param in &self.params {
            query = match param {
                SqlValue::Text(s) => query.bind(s.as_str()),
                SqlValue::Integer(i) => query.bind(*i),
            };
        }
        query
    }
}

/// 将过滤谓词转换为 WHERE 子句，谓词之间为 AND，谓词内多个值为 OR
pub fn build_where(query: &ListQuery, fields: FieldMap) -> HubResult<WhereClause> {
    let mut parts = Vec::new();
    let mut params = Vec::new();

    for predicate in &query.predicates {
        let (_, column, kind) = fields
            .iter()
            .find(|(name, _, _)| *name == predicate.field)
            .ok_or_else(|| HubError::bad_request(format!("未知的过滤字段: {}", predicate.field)))?;
        if predicate.values.is_empty() {
            return Err(HubError::bad_request(format!(
                "过滤字段 {} 缺少值",
                predicate.field
            )));
        }

        for value in &predicate.values {
            let param = match (kind, predicate.op) {
                (ColumnKind::Integer, FilterOp::Eq | FilterOp::NotEq) => {
                    SqlValue::Integer(value.parse().map_err(|_| {
                        HubError::bad_request(format!(
                            "过滤字段 {} 需要整数: {value}",
                            predicate.field
                        ))
                    })?)
                }
                _ => SqlValue::Text(value.clone()),
            };
            params.push(param);
        }

        let placeholders = vec!["?"; predicate.values.len()].join(", ");
        let part = match predicate.op {
            FilterOp::Eq => format!("{column} IN ({placeholders})"),
            FilterOp::NotEq => format!("({column} IS NULL OR {column} NOT IN ({placeholders}))"),
            FilterOp::Like => {
                let ors: Vec<String> = predicate
                    .values
                    .iter()
                    .map(|_| format!("CAST({column} AS TEXT) GLOB ?"))
                    .collect();
                format!("({})", ors.join(" OR "))
            }
        };
        parts.push(part);
    }

    let sql = if parts.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", parts.join(" AND "))
    };
    Ok(WhereClause { sql, params })
}

/// LIMIT/OFFSET 子句
pub fn page_clause(query: &ListQuery) -> String {
    match query.limit {
        Some(limit) => format!(" LIMIT {} OFFSET {}", limit.max(0), query.offset.max(0)),
        None if query.offset > 0 => format!(" LIMIT -1 OFFSET {}", query.offset),
        None => String::new(),
    }
}
