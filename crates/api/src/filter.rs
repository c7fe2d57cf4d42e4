//! 列表过滤参数
//!
//! `?filter=` 为逗号分隔的谓词：`field=value`、`field!=value`、`field~glob`、
//! `field=(a|b)`，值可用单引号包裹。`state=queued` 展开为所有排队状态。

use std::str::FromStr;

use serde::Deserialize;
use taskhub_core::models::{FilterOp, ListQuery, Predicate, TaskState};

use crate::error::{ApiError, ApiResult};

const QUEUED_ALIAS: &str = "queued";

/// 列表查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub filter: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListParams {
    pub fn to_query(&self) -> ApiResult<ListQuery> {
        let predicates = match self.filter.as_deref() {
            Some(filter) => parse(filter)?,
            None => Vec::new(),
        };
        if self.limit.is_some_and(|l| l < 0) || self.offset.is_some_and(|o| o < 0) {
            return Err(ApiError::bad_request("limit/offset 不能为负数"));
        }
        Ok(ListQuery {
            predicates,
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

/// 解析过滤表达式
pub fn parse(filter: &str) -> ApiResult<Vec<Predicate>> {
    let mut predicates = Vec::new();
    for part in split_outside(filter, ',')? {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        predicates.push(parse_predicate(part)?);
    }
    Ok(predicates)
}

fn parse_predicate(text: &str) -> ApiResult<Predicate> {
    let (field, op, value) = split_operator(text)
        .ok_or_else(|| ApiError::bad_request(format!("无效的过滤谓词: {text}")))?;
    let field = field.trim();
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
    {
        return Err(ApiError::bad_request(format!("无效的过滤字段: '{field}'")));
    }

    let value = value.trim();
    let raw_values = match value.strip_prefix('(') {
        Some(inner) => {
            let inner = inner
                .strip_suffix(')')
                .ok_or_else(|| ApiError::bad_request(format!("括号未闭合: {text}")))?;
            split_outside(inner, '|')?
        }
        None => vec![value.to_string()],
    };

    let mut values = Vec::with_capacity(raw_values.len());
    for raw in raw_values {
        let value = unquote(raw.trim())?;
        if value.is_empty() {
            return Err(ApiError::bad_request(format!("过滤值为空: {text}")));
        }
        values.push(value);
    }

    let mut predicate = Predicate {
        field: field.to_string(),
        op,
        values,
    };
    if predicate.field == "state" {
        expand_state(&mut predicate)?;
    }
    Ok(predicate)
}

/// 找到第一个引号外的操作符
fn split_operator(text: &str) -> Option<(&str, FilterOp, &str)> {
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '!' if !quoted && text[i..].starts_with("!=") => {
                return Some((&text[..i], FilterOp::NotEq, &text[i + 2..]));
            }
            '=' if !quoted => return Some((&text[..i], FilterOp::Eq, &text[i + 1..])),
            '~' if !quoted => return Some((&text[..i], FilterOp::Like, &text[i + 1..])),
            _ => {}
        }
    }
    None
}

/// 按分隔符切分，忽略引号和括号内的分隔符
fn split_outside(text: &str, sep: char) -> ApiResult<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            c if c == sep && !quoted && depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if quoted {
        return Err(ApiError::bad_request(format!("引号未闭合: {text}")));
    }
    parts.push(current);
    Ok(parts)
}

fn unquote(value: &str) -> ApiResult<String> {
    match value.strip_prefix('\'') {
        Some(rest) => rest
            .strip_suffix('\'')
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request(format!("引号未闭合: {value}"))),
        None => Ok(value.to_string()),
    }
}

fn expand_state(predicate: &mut Predicate) -> ApiResult<()> {
    let mut values = Vec::new();
    for value in predicate.values.drain(..) {
        if value.eq_ignore_ascii_case(QUEUED_ALIAS) {
            values.extend(TaskState::QUEUED.iter().map(|s| s.as_str().to_string()));
        } else {
            if predicate.op != FilterOp::Like {
                TaskState::from_str(&value)?;
            }
            values.push(value);
        }
    }
    predicate.values = values;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operators() {
        let predicates = parse("kind=analyze,name!=x,locator~app/*").unwrap();
        assert_eq!(predicates.len(), 3);
        assert_eq!(predicates[0], Predicate::eq("kind", "analyze"));
        assert_eq!(predicates[1].op, FilterOp::NotEq);
        assert_eq!(predicates[1].values, vec!["x"]);
        assert_eq!(predicates[2].op, FilterOp::Like);
        assert_eq!(predicates[2].values, vec!["app/*"]);
    }

    #[test]
    fn test_parse_alternatives_and_quotes() {
        let predicates = parse("application.id=(1|2),name='a,b=c'").unwrap();
        assert_eq!(predicates[0].field, "application.id");
        assert_eq!(predicates[0].values, vec!["1", "2"]);
        assert_eq!(predicates[1].values, vec!["a,b=c"]);

        let predicates = parse("name=('x|y'|z)").unwrap();
        assert_eq!(predicates[0].values, vec!["x|y", "z"]);
    }

    #[test]
    fn test_state_queued_expands() {
        let predicates = parse("state=queued").unwrap();
        assert_eq!(
            predicates[0].values,
            vec!["Ready", "Postponed", "Pending", "QuotaBlocked", "Running"]
        );
        let predicates = parse("state=(Created|Succeeded)").unwrap();
        assert_eq!(predicates[0].values, vec!["Created", "Succeeded"]);
    }

    #[test]
    fn test_malformed_filters_rejected() {
        for bad in [
            "kind",
            "=x",
            "kind=",
            "name='open",
            "id=(1|2",
            "state=Sleeping",
            "bad field=1",
        ] {
            assert!(parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_list_params() {
        let params = ListParams {
            filter: Some("addon=analyzer".into()),
            limit: Some(10),
            offset: Some(20),
        };
        let query = params.to_query().unwrap();
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, 20);
        assert_eq!(query.predicates.len(), 1);

        let params = ListParams {
            limit: Some(-1),
            ..Default::default()
        };
        assert!(params.to_query().is_err());
    }
}
