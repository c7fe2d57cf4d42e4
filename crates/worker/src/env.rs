//! Pod 环境变量
//!
//! 管理器为每个容器注入 `HUB_URL`、`TASK`、`HUB_TOKEN`、`SHARED_DIR`、`CACHE_DIR`，
//! 扩展的变量以 `_EXT_<扩展>_<变量>` 的形式出现在所有容器中。

use std::collections::BTreeMap;

use crate::error::{WorkerError, WorkerResult};

pub const HUB_URL: &str = "HUB_URL";
pub const HUB_TOKEN: &str = "HUB_TOKEN";
pub const TASK: &str = "TASK";
pub const SHARED_DIR: &str = "SHARED_DIR";
pub const CACHE_DIR: &str = "CACHE_DIR";
pub const EXT_PREFIX: &str = "_EXT_";

#[derive(Debug, Clone, PartialEq)]
pub struct AddonEnv {
    pub hub_url: String,
    pub token: String,
    pub task: i64,
    pub shared_dir: String,
    pub cache_dir: String,
    /// 去掉 `_EXT_` 前缀后的扩展变量
    namespaced: BTreeMap<String, String>,
}

impl AddonEnv {
    pub fn from_env() -> WorkerResult<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> WorkerResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut all: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let hub_url = all
            .remove(HUB_URL)
            .ok_or(WorkerError::MissingEnv(HUB_URL))?;
        let raw_task = all.remove(TASK).ok_or(WorkerError::MissingEnv(TASK))?;
        let task = raw_task
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or(WorkerError::InvalidEnv {
                name: TASK,
                value: raw_task.clone(),
            })?;

        let namespaced = all
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(EXT_PREFIX)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();

        Ok(Self {
            hub_url: hub_url.trim_end_matches('/').to_string(),
            token: all.remove(HUB_TOKEN).unwrap_or_default(),
            task,
            shared_dir: all.remove(SHARED_DIR).unwrap_or_default(),
            cache_dir: all.remove(CACHE_DIR).unwrap_or_default(),
            namespaced,
        })
    }

    /// 指定扩展的变量，键为扩展中声明的变量名（大写）
    pub fn extension(&self, name: &str) -> BTreeMap<String, String> {
        let prefix = format!("{}_", env_key(name));
        self.namespaced
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|var| (var.to_string(), v.clone())))
            .collect()
    }
}

/// 与管理器一致的变量名规整：非字母数字替换为 `_` 并转大写
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            (HUB_URL, "http://hub:8080/"),
            (TASK, "42"),
            (HUB_TOKEN, "secret"),
            (SHARED_DIR, "/shared"),
            (CACHE_DIR, "/cache"),
        ]
    }

    #[test]
    fn test_from_vars() {
        let env = AddonEnv::from_vars(base()).unwrap();
        assert_eq!(env.hub_url, "http://hub:8080");
        assert_eq!(env.task, 42);
        assert_eq!(env.token, "secret");
        assert_eq!(env.shared_dir, "/shared");
        assert_eq!(env.cache_dir, "/cache");
    }

    #[test]
    fn test_missing_and_invalid() {
        let vars: Vec<_> = base().into_iter().filter(|(k, _)| *k != TASK).collect();
        assert!(matches!(
            AddonEnv::from_vars(vars),
            Err(WorkerError::MissingEnv(TASK))
        ));

        let mut vars = base();
        vars[1] = (TASK, "abc");
        assert!(matches!(
            AddonEnv::from_vars(vars),
            Err(WorkerError::InvalidEnv { name: TASK, .. })
        ));
    }

    #[test]
    fn test_extension_vars() {
        let mut vars = base();
        vars.push(("_EXT_MAVEN_PORT", "9000"));
        vars.push(("_EXT_MAVEN_CENTRAL_URL", "https://repo"));
        vars.push(("_EXT_JAVA_LSP_PORT", "8000"));
        let env = AddonEnv::from_vars(vars).unwrap();

        let maven = env.extension("maven");
        assert_eq!(maven.len(), 2);
        assert_eq!(maven["PORT"], "9000");
        assert_eq!(maven["CENTRAL_URL"], "https://repo");

        let lsp = env.extension("java-lsp");
        assert_eq!(lsp["PORT"], "8000");
        assert!(env.extension("other").is_empty());
    }
}
