use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tokio::fs;
use tokio::sync::RwLock;

use berth_types::{EnvVar, StackSpec, COMPOSE_FILE_NAME};

/// Stack definitions on disk: one directory per stack holding its compose
/// file, plus a JSON index. Definitions are only written by explicit save
/// operations, never by the executor.
pub struct StackStore {
    base: PathBuf,
    stacks: RwLock<HashMap<String, StackSpec>>,
}

impl StackStore {
    pub async fn open(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let index_file = base.join("stacks.json");
        let stacks = if index_file.exists() {
            let raw = fs::read_to_string(&index_file).await?;
            serde_json::from_str::<HashMap<String, StackSpec>>(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            base,
            stacks: RwLock::new(stacks),
        })
    }

    pub async fn list(&self) -> Vec<StackSpec> {
        let mut rows = self
            .stacks
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn get(&self, name: &str) -> Option<StackSpec> {
        self.stacks.read().await.get(name).cloned()
    }

    pub async fn create(
        &self,
        name: &str,
        definition: &str,
        env: Vec<EnvVar>,
    ) -> anyhow::Result<StackSpec> {
        validate_name(name)?;
        if self.stacks.read().await.contains_key(name) {
            anyhow::bail!("stack '{name}' already exists");
        }
        let dir = self.base.join(name);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(COMPOSE_FILE_NAME), definition).await?;

        let now = Utc::now();
        let spec = StackSpec {
            name: name.to_string(),
            dir: dir.to_string_lossy().to_string(),
            env,
            created_at: now,
            updated_at: now,
        };
        self.stacks
            .write()
            .await
            .insert(name.to_string(), spec.clone());
        self.flush().await?;
        Ok(spec)
    }

    pub async fn set_env(&self, name: &str, env: Vec<EnvVar>) -> anyhow::Result<StackSpec> {
        let updated = {
            let mut stacks = self.stacks.write().await;
            let spec = stacks
                .get_mut(name)
                .with_context(|| format!("stack '{name}' not found"))?;
            spec.env = env;
            spec.updated_at = Utc::now();
            spec.clone()
        };
        self.flush().await?;
        Ok(updated)
    }

    pub async fn read_definition(&self, name: &str) -> anyhow::Result<String> {
        let spec = self
            .get(name)
            .await
            .with_context(|| format!("stack '{name}' not found"))?;
        fs::read_to_string(Path::new(&spec.dir).join(COMPOSE_FILE_NAME))
            .await
            .with_context(|| format!("read definition for stack '{name}'"))
    }

    /// Explicit "save config" action; the only write path for definitions.
    pub async fn save_definition(&self, name: &str, definition: &str) -> anyhow::Result<()> {
        let updated = {
            let mut stacks = self.stacks.write().await;
            let spec = stacks
                .get_mut(name)
                .with_context(|| format!("stack '{name}' not found"))?;
            spec.updated_at = Utc::now();
            spec.dir.clone()
        };
        fs::write(Path::new(&updated).join(COMPOSE_FILE_NAME), definition).await?;
        self.flush().await
    }

    pub async fn remove(&self, name: &str, delete_dir: bool) -> anyhow::Result<bool> {
        let removed = self.stacks.write().await.remove(name);
        let Some(removed) = removed else {
            return Ok(false);
        };
        self.flush().await?;
        if delete_dir {
            if let Err(err) = fs::remove_dir_all(&removed.dir).await {
                tracing::warn!("failed to delete stack dir {}: {err}", removed.dir);
            }
        }
        Ok(true)
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = self.stacks.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("stacks.json"), payload).await?;
        Ok(())
    }
}

/// Compose project names: lowercase alphanumerics, dash and underscore,
/// starting with an alphanumeric.
fn validate_name(name: &str) -> anyhow::Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let valid_rest = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid_first || !valid_rest {
        anyhow::bail!(
            "invalid stack name '{name}': use lowercase letters, digits, '-' and '_', starting with a letter or digit"
        );
    }
    Ok(())
}
