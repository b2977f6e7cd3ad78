//! Persisted per-group moderation settings and warning counts.

use knight_core::error::KnightError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// What happens to a message that trips the filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadwordAction {
    #[default]
    Delete,
    Kick,
    Warn,
}

impl BadwordAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Some(Self::Delete),
            "kick" => Some(Self::Kick),
            "warn" => Some(Self::Warn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Kick => "kick",
            Self::Warn => "warn",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GroupSettings {
    #[serde(default)]
    action: BadwordAction,
    #[serde(default)]
    warnings: HashMap<String, u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ModerationState {
    #[serde(default)]
    groups: HashMap<String, GroupSettings>,
}

/// Enabled groups keyed by group JID, saved as JSON after every change.
pub struct ModerationStore {
    path: Option<PathBuf>,
    state: Mutex<ModerationState>,
}

impl ModerationStore {
    /// Open the store at `path`, starting empty if the file is missing or unreadable.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("moderation: {} unreadable, starting empty: {e}", path.display());
                ModerationState::default()
            }),
            Err(_) => ModerationState::default(),
        };
        Self {
            path: Some(path),
            state: Mutex::new(state),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(ModerationState::default()),
        }
    }

    /// Action for `group`, or `None` when the filter is off there.
    pub async fn action(&self, group: &str) -> Option<BadwordAction> {
        self.state.lock().await.groups.get(group).map(|g| g.action)
    }

    /// Turn the filter on with the default action. `false` if already on.
    pub async fn enable(&self, group: &str) -> Result<bool, KnightError> {
        let mut state = self.state.lock().await;
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        state.groups.insert(group.to_string(), GroupSettings::default());
        self.persist(&state).await?;
        Ok(true)
    }

    /// Turn the filter off and forget warnings. `false` if already off.
    pub async fn disable(&self, group: &str) -> Result<bool, KnightError> {
        let mut state = self.state.lock().await;
        if state.groups.remove(group).is_none() {
            return Ok(false);
        }
        self.persist(&state).await?;
        Ok(true)
    }

    /// Set the action, enabling the filter if needed.
    pub async fn set_action(&self, group: &str, action: BadwordAction) -> Result<(), KnightError> {
        let mut state = self.state.lock().await;
        state.groups.entry(group.to_string()).or_default().action = action;
        self.persist(&state).await
    }

    /// Record one more warning for `user`; returns the new count.
    ///
    /// Returns 0 and records nothing when the filter is off for `group`.
    pub async fn add_warning(&self, group: &str, user: &str) -> Result<u32, KnightError> {
        let mut state = self.state.lock().await;
        let Some(settings) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        let count = settings.warnings.entry(user.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.persist(&state).await?;
        Ok(count)
    }

    pub async fn reset_warnings(&self, group: &str, user: &str) -> Result<(), KnightError> {
        let mut state = self.state.lock().await;
        let removed = state
            .groups
            .get_mut(group)
            .and_then(|settings| settings.warnings.remove(user));
        if removed.is_none() {
            return Ok(());
        }
        self.persist(&state).await
    }

    async fn persist(&self, state: &ModerationState) -> Result<(), KnightError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        write_replace(path, &bytes).await
    }
}

async fn write_replace(path: &Path, bytes: &[u8]) -> Result<(), KnightError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}
