use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonStore;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub source_url: String,
    pub display_name: String,
    #[serde(default)]
    pub audio_only: bool,
    pub created_at: DateTime<Utc>,
}

/// Rename or audio-only toggle. The id and URL never change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionPatch {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub audio_only: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SubscriptionDocument {
    #[serde(default)]
    subscriptions: Vec<Subscription>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct SubscriptionStore {
    inner: JsonStore<SubscriptionDocument>,
}

impl SubscriptionStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::load(path),
        }
    }

    /// Snapshot in insertion order.
    pub fn list(&self) -> Vec<Subscription> {
        self.inner.get().subscriptions
    }

    pub fn get(&self, id: &str) -> CoreResult<Subscription> {
        self.inner
            .get()
            .subscriptions
            .into_iter()
            .find(|subscription| subscription.id == id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// Rejects a second record with the same id.
    pub fn insert(&self, subscription: Subscription) -> CoreResult<Subscription> {
        self.inner.update(|document| {
            if document
                .subscriptions
                .iter()
                .any(|existing| existing.id == subscription.id)
            {
                return Err(CoreError::DuplicateSubscription(subscription.id.clone()));
            }
            document.subscriptions.push(subscription.clone());
            document.updated_at = Some(Utc::now());
            Ok(subscription)
        })
    }

    pub fn remove(&self, id: &str) -> CoreResult<Subscription> {
        self.inner.update(|document| {
            let position = document
                .subscriptions
                .iter()
                .position(|subscription| subscription.id == id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            let removed = document.subscriptions.remove(position);
            document.updated_at = Some(Utc::now());
            Ok(removed)
        })
    }

    pub fn update(&self, id: &str, patch: &SubscriptionPatch) -> CoreResult<Subscription> {
        let display_name = match patch.display_name.as_deref().map(str::trim) {
            Some("") => return Err(CoreError::validation("display_name must not be empty")),
            other => other.map(str::to_string),
        };
        self.inner.update(|document| {
            let subscription = document
                .subscriptions
                .iter_mut()
                .find(|subscription| subscription.id == id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            if let Some(name) = display_name {
                subscription.display_name = name;
            }
            if let Some(audio_only) = patch.audio_only {
                subscription.audio_only = audio_only;
            }
            let updated = subscription.clone();
            document.updated_at = Some(Utc::now());
            Ok(updated)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(id: &str) -> Subscription {
        Subscription {
            id: id.to_string(),
            source_url: format!("https://www.youtube.com/channel/{id}"),
            display_name: format!("Channel {id}"),
            audio_only: false,
            created_at: Utc::now(),
        }
    }

    fn store() -> (tempfile::TempDir, SubscriptionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SubscriptionStore::load(dir.path().join("subscriptions.json"));
        (dir, store)
    }

    #[test]
    fn insert_rejects_duplicates() {
        let (_dir, store) = store();
        store.insert(subscription("UC1")).unwrap();
        let err = store.insert(subscription("UC1")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateSubscription(ref id) if id == "UC1"));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn remove_and_get_report_not_found() {
        let (_dir, store) = store();
        store.insert(subscription("UC1")).unwrap();
        assert!(matches!(store.get("nope"), Err(CoreError::NotFound(_))));
        assert!(matches!(store.remove("nope"), Err(CoreError::NotFound(_))));
        assert_eq!(store.remove("UC1").unwrap().id, "UC1");
        assert!(store.list().is_empty());
    }

    #[test]
    fn update_renames_and_toggles() {
        let (_dir, store) = store();
        store.insert(subscription("UC1")).unwrap();
        let updated = store
            .update(
                "UC1",
                &SubscriptionPatch {
                    display_name: Some("  Renamed ".into()),
                    audio_only: Some(true),
                },
            )
            .unwrap();
        assert_eq!(updated.display_name, "Renamed");
        assert!(updated.audio_only);
        assert_eq!(updated.source_url, "https://www.youtube.com/channel/UC1");

        let err = store
            .update(
                "UC1",
                &SubscriptionPatch {
                    display_name: Some(" ".into()),
                    ..SubscriptionPatch::default()
                },
            )
            .unwrap_err();
        assert!(err.is_validation_class());
        assert_eq!(store.get("UC1").unwrap().display_name, "Renamed");
    }

    #[test]
    fn writes_from_another_process_are_kept_and_seen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        let backend = SubscriptionStore::load(&path);
        let cli = SubscriptionStore::load(&path);

        cli.insert(subscription("UCcli")).unwrap();
        backend.insert(subscription("UCapi")).unwrap();
        let err = cli.insert(subscription("UCapi")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateSubscription(_)));

        let ids = |store: &SubscriptionStore| -> Vec<String> {
            store.list().into_iter().map(|s| s.id).collect()
        };
        assert_eq!(ids(&backend), vec!["UCcli", "UCapi"]);
        assert_eq!(ids(&cli), vec!["UCcli", "UCapi"]);
        assert_eq!(ids(&SubscriptionStore::load(&path)), vec!["UCcli", "UCapi"]);

        backend.remove("UCcli").unwrap();
        assert!(matches!(cli.get("UCcli"), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn document_shape_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.json");
        SubscriptionStore::load(&path)
            .insert(subscription("UC9"))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["subscriptions"][0]["id"], "UC9");
        assert!(raw["updated_at"].is_string());
        assert_eq!(SubscriptionStore::load(&path).list().len(), 1);
    }
}
