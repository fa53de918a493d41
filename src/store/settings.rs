use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JsonStore;
use crate::error::{CoreError, CoreResult};

/// Quality label. Every named preset is also the literal format expression it
/// stands for; anything else is `Custom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityPreset {
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "bestvideo+bestaudio")]
    BestVideoBestAudio,
    #[serde(rename = "worst")]
    Worst,
    #[serde(rename = "bestvideo")]
    BestVideo,
    #[serde(rename = "bestaudio")]
    BestAudio,
    #[serde(rename = "custom")]
    Custom,
}

impl QualityPreset {
    pub const NAMED: [QualityPreset; 5] = [
        Self::Best,
        Self::BestVideoBestAudio,
        Self::Worst,
        Self::BestVideo,
        Self::BestAudio,
    ];

    /// The format expression a named preset pins.
    pub fn literal(self) -> Option<&'static str> {
        match self {
            Self::Best => Some("best"),
            Self::BestVideoBestAudio => Some("bestvideo+bestaudio"),
            Self::Worst => Some("worst"),
            Self::BestVideo => Some("bestvideo"),
            Self::BestAudio => Some("bestaudio"),
            Self::Custom => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.literal().unwrap_or("custom")
    }

    /// Named preset for a label, `Custom` for any other label.
    pub fn from_label(label: &str) -> Self {
        Self::NAMED
            .into_iter()
            .find(|preset| preset.literal() == Some(label.trim()))
            .unwrap_or(Self::Custom)
    }

    /// The preset an expression implies.
    pub fn from_expression(expression: &str) -> Self {
        Self::from_label(expression)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub quality_preset: QualityPreset,
    pub format_expression: String,
    #[serde(default)]
    pub auto_hardlink: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quality_preset: QualityPreset::BestVideoBestAudio,
            format_expression: "bestvideo+bestaudio".to_string(),
            auto_hardlink: false,
            updated_at: None,
        }
    }
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub quality_preset: Option<String>,
    #[serde(default)]
    pub format_expression: Option<String>,
    #[serde(default)]
    pub auto_hardlink: Option<bool>,
}

impl Settings {
    /// Applies `patch` and re-derives the preset from the resulting expression,
    /// so the pair can never disagree.
    ///
    /// Resulting expression: the patch's expression if given, else the literal
    /// of a named preset if given, else the current expression. A named preset
    /// sent together with a different expression is rejected.
    pub fn reconcile(&self, patch: &SettingsPatch) -> CoreResult<Settings> {
        let preset = patch
            .quality_preset
            .as_deref()
            .map(str::trim)
            .map(|label| {
                if label.is_empty() {
                    Err(CoreError::validation("quality_preset must not be empty"))
                } else {
                    Ok(QualityPreset::from_label(label))
                }
            })
            .transpose()?;
        let expression = patch
            .format_expression
            .as_deref()
            .map(str::trim)
            .map(|expr| {
                if expr.is_empty() {
                    Err(CoreError::validation("format_expression must not be empty"))
                } else {
                    Ok(expr.to_string())
                }
            })
            .transpose()?;

        if let (Some(preset), Some(expr)) = (preset, expression.as_deref())
            && let Some(literal) = preset.literal()
            && literal != expr
        {
            return Err(CoreError::validation(format!(
                "quality_preset '{literal}' conflicts with format_expression '{expr}'"
            )));
        }

        let format_expression = expression
            .or_else(|| preset.and_then(QualityPreset::literal).map(str::to_string))
            .unwrap_or_else(|| self.format_expression.clone());

        Ok(Settings {
            quality_preset: QualityPreset::from_expression(&format_expression),
            format_expression,
            auto_hardlink: patch.auto_hardlink.unwrap_or(self.auto_hardlink),
            updated_at: Some(Utc::now()),
        })
    }

    /// Heals a record edited by hand into an inconsistent pair.
    fn normalized(mut self) -> Self {
        if self.format_expression.trim().is_empty() {
            self.format_expression = Settings::default().format_expression;
        }
        self.quality_preset = QualityPreset::from_expression(&self.format_expression);
        self
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    inner: JsonStore<Settings>,
}

impl SettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::load(path),
        }
    }

    pub fn get(&self) -> Settings {
        self.inner.get().normalized()
    }

    pub fn update(&self, patch: &SettingsPatch) -> CoreResult<Settings> {
        self.inner.update(|current| {
            let next = current.clone().normalized().reconcile(patch)?;
            *current = next.clone();
            Ok(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_preset(label: &str) -> SettingsPatch {
        SettingsPatch {
            quality_preset: Some(label.into()),
            ..SettingsPatch::default()
        }
    }

    fn patch_expression(expr: &str) -> SettingsPatch {
        SettingsPatch {
            format_expression: Some(expr.into()),
            ..SettingsPatch::default()
        }
    }

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json"));
        (dir, store)
    }

    #[test]
    fn defaults_are_consistent() {
        let (_dir, store) = store();
        let settings = store.get();
        assert_eq!(settings.quality_preset, QualityPreset::BestVideoBestAudio);
        assert_eq!(settings.format_expression, "bestvideo+bestaudio");
        assert!(!settings.auto_hardlink);
    }

    #[test]
    fn named_preset_pins_expression() {
        let (_dir, store) = store();
        let settings = store.update(&patch_preset("best")).unwrap();
        assert_eq!(settings.format_expression, "best");
        assert_eq!(settings.quality_preset, QualityPreset::Best);
        assert_eq!(store.get().format_expression, "best");
    }

    #[test]
    fn free_form_expression_marks_custom() {
        let (_dir, store) = store();
        let settings = store
            .update(&patch_expression("bestvideo[height<=720]"))
            .unwrap();
        assert_eq!(settings.quality_preset, QualityPreset::Custom);
        assert_eq!(settings.format_expression, "bestvideo[height<=720]");
    }

    #[test]
    fn literal_expression_selects_named_preset() {
        let (_dir, store) = store();
        store.update(&patch_expression("bestvideo[height<=720]")).unwrap();
        let settings = store.update(&patch_expression("worst")).unwrap();
        assert_eq!(settings.quality_preset, QualityPreset::Worst);
    }

    #[test]
    fn conflicting_pair_is_rejected_without_mutation() {
        let (_dir, store) = store();
        let err = store
            .update(&SettingsPatch {
                quality_preset: Some("best".into()),
                format_expression: Some("worst".into()),
                auto_hardlink: Some(true),
            })
            .unwrap_err();
        assert!(err.is_validation_class());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn custom_label_keeps_current_expression() {
        let (_dir, store) = store();
        store.update(&patch_expression("bv*+ba/b")).unwrap();
        let settings = store.update(&patch_preset("custom")).unwrap();
        assert_eq!(settings.format_expression, "bv*+ba/b");
        assert_eq!(settings.quality_preset, QualityPreset::Custom);
    }

    #[test]
    fn hardlink_flag_is_independent() {
        let (_dir, store) = store();
        store.update(&patch_preset("bestaudio")).unwrap();
        let settings = store
            .update(&SettingsPatch {
                auto_hardlink: Some(true),
                ..SettingsPatch::default()
            })
            .unwrap();
        assert!(settings.auto_hardlink);
        assert_eq!(settings.format_expression, "bestaudio");
    }

    #[test]
    fn empty_expression_is_rejected() {
        let (_dir, store) = store();
        assert!(store.update(&patch_expression("  ")).is_err());
    }

    #[test]
    fn preset_serializes_as_literal() {
        let json = serde_json::to_string(&QualityPreset::BestVideoBestAudio).unwrap();
        assert_eq!(json, "\"bestvideo+bestaudio\"");
        let json = serde_json::to_string(&QualityPreset::Custom).unwrap();
        assert_eq!(json, "\"custom\"");
    }

    #[test]
    fn hand_edited_inconsistent_record_is_healed_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"quality_preset":"best","format_expression":"bestvideo[height<=480]"}"#,
        )
        .unwrap();
        let store = SettingsStore::load(&path);
        assert_eq!(store.get().quality_preset, QualityPreset::Custom);
    }
}
