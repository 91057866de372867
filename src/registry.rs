//! Named settings and background sources.
//!
//! The saver never owns camera settings or the processed background; it asks
//! whoever registered under a known name. Sources are queried synchronously
//! at save start and stop. A missing source, or one that returns `None`, just
//! means there is nothing to merge.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use stream_core::{StreamError, StreamResult};
use stream_storage::{BackgroundSnapshot, SettingsDict};

/// Provides a settings tree (camera parameters, counters, ...).
pub trait SettingsSource: Send + Sync {
    /// Current settings, or `None` if temporarily unavailable.
    fn settings(&self) -> Option<Value>;
}

/// Provides the background frames of the frame processor.
pub trait BackgroundSource: Send + Sync {
    /// Current background, or `None` if there is none.
    fn background(&self) -> Option<BackgroundSnapshot>;
}

impl<F> SettingsSource for F
where
    F: Fn() -> Option<Value> + Send + Sync,
{
    fn settings(&self) -> Option<Value> {
        self()
    }
}

impl<F> BackgroundSource for F
where
    F: Fn() -> Option<BackgroundSnapshot> + Send + Sync,
{
    fn background(&self) -> Option<BackgroundSnapshot> {
        self()
    }
}

/// Registry of named sources shared between the saver and its collaborators.
#[derive(Default)]
pub struct ResourceRegistry {
    settings: RwLock<HashMap<String, Arc<dyn SettingsSource>>>,
    backgrounds: RwLock<HashMap<String, Arc<dyn BackgroundSource>>>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("settings", &self.settings.read().keys().collect::<Vec<_>>())
            .field(
                "backgrounds",
                &self.backgrounds.read().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ResourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a settings source under `name`.
    pub fn register_settings(
        &self,
        name: impl Into<String>,
        source: Arc<dyn SettingsSource>,
    ) -> StreamResult<()> {
        let name = name.into();
        let mut settings = self.settings.write();
        if settings.contains_key(&name) {
            return Err(StreamError::Configuration(format!(
                "settings source '{}' already registered",
                name
            )));
        }
        tracing::debug!(name = %name, "Registered settings source");
        settings.insert(name, source);
        Ok(())
    }

    /// Register a background source under `name`.
    pub fn register_background(
        &self,
        name: impl Into<String>,
        source: Arc<dyn BackgroundSource>,
    ) -> StreamResult<()> {
        let name = name.into();
        let mut backgrounds = self.backgrounds.write();
        if backgrounds.contains_key(&name) {
            return Err(StreamError::Configuration(format!(
                "background source '{}' already registered",
                name
            )));
        }
        tracing::debug!(name = %name, "Registered background source");
        backgrounds.insert(name, source);
        Ok(())
    }

    /// Remove every source registered under `name`.
    ///
    /// Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let a = self.settings.write().remove(name).is_some();
        let b = self.backgrounds.write().remove(name).is_some();
        a || b
    }

    /// Query the settings source `name`.
    pub fn settings(&self, name: &str) -> Option<Value> {
        // Clone the Arc so the source runs without the registry lock held.
        let source = self.settings.read().get(name).cloned()?;
        source.settings()
    }

    /// Query the settings source `name` as a flat dictionary.
    pub fn settings_dict(&self, name: &str) -> Option<SettingsDict> {
        let value = self.settings(name)?;
        let mut dict = SettingsDict::new();
        dict.insert("", value);
        Some(dict)
    }

    /// Query the background source `name`.
    pub fn background(&self, name: &str) -> Option<BackgroundSnapshot> {
        let source = self.backgrounds.read().get(name).cloned()?;
        source.background()
    }

    /// Number of registered sources.
    pub fn count(&self) -> usize {
        self.settings.read().len() + self.backgrounds.read().len()
    }

    /// Names of registered sources, settings first.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.settings.read().keys().cloned().collect();
        names.sort();
        let mut bg: Vec<String> = self.backgrounds.read().keys().cloned().collect();
        bg.sort();
        names.extend(bg);
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use stream_core::Frame;

    #[test]
    fn test_register_and_query() {
        let registry = ResourceRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        registry
            .register_settings(
                "settings",
                Arc::new(move || -> Option<Value> {
                    Some(json!({"cam": {"cnt": {"frames": c.fetch_add(1, Ordering::SeqCst)}}}))
                }),
            )
            .unwrap();

        let first = registry.settings_dict("settings").unwrap();
        assert_eq!(first.get("cam/cnt/frames"), Some(&json!(0)));
        let second = registry.settings("settings").unwrap();
        assert_eq!(second["cam"]["cnt"]["frames"], 1);
        assert!(registry.settings("other").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ResourceRegistry::new();
        registry
            .register_settings("settings", Arc::new(|| -> Option<Value> { None }))
            .unwrap();
        let err = registry
            .register_settings("settings", Arc::new(|| -> Option<Value> { None }))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_unavailable_source_is_none() {
        let registry = ResourceRegistry::new();
        registry
            .register_settings("settings", Arc::new(|| -> Option<Value> { None }))
            .unwrap();
        assert!(registry.settings_dict("settings").is_none());
    }

    #[test]
    fn test_background_and_unregister() {
        let registry = ResourceRegistry::new();
        registry
            .register_background(
                "background",
                Arc::new(|| -> Option<BackgroundSnapshot> {
                    Some(BackgroundSnapshot {
                        frames: vec![Frame::from_u16(2, 2, &[1, 2, 3, 4]).ok()?],
                        parameters: json!({}),
                    })
                }),
            )
            .unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.background("background").unwrap().frames.len(), 1);
        assert_eq!(registry.list(), vec!["background".to_string()]);
        assert!(registry.unregister("background"));
        assert!(!registry.unregister("background"));
        assert!(registry.background("background").is_none());
    }
}
