use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::core::{ProcessingSettings, Quality, Result, StateStore, TranscodeError};

/// 保存当前视图的键
pub const ACTIVE_VIEW_KEY: &str = "activeTab";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveView {
    #[default]
    Pictures,
    Videos,
    Queue,
    Dashboard,
}

impl ActiveView {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveView::Pictures => "pictures",
            ActiveView::Videos => "videos",
            ActiveView::Queue => "queue",
            ActiveView::Dashboard => "dashboard",
        }
    }

    /// Upload defaults for the two upload views
    pub fn default_settings(&self) -> Option<ProcessingSettings> {
        let builder = match self {
            ActiveView::Pictures => ProcessingSettings::builder("jpg")
                .quality(Quality::High)
                .extract_metadata(true)
                .optimize_for_web(true),
            ActiveView::Videos => ProcessingSettings::builder("mp4")
                .quality(Quality::High),
            ActiveView::Queue | ActiveView::Dashboard => return None,
        };

        builder.build().ok()
    }
}

impl fmt::Display for ActiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActiveView {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pictures" => Ok(ActiveView::Pictures),
            "videos" => Ok(ActiveView::Videos),
            "queue" => Ok(ActiveView::Queue),
            "dashboard" => Ok(ActiveView::Dashboard),
            other => Err(TranscodeError::InvalidView(other.to_string())),
        }
    }
}

/// Last active view, restored on start and written back when it changes
pub struct AppState<S: StateStore> {
    store: S,
    active_view: ActiveView,
}

impl<S: StateStore> AppState<S> {
    /// Absent, unreadable or unknown stored values fall back to the default view
    pub fn load(store: S) -> Self {
        let active_view = match store.load(ACTIVE_VIEW_KEY) {
            Ok(Some(raw)) => raw.parse::<ActiveView>().unwrap_or_else(|err| {
                debug!(error = %err, "Ignoring stored view");
                ActiveView::default()
            }),
            Ok(None) => ActiveView::default(),
            Err(err) => {
                warn!(error = %err, "Failed to read view state");
                ActiveView::default()
            }
        };

        Self { store, active_view }
    }

    pub fn active_view(&self) -> ActiveView {
        self.active_view
    }

    /// Switches view; the store is only written when the view actually changes
    pub fn set_active_view(&mut self, view: ActiveView) -> Result<()> {
        if view == self.active_view {
            return Ok(());
        }

        self.store.save(ACTIVE_VIEW_KEY, view.as_str())?;
        self.active_view = view;

        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
