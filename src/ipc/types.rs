use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;

use super::handlers::attendance::AttendancePage;
use super::handlers::grading::GradingPage;
use super::handlers::lesson_plans::LessonPlanPage;
use crate::config::Settings;
use crate::transport::Transport;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct Session {
    pub transport: Arc<dyn Transport>,
    pub base_url: String,
    pub anonymous: bool,
}

pub struct AppState {
    pub settings: Settings,
    pub session: Option<Session>,
    pub attendance: AttendancePage,
    pub grading: GradingPage,
    pub plans: LessonPlanPage,
}

pub type SharedState = Arc<Mutex<AppState>>;

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            session: None,
            attendance: AttendancePage::default(),
            grading: GradingPage::default(),
            plans: LessonPlanPage::default(),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Unmount every page; outstanding fetches for them become stale.
    pub fn close_pages(&mut self) {
        self.attendance.close();
        self.grading.close();
        self.plans.close();
    }
}

/// Never held across an `.await`; a poisoned lock still guards consistent data.
pub fn lock(state: &SharedState) -> MutexGuard<'_, AppState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
