use chrono::{DateTime, Utc};

use crate::control::ControlContext;

#[derive(Clone)]
pub struct AppState {
    pub control: ControlContext,
    pub ws_path: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(control: ControlContext, ws_path: impl Into<String>) -> Self {
        Self {
            control,
            ws_path: ws_path.into(),
            started_at: Utc::now(),
        }
    }
}
