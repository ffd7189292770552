//! Process-scoped local state persisted across restarts

use serde::{Deserialize, Serialize};

use super::ids::{SurveyId, UserId};

/// Local values loaded at startup and flushed on every write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Survey that was active when the app last ran
    pub last_active_survey_id: Option<SurveyId>,
    /// User the queue was last written for
    pub last_user_id: Option<UserId>,
}
