//! Data models for fieldsync

mod condition;
mod ids;
mod loi;
mod mutation;
mod settings;
mod submission;
mod survey;
mod sync_status;
mod upload_queue;

pub use condition::{Condition, ConditionError, Expression, ExpressionType, MatchType};
pub use ids::{JobId, LoiId, MutationId, OptionId, SubmissionId, SurveyId, TaskId, UserId};
pub use loi::{AuditInfo, Coordinate, Geometry, LocationOfInterest};
pub use mutation::{
    LoiChange, MediaUpload, Mutation, MutationKind, MutationPayload, MutationType, NewMedia,
    NewMutation, SubmissionChange,
};
pub use settings::LocalSettings;
pub use submission::{Submission, TaskSelections, TaskValue, ValueDelta};
pub use survey::{
    Cardinality, DataCollectionStrategy, Job, MultipleChoice, Survey, Task, TaskOption, TaskType,
};
pub use sync_status::{SyncStatus, TransitionError};
pub use upload_queue::{QueueEvent, UploadQueueEntry};
