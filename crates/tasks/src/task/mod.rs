//! Task records and the task state machine

mod record;
mod status;

pub(crate) use record::TaskRecord;
pub use record::{
    OwnerId, PageRange, Progress, RunnerHandle, TaskId, TaskKind, TaskSnapshot, TaskSpec,
};
pub use status::TaskStatus;
