//! Transfer Lifecycle States
//!
//! ```text
//! INIT → PRE-TASKS → PRE-TASKS DONE → START DATA → READING | WRITING
//!      → END DATA → CLOSE → MOVE → DATA ENDED → POST-TASKS
//!      → POST-TASKS DONE → END TRANSFER → ALL DONE
//!
//! any non-terminal state → ERROR → IN ERROR
//! ```
//!
//! Terminal states: ALL DONE, IN ERROR.

use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::fsm::{StateMachine, Transitions};

/// States of one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    PreTasks,
    PreTasksDone,
    StartData,
    /// Send direction: the local file is read.
    Reading,
    /// Receive direction: the local file is written.
    Writing,
    EndData,
    Close,
    Move,
    DataEnded,
    PostTasks,
    PostTasksDone,
    EndTransfer,
    AllDone,
    Error,
    InError,
}

impl PipelineState {
    pub const ALL: [PipelineState; 16] = [
        PipelineState::Init,
        PipelineState::PreTasks,
        PipelineState::PreTasksDone,
        PipelineState::StartData,
        PipelineState::Reading,
        PipelineState::Writing,
        PipelineState::EndData,
        PipelineState::Close,
        PipelineState::Move,
        PipelineState::DataEnded,
        PipelineState::PostTasks,
        PipelineState::PostTasksDone,
        PipelineState::EndTransfer,
        PipelineState::AllDone,
        PipelineState::Error,
        PipelineState::InError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::PreTasks => "pre-tasks",
            PipelineState::PreTasksDone => "pre-tasks done",
            PipelineState::StartData => "start data",
            PipelineState::Reading => "reading",
            PipelineState::Writing => "writing",
            PipelineState::EndData => "end data",
            PipelineState::Close => "close",
            PipelineState::Move => "move",
            PipelineState::DataEnded => "data ended",
            PipelineState::PostTasks => "post-tasks",
            PipelineState::PostTasksDone => "post-tasks done",
            PipelineState::EndTransfer => "end transfer",
            PipelineState::AllDone => "all done",
            PipelineState::Error => "error",
            PipelineState::InError => "in error",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::AllDone | PipelineState::InError)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static TRANSITIONS: LazyLock<Arc<Transitions<PipelineState>>> = LazyLock::new(|| {
    use PipelineState::*;

    Arc::new(
        Transitions::new()
            .state(Init, &[PreTasks, Error])
            .state(PreTasks, &[PreTasksDone, Error])
            .state(PreTasksDone, &[StartData, Error])
            .state(StartData, &[Reading, Writing, Error])
            .state(Reading, &[EndData, Error])
            .state(Writing, &[EndData, Error])
            .state(EndData, &[Close, Error])
            .state(Close, &[Move, Error])
            .state(Move, &[DataEnded, Error])
            .state(DataEnded, &[PostTasks, Error])
            .state(PostTasks, &[PostTasksDone, Error])
            .state(PostTasksDone, &[EndTransfer, Error])
            .state(EndTransfer, &[AllDone, Error])
            .state(AllDone, &[])
            .state(Error, &[InError])
            .state(InError, &[]),
    )
});

/// The shared lifecycle transition table.
pub fn transitions() -> Arc<Transitions<PipelineState>> {
    Arc::clone(&TRANSITIONS)
}

/// A fresh machine positioned on `init`.
pub fn new_machine() -> StateMachine<PipelineState> {
    StateMachine::new(transitions(), PipelineState::Init)
}
