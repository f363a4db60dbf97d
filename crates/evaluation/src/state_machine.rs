use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Start,
    ImagesExhausted,
    Finalized,
    Abort,
    Retry,
}

/// Lifecycle of one evaluation run.
///
/// `Idle -> Running -> Finalizing -> Done`. Errors move the run to `Failed`;
/// a run that failed after every image was processed may retry finalizing.
pub struct StateContext {
    current_state: PipelineState,
    images_complete: bool,
}

impl StateContext {
    pub fn new() -> Self {
        Self {
            current_state: PipelineState::Idle,
            images_complete: false,
        }
    }

    pub fn apply(&mut self, event: PipelineEvent) -> Result<PipelineState, PipelineError> {
        use PipelineEvent as E;
        use PipelineState as S;

        let next = match (self.current_state, event) {
            (S::Idle, E::Start) => S::Running,
            (S::Running, E::ImagesExhausted) => {
                self.images_complete = true;
                S::Finalizing
            }
            (S::Finalizing, E::Finalized) => S::Done,
            (S::Running | S::Finalizing, E::Abort) => S::Failed,
            (S::Failed, E::Retry) if self.images_complete => S::Finalizing,
            (state, event) => return Err(PipelineError::InvalidState { state, event }),
        };

        tracing::debug!(from = ?self.current_state, to = ?next, ?event, "Pipeline transition");
        self.current_state = next;
        Ok(next)
    }

    pub fn current_state(&self) -> PipelineState {
        self.current_state
    }

    pub fn images_complete(&self) -> bool {
        self.images_complete
    }
}

impl Default for StateContext {
    fn default() -> Self {
        Self::new()
    }
}
