//! Stage integrations: the side-effecting call behind each pipeline stage.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use carpipe_core::{IntegrationResult, PipelineStage, TaskId, TraceContext};

/// One stage's external call. Expected failures come back as
/// [`IntegrationResult::failed`] values, never panics.
pub trait StageIntegration: Send + Sync {
    fn run(&self, task_id: &TaskId, trace: &TraceContext) -> IntegrationResult;
}

impl<F> StageIntegration for F
where
    F: Fn(&TaskId, &TraceContext) -> IntegrationResult + Send + Sync,
{
    fn run(&self, task_id: &TaskId, trace: &TraceContext) -> IntegrationResult {
        self(task_id, trace)
    }
}

/// Integration bound to each stage.
#[derive(Clone, Default)]
pub struct IntegrationRegistry {
    by_stage: HashMap<PipelineStage, Arc<dyn StageIntegration>>,
}

impl IntegrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: PipelineStage, integration: impl StageIntegration + 'static) {
        self.by_stage.insert(stage, Arc::new(integration));
    }

    pub fn with(
        mut self,
        stage: PipelineStage,
        integration: impl StageIntegration + 'static,
    ) -> Self {
        self.register(stage, integration);
        self
    }

    pub fn for_stage(&self, stage: PipelineStage) -> Option<&dyn StageIntegration> {
        self.by_stage.get(&stage).map(|i| i.as_ref())
    }

    /// A registry where every stage succeeds with an empty payload.
    pub fn succeeding() -> Self {
        PipelineStage::ALL.into_iter().fold(Self::new(), |registry, stage| {
            registry.with(stage, |_: &TaskId, _: &TraceContext| {
                IntegrationResult::succeeded_empty()
            })
        })
    }
}

impl fmt::Debug for IntegrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<_> = self.by_stage.keys().copied().collect();
        stages.sort();
        f.debug_struct("IntegrationRegistry")
            .field("stages", &stages)
            .finish()
    }
}
