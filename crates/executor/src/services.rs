use crate::{builder::ExecutorBuilder, plan::Planner};
use common::Config;
use std::sync::Arc;
use telemetry::Observers;

/// Process-wide collaborators shared by every statement.
#[derive(Clone)]
pub struct ExecServices {
    pub config: Config,
    pub planner: Arc<dyn Planner>,
    pub builder: Arc<dyn ExecutorBuilder>,
    pub observers: Observers,
}

impl ExecServices {
    pub fn new(
        config: Config,
        planner: Arc<dyn Planner>,
        builder: Arc<dyn ExecutorBuilder>,
    ) -> Self {
        let observers = Observers::new(&config);
        Self {
            config,
            planner,
            builder,
            observers,
        }
    }

    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }
}

impl std::fmt::Debug for ExecServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecServices")
            .field("config", &self.config)
            .field("observers", &self.observers)
            .finish()
    }
}
