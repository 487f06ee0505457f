use crate::context::Context;
use crate::errors::Result;
use crate::vertex::{BuildResult, SharedResult};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// String-valued result used by unit tests
pub(crate) struct TestResult {
    id: String,
    value: String,
}

impl TestResult {
    pub(crate) fn shared(value: &str) -> SharedResult {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            value: value.to_string(),
        })
    }

    pub(crate) fn value_of(result: &SharedResult) -> String {
        result
            .sys()
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BuildResult for TestResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn sys(&self) -> &(dyn Any + Send + Sync) {
        &self.value
    }

    async fn release(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}
