//! # Concurrency Controller
//!
//! Resolves concurrency keys and guards the shared in-flight counters. The
//! counters live in the repository so every controller replica and worker
//! sees the same value; this type holds no state of its own. The queue's claim
//! and terminal transitions move the same counters inside their own atomic
//! repository calls.

use crate::error::{TaskerResult, ValidationError};
use crate::models::ConcurrencySpec;
use crate::orchestration::expression::ConcurrencyExpression;
use crate::repository::ConcurrencyRepository;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ConcurrencyController {
    repository: Arc<dyn ConcurrencyRepository>,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController").finish_non_exhaustive()
    }
}

impl ConcurrencyController {
    pub fn new(repository: Arc<dyn ConcurrencyRepository>) -> Self {
        Self { repository }
    }

    /// Evaluate `expression` against a trigger context
    pub fn resolve_key(expression: &str, context: &Value) -> Result<String, ValidationError> {
        ConcurrencyExpression::parse(expression)?.evaluate(context)
    }

    /// Key and limit for a step, `None` when the step is unlimited
    pub fn resolve_spec(
        spec: Option<&ConcurrencySpec>,
        context: &Value,
    ) -> Result<Option<(String, u32)>, ValidationError> {
        spec.map(|spec| Ok((Self::resolve_key(&spec.expression, context)?, spec.max_runs)))
            .transpose()
    }

    pub async fn try_reserve(&self, tenant_id: Uuid, key: &str, limit: u32) -> TaskerResult<bool> {
        let reserved = self.repository.try_reserve(tenant_id, key, limit).await?;
        if !reserved {
            debug!(tenant_id = %tenant_id, key = %key, limit, "Concurrency key saturated");
        }
        Ok(reserved)
    }

    pub async fn release(&self, tenant_id: Uuid, key: &str) -> TaskerResult<()> {
        self.repository.release(tenant_id, key).await
    }

    pub async fn in_flight(&self, tenant_id: Uuid, key: &str) -> TaskerResult<u32> {
        self.repository.in_flight(tenant_id, key).await
    }
}
