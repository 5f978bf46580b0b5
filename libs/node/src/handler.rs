use std::collections::HashMap;
use std::sync::Arc;

use eniop_operator::error::Result;
use eniop_operator::provider::{PodResourceHandler, requested_resource_count};
use k8s_openapi::api::core::v1::Pod;

/// Routes pod events to the provider serving the extended resource the
/// pod requests.
pub struct ResourceHandler {
    handlers: HashMap<&'static str, Arc<dyn PodResourceHandler>>,
}

impl ResourceHandler {
    pub fn new(handlers: Vec<Arc<dyn PodResourceHandler>>) -> Self {
        Self {
            handlers: handlers
                .into_iter()
                .map(|handler| (handler.resource_name(), handler))
                .collect(),
        }
    }

    pub async fn handle_create(&self, pod: &Pod) -> Result<()> {
        for (resource, handler) in &self.handlers {
            if requested_resource_count(pod, resource) > 0 {
                handler.handle_pod_create(pod).await?;
            }
        }
        Ok(())
    }

    pub async fn handle_delete(&self, pod: &Pod) -> Result<()> {
        for (resource, handler) in &self.handlers {
            if requested_resource_count(pod, resource) > 0 {
                handler.handle_pod_delete(pod).await?;
            }
        }
        Ok(())
    }
}
