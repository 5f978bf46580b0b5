//! CNINode janitor. A CNINode without a backing node is only deleted once
//! it has been suspect for two consecutive passes, which protects against
//! transient gaps in the node cache.

use std::collections::HashSet;
use std::sync::Arc;

use eniop_k8s_util::wrapper::K8sApi;
use parking_lot::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::manager::NodeManager;

pub struct CNINodeCleaner {
    k8s: Arc<dyn K8sApi>,
    manager: Option<Arc<NodeManager>>,
    interval: Duration,
    suspects: Mutex<Vec<String>>,
}

impl CNINodeCleaner {
    pub fn new(
        k8s: Arc<dyn K8sApi>,
        manager: Option<Arc<NodeManager>>,
        interval: Duration,
    ) -> Self {
        Self {
            k8s,
            manager,
            interval,
            suspects: Mutex::new(Vec::new()),
        }
    }

    /// Run the janitor until cancelled. Panics inside a pass are contained
    /// by the error handling in the pass itself; a failed list simply
    /// skips the pass.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(msg = "starting the CNINode cleanup routine", interval = ?self.interval);
        loop {
            self.clean_up_leaked_cninodes().await;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(msg = "CNINode cleanup routine exiting");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    pub(crate) async fn clean_up_leaked_cninodes(&self) {
        let nodes = match self.k8s.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(msg = "listing nodes failed, skipping the cleanup pass", %e);
                return;
            }
        };
        let node_names: HashSet<String> = nodes
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect();

        // Delete the previous pass's suspects that still have no node.
        let previous = std::mem::take(&mut *self.suspects.lock());
        for name in previous {
            if node_names.contains(&name) {
                continue;
            }
            match self.k8s.get_cninode(&name).await {
                Ok(_) => match self.k8s.delete_cninode(&name).await {
                    Ok(()) => info!(msg = "deleted a leaked CNINode", cninode = name),
                    Err(e) => error!(msg = "failed to delete a leaked CNINode", cninode = name, %e),
                },
                Err(e) if e.is_not_found() => {
                    info!(msg = "suspect CNINode is already gone", cninode = name);
                }
                Err(e) => error!(msg = "failed to look up a suspect CNINode", cninode = name, %e),
            }
        }

        // Retire node contexts whose nodes have disappeared; their delete
        // events may have been missed while the controller was down.
        if let Some(manager) = &self.manager {
            for managed in manager.managed_node_names() {
                if !node_names.contains(&managed) {
                    manager.delete_node(&managed);
                }
            }
        }

        let cninodes = match self.k8s.list_cninodes().await {
            Ok(cninodes) => cninodes,
            Err(e) => {
                error!(msg = "listing CNINodes failed", %e);
                return;
            }
        };
        let mut suspects = self.suspects.lock();
        for cninode in cninodes {
            let Some(name) = cninode.metadata.name else {
                continue;
            };
            if !node_names.contains(&name) {
                info!(msg = "found a possibly leaked CNINode, will check again next pass",
                    cninode = name);
                suspects.push(name);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use eniop_api::cninode::{CNINode, CNINodeSpec, Feature};
    use eniop_api::security_group_policy::SecurityGroupPolicy;
    use eniop_k8s_util::error::{Error, Result};
    use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[derive(Default)]
    struct FakeK8s {
        nodes: StdMutex<Vec<Node>>,
        cninodes: StdMutex<Vec<CNINode>>,
        deleted: StdMutex<Vec<String>>,
    }

    fn not_found(name: &str) -> Error {
        Error::kube(
            format!("failed to get CNINode {name}"),
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("cninodes.vpcresources.k8s.aws \"{name}\" not found"),
                reason: "NotFound".to_string(),
                code: 404,
            }),
        )
    }

    #[async_trait]
    impl K8sApi for FakeK8s {
        async fn get_pod(&self, _: &str, _: &str) -> Result<Pod> {
            unimplemented!()
        }
        async fn get_service_account(&self, _: &str, _: &str) -> Result<ServiceAccount> {
            unimplemented!()
        }
        async fn list_pods_on_node(&self, _: &str) -> Result<Vec<Pod>> {
            unimplemented!()
        }
        async fn annotate_pod(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn advertise_capacity_if_not_set(&self, _: &str, _: &str, _: usize) -> Result<()> {
            unimplemented!()
        }
        async fn get_node(&self, name: &str) -> Result<Node> {
            self.nodes
                .lock()
                .unwrap()
                .iter()
                .find(|node| node.metadata.name.as_deref() == Some(name))
                .cloned()
                .ok_or_else(|| not_found(name))
        }
        async fn list_nodes(&self) -> Result<Vec<Node>> {
            Ok(self.nodes.lock().unwrap().clone())
        }
        async fn get_cninode(&self, name: &str) -> Result<CNINode> {
            self.cninodes
                .lock()
                .unwrap()
                .iter()
                .find(|cninode| cninode.metadata.name.as_deref() == Some(name))
                .cloned()
                .ok_or_else(|| not_found(name))
        }
        async fn create_cninode(&self, _: &Node, _: Vec<Feature>) -> Result<CNINode> {
            unimplemented!()
        }
        async fn update_cninode_status(&self, _: &CNINode, _: &CNINode) -> Result<CNINode> {
            unimplemented!()
        }
        async fn delete_cninode(&self, name: &str) -> Result<()> {
            self.cninodes
                .lock()
                .unwrap()
                .retain(|cninode| cninode.metadata.name.as_deref() != Some(name));
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
        async fn list_cninodes(&self) -> Result<Vec<CNINode>> {
            Ok(self.cninodes.lock().unwrap().clone())
        }
        async fn list_security_group_policies(&self, _: &str) -> Result<Vec<SecurityGroupPolicy>> {
            unimplemented!()
        }
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    fn cninode(name: &str) -> CNINode {
        CNINode {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: CNINodeSpec::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_leaked_cninode_deleted_on_second_pass() {
        let fake = Arc::new(FakeK8s::default());
        *fake.cninodes.lock().unwrap() = vec![cninode("gone-node")];
        let cleaner = CNINodeCleaner::new(
            Arc::clone(&fake) as Arc<dyn K8sApi>,
            None,
            Duration::from_secs(60),
        );

        // First pass only marks the CNINode as suspect.
        cleaner.clean_up_leaked_cninodes().await;
        assert!(fake.deleted.lock().unwrap().is_empty());

        // Still no node on the second pass, the CNINode goes away.
        cleaner.clean_up_leaked_cninodes().await;
        assert_eq!(*fake.deleted.lock().unwrap(), vec!["gone-node".to_string()]);

        // Third pass sees nothing left to clean.
        cleaner.clean_up_leaked_cninodes().await;
        assert_eq!(fake.deleted.lock().unwrap().len(), 1);
        assert!(fake.cninodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_reappearing_clears_the_suspect() {
        let fake = Arc::new(FakeK8s::default());
        *fake.cninodes.lock().unwrap() = vec![cninode("flaky-node")];
        let cleaner = CNINodeCleaner::new(
            Arc::clone(&fake) as Arc<dyn K8sApi>,
            None,
            Duration::from_secs(60),
        );

        cleaner.clean_up_leaked_cninodes().await;

        // The node shows up again before the second pass; the CNINode is
        // spared and no longer suspect.
        fake.nodes.lock().unwrap().push(node("flaky-node"));
        cleaner.clean_up_leaked_cninodes().await;
        assert!(fake.deleted.lock().unwrap().is_empty());

        cleaner.clean_up_leaked_cninodes().await;
        assert!(fake.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cninode_with_backing_node_is_never_suspect() {
        let fake = Arc::new(FakeK8s::default());
        *fake.nodes.lock().unwrap() = vec![node("healthy-node")];
        *fake.cninodes.lock().unwrap() = vec![cninode("healthy-node")];
        let cleaner = CNINodeCleaner::new(
            Arc::clone(&fake) as Arc<dyn K8sApi>,
            None,
            Duration::from_secs(60),
        );

        cleaner.clean_up_leaked_cninodes().await;
        cleaner.clean_up_leaked_cninodes().await;
        assert!(fake.deleted.lock().unwrap().is_empty());
    }
}
