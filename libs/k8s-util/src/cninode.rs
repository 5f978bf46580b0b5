//! Access to the per node CNINode resource. Status writes go through the
//! paired `(old, new)` copies so a concurrent writer surfaces as a
//! conflict instead of a lost update.

use std::sync::Arc;

use eniop_api::cninode::{CNINode, CNINodeStatus, WarmBranchENI};
use tracing::{info, warn};

use crate::error::Result;
use crate::wrapper::K8sApi;

pub struct CNINodeHandler {
    client: Arc<dyn K8sApi>,
}

impl CNINodeHandler {
    pub fn new(client: Arc<dyn K8sApi>) -> Self {
        Self { client }
    }

    /// Branch interfaces currently recorded on the node, empty when the
    /// CNINode is missing.
    pub async fn list_branch_enis(&self, node_name: &str) -> Vec<WarmBranchENI> {
        match self.client.get_cninode(node_name).await {
            Ok(cninode) => cninode.status.map(|s| s.branch_enis).unwrap_or_default(),
            Err(e) => {
                warn!(msg = "could not read CNINode", node = node_name, %e);
                Vec::new()
            }
        }
    }

    /// Record branch interfaces on the node status, replacing entries with
    /// the same interface id.
    pub async fn add_branch_enis(&self, node_name: &str, enis: &[WarmBranchENI]) -> Result<()> {
        let old = self.client.get_cninode(node_name).await?;
        let mut new = old.clone();
        let mut merged = new
            .status
            .as_ref()
            .map(|s| s.branch_enis.clone())
            .unwrap_or_default();
        for eni in enis {
            match merged.iter_mut().find(|existing| existing.id == eni.id) {
                Some(existing) => *existing = eni.clone(),
                None => merged.push(eni.clone()),
            }
        }
        new.status = Some(CNINodeStatus { branch_enis: merged });

        info!(
            msg = "adding branch interfaces to CNINode",
            node = node_name,
            count = enis.len()
        );
        self.client.update_cninode_status(&old, &new).await?;
        Ok(())
    }

    /// Remove branch interfaces from the node status by interface id.
    pub async fn delete_branch_enis(&self, node_name: &str, eni_ids: &[String]) -> Result<()> {
        let old = self.client.get_cninode(node_name).await?;
        let mut new = old.clone();
        let remaining: Vec<WarmBranchENI> = new
            .status
            .as_ref()
            .map(|s| {
                s.branch_enis
                    .iter()
                    .filter(|eni| !eni_ids.contains(&eni.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        new.status = Some(CNINodeStatus {
            branch_enis: remaining,
        });

        self.client.update_cninode_status(&old, &new).await?;
        Ok(())
    }

    /// Remaining room for warmed branch interfaces on the node.
    pub async fn available_spots(&self, node_name: &str, branch_limit: usize) -> Result<usize> {
        let cninode = self.client.get_cninode(node_name).await?;
        let recorded = cninode
            .status
            .map(|s| s.branch_enis.len())
            .unwrap_or_default();
        Ok(branch_limit.saturating_sub(recorded))
    }
}

pub use eniop_api::cninode::FeatureName;
