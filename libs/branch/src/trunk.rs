//! Per node trunk interface state: the VLAN id space, the pod to branch
//! interface mapping, and the cool down queue of branches waiting for
//! deletion. The state survives controller restarts by rebuilding from the
//! pod annotations cross checked against the cloud's association view.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use eniop_aws::helper::{BRANCH_ENI_DESCRIPTION, Ec2Api, TRUNK_ENI_DESCRIPTION};
use eniop_aws::instance::Ec2Instance;
use eniop_operator::config::{
    COOL_DOWN_PERIOD, DEFAULT_NAMESPACE, MAX_ALLOCATABLE_VLAN_IDS, MAX_DELETE_RETRIES,
    RESOURCE_NAME_POD_ENI,
};
use eniop_operator::error::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

const INTERFACE_TYPE_TRUNK: &str = "trunk";

/// Branch interface entry as serialized into the pod annotation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchEniAnnotation {
    pub eni_id: String,
    pub if_address: String,
    pub private_ip: String,
    pub vlan_id: i32,
    pub subnet_cidr: String,
}

/// A branch interface tracked by the trunk manager.
#[derive(Debug, Clone)]
pub struct EniDetails {
    pub id: String,
    pub mac_address: String,
    pub ipv4_addr: String,
    pub ipv6_addr: Option<String>,
    pub vlan_id: i32,
    pub subnet_cidr: Option<String>,
    pub subnet_v6_cidr: Option<String>,
    /// When the branch entered the cool down queue. `None` marks an entry
    /// eligible for immediate deletion.
    pub deletion_timestamp: Option<Instant>,
    pub delete_retry_count: u32,
}

impl EniDetails {
    fn annotation_entry(&self) -> BranchEniAnnotation {
        BranchEniAnnotation {
            eni_id: self.id.clone(),
            if_address: self.mac_address.clone(),
            private_ip: self.ipv4_addr.clone(),
            vlan_id: self.vlan_id,
            subnet_cidr: self.subnet_cidr.clone().unwrap_or_default(),
        }
    }
}

/// Serialize the branch list the way the CNI plugin reads it from the pod
/// annotation.
pub fn annotation_value(branches: &[EniDetails]) -> Result<String> {
    let entries: Vec<BranchEniAnnotation> =
        branches.iter().map(EniDetails::annotation_entry).collect();
    serde_json::to_string(&entries).map_err(|e| {
        Error::SerializationError("failed to serialize the branch interface list".to_string(), e)
    })
}

struct PodBranches {
    uid: String,
    is_pod_being_deleted: bool,
    branches: Vec<EniDetails>,
}

struct TrunkState {
    trunk_eni_id: Option<String>,
    used_vlan_ids: Vec<bool>,
    branch_enis: HashMap<String, PodBranches>,
    delete_queue: VecDeque<EniDetails>,
}

/// Trunk interface manager for a single node. Guarded by one reader/writer
/// lock which is never held across a cloud call.
pub struct TrunkEni {
    node_name: String,
    instance_id: String,
    subnet_id: String,
    subnet_cidr: Option<String>,
    subnet_v6_cidr: Option<String>,
    instance_security_groups: Vec<String>,
    ec2: Arc<dyn Ec2Api>,
    inner: RwLock<TrunkState>,
}

/// Pod mapping key, `default` substituted for an empty namespace.
pub fn pod_key(namespace: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };
    format!("{namespace}/{name}")
}

/// Branch interfaces recorded on the pod annotation, empty when absent or
/// unparsable.
pub fn branch_enis_from_pod(pod: &Pod) -> Vec<BranchEniAnnotation> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(RESOURCE_NAME_POD_ENI))
        .and_then(|value| serde_json::from_str(value).ok())
        .unwrap_or_default()
}

impl TrunkEni {
    pub fn new(
        ec2: Arc<dyn Ec2Api>,
        node_name: &str,
        instance_id: &str,
        subnet_id: &str,
        subnet_cidr: Option<String>,
        subnet_v6_cidr: Option<String>,
        instance_security_groups: Vec<String>,
    ) -> Self {
        let mut used_vlan_ids = vec![false; MAX_ALLOCATABLE_VLAN_IDS];
        // Vlan 0 carries the trunk's own untagged traffic.
        used_vlan_ids[0] = true;
        Self {
            node_name: node_name.to_string(),
            instance_id: instance_id.to_string(),
            subnet_id: subnet_id.to_string(),
            subnet_cidr,
            subnet_v6_cidr,
            instance_security_groups,
            ec2,
            inner: RwLock::new(TrunkState {
                trunk_eni_id: None,
                used_vlan_ids,
                branch_enis: HashMap::new(),
                delete_queue: VecDeque::new(),
            }),
        }
    }

    pub fn trunk_id(&self) -> Option<String> {
        self.inner.read().trunk_eni_id.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().trunk_eni_id.is_some()
    }

    pub fn is_vlan_used(&self, vlan_id: i32) -> bool {
        self.inner
            .read()
            .used_vlan_ids
            .get(vlan_id as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn branches_for_pod(&self, namespace: &str, name: &str) -> Option<Vec<EniDetails>> {
        self.inner
            .read()
            .branch_enis
            .get(&pod_key(namespace, name))
            .map(|b| b.branches.clone())
    }

    pub fn delete_queue_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .delete_queue
            .iter()
            .map(|eni| eni.id.clone())
            .collect()
    }

    fn assign_vlan_id(state: &mut TrunkState, trunk: &str) -> Result<i32> {
        // Lowest free index first, deterministic for recovery and tests.
        for (index, used) in state.used_vlan_ids.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Ok(index as i32);
            }
        }
        Err(Error::VlanExhausted(trunk.to_string()))
    }

    fn free_vlan_id(state: &mut TrunkState, vlan_id: i32) {
        if let Some(used) = state.used_vlan_ids.get_mut(vlan_id as usize) {
            *used = false;
        }
    }

    fn mark_vlan_assigned(state: &mut TrunkState, vlan_id: i32) {
        if let Some(used) = state.used_vlan_ids.get_mut(vlan_id as usize) {
            *used = true;
        }
    }

    /// Idempotent initialisation: find or create the trunk, then rebuild
    /// the pod mapping from the annotations of the pods already running on
    /// the node. Cloud side branches no live pod claims are queued for
    /// deletion.
    pub async fn init_trunk(
        &self,
        instance: &dyn Ec2Instance,
        existing_pods: &[Pod],
    ) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let trunk = self
            .ec2
            .get_trunk_interface(&self.instance_id)
            .await
            .map_err(|e| Error::Ec2Error("failed to look up the trunk interface".to_string(), e))?;

        let trunk_id = match trunk {
            Some(trunk) => trunk.id,
            None => {
                let device_index = instance.highest_unused_device_index().map_err(|e| {
                    Error::Ec2Error("no free device index for the trunk".to_string(), e)
                })?;
                let nic = self
                    .ec2
                    .create_and_attach_network_interface(
                        &self.instance_id,
                        &self.subnet_id,
                        &[],
                        device_index,
                        TRUNK_ENI_DESCRIPTION,
                        Some(INTERFACE_TYPE_TRUNK),
                        None,
                    )
                    .await
                    .map_err(|e| {
                        Error::Ec2Error("failed to create the trunk interface".to_string(), e)
                    })?;
                info!(msg = "created trunk interface", node = self.node_name, trunk = %nic.id);
                self.inner.write().trunk_eni_id = Some(nic.id);
                // A fresh trunk has no associations to reconcile.
                return Ok(());
            }
        };

        let associations = self
            .ec2
            .describe_trunk_interface_associations(&trunk_id)
            .await
            .map_err(|e| {
                Error::Ec2Error("failed to list the trunk associations".to_string(), e)
            })?;
        let mut vlan_by_branch: HashMap<String, i32> = associations
            .iter()
            .map(|a| (a.branch_eni_id.clone(), a.vlan_id))
            .collect();

        let mut state = self.inner.write();
        state.trunk_eni_id = Some(trunk_id.clone());

        for pod in existing_pods {
            let annotated = branch_enis_from_pod(pod);
            if annotated.is_empty() {
                continue;
            }
            let mut branches = Vec::new();
            for entry in annotated {
                // The cloud view is authoritative; a stale annotation entry
                // without an association is skipped.
                if vlan_by_branch.remove(&entry.eni_id).is_none() {
                    warn!(
                        msg = "annotated branch has no trunk association, skipping",
                        pod = pod.metadata.name.as_deref().unwrap_or_default(),
                        eni = %entry.eni_id
                    );
                    continue;
                }
                Self::mark_vlan_assigned(&mut state, entry.vlan_id);
                branches.push(EniDetails {
                    id: entry.eni_id,
                    mac_address: entry.if_address,
                    ipv4_addr: entry.private_ip,
                    ipv6_addr: None,
                    vlan_id: entry.vlan_id,
                    subnet_cidr: Some(entry.subnet_cidr),
                    subnet_v6_cidr: None,
                    deletion_timestamp: None,
                    delete_retry_count: 0,
                });
            }
            if branches.is_empty() {
                continue;
            }
            let key = pod_key(
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
            );
            state.branch_enis.insert(
                key,
                PodBranches {
                    uid: pod.metadata.uid.clone().unwrap_or_default(),
                    is_pod_being_deleted: false,
                    branches,
                },
            );
        }

        // Whatever is left on the trunk belongs to no live pod; delete it
        // once the controller is caught up.
        for (branch_id, vlan_id) in vlan_by_branch {
            warn!(
                msg = "found dangling branch interface",
                node = self.node_name,
                eni = %branch_id
            );
            Self::mark_vlan_assigned(&mut state, vlan_id);
            state.delete_queue.push_back(EniDetails {
                id: branch_id,
                mac_address: String::new(),
                ipv4_addr: String::new(),
                ipv6_addr: None,
                vlan_id,
                subnet_cidr: self.subnet_cidr.clone(),
                subnet_v6_cidr: None,
                deletion_timestamp: None,
                delete_retry_count: 0,
            });
        }

        Ok(())
    }

    /// Create `count` branch interfaces for the pod and associate each to
    /// the trunk at a fresh VLAN id. On any failure every branch created by
    /// this call is pushed to the front of the delete queue and the error
    /// is returned; the pod mapping is only written when all succeed.
    pub async fn create_and_associate_branch_enis(
        &self,
        pod: &Pod,
        security_groups: Vec<String>,
        count: usize,
    ) -> Result<Vec<EniDetails>> {
        let trunk_id = self
            .trunk_id()
            .ok_or_else(|| Error::NodeNotReady(self.node_name.clone()))?;
        let security_groups = if security_groups.is_empty() {
            self.instance_security_groups.clone()
        } else {
            security_groups
        };

        let mut created: Vec<EniDetails> = Vec::new();
        for _ in 0..count {
            let vlan_id = {
                let mut state = self.inner.write();
                match Self::assign_vlan_id(&mut state, &self.node_name) {
                    Ok(vlan_id) => vlan_id,
                    Err(e) => {
                        Self::push_front_of_delete_queue(&mut state, created);
                        return Err(e);
                    }
                }
            };

            let nic = match self
                .ec2
                .create_network_interface(
                    BRANCH_ENI_DESCRIPTION,
                    &self.subnet_id,
                    &security_groups,
                    None,
                    None,
                )
                .await
            {
                Ok(nic) => nic,
                Err(e) => {
                    let mut state = self.inner.write();
                    Self::free_vlan_id(&mut state, vlan_id);
                    Self::push_front_of_delete_queue(&mut state, created);
                    return Err(Error::Ec2Error(
                        "failed to create a branch interface".to_string(),
                        e,
                    ));
                }
            };

            let details = EniDetails {
                id: nic.id.clone(),
                mac_address: nic.mac_address.clone().unwrap_or_default(),
                ipv4_addr: nic.primary_ipv4.clone().unwrap_or_default(),
                ipv6_addr: nic.ipv6_addr.clone(),
                vlan_id,
                subnet_cidr: self.subnet_cidr.clone(),
                subnet_v6_cidr: self.subnet_v6_cidr.clone(),
                deletion_timestamp: None,
                delete_retry_count: 0,
            };

            if let Err(e) = self
                .ec2
                .associate_branch_to_trunk(&trunk_id, &nic.id, vlan_id)
                .await
            {
                created.push(details);
                let mut state = self.inner.write();
                Self::push_front_of_delete_queue(&mut state, created);
                return Err(Error::Ec2Error(
                    "failed to associate the branch to the trunk".to_string(),
                    e,
                ));
            }
            created.push(details);
        }

        let key = pod_key(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        );
        self.inner.write().branch_enis.insert(
            key,
            PodBranches {
                uid: pod.metadata.uid.clone().unwrap_or_default(),
                is_pod_being_deleted: false,
                branches: created.clone(),
            },
        );
        Ok(created)
    }

    fn push_front_of_delete_queue(state: &mut TrunkState, branches: Vec<EniDetails>) {
        for eni in branches.into_iter().rev() {
            state.delete_queue.push_front(eni);
        }
    }

    /// Flag the mapping before the branches may be released. A UID other
    /// than the cached one means the event belongs to an older pod with
    /// the same name and must be dropped.
    pub fn mark_pod_being_deleted(&self, uid: &str, namespace: &str, name: &str) -> Result<()> {
        let key = pod_key(namespace, name);
        let mut state = self.inner.write();
        let entry = state
            .branch_enis
            .get_mut(&key)
            .ok_or_else(|| Error::MissingData(format!("no branch interfaces cached for {key}")))?;
        if entry.uid != uid {
            return Err(Error::StaleEvent {
                cached: entry.uid.clone(),
                received: uid.to_string(),
            });
        }
        entry.is_pod_being_deleted = true;
        Ok(())
    }

    /// Move the pod's branches into the cool down queue, stamped now, and
    /// drop the mapping. Only permitted once the pod was marked as being
    /// deleted.
    pub fn push_branch_enis_to_cooldown_queue(&self, namespace: &str, name: &str) -> Result<()> {
        let key = pod_key(namespace, name);
        let mut state = self.inner.write();
        let entry = state
            .branch_enis
            .get(&key)
            .ok_or_else(|| Error::MissingData(format!("no branch interfaces cached for {key}")))?;
        if !entry.is_pod_being_deleted {
            return Err(Error::Invalid(format!(
                "pod {key} is not marked as being deleted"
            )));
        }
        let entry = state.branch_enis.remove(&key).expect("entry checked above");
        let now = Instant::now();
        for mut eni in entry.branches {
            eni.deletion_timestamp = Some(now);
            state.delete_queue.push_back(eni);
        }
        Ok(())
    }

    /// Drain the cool down queue head first. Entries without a timestamp
    /// are deleted immediately; a head younger than the cool down period
    /// halts the pass since everything behind it is younger still. Failed
    /// deletions are retried up to the budget, then dropped.
    pub async fn delete_cooled_down_enis(&self) {
        loop {
            let eni = {
                let mut state = self.inner.write();
                match state.delete_queue.front() {
                    None => return,
                    Some(head) => match head.deletion_timestamp {
                        Some(ts) if Instant::now().duration_since(ts) < COOL_DOWN_PERIOD => return,
                        _ => state.delete_queue.pop_front().expect("head checked above"),
                    },
                }
            };

            match self.ec2.delete_network_interface(&eni.id).await {
                Ok(()) => {
                    let mut state = self.inner.write();
                    Self::free_vlan_id(&mut state, eni.vlan_id);
                    info!(msg = "deleted branch interface", node = self.node_name, eni = %eni.id);
                }
                Err(e) => {
                    let mut eni = eni;
                    eni.delete_retry_count += 1;
                    if eni.delete_retry_count >= MAX_DELETE_RETRIES {
                        warn!(
                            msg = "dropping branch interface after repeated delete failures",
                            node = self.node_name,
                            eni = %eni.id,
                            %e
                        );
                    } else {
                        self.inner.write().delete_queue.push_front(eni);
                    }
                }
            }
        }
    }

    /// Push branches of pods that no longer exist to the cool down queue.
    /// Safe to run periodically; drift between watch events is repaired
    /// here.
    pub fn reconcile(&self, live_pods: &[Pod]) -> Result<()> {
        let live: std::collections::HashSet<String> = live_pods
            .iter()
            .map(|pod| {
                pod_key(
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                )
            })
            .collect();

        let mut state = self.inner.write();
        let stale: Vec<String> = state
            .branch_enis
            .keys()
            .filter(|key| !live.contains(*key))
            .cloned()
            .collect();
        let now = Instant::now();
        for key in stale {
            warn!(
                msg = "cleaning up branch interfaces of a pod that no longer exists",
                node = self.node_name,
                pod = %key
            );
            let entry = state.branch_enis.remove(&key).expect("key from iteration");
            for mut eni in entry.branches {
                eni.deletion_timestamp = Some(now);
                state.delete_queue.push_back(eni);
            }
        }
        Ok(())
    }

    /// Authoritative branch list from the cloud, for drift detection. The
    /// lock is not held across the call.
    pub async fn get_branch_interfaces_from_ec2(&self) -> Result<Vec<EniDetails>> {
        let trunk_id = self
            .trunk_id()
            .ok_or_else(|| Error::NodeNotReady(self.node_name.clone()))?;
        let associations = self
            .ec2
            .describe_trunk_interface_associations(&trunk_id)
            .await
            .map_err(|e| {
                Error::Ec2Error("failed to list the trunk associations".to_string(), e)
            })?;
        Ok(associations
            .into_iter()
            .map(|assoc| EniDetails {
                id: assoc.branch_eni_id,
                mac_address: String::new(),
                ipv4_addr: String::new(),
                ipv6_addr: None,
                vlan_id: assoc.vlan_id,
                subnet_cidr: self.subnet_cidr.clone(),
                subnet_v6_cidr: None,
                deletion_timestamp: None,
                delete_retry_count: 0,
            })
            .collect())
    }
}
