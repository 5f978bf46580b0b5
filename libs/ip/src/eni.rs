//! Secondary IPv4 address management across the instance's network
//! interfaces. Addresses are spread over the existing interfaces first; a
//! fresh interface is attached once every known one is full.

use std::sync::Arc;

use eniop_aws::helper::{Ec2Api, SECONDARY_ENI_DESCRIPTION};
use eniop_aws::limits::InstanceLimits;
use eniop_operator::error::{Error, Result};
use tracing::{info, warn};

const INTERFACE_TYPE_TRUNK: &str = "trunk";

struct EniIps {
    eni_id: String,
    device_index: i32,
    ips: Vec<String>,
}

pub struct EniManager {
    instance_id: String,
    subnet_id: String,
    limits: InstanceLimits,
    interfaces: Vec<EniIps>,
}

impl EniManager {
    pub fn new(instance_id: &str, subnet_id: &str, limits: InstanceLimits) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            subnet_id: subnet_id.to_string(),
            limits,
            interfaces: Vec::new(),
        }
    }

    /// Secondary addresses one interface can carry, the primary address
    /// excluded.
    fn per_interface_capacity(&self) -> usize {
        self.limits.ipv4_per_interface.saturating_sub(1)
    }

    /// Discover the instance's interfaces and return every secondary
    /// address already present on them.
    pub async fn init_resources(&mut self, ec2: &Arc<dyn Ec2Api>) -> Result<Vec<String>> {
        let interfaces = ec2
            .get_instance_network_interfaces(&self.instance_id)
            .await
            .map_err(|e| {
                Error::Ec2Error("failed to describe the instance interfaces".to_string(), e)
            })?;

        let mut present = Vec::new();
        self.interfaces.clear();
        for nic in interfaces {
            if nic.interface_type.as_deref() == Some(INTERFACE_TYPE_TRUNK) {
                continue;
            }
            present.extend(nic.secondary_ipv4.iter().cloned());
            self.interfaces.push(EniIps {
                eni_id: nic.id,
                device_index: nic.device_index.unwrap_or_default(),
                ips: nic.secondary_ipv4,
            });
        }
        info!(
            msg = "discovered secondary addresses",
            instance = self.instance_id,
            interfaces = self.interfaces.len(),
            addresses = present.len()
        );
        Ok(present)
    }

    fn next_device_index(&self) -> i32 {
        self.interfaces
            .iter()
            .map(|eni| eni.device_index)
            .max()
            .map(|index| index + 1)
            .unwrap_or(0)
    }

    /// Assign `count` new secondary addresses. On failure the addresses
    /// created before the error are returned alongside it so the pool can
    /// keep them.
    pub async fn create_ipv4_addresses(
        &mut self,
        count: usize,
        ec2: &Arc<dyn Ec2Api>,
    ) -> (Vec<String>, Result<()>) {
        let mut created: Vec<String> = Vec::new();
        let mut remaining = count;

        while remaining > 0 {
            let capacity = self.per_interface_capacity();
            let slot = self
                .interfaces
                .iter_mut()
                .find(|eni| eni.ips.len() < capacity);

            match slot {
                Some(eni) => {
                    let room = capacity - eni.ips.len();
                    let batch = remaining.min(room);
                    match ec2.assign_ipv4_addresses(&eni.eni_id, batch as i32).await {
                        Ok(ips) => {
                            eni.ips.extend(ips.iter().cloned());
                            created.extend(ips);
                            remaining -= batch;
                        }
                        Err(e) => {
                            return (
                                created,
                                Err(Error::Ec2Error(
                                    "failed to assign secondary addresses".to_string(),
                                    e,
                                )),
                            );
                        }
                    }
                }
                None => {
                    if self.interfaces.len() >= self.limits.interfaces {
                        return (
                            created,
                            Err(Error::Invalid(format!(
                                "instance {} has no room for more addresses",
                                self.instance_id
                            ))),
                        );
                    }
                    let batch = remaining.min(capacity);
                    let result = ec2
                        .create_and_attach_network_interface(
                            &self.instance_id,
                            &self.subnet_id,
                            &[],
                            self.next_device_index(),
                            SECONDARY_ENI_DESCRIPTION,
                            None,
                            Some(batch as i32),
                        )
                        .await;
                    match result {
                        Ok(nic) => {
                            info!(
                                msg = "attached a secondary interface",
                                instance = self.instance_id,
                                eni = %nic.id
                            );
                            created.extend(nic.secondary_ipv4.iter().cloned());
                            remaining -= nic.secondary_ipv4.len().min(remaining);
                            let device_index =
                                nic.device_index.unwrap_or_else(|| self.next_device_index());
                            self.interfaces.push(EniIps {
                                eni_id: nic.id,
                                device_index,
                                ips: nic.secondary_ipv4,
                            });
                        }
                        Err(e) => {
                            return (
                                created,
                                Err(Error::Ec2Error(
                                    "failed to attach a secondary interface".to_string(),
                                    e,
                                )),
                            );
                        }
                    }
                }
            }
        }
        (created, Ok(()))
    }

    /// Unassign the given addresses. Addresses that could not be released
    /// are returned alongside the error.
    pub async fn delete_ipv4_addresses(
        &mut self,
        addresses: &[String],
        ec2: &Arc<dyn Ec2Api>,
    ) -> (Vec<String>, Result<()>) {
        let mut failed = Vec::new();
        let mut last_error = None;

        for address in addresses {
            let owner = self
                .interfaces
                .iter_mut()
                .find(|eni| eni.ips.contains(address));
            let Some(eni) = owner else {
                warn!(
                    msg = "address not tracked on any interface, skipping",
                    instance = self.instance_id,
                    address
                );
                continue;
            };
            match ec2
                .unassign_ipv4_addresses(&eni.eni_id, std::slice::from_ref(address))
                .await
            {
                Ok(()) => eni.ips.retain(|ip| ip != address),
                Err(e) => {
                    failed.push(address.clone());
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => (failed, Ok(())),
            Some(e) => (
                failed,
                Err(Error::Ec2Error(
                    "failed to unassign some secondary addresses".to_string(),
                    e,
                )),
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use eniop_aws::error::{Ec2Error, ErrorKind};
    use eniop_aws::helper::{InstanceDetails, NetworkInterface, SubnetInfo, TrunkAssociation};

    const INSTANCE_ID: &str = "i-00000000000000000";
    const SUBNET_ID: &str = "subnet-00000000000000000";

    fn limits() -> InstanceLimits {
        InstanceLimits {
            interfaces: 2,
            ipv4_per_interface: 4,
            branch_interfaces: 0,
        }
    }

    #[derive(Default)]
    struct FakeEc2 {
        interfaces: Mutex<Vec<NetworkInterface>>,
        assign_results: Mutex<VecDeque<Result<Vec<String>, Ec2Error>>>,
        attach_results: Mutex<VecDeque<Result<NetworkInterface, Ec2Error>>>,
        unassign_failures: Mutex<Vec<String>>,
        unassigned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Ec2Api for FakeEc2 {
        async fn get_instance_details(&self, _: &str) -> Result<InstanceDetails, Ec2Error> {
            unimplemented!()
        }
        async fn get_subnet(&self, _: &str) -> Result<SubnetInfo, Ec2Error> {
            unimplemented!()
        }
        async fn get_trunk_interface(
            &self,
            _: &str,
        ) -> Result<Option<NetworkInterface>, Ec2Error> {
            unimplemented!()
        }
        async fn get_instance_network_interfaces(
            &self,
            _: &str,
        ) -> Result<Vec<NetworkInterface>, Ec2Error> {
            Ok(self.interfaces.lock().unwrap().clone())
        }
        async fn create_network_interface(
            &self,
            _: &str,
            _: &str,
            _: &[String],
            _: Option<i32>,
            _: Option<&str>,
        ) -> Result<NetworkInterface, Ec2Error> {
            unimplemented!()
        }
        async fn create_and_attach_network_interface(
            &self,
            _: &str,
            _: &str,
            _: &[String],
            _: i32,
            _: &str,
            _: Option<&str>,
            _: Option<i32>,
        ) -> Result<NetworkInterface, Ec2Error> {
            self.attach_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(Ec2Error::new("mock", ErrorKind::Transient, "unexpected attach"))
                })
        }
        async fn delete_network_interface(&self, _: &str) -> Result<(), Ec2Error> {
            Ok(())
        }
        async fn assign_ipv4_addresses(&self, _: &str, _: i32) -> Result<Vec<String>, Ec2Error> {
            self.assign_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(Ec2Error::new("mock", ErrorKind::Transient, "unexpected assign"))
                })
        }
        async fn unassign_ipv4_addresses(
            &self,
            _: &str,
            addresses: &[String],
        ) -> Result<(), Ec2Error> {
            for address in addresses {
                if self.unassign_failures.lock().unwrap().contains(address) {
                    return Err(Ec2Error::new("mock", ErrorKind::Transient, "mock error"));
                }
                self.unassigned.lock().unwrap().push(address.clone());
            }
            Ok(())
        }
        async fn describe_trunk_interface_associations(
            &self,
            _: &str,
        ) -> Result<Vec<TrunkAssociation>, Ec2Error> {
            unimplemented!()
        }
        async fn associate_branch_to_trunk(&self, _: &str, _: &str, _: i32) -> Result<(), Ec2Error> {
            unimplemented!()
        }
    }

    fn fake_with_primary(secondary: &[&str]) -> Arc<FakeEc2> {
        let fake = FakeEc2::default();
        *fake.interfaces.lock().unwrap() = vec![NetworkInterface {
            id: "eni-primary".to_string(),
            device_index: Some(0),
            secondary_ipv4: secondary.iter().map(|s| s.to_string()).collect(),
            ..NetworkInterface::default()
        }];
        Arc::new(fake)
    }

    #[tokio::test]
    async fn test_init_resources_collects_secondary_ips() {
        let fake = fake_with_primary(&["10.0.0.5", "10.0.0.6"]);
        let ec2: Arc<dyn Ec2Api> = fake;
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());

        let present = manager.init_resources(&ec2).await.unwrap();
        assert_eq!(present, vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()]);
    }

    #[tokio::test]
    async fn test_init_resources_skips_trunk_interfaces() {
        let fake = FakeEc2::default();
        *fake.interfaces.lock().unwrap() = vec![NetworkInterface {
            id: "eni-trunk".to_string(),
            interface_type: Some("trunk".to_string()),
            secondary_ipv4: vec!["10.0.0.9".to_string()],
            ..NetworkInterface::default()
        }];
        let ec2: Arc<dyn Ec2Api> = Arc::new(fake);
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());

        let present = manager.init_resources(&ec2).await.unwrap();
        assert!(present.is_empty());
    }

    #[tokio::test]
    async fn test_create_fills_existing_interface_first() {
        let fake = fake_with_primary(&["10.0.0.5"]);
        fake.assign_results
            .lock()
            .unwrap()
            .push_back(Ok(vec!["10.0.0.6".to_string(), "10.0.0.7".to_string()]));
        let ec2: Arc<dyn Ec2Api> = Arc::clone(&fake) as Arc<dyn Ec2Api>;
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());
        manager.init_resources(&ec2).await.unwrap();

        let (created, result) = manager.create_ipv4_addresses(2, &ec2).await;
        result.unwrap();
        assert_eq!(created, vec!["10.0.0.6".to_string(), "10.0.0.7".to_string()]);
    }

    #[tokio::test]
    async fn test_create_attaches_new_interface_when_full() {
        // Primary interface is at capacity: 3 secondaries on a 4 address
        // interface.
        let fake = fake_with_primary(&["10.0.0.5", "10.0.0.6", "10.0.0.7"]);
        fake.attach_results
            .lock()
            .unwrap()
            .push_back(Ok(NetworkInterface {
                id: "eni-secondary".to_string(),
                device_index: Some(1),
                secondary_ipv4: vec!["10.0.1.5".to_string()],
                ..NetworkInterface::default()
            }));
        let ec2: Arc<dyn Ec2Api> = Arc::clone(&fake) as Arc<dyn Ec2Api>;
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());
        manager.init_resources(&ec2).await.unwrap();

        let (created, result) = manager.create_ipv4_addresses(1, &ec2).await;
        result.unwrap();
        assert_eq!(created, vec!["10.0.1.5".to_string()]);
    }

    #[tokio::test]
    async fn test_create_fails_when_instance_is_full() {
        let fake = fake_with_primary(&["10.0.0.5", "10.0.0.6", "10.0.0.7"]);
        fake.interfaces.lock().unwrap().push(NetworkInterface {
            id: "eni-second".to_string(),
            device_index: Some(1),
            secondary_ipv4: vec![
                "10.0.1.5".to_string(),
                "10.0.1.6".to_string(),
                "10.0.1.7".to_string(),
            ],
            ..NetworkInterface::default()
        });
        let ec2: Arc<dyn Ec2Api> = Arc::clone(&fake) as Arc<dyn Ec2Api>;
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());
        manager.init_resources(&ec2).await.unwrap();

        let (created, result) = manager.create_ipv4_addresses(1, &ec2).await;
        assert!(created.is_empty());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_partial_create_returns_prefix() {
        let fake = fake_with_primary(&[]);
        {
            let mut assigns = fake.assign_results.lock().unwrap();
            assigns.push_back(Ok(vec![
                "10.0.0.5".to_string(),
                "10.0.0.6".to_string(),
                "10.0.0.7".to_string(),
            ]));
        }
        // Second batch needs a new interface; make the attach fail.
        let ec2: Arc<dyn Ec2Api> = Arc::clone(&fake) as Arc<dyn Ec2Api>;
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());
        manager.init_resources(&ec2).await.unwrap();

        let (created, result) = manager.create_ipv4_addresses(5, &ec2).await;
        assert_eq!(created.len(), 3);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_returns_failed_addresses() {
        let fake = fake_with_primary(&["10.0.0.5", "10.0.0.6"]);
        fake.unassign_failures
            .lock()
            .unwrap()
            .push("10.0.0.5".to_string());
        let ec2: Arc<dyn Ec2Api> = Arc::clone(&fake) as Arc<dyn Ec2Api>;
        let mut manager = EniManager::new(INSTANCE_ID, SUBNET_ID, limits());
        manager.init_resources(&ec2).await.unwrap();

        let (failed, result) = manager
            .delete_ipv4_addresses(
                &["10.0.0.5".to_string(), "10.0.0.6".to_string()],
                &ec2,
            )
            .await;
        assert_eq!(failed, vec!["10.0.0.5".to_string()]);
        assert!(result.is_err());
        assert_eq!(*fake.unassigned.lock().unwrap(), vec!["10.0.0.6".to_string()]);
    }
}
