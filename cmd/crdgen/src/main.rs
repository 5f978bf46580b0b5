use eniop_api::cninode::CNINode;
use eniop_api::security_group_policy::SecurityGroupPolicy;

use kube::CustomResourceExt;

fn main() {
    for crd in vec![CNINode::crd(), SecurityGroupPolicy::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
