use crate::config::ContainerConfig;
use crate::container_lookup::ContainerLookup;
use crate::messages::NodeMessage;
use async_trait::async_trait;
use ethers::types::Address;
use eyre::{eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Admission filter every inbound message passes before the processor sees
/// it. Implementations return the (possibly annotated) message on success
/// and an error describing the rejection otherwise.
#[async_trait]
pub trait Guardian: Send + Sync {
    async fn process_message(&self, msg: NodeMessage) -> Result<NodeMessage>;
}

#[derive(Debug, Default, Clone)]
struct ContainerPolicy {
    allowed_ips: Vec<String>,
    allowed_addresses: HashSet<Address>,
    allowed_delegate_addresses: HashSet<Address>,
    generates_proofs: bool,
}

/// Allow-list guardian driven by per-container config: requester IPs for
/// off-chain jobs, consumer addresses for on-chain subscriptions, signer
/// addresses for delegated subscriptions, and proof capability.
pub struct AllowlistGuardian {
    policies: HashMap<String, ContainerPolicy>,
    lookup: Arc<ContainerLookup>,
}

impl AllowlistGuardian {
    pub fn new(containers: &[ContainerConfig], lookup: Arc<ContainerLookup>) -> Self {
        let policies = containers
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    ContainerPolicy {
                        allowed_ips: c.allowed_ips.clone(),
                        allowed_addresses: c.allowed_addresses.iter().copied().collect(),
                        allowed_delegate_addresses: c
                            .allowed_delegate_addresses
                            .iter()
                            .copied()
                            .collect(),
                        generates_proofs: c.generates_proofs,
                    },
                )
            })
            .collect();
        Self { policies, lookup }
    }

    fn policy(&self, container: &str) -> Result<&ContainerPolicy> {
        self.policies
            .get(container)
            .ok_or_else(|| eyre!("container '{container}' is not served by this node"))
    }

    /// Exact or prefix match, so entries like `10.0.` cover a subnet.
    fn ip_allowed(policy: &ContainerPolicy, ip: &str) -> bool {
        policy.allowed_ips.is_empty() || policy.allowed_ips.iter().any(|allowed| ip.starts_with(allowed))
    }

    fn address_allowed(allowed: &HashSet<Address>, address: Address) -> bool {
        allowed.is_empty() || allowed.contains(&address)
    }

    fn check_proofs(&self, containers: &[String], requires_proof: bool) -> Result<()> {
        if !requires_proof {
            return Ok(());
        }
        for container in containers {
            if !self.policy(container)?.generates_proofs {
                return Err(eyre!("container '{container}' cannot generate required proofs"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Guardian for AllowlistGuardian {
    async fn process_message(&self, msg: NodeMessage) -> Result<NodeMessage> {
        match &msg {
            NodeMessage::OffchainJob(job) => {
                for container in &job.containers {
                    let policy = self.policy(container)?;
                    if !Self::ip_allowed(policy, &job.ip) {
                        return Err(eyre!(
                            "ip {} not allowed for container '{container}'",
                            job.ip
                        ));
                    }
                }
                self.check_proofs(&job.containers, job.requires_proof)?;
            }
            NodeMessage::DelegatedSubscription(delegated) => {
                let containers = self.lookup.get(&delegated.subscription.containers);
                if containers.is_empty() {
                    return Err(eyre!("unknown container permutation in delegated subscription"));
                }
                for container in &containers {
                    let policy = self.policy(container)?;
                    if !Self::ip_allowed(policy, &delegated.ip) {
                        return Err(eyre!(
                            "ip {} not allowed for container '{container}'",
                            delegated.ip
                        ));
                    }
                    if !Self::address_allowed(
                        &policy.allowed_delegate_addresses,
                        delegated.subscription.owner,
                    ) {
                        return Err(eyre!(
                            "owner {:?} not allowed to delegate to container '{container}'",
                            delegated.subscription.owner
                        ));
                    }
                }
            }
            NodeMessage::SubscriptionCreated(sub) => {
                if sub.containers.is_empty() {
                    return Err(eyre!(
                        "subscription {} names a container permutation this node does not serve",
                        sub.id
                    ));
                }
                for container in &sub.containers {
                    let policy = self.policy(container)?;
                    if !Self::address_allowed(&policy.allowed_addresses, sub.owner) {
                        return Err(eyre!(
                            "owner {:?} not allowed on container '{container}'",
                            sub.owner
                        ));
                    }
                }
                self.check_proofs(&sub.containers, sub.requires_proof())?;
            }
        }
        tracing::debug!(kind = msg.kind(), "message admitted");
        Ok(msg)
    }
}
