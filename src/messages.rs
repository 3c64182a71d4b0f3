use crate::subscription::{SerializedSubscription, Subscription};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a job originated and where its output is headed. Encoded as small
/// integers on the wire, matching the container protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobLocation {
    Onchain,
    Offchain,
    Stream,
}

impl From<JobLocation> for u8 {
    fn from(loc: JobLocation) -> u8 {
        match loc {
            JobLocation::Onchain => 0,
            JobLocation::Offchain => 1,
            JobLocation::Stream => 2,
        }
    }
}

impl TryFrom<u8> for JobLocation {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(JobLocation::Onchain),
            1 => Ok(JobLocation::Offchain),
            2 => Ok(JobLocation::Stream),
            other => Err(format!("invalid job location {other}")),
        }
    }
}

/// The body POSTed to a container's `/service_output` endpoint, and the
/// orchestrator's working input as it chains containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub source: JobLocation,
    pub destination: JobLocation,
    pub data: Value,
    #[serde(default)]
    pub requires_proof: bool,
}

/// Outcome of one container step: its parsed output, or the error that
/// stopped the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContainerResult {
    Output { container: String, output: Value },
    Error { container: String, error: String },
}

impl ContainerResult {
    pub fn container(&self) -> &str {
        match self {
            ContainerResult::Output { container, .. } => container,
            ContainerResult::Error { container, .. } => container,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ContainerResult::Error { .. })
    }
}

/// EIP-712 signature material accompanying a delegated subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSignatureParams {
    pub nonce: u32,
    pub expiry: u32,
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// An off-chain job submitted through the REST ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffchainJobMessage {
    pub id: String,
    pub ip: String,
    pub containers: Vec<String>,
    pub data: Value,
    #[serde(default)]
    pub requires_proof: bool,
}

impl OffchainJobMessage {
    /// Store key, double-keyed by requesting IP and job id.
    pub fn job_key(&self) -> String {
        format!("{}:{}", self.ip, self.id)
    }
}

/// An off-chain signed subscription the node should create and deliver
/// on-chain on the owner's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedSubscriptionMessage {
    pub ip: String,
    pub subscription: SerializedSubscription,
    pub signature: CoordinatorSignatureParams,
    pub data: Value,
    #[serde(default)]
    pub requires_proof: bool,
}

/// The single dispatch point for everything the guardian admits into the
/// node: REST jobs, delegated subscriptions, and listener-discovered
/// on-chain subscriptions.
#[derive(Debug, Clone)]
pub enum NodeMessage {
    OffchainJob(OffchainJobMessage),
    DelegatedSubscription(Box<DelegatedSubscriptionMessage>),
    SubscriptionCreated(Subscription),
}

impl NodeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::OffchainJob(_) => "offchain_job",
            NodeMessage::DelegatedSubscription(_) => "delegated_subscription",
            NodeMessage::SubscriptionCreated(_) => "subscription_created",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_location_wire_form_is_integer() {
        let input = JobInput {
            source: JobLocation::Offchain,
            destination: JobLocation::Stream,
            data: json!({"prompt": "hi"}),
            requires_proof: false,
        };
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["source"], json!(1));
        assert_eq!(value["destination"], json!(2));

        let back: JobInput = serde_json::from_value(value).unwrap();
        assert_eq!(back.source, JobLocation::Offchain);
        assert_eq!(back.destination, JobLocation::Stream);
    }

    #[test]
    fn invalid_job_location_is_rejected() {
        assert!(serde_json::from_value::<JobLocation>(json!(3)).is_err());
    }

    #[test]
    fn container_result_serde_distinguishes_variants() {
        let ok = ContainerResult::Output {
            container: "echo".into(),
            output: json!({"x": 1}),
        };
        let err = ContainerResult::Error {
            container: "echo".into(),
            error: "boom".into(),
        };

        let ok_back: ContainerResult = serde_json::from_value(serde_json::to_value(&ok).unwrap()).unwrap();
        let err_back: ContainerResult =
            serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(ok_back, ok);
        assert_eq!(err_back, err);
        assert!(!ok.is_error());
        assert!(err.is_error());
    }

    #[test]
    fn offchain_job_key_is_ip_scoped() {
        let msg = OffchainJobMessage {
            id: "job-1".into(),
            ip: "10.0.0.2".into(),
            containers: vec!["echo".into()],
            data: json!({}),
            requires_proof: false,
        };
        assert_eq!(msg.job_key(), "10.0.0.2:job-1");
    }
}
