use crate::config::ContainerConfig;
use crate::messages::{ContainerResult, JobInput, JobLocation, OffchainJobMessage};
use crate::store::DataStore;
use eyre::{eyre, Result};
use futures::StreamExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Wall-clock budget for a single container call in a regular job.
const RUN_JOB_TIMEOUT: Duration = Duration::from_secs(180);

/// Wall-clock budget for a streaming job's single container.
const STREAM_JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// Port assignment starts here and walks downward on collision.
const PORT_ASSIGN_START: u16 = 3999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEndpoint {
    pub base_url: String,
    pub bearer: Option<String>,
}

/// Resolves each container to the URL the node reaches it at.
///
/// Externally-hosted containers keep their configured URL. Managed ones
/// resolve to the Docker host (when the node itself is containerized) or
/// localhost, on their configured port; conflicting or missing ports are
/// assigned by walking down from 3999.
pub fn resolve_endpoints(
    containers: &[ContainerConfig],
    in_docker: bool,
) -> HashMap<String, ContainerEndpoint> {
    let host = if in_docker {
        "host.docker.internal"
    } else {
        "localhost"
    };

    let mut used: HashSet<u16> = HashSet::new();
    let mut endpoints = HashMap::new();

    for container in containers {
        let endpoint = if let Some(url) = &container.url {
            ContainerEndpoint {
                base_url: url.trim_end_matches('/').to_string(),
                bearer: container.bearer.clone(),
            }
        } else {
            let port = match container.port {
                Some(p) if !used.contains(&p) => p,
                configured => {
                    let mut candidate = PORT_ASSIGN_START;
                    while used.contains(&candidate) {
                        candidate -= 1;
                    }
                    if let Some(p) = configured {
                        tracing::warn!(
                            container = container.id,
                            configured = p,
                            assigned = candidate,
                            "configured port already taken; reassigned"
                        );
                    }
                    candidate
                }
            };
            used.insert(port);
            ContainerEndpoint {
                base_url: format!("http://{host}:{port}"),
                bearer: container.bearer.clone(),
            }
        };
        endpoints.insert(container.id.clone(), endpoint);
    }

    endpoints
}

pub fn running_in_docker() -> bool {
    std::path::Path::new("/.dockerenv").exists()
}

/// Destination for step `index` of an `n`-step pipeline: intermediate hops
/// are off-chain; only the final step carries the job's real destination.
fn step_destination(index: usize, n: usize, final_destination: JobLocation) -> JobLocation {
    if index + 1 == n {
        final_destination
    } else {
        JobLocation::Offchain
    }
}

/// Runs user-declared container pipelines: POSTs each container's input,
/// chains output `i` into input `i+1`, fails fast, and records job state in
/// the store.
pub struct Orchestrator {
    http: reqwest::Client,
    store: DataStore,
    endpoints: HashMap<String, ContainerEndpoint>,
}

impl Orchestrator {
    pub fn new(store: DataStore, endpoints: HashMap<String, ContainerEndpoint>) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            endpoints,
        }
    }

    fn endpoint(&self, container: &str) -> Result<&ContainerEndpoint> {
        self.endpoints
            .get(container)
            .ok_or_else(|| eyre!("no endpoint for container '{container}'"))
    }

    /// One container call. Non-JSON response bodies become errors carrying
    /// the raw text, so misbehaving containers stay diagnosable.
    async fn call_container(
        &self,
        container: &str,
        input: &JobInput,
        timeout: Duration,
    ) -> Result<Value> {
        let endpoint = self.endpoint(container)?;
        let url = format!("{}/service_output", endpoint.base_url);

        let mut request = self.http.post(&url).json(input).timeout(timeout);
        if let Some(token) = &endpoint.bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| eyre!("POST {url} failed: {e}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| eyre!("failed reading response from {url}: {e}"))?;

        if !status.is_success() {
            return Err(eyre!("container '{container}' returned {status}: {body}"));
        }

        serde_json::from_str(&body).map_err(|_| eyre!(body))
    }

    /// Core pipeline loop shared by off-chain and on-chain jobs.
    async fn run_job(
        &self,
        job_input: JobInput,
        containers: &[String],
        message: Option<&OffchainJobMessage>,
    ) -> Vec<ContainerResult> {
        self.store.set_running(message).await;

        let final_destination = job_input.destination;
        let mut results: Vec<ContainerResult> = Vec::with_capacity(containers.len());
        let mut input = JobInput {
            source: job_input.source,
            destination: step_destination(0, containers.len(), final_destination),
            data: job_input.data,
            requires_proof: job_input.requires_proof,
        };

        for (index, container) in containers.iter().enumerate() {
            match self.call_container(container, &input, RUN_JOB_TIMEOUT).await {
                Ok(output) => {
                    tracing::debug!(container, index, "container call succeeded");
                    results.push(ContainerResult::Output {
                        container: container.clone(),
                        output: output.clone(),
                    });
                    input = JobInput {
                        source: JobLocation::Offchain,
                        destination: step_destination(index + 1, containers.len(), final_destination),
                        data: output,
                        requires_proof: input.requires_proof,
                    };
                }
                Err(err) => {
                    tracing::warn!(container, index, error = %err, "container call failed; aborting pipeline");
                    results.push(ContainerResult::Error {
                        container: container.clone(),
                        error: err.to_string(),
                    });
                    self.store.set_failed(message, results.clone()).await;
                    return results;
                }
            }
        }

        self.store.set_success(message, results.clone()).await;
        results
    }

    /// Pipeline run on behalf of the chain processor. The job id exists
    /// only for logging; on-chain jobs have no client-visible record.
    pub async fn process_chain_processor_job(
        &self,
        job_id: &str,
        job_input: JobInput,
        containers: &[String],
        requires_proof: bool,
    ) -> Vec<ContainerResult> {
        tracing::debug!(job_id, ?containers, "running on-chain pipeline");
        let input = JobInput {
            requires_proof,
            ..job_input
        };
        self.run_job(input, containers, None).await
    }

    /// Pipeline run for a REST-ingress job.
    pub async fn process_offchain_job(&self, message: &OffchainJobMessage) -> Vec<ContainerResult> {
        let input = JobInput {
            source: JobLocation::Offchain,
            destination: JobLocation::Offchain,
            data: message.data.clone(),
            requires_proof: message.requires_proof,
        };
        self.run_job(input, &message.containers, Some(message)).await
    }

    /// Streaming job: single container, raw byte stream proxied back to the
    /// ingress and concatenated into the completed-jobs store.
    pub async fn process_streaming_job(&self, message: &OffchainJobMessage) -> Result<Vec<u8>> {
        let Some(container) = message.containers.first() else {
            return Err(eyre!("streaming job without containers"));
        };

        self.store.set_running(Some(message)).await;

        let input = JobInput {
            source: JobLocation::Offchain,
            destination: JobLocation::Stream,
            data: message.data.clone(),
            requires_proof: message.requires_proof,
        };

        match self.stream_container(container, &input).await {
            Ok(collected) => {
                let payload = payload_from_bytes(&collected);
                self.store
                    .set_success(
                        Some(message),
                        vec![ContainerResult::Output {
                            container: container.clone(),
                            output: payload,
                        }],
                    )
                    .await;
                Ok(collected)
            }
            Err(err) => {
                self.store
                    .set_failed(
                        Some(message),
                        vec![ContainerResult::Error {
                            container: container.clone(),
                            error: err.to_string(),
                        }],
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn stream_container(&self, container: &str, input: &JobInput) -> Result<Vec<u8>> {
        let endpoint = self.endpoint(container)?;
        let url = format!("{}/service_output", endpoint.base_url);

        let mut request = self.http.post(&url).json(input).timeout(STREAM_JOB_TIMEOUT);
        if let Some(token) = &endpoint.bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| eyre!("POST {url} failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(eyre!("container '{container}' returned {status}"));
        }

        let mut collected = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| eyre!("stream from '{container}' broke: {e}"))?;
            collected.extend_from_slice(&chunk);
        }

        if collected.is_empty() {
            return Err(eyre!("container '{container}' streamed an empty body"));
        }
        Ok(collected)
    }

    /// Fans out to every container's `/service-resources` endpoint.
    /// Individual failures are logged and omitted from the result.
    pub async fn collect_service_resources(
        &self,
        model_id: Option<&str>,
    ) -> HashMap<String, Value> {
        let mut resources = HashMap::new();
        for (container, endpoint) in &self.endpoints {
            let url = match model_id {
                Some(model) => format!(
                    "{}/service-resources?model_id={model}",
                    endpoint.base_url
                ),
                None => format!("{}/service-resources", endpoint.base_url),
            };

            let mut request = self.http.get(&url).timeout(Duration::from_secs(10));
            if let Some(token) = &endpoint.bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Value>().await {
                        Ok(body) => {
                            resources.insert(container.clone(), body);
                        }
                        Err(err) => {
                            tracing::warn!(container, error = %err, "service-resources returned non-JSON");
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(container, status = %response.status(), "service-resources probe failed");
                }
                Err(err) => {
                    tracing::warn!(container, error = %err, "service-resources unreachable");
                }
            }
        }
        resources
    }
}

/// The seam the chain processor drives pipelines through; tests substitute
/// a canned runner.
#[async_trait::async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run_chain_job(
        &self,
        job_id: &str,
        input: JobInput,
        containers: &[String],
        requires_proof: bool,
    ) -> Vec<ContainerResult>;

    async fn run_offchain_job(&self, message: &OffchainJobMessage) -> Vec<ContainerResult>;
}

#[async_trait::async_trait]
impl PipelineRunner for Orchestrator {
    async fn run_chain_job(
        &self,
        job_id: &str,
        input: JobInput,
        containers: &[String],
        requires_proof: bool,
    ) -> Vec<ContainerResult> {
        self.process_chain_processor_job(job_id, input, containers, requires_proof)
            .await
    }

    async fn run_offchain_job(&self, message: &OffchainJobMessage) -> Vec<ContainerResult> {
        self.process_offchain_job(message).await
    }
}

/// Streaming payloads are stored parsed when they form valid JSON, raw
/// text otherwise.
fn payload_from_bytes(raw: &[u8]) -> Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container(id: &str, port: Option<u16>, url: Option<&str>) -> ContainerConfig {
        let mut raw = json!({ "id": id, "image": "img" });
        if let Some(p) = port {
            raw["port"] = json!(p);
        }
        if let Some(u) = url {
            raw["url"] = json!(u);
        }
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn external_url_wins_over_port() {
        let endpoints = resolve_endpoints(
            &[container("a", Some(3000), Some("https://svc.example.com/a/"))],
            false,
        );
        assert_eq!(endpoints["a"].base_url, "https://svc.example.com/a");
    }

    #[test]
    fn configured_ports_are_respected() {
        let endpoints = resolve_endpoints(&[container("a", Some(3000), None)], false);
        assert_eq!(endpoints["a"].base_url, "http://localhost:3000");
    }

    #[test]
    fn docker_host_resolution() {
        let endpoints = resolve_endpoints(&[container("a", Some(3000), None)], true);
        assert_eq!(endpoints["a"].base_url, "http://host.docker.internal:3000");
    }

    #[test]
    fn port_collisions_walk_down_from_3999() {
        let endpoints = resolve_endpoints(
            &[
                container("a", Some(3000), None),
                container("b", Some(3000), None),
                container("c", None, None),
            ],
            false,
        );
        assert_eq!(endpoints["a"].base_url, "http://localhost:3000");
        assert_eq!(endpoints["b"].base_url, "http://localhost:3999");
        assert_eq!(endpoints["c"].base_url, "http://localhost:3998");
    }

    #[test]
    fn intermediate_steps_route_offchain() {
        assert_eq!(step_destination(0, 3, JobLocation::Onchain), JobLocation::Offchain);
        assert_eq!(step_destination(1, 3, JobLocation::Onchain), JobLocation::Offchain);
        assert_eq!(step_destination(2, 3, JobLocation::Onchain), JobLocation::Onchain);
        // single container goes straight to the final destination
        assert_eq!(step_destination(0, 1, JobLocation::Onchain), JobLocation::Onchain);
    }

    #[test]
    fn stream_payload_parses_json_or_keeps_text() {
        assert_eq!(payload_from_bytes(b"{\"a\":1}"), json!({"a": 1}));
        assert_eq!(payload_from_bytes(b"plain text"), json!("plain text"));
    }
}
