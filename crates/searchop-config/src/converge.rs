//! Idempotent convergence of declared settings
//!
//! For each operation the engine reads the current document, compares it with
//! the declared body and only writes when the cluster does not already hold
//! at least what was declared. Operations run strictly in order and the first
//! failure ends the pass; nothing is cached between passes.

use std::time::Duration;

use tracing::{debug, info, warn};

use searchop_common::crd::ConfigOperation;
use searchop_common::search_client::{Method, SearchClient, SearchResponse};
use searchop_common::Error;

use crate::diff::compare_bytes;

/// What a pass did, per operation outcome
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Operations already satisfied
    pub unchanged: u32,
    /// Operations whose target did not exist
    pub created: u32,
    /// Operations whose target differed
    pub updated: u32,
}

impl ConvergeReport {
    /// Operations converged in this pass
    pub fn applied(&self) -> u32 {
        self.unchanged + self.created + self.updated
    }

    /// Writes issued in this pass
    pub fn writes(&self) -> u32 {
        self.created + self.updated
    }

    fn record(&mut self, outcome: OperationOutcome) {
        match outcome {
            OperationOutcome::Unchanged => self.unchanged += 1,
            OperationOutcome::Created => self.created += 1,
            OperationOutcome::Updated => self.updated += 1,
        }
    }
}

/// Result of converging one operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Observed document already contains the declared body
    Unchanged,
    /// Target did not exist and was written
    Created,
    /// Target differed and was overwritten
    Updated,
}

/// Whether, and why, an operation needs a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteRequired {
    /// Nothing to do
    No,
    /// Target does not exist
    Create,
    /// Target exists but does not contain the declared body
    Update,
}

/// Converges operations against one cluster
pub struct ConfigConverger<'a> {
    client: &'a dyn SearchClient,
    timeout: Duration,
}

impl<'a> ConfigConverger<'a> {
    /// Create a converger whose every request is bounded by `timeout`
    pub fn new(client: &'a dyn SearchClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Converge `operations` in order, stopping at the first failure
    pub async fn converge(&self, operations: &[ConfigOperation]) -> Result<ConvergeReport, Error> {
        let mut report = ConvergeReport::default();
        for op in operations {
            let outcome = self.reconcile_operation(op).await?;
            report.record(outcome);
        }
        info!(
            unchanged = report.unchanged,
            created = report.created,
            updated = report.updated,
            "operations converged"
        );
        Ok(report)
    }

    /// Converge a single operation
    pub async fn reconcile_operation(&self, op: &ConfigOperation) -> Result<OperationOutcome, Error> {
        match self.update_required(op).await? {
            WriteRequired::No => Ok(OperationOutcome::Unchanged),
            WriteRequired::Create => {
                self.write(op).await?;
                Ok(OperationOutcome::Created)
            }
            WriteRequired::Update => {
                self.write(op).await?;
                Ok(OperationOutcome::Updated)
            }
        }
    }

    /// Read the target of `op` and decide whether it must be written
    pub async fn update_required(&self, op: &ConfigOperation) -> Result<WriteRequired, Error> {
        debug!(url = %op.url, "requesting current document");
        let response = self.send(Method::GET, &op.url, None).await?;

        match response.status {
            404 => {
                debug!(url = %op.url, "target does not exist yet");
                Ok(WriteRequired::Create)
            }
            200 => {
                if compare_bytes(&response.body, &op.desired_bytes()).is_satisfied() {
                    debug!(url = %op.url, "observed document contains declared body");
                    Ok(WriteRequired::No)
                } else {
                    debug!(
                        url = %op.url,
                        actual = %String::from_utf8_lossy(&response.body),
                        expected = %op.body,
                        "observed document differs from declared body"
                    );
                    Ok(WriteRequired::Update)
                }
            }
            status => {
                warn!(url = %op.url, status, "unacceptable status reading current document");
                Err(Error::unacceptable_status("GET", &op.url, status))
            }
        }
    }

    async fn write(&self, op: &ConfigOperation) -> Result<(), Error> {
        debug!(url = %op.url, "writing declared body");
        let response = self
            .send(Method::PUT, &op.url, Some(op.desired_bytes()))
            .await?;

        if !response.is_success() {
            warn!(
                url = %op.url,
                status = response.status,
                body = %String::from_utf8_lossy(&response.body),
                "write rejected"
            );
            return Err(Error::unacceptable_status("PUT", &op.url, response.status));
        }
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<SearchResponse, Error> {
        let name = method.to_string();
        tokio::time::timeout(self.timeout, self.client.request(method, url, body))
            .await
            .map_err(|_| Error::timeout(name, url, self.timeout))?
    }
}
