use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::acme::CertificateAuthority;
use crate::acme::types::ChallengeStatus;
use crate::config::Settings;
use crate::operation::{CreateOperation, Stage};
use crate::platform::CertificateHost;
use crate::policy::RetryPolicy;
use crate::store::{OperationStore, StoreError};
use crate::task::{CertificateBundle, Enqueue, Task, TaskContext, TaskHandler};

mod stages;

#[derive(Debug, Clone, Copy)]
pub struct WorkflowOptions {
    pub retry: RetryPolicy,
    /// Delay between serving the challenge response and the first issue attempt.
    pub respond_delay: Duration,
    pub certificate_validity: Option<Duration>,
}

impl WorkflowOptions {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry: settings.workflow.retry_policy(),
            respond_delay: settings.workflow.respond_delay(),
            certificate_validity: settings.acme.certificate_validity,
        }
    }
}

/// Result of starting a workflow for a hostname.
#[derive(Debug)]
pub struct Authorized {
    pub operation: CreateOperation,
    /// Set when the CA already considers the challenge valid.
    pub next: Option<Enqueue>,
}

/// Body to serve at the challenge path, plus the issue task to schedule.
#[derive(Debug)]
pub struct ChallengeResponse {
    pub body: String,
    pub next: Option<Enqueue>,
}

/// The certificate issuance state machine.
///
/// Synchronous entry points ([`Workflow::authorize`], [`Workflow::respond`])
/// and deferred stages all return the follow-up work as an [`Enqueue`] value
/// instead of scheduling it themselves.
pub struct Workflow {
    operations: Arc<dyn OperationStore>,
    authority: Arc<dyn CertificateAuthority>,
    host: Arc<dyn CertificateHost>,
    options: WorkflowOptions,
}

impl Workflow {
    #[must_use]
    pub fn new(
        operations: Arc<dyn OperationStore>,
        authority: Arc<dyn CertificateAuthority>,
        host: Arc<dyn CertificateHost>,
        options: WorkflowOptions,
    ) -> Self {
        Self {
            operations,
            authority,
            host,
            options,
        }
    }

    /// Starts (or rejoins) the workflow for `hostname`.
    ///
    /// # Errors
    /// Returns error if the CA offers no HTTP-01 challenge or any collaborator fails.
    pub async fn authorize(&self, hostname: &str) -> Result<Authorized> {
        info!("Authorizing {}", hostname);
        self.authority
            .ensure_account()
            .await
            .context("Failed to load CA account")?;

        let authorization = self
            .authority
            .authorize(hostname)
            .await
            .with_context(|| format!("Failed to authorize {hostname}"))?;
        let challenge = authorization
            .http01()
            .cloned()
            .with_context(|| format!("CA offered no http-01 challenge for {hostname}"))?;
        let response = self.authority.http01_response(&challenge.token).await?;

        let now = OffsetDateTime::now_utc();
        let mut operation = CreateOperation::new(
            hostname,
            challenge.token.clone(),
            authorization.url.clone(),
            challenge.url.clone(),
            response,
            now,
        );
        match self.operations.create(&operation).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                info!(
                    "Operation {} for {} already exists, reusing it",
                    challenge.token, hostname
                );
                operation = self.operations.get(&challenge.token).await?;
            }
            Err(err) => return Err(err).context("Failed to store operation"),
        }

        if challenge.status == ChallengeStatus::Valid {
            info!("Challenge for {} is already valid", hostname);
            if operation.stage == Stage::Authorized {
                operation.advance(Stage::Responded, now)?;
                self.operations.save(&operation).await?;
            }
            let next = (!operation.is_finished && operation.stage == Stage::Responded)
                .then(|| Enqueue::now(Task::Issue {
                    token: operation.token.clone(),
                }));
            return Ok(Authorized { operation, next });
        }

        if !operation.has_reached(Stage::Responded) {
            self.authority
                .accept(&challenge)
                .await
                .with_context(|| format!("Failed to accept challenge for {hostname}"))?;
        }
        Ok(Authorized {
            operation,
            next: None,
        })
    }

    /// Answers the CA's validation fetch for `token`.
    ///
    /// Returns `None` for an unknown token.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn respond(&self, token: &str) -> Result<Option<ChallengeResponse>> {
        let mut operation = match self.operations.get(token).await {
            Ok(operation) => operation,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if operation.stage == Stage::Authorized {
            operation.advance(Stage::Responded, OffsetDateTime::now_utc())?;
            self.operations.save(&operation).await?;
            info!("Served challenge for {} ({})", operation.hostname, token);
        }

        let next = (!operation.is_finished && operation.stage == Stage::Responded).then(|| {
            Enqueue::after(
                Task::Issue {
                    token: token.to_string(),
                },
                self.options.respond_delay,
            )
        });
        Ok(Some(ChallengeResponse {
            body: operation.response,
            next,
        }))
    }

    /// Runs one attempt of a deferred stage and persists the record afterwards.
    async fn run_stage(
        &self,
        token: &str,
        input: StageInput,
        retry_count: u32,
    ) -> Result<Option<Enqueue>> {
        let mut operation = match self.operations.get(token).await {
            Ok(operation) => operation,
            Err(StoreError::NotFound { .. }) => {
                warn!("Operation {} no longer exists, dropping {} stage", token, input.stage());
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if operation.is_finished {
            info!(
                "Operation {} already finished, skipping {} stage",
                token,
                input.stage()
            );
            return Ok(None);
        }

        info!(
            "Running {} stage for {} ({}, attempt {})",
            input.stage(),
            operation.hostname,
            token,
            retry_count.saturating_add(1)
        );
        let result = match input {
            StageInput::Issue => self.issue(&mut operation).await,
            StageInput::Upload(bundle) => self.upload(&mut operation, bundle).await,
            StageInput::Map {
                certificate_id,
                common_name,
            } => self.map(&mut operation, &certificate_id, &common_name).await,
        };

        let settled = self.options.retry.settle(&mut operation, result, retry_count);
        self.operations
            .save(&operation)
            .await
            .with_context(|| format!("Failed to persist operation {token}"))?;
        settled
    }
}

/// Payload of a deferred stage, taken from its [`Task`].
enum StageInput {
    Issue,
    Upload(CertificateBundle),
    Map {
        certificate_id: String,
        common_name: String,
    },
}

impl StageInput {
    /// Stage the input completes.
    fn stage(&self) -> Stage {
        match self {
            StageInput::Issue => Stage::Issued,
            StageInput::Upload(_) => Stage::Uploaded,
            StageInput::Map { .. } => Stage::Mapped,
        }
    }
}

#[async_trait]
impl TaskHandler for Workflow {
    async fn handle(&self, task: Task, context: TaskContext) -> Result<Option<Enqueue>> {
        let retry_count = context.retry_count;
        match task {
            Task::Create { hostname } => Ok(self.authorize(&hostname).await?.next),
            Task::Issue { token } => self.run_stage(&token, StageInput::Issue, retry_count).await,
            Task::Upload { token, bundle } => {
                self.run_stage(&token, StageInput::Upload(bundle), retry_count)
                    .await
            }
            Task::Map {
                token,
                certificate_id,
                common_name,
            } => {
                self.run_stage(
                    &token,
                    StageInput::Map {
                        certificate_id,
                        common_name,
                    },
                    retry_count,
                )
                .await
            }
        }
    }
}
