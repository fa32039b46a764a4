//! Octocrab-backed `RunnerRegistrar` (`spec.md` §4.4): generates JIT runner
//! configs, polls registration status and deletes runner records against
//! the GitHub REST API via `octocrab`'s `actions()` surface.

use std::collections::BTreeSet;

use async_trait::async_trait;
use octocrab::models::RunnerGroupId;
use octocrab::Octocrab;
use thiserror::Error;
use tracing::{error, instrument};

use crate::containers::lifecycle::RunnerRegistrar;
use crate::containers::ContainerError;
use crate::error::{Classify, ErrorKind};
use crate::store::StoreError;

const DEFAULT_RUNNER_GROUP_ID: u64 = 1;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error(transparent)]
    Api(#[from] octocrab::Error),
}

impl Classify for GitHubError {
    fn kind(&self) -> ErrorKind {
        match self {
            GitHubError::Api(_) => ErrorKind::TransientExternal,
        }
    }
}

/// `RunnerRegistrar`'s signature carries `ContainerError`, which has no
/// variant of its own for "the GitHub API call failed"; fold it into
/// `Store` rather than widen `ContainerError` for one implementation.
impl From<GitHubError> for ContainerError {
    fn from(err: GitHubError) -> Self {
        ContainerError::Store(StoreError::Unavailable(err.to_string()))
    }
}

/// GitHub org-level runner registration, backed by a personal access token
/// (`spec.md` §6 `GitHubSettings`).
pub struct GitHubRegistrar {
    client: Octocrab,
    org: String,
    runner_group_id: u64,
}

impl GitHubRegistrar {
    pub fn new(org: impl Into<String>, token: impl Into<String>) -> octocrab::Result<Self> {
        let client = octocrab::OctocrabBuilder::default()
            .personal_token(token.into())
            .build()?;
        Ok(Self {
            client,
            org: org.into(),
            runner_group_id: DEFAULT_RUNNER_GROUP_ID,
        })
    }

    #[instrument(skip(self), fields(org = %self.org, %runner_name))]
    async fn find_runner(
        &self,
        runner_name: &str,
    ) -> Result<Option<octocrab::models::actions::SelfHostedRunner>, GitHubError> {
        let mut page = self
            .client
            .actions()
            .list_org_self_hosted_runners(&self.org)
            .send()
            .await?;

        loop {
            if let Some(found) = page.items.iter().find(|r| r.name == runner_name) {
                return Ok(Some(found.clone()));
            }
            page = match self.client.get_page(&page.next).await? {
                Some(next) => next,
                None => return Ok(None),
            };
        }
    }
}

#[async_trait]
impl RunnerRegistrar for GitHubRegistrar {
    /// Generates a one-shot JIT config for a freshly named runner and
    /// returns the encoded token `actions-runner/run.sh --jitconfig` reads.
    #[instrument(skip(self, labels), fields(org = %self.org, %pool))]
    async fn generate_token(&self, pool: &str, labels: &BTreeSet<String>) -> Result<String, ContainerError> {
        let _ = pool;
        let runner_name = format!("runnerhub-{}", uuid::Uuid::new_v4());
        let label_list: Vec<String> = labels.iter().cloned().collect();

        let config = self
            .client
            .actions()
            .create_org_jit_runner_config(
                &self.org,
                runner_name,
                RunnerGroupId(self.runner_group_id),
                label_list,
            )
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "failed to generate runner jitconfig");
                GitHubError::Api(e)
            })?;

        Ok(config.encoded_jit_config)
    }

    #[instrument(skip(self), fields(org = %self.org, %runner_name))]
    async fn is_registered(&self, runner_name: &str) -> Result<bool, ContainerError> {
        let found = self.find_runner(runner_name).await?;
        Ok(found.is_some_and(|r| r.status == "online"))
    }

    #[instrument(skip(self), fields(org = %self.org, %runner_name))]
    async fn delete_registration(&self, runner_name: &str) -> Result<(), ContainerError> {
        let Some(runner) = self.find_runner(runner_name).await? else {
            return Ok(());
        };

        self.client
            .actions()
            .delete_org_runner(&self.org, runner.id)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to delete github runner");
                GitHubError::Api(e)
            })?;
        Ok(())
    }
}
