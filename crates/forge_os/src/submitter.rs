#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use forge_engines::backend::{BackendError, BuildBackend};
use forge_engines::context::{BuildContextPreparer, ContextPreparationError};
use forge_engines::namespace::ArtifactNamespace;
use forge_kernel_contracts::build::{BuildJob, BuildOutcome, BuildSpec, BuildVariables};
use forge_kernel_contracts::namespace::{JobId, OwnerId};
use forge_kernel_contracts::status::{BuildStatus, TerminalStatus};
use forge_kernel_contracts::ContractViolation;
use forge_storage::store::{ForgeStore, StorageError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission::{ImageCapGate, DEFAULT_IMAGE_CAP};
use crate::system_time_now_ns;

pub const DEFAULT_BUILD_DEADLINE_SECS: u64 = 1800;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("image cap reached: {count} of {cap} images")]
    ImageCapExceeded { count: usize, cap: usize },
    #[error("registry unavailable for admission: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("status store lock poisoned")]
    StoreUnavailable,
    #[error("admission task failed: {0}")]
    Task(String),
}

/// Why a build ended `failed`. Only ever rendered into the status record.
#[derive(Debug, thiserror::Error)]
enum BuildFailure {
    #[error("context preparation failed: {0}")]
    Context(#[from] ContextPreparationError),
    #[error("invalid build spec: {0}")]
    Spec(#[from] ContractViolation),
    #[error("build backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("build failed: {0}")]
    Build(String),
    #[error("build task aborted: {0}")]
    Aborted(String),
    #[error("build exceeded deadline of {0}ms")]
    Deadline(u128),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSubmitterConfig {
    pub image_cap: usize,
    pub deadline: Duration,
}

impl Default for BuildSubmitterConfig {
    fn default() -> Self {
        Self {
            image_cap: DEFAULT_IMAGE_CAP,
            deadline: Duration::from_secs(DEFAULT_BUILD_DEADLINE_SECS),
        }
    }
}

/// Acknowledgment handed back before any build work starts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BuildTicket {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub submission_seq: u64,
    pub status: BuildStatus,
    /// Owner's image count seen by the cap check.
    pub image_count: usize,
}

struct InFlightBuild {
    submission_seq: u64,
    handle: JoinHandle<()>,
}

type InFlightRegistry = BTreeMap<(OwnerId, JobId), Vec<InFlightBuild>>;

/// Admits build jobs and runs each one as a detached task that always ends
/// in a terminal status write.
#[derive(Clone)]
pub struct BuildSubmitter {
    store: Arc<Mutex<ForgeStore>>,
    gate: ImageCapGate,
    preparer: BuildContextPreparer,
    deadline: Duration,
    in_flight: Arc<Mutex<InFlightRegistry>>,
}

impl BuildSubmitter {
    pub fn new(
        store: Arc<Mutex<ForgeStore>>,
        namespace: ArtifactNamespace,
        preparer: BuildContextPreparer,
        config: BuildSubmitterConfig,
    ) -> Self {
        Self {
            store,
            gate: ImageCapGate::new(namespace, config.image_cap),
            preparer,
            deadline: config.deadline,
            in_flight: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn gate(&self) -> &ImageCapGate {
        &self.gate
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Cap check, `pending` write, then hand-off. Returns as soon as the task
    /// is spawned; the outcome is only visible through the status record.
    pub async fn submit(&self, job: BuildJob) -> Result<BuildTicket, SubmitError> {
        let gate = self.gate.clone();
        let owner_id = job.owner_id.clone();
        let image_count = tokio::task::spawn_blocking(move || gate.check(&owner_id))
            .await
            .map_err(|err| SubmitError::Task(err.to_string()))??;

        let pending = {
            let mut store = self
                .store
                .lock()
                .map_err(|_| SubmitError::StoreUnavailable)?;
            store.begin_submission(&job.owner_id, &job.job_id, system_time_now_ns())?
        };
        info!(
            owner_id = %job.owner_id,
            job_id = %job.job_id,
            submission_seq = pending.submission_seq,
            image_count,
            "build admitted"
        );

        let task = BuildTask {
            store: self.store.clone(),
            backend: self.gate.namespace().backend().clone(),
            preparer: self.preparer.clone(),
            deadline: self.deadline,
            variables: job.variables(),
            submission_seq: pending.submission_seq,
        };
        let handle = tokio::spawn(task.run());

        let mut in_flight = self.in_flight();
        reap_finished(&mut in_flight);
        in_flight
            .entry((job.owner_id.clone(), job.job_id.clone()))
            .or_default()
            .push(InFlightBuild {
                submission_seq: pending.submission_seq,
                handle,
            });

        Ok(BuildTicket {
            owner_id: job.owner_id,
            job_id: job.job_id,
            submission_seq: pending.submission_seq,
            status: pending.status,
            image_count,
        })
    }

    /// Waits for every tracked task of (owner, job). Returns the submission
    /// sequences that were awaited, oldest first.
    pub async fn join(&self, owner_id: &OwnerId, job_id: &JobId) -> Vec<u64> {
        let builds = self
            .in_flight()
            .remove(&(owner_id.clone(), job_id.clone()))
            .unwrap_or_default();
        let mut joined = Vec::with_capacity(builds.len());
        for build in builds {
            if let Err(err) = build.handle.await {
                error!(
                    owner_id = %owner_id,
                    job_id = %job_id,
                    submission_seq = build.submission_seq,
                    error = %err,
                    "build task did not complete"
                );
            }
            joined.push(build.submission_seq);
        }
        joined
    }

    /// Awaits every tracked task; used on shutdown.
    pub async fn join_all(&self) -> usize {
        let keys: Vec<(OwnerId, JobId)> = self.in_flight().keys().cloned().collect();
        let mut total = 0;
        for (owner_id, job_id) in keys {
            total += self.join(&owner_id, &job_id).await.len();
        }
        total
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight()
            .values()
            .flatten()
            .filter(|build| !build.handle.is_finished())
            .count()
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlightRegistry> {
        // Handles only; a panicking holder cannot leave them half-written.
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn reap_finished(registry: &mut InFlightRegistry) {
    for builds in registry.values_mut() {
        builds.retain(|build| !build.handle.is_finished());
    }
    registry.retain(|_, builds| !builds.is_empty());
}

struct BuildTask {
    store: Arc<Mutex<ForgeStore>>,
    backend: Arc<dyn BuildBackend>,
    preparer: BuildContextPreparer,
    deadline: Duration,
    variables: BuildVariables,
    submission_seq: u64,
}

impl BuildTask {
    async fn run(self) {
        let backend = self.backend.clone();
        let preparer = self.preparer.clone();
        let variables = self.variables.clone();
        let work = tokio::task::spawn_blocking(move || {
            run_pipeline(backend.as_ref(), &preparer, &variables)
        });
        // On deadline the blocking call is abandoned, not interrupted; its
        // eventual result is discarded.
        let result = match tokio::time::timeout(self.deadline, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BuildFailure::Aborted(join_err.to_string())),
            Err(_) => Err(BuildFailure::Deadline(self.deadline.as_millis())),
        };
        let terminal = match result {
            Ok(image_ref) => TerminalStatus::Built { image_ref },
            Err(failure) => {
                error!(
                    owner_id = %self.variables.owner_id,
                    job_id = %self.variables.job_id,
                    submission_seq = self.submission_seq,
                    error = %failure,
                    "build failed"
                );
                TerminalStatus::Failed {
                    error: failure.to_string(),
                }
            }
        };
        self.record_terminal(terminal);
    }

    fn record_terminal(&self, terminal: TerminalStatus) {
        let owner_id = &self.variables.owner_id;
        let job_id = &self.variables.job_id;
        // A terminal write is applied whole or not at all, so a poisoned
        // store is still consistent.
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match store.complete_submission(
            owner_id,
            job_id,
            self.submission_seq,
            terminal,
            system_time_now_ns(),
        ) {
            Ok(record) => info!(
                owner_id = %owner_id,
                job_id = %job_id,
                submission_seq = record.submission_seq,
                status = record.status.as_str(),
                image_ref = ?record.image_ref,
                "build finished"
            ),
            Err(StorageError::StaleSubmission { current_seq, .. }) => warn!(
                owner_id = %owner_id,
                job_id = %job_id,
                submission_seq = self.submission_seq,
                current_seq,
                "build result superseded by a newer submission"
            ),
            Err(err @ StorageError::Journal { .. }) => error!(
                owner_id = %owner_id,
                job_id = %job_id,
                submission_seq = self.submission_seq,
                error = %err,
                "build result recorded in memory only; journal append failed"
            ),
            Err(err) => error!(
                owner_id = %owner_id,
                job_id = %job_id,
                submission_seq = self.submission_seq,
                error = %err,
                "failed to record build result"
            ),
        }
    }
}

fn run_pipeline(
    backend: &dyn BuildBackend,
    preparer: &BuildContextPreparer,
    variables: &BuildVariables,
) -> Result<String, BuildFailure> {
    let source = if backend.requires_staged_context() {
        Some(preparer.prepare(variables)?)
    } else {
        None
    };
    let spec = BuildSpec::v1(backend.image_repository(), variables, source)?;
    info!(
        backend = backend.name(),
        image_tag = %spec.image_tag,
        "submitting build"
    );
    match backend.submit(&spec)? {
        BuildOutcome::Succeeded { image } => Ok(image),
        BuildOutcome::Failed { detail } => Err(BuildFailure::Build(detail)),
    }
}
