use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use batchforge_core::{
    ExecutionContext, ExpectedVersion, JobExecution, JobExecutionId, JobInstance, JobInstanceId,
    JobParameters, StepExecution, StepExecutionId,
};

use super::r#trait::{JobRepository, RepositoryError, check_restartable};

#[derive(Debug, Default)]
struct State {
    last_instance_id: i64,
    last_job_execution_id: i64,
    last_step_execution_id: i64,
    instances: BTreeMap<JobInstanceId, JobInstance>,
    instance_keys: HashMap<(String, String), JobInstanceId>,
    job_executions: BTreeMap<JobExecutionId, JobExecution>,
    step_executions: BTreeMap<StepExecutionId, StepExecution>,
    job_contexts: HashMap<JobExecutionId, String>,
    step_contexts: HashMap<StepExecutionId, String>,
}

impl State {
    fn instance_for(&self, job_name: &str, parameters: &JobParameters) -> Option<&JobInstance> {
        let key = (job_name.to_string(), parameters.job_key());
        self.instance_keys
            .get(&key)
            .and_then(|id| self.instances.get(id))
    }

    fn job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, RepositoryError> {
        let Some(row) = self.job_executions.get(&id) else {
            return Ok(None);
        };
        let mut execution = row.clone();
        if let Some(json) = self.job_contexts.get(&id) {
            execution.execution_context = ExecutionContext::from_json(json)?;
        }
        Ok(Some(execution))
    }

    fn step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecution>, RepositoryError> {
        let Some(row) = self.step_executions.get(&id) else {
            return Ok(None);
        };
        let mut step = row.clone();
        if let Some(json) = self.step_contexts.get(&id) {
            step.execution_context = ExecutionContext::from_json(json)?;
        }
        Ok(Some(step))
    }

    /// Executions of an instance, newest first.
    fn job_executions_of(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, RepositoryError> {
        let ids: Vec<JobExecutionId> = self
            .job_executions
            .values()
            .rev()
            .filter(|e| e.job_instance.id == instance_id)
            .filter_map(|e| e.id)
            .collect();
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = self.job_execution(id)? {
                executions.push(execution);
            }
        }
        Ok(executions)
    }

    fn insert_job_execution(&mut self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        if execution.id.is_some() || execution.version.is_some() {
            return Err(RepositoryError::InvalidArgument(
                "job execution already has an identity or version".to_string(),
            ));
        }
        let context = execution.execution_context.to_json()?;
        self.last_job_execution_id += 1;
        let id = JobExecutionId::new(self.last_job_execution_id);
        execution.id = Some(id);
        execution.version = Some(0);
        execution.last_updated = Some(Utc::now());
        self.job_executions.insert(id, row_of_job(execution));
        self.job_contexts.insert(id, context);
        Ok(())
    }

    fn update_step_row(&mut self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        let id = step.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("step execution has not been saved".to_string())
        })?;
        let expected = ExpectedVersion::of(step)?;
        let stored = self
            .step_executions
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("step execution {id}")))?;
        let actual = stored.version.unwrap_or_default();
        if !expected.matches(actual) {
            debug!(step_execution_id = %id, ?expected, actual, "stale step execution update rejected");
            return Err(RepositoryError::Concurrency(format!(
                "step execution {id}: expected {expected:?}, found {actual}"
            )));
        }

        step.version = Some(actual + 1);
        step.last_updated = Some(Utc::now());
        *stored = row_of_step(step);

        if self
            .job_executions
            .get(&step.job_execution_id)
            .is_some_and(JobExecution::is_stopping)
        {
            step.set_terminate_only();
        }
        Ok(())
    }
}

/// Stored copy of a job execution; the context lives in its own table.
fn row_of_job(execution: &JobExecution) -> JobExecution {
    JobExecution {
        execution_context: ExecutionContext::new(),
        ..execution.clone()
    }
}

fn row_of_step(step: &StepExecution) -> StepExecution {
    StepExecution {
        execution_context: ExecutionContext::new(),
        terminate_only: false,
        ..step.clone()
    }
}

/// Most recent by start (else create) time, ties broken by the highest identity.
fn latest<T, K: Ord>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> K) -> Option<T> {
    items.max_by(|a, b| key(a).cmp(&key(b)))
}

/// In-memory execution repository.
///
/// The default repository for tests and single-process runs. A single lock
/// guards every table, so each operation (including a chunk checkpoint of row
/// plus context) is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    state: RwLock<State>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, RepositoryError> {
        self.state
            .read()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, RepositoryError> {
        self.state
            .write()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    /// Distinct job names, sorted.
    pub fn distinct_job_names(&self) -> Result<Vec<String>, RepositoryError> {
        let state = self.read()?;
        let mut names: Vec<String> = state.instances.values().map(|i| i.job_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Instances of a job, newest first.
    pub fn job_instances(&self, job_name: &str) -> Result<Vec<JobInstance>, RepositoryError> {
        let state = self.read()?;
        Ok(state
            .instances
            .values()
            .rev()
            .filter(|i| i.job_name == job_name)
            .cloned()
            .collect())
    }

    /// Running executions of a job, newest first.
    pub fn running_job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>, RepositoryError> {
        let state = self.read()?;
        let ids: Vec<JobExecutionId> = state
            .job_executions
            .values()
            .rev()
            .filter(|e| e.job_name() == job_name && e.is_running())
            .filter_map(|e| e.id)
            .collect();
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = state.job_execution(id)? {
                executions.push(execution);
            }
        }
        Ok(executions)
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError> {
        let mut state = self.write()?;
        let key = (job_name.to_string(), parameters.job_key());
        if state.instance_keys.contains_key(&key) {
            return Err(RepositoryError::InstanceAlreadyExists(format!(
                "job '{job_name}' with key {}",
                key.1
            )));
        }

        state.last_instance_id += 1;
        let instance = JobInstance {
            id: JobInstanceId::new(state.last_instance_id),
            job_name: job_name.to_string(),
            job_key: key.1.clone(),
            version: 0,
        };
        state.instance_keys.insert(key, instance.id);
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    fn get_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        Ok(self.read()?.instance_for(job_name, parameters).cloned())
    }

    fn create_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        let mut state = self.write()?;

        let (instance, context) = match state.instance_for(job_name, parameters).cloned() {
            Some(instance) => {
                let executions = state.job_executions_of(instance.id)?;
                let last = check_restartable(&instance, parameters, &executions)?;
                (instance, last.execution_context.clone())
            }
            None => {
                let key = (job_name.to_string(), parameters.job_key());
                state.last_instance_id += 1;
                let instance = JobInstance {
                    id: JobInstanceId::new(state.last_instance_id),
                    job_name: job_name.to_string(),
                    job_key: key.1.clone(),
                    version: 0,
                };
                state.instance_keys.insert(key, instance.id);
                state.instances.insert(instance.id, instance.clone());
                (instance, ExecutionContext::new())
            }
        };

        let mut execution = JobExecution::new(instance, parameters.clone());
        execution.execution_context = context;
        state.insert_job_execution(&mut execution)?;
        Ok(execution)
    }

    fn save_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        self.write()?.insert_job_execution(execution)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        let id = execution.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("job execution has not been saved".to_string())
        })?;
        let expected = ExpectedVersion::of(execution)?;

        let mut state = self.write()?;
        let stored = state
            .job_executions
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("job execution {id}")))?;
        let actual = stored.version.unwrap_or_default();
        if !expected.matches(actual) {
            return Err(RepositoryError::Concurrency(format!(
                "job execution {id}: expected {expected:?}, found {actual}"
            )));
        }

        execution.version = Some(actual + 1);
        execution.last_updated = Some(Utc::now());
        *stored = row_of_job(execution);
        Ok(())
    }

    fn synchronize_status(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        let Some(id) = execution.id else {
            return Ok(());
        };
        let state = self.read()?;
        if let Some(stored) = state.job_executions.get(&id) {
            if stored.version != execution.version {
                execution.upgrade_status(stored.status);
                execution.version = stored.version;
            }
        }
        Ok(())
    }

    fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        self.read()?.job_execution(id)
    }

    fn find_job_executions(
        &self,
        instance_id: JobInstanceId,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        self.read()?.job_executions_of(instance_id)
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let state = self.read()?;
        let Some(instance) = state.instance_for(job_name, parameters) else {
            return Ok(None);
        };
        let executions = state.job_executions_of(instance.id)?;
        Ok(latest(executions.into_iter(), |e| {
            (e.start_time.unwrap_or(e.create_time), e.id)
        }))
    }

    fn save_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        if step.id.is_some() || step.version.is_some() {
            return Err(RepositoryError::InvalidArgument(
                "step execution already has an identity or version".to_string(),
            ));
        }
        let context = step.execution_context.to_json()?;

        let mut state = self.write()?;
        if !state.job_executions.contains_key(&step.job_execution_id) {
            return Err(RepositoryError::NotFound(format!(
                "job execution {}",
                step.job_execution_id
            )));
        }
        state.last_step_execution_id += 1;
        let id = StepExecutionId::new(state.last_step_execution_id);
        step.id = Some(id);
        step.version = Some(0);
        step.last_updated = Some(Utc::now());
        state.step_executions.insert(id, row_of_step(step));
        state.step_contexts.insert(id, context);
        Ok(())
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        self.write()?.update_step_row(step)
    }

    fn get_step_execution(
        &self,
        id: StepExecutionId,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        self.read()?.step_execution(id)
    }

    fn find_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let state = self.read()?;
        let ids: Vec<StepExecutionId> = state
            .step_executions
            .values()
            .filter(|s| s.job_execution_id == job_execution_id)
            .filter_map(|s| s.id)
            .collect();
        let mut steps = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(step) = state.step_execution(id)? {
                steps.push(step);
            }
        }
        Ok(steps)
    }

    fn get_last_step_execution(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let state = self.read()?;
        let candidate = latest(
            state
                .step_executions
                .values()
                .filter(|s| s.job_instance_id == instance_id && s.step_name == step_name),
            |s| (s.ordering_time(), s.id),
        );
        match candidate.and_then(|s| s.id) {
            Some(id) => state.step_execution(id),
            None => Ok(None),
        }
    }

    fn step_execution_count(
        &self,
        instance_id: JobInstanceId,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        Ok(self
            .read()?
            .step_executions
            .values()
            .filter(|s| s.job_instance_id == instance_id && s.step_name == step_name)
            .count())
    }

    fn update_step_execution_context(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let id = step.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("step execution has not been saved".to_string())
        })?;
        let json = step.execution_context.to_json()?;
        self.write()?.step_contexts.insert(id, json);
        Ok(())
    }

    fn update_job_execution_context(
        &self,
        execution: &JobExecution,
    ) -> Result<(), RepositoryError> {
        let id = execution.id.ok_or_else(|| {
            RepositoryError::InvalidArgument("job execution has not been saved".to_string())
        })?;
        let json = execution.execution_context.to_json()?;
        self.write()?.job_contexts.insert(id, json);
        Ok(())
    }

    fn checkpoint_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        let json = step.execution_context.to_json()?;
        let mut state = self.write()?;
        state.update_step_row(step)?;
        if let Some(id) = step.id {
            state.step_contexts.insert(id, json);
        }
        Ok(())
    }
}
