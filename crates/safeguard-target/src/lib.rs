#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use safeguard_domain::{
    now_utc, ApplyMode, ChangeSet, Finding, ResourceRef, ResourceState, Scope, ValidationKind,
    ValidationReport, VersionId, WriteFailure, WriteOutcome,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use ulid::Ulid;

/// The external stateful system a change set is applied to.
pub trait TargetSystem {
    fn target_name(&self) -> &'static str;

    /// Run one validation kind. Must never mutate target state.
    #[allow(clippy::missing_errors_doc)]
    fn validate(
        &self,
        kind: ValidationKind,
        scope: &Scope,
        plan: &ChangeSet,
    ) -> Result<ValidationReport>;

    #[allow(clippy::missing_errors_doc)]
    fn read_state(&self, refs: &[ResourceRef]) -> Result<BTreeMap<ResourceRef, ResourceState>>;

    /// Write the plan. A resource whose current version differs from
    /// `expected_prior_versions` is refused and nothing past it is written.
    #[allow(clippy::missing_errors_doc)]
    fn write_state(
        &self,
        plan: &ChangeSet,
        mode: ApplyMode,
        expected_prior_versions: &BTreeMap<ResourceRef, VersionId>,
    ) -> Result<WriteOutcome>;

    #[allow(clippy::missing_errors_doc)]
    fn restore(&self, resource: &ResourceRef, target_version: &VersionId) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredVersion {
    pub fields: Map<String, Value>,
    pub mode: ApplyMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredResource {
    pub current_version: VersionId,
    pub next_seq: u64,
    pub history: BTreeMap<VersionId, StoredVersion>,
}

impl StoredResource {
    fn current(&self) -> Option<&StoredVersion> {
        self.history.get(&self.current_version)
    }

    fn push_version(&mut self, fields: Map<String, Value>, mode: ApplyMode) -> VersionId {
        let version = VersionId::new(format!("v{}", self.next_seq));
        self.next_seq += 1;
        self.history
            .insert(version.clone(), StoredVersion { fields, mode });
        self.current_version = version.clone();
        version
    }
}

/// Versioned resource state shared by the local target implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TargetState {
    #[serde(default)]
    pub unhealthy: bool,
    #[serde(default)]
    pub resources: BTreeMap<ResourceRef, StoredResource>,
}

impl TargetState {
    /// Seed a resource at version `v1` with the given field values.
    #[must_use]
    pub fn with_resource(mut self, resource: &str, fields: &Value) -> Self {
        let fields = fields.as_object().cloned().unwrap_or_default();
        let mut stored = StoredResource {
            current_version: VersionId::new("v0"),
            next_seq: 1,
            history: BTreeMap::new(),
        };
        stored.push_version(fields, ApplyMode::Publish);
        self.resources.insert(ResourceRef::new(resource), stored);
        self
    }

    #[must_use]
    pub fn with_unhealthy(mut self, unhealthy: bool) -> Self {
        self.unhealthy = unhealthy;
        self
    }

    #[must_use]
    pub fn current_version(&self, resource: &ResourceRef) -> Option<&VersionId> {
        self.resources
            .get(resource)
            .map(|stored| &stored.current_version)
    }

    #[must_use]
    pub fn current_fields(&self, resource: &ResourceRef) -> Option<&Map<String, Value>> {
        self.resources
            .get(resource)
            .and_then(StoredResource::current)
            .map(|version| &version.fields)
    }

    #[must_use]
    pub fn validate(&self, kind: ValidationKind, plan: &ChangeSet) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match kind {
            ValidationKind::PreFlight | ValidationKind::PreApply => {
                for resource in plan.touched_resources() {
                    if !self.resources.contains_key(&resource) {
                        errors.push(
                            Finding::new(
                                "resource_not_found",
                                format!("{resource} does not exist in the target"),
                            )
                            .for_resource(&resource),
                        );
                    }
                }
            }
            ValidationKind::HealthCheck => {
                if self.unhealthy {
                    errors.push(Finding::new(
                        "target_unhealthy",
                        "target reported an unhealthy status",
                    ));
                }
            }
            ValidationKind::Mapping => {
                for operation in &plan.operations {
                    let Some(current) = self.current_fields(&operation.resource) else {
                        continue;
                    };
                    for field in operation.fields.keys() {
                        if !current.contains_key(field) {
                            warnings.push(
                                Finding::new(
                                    "field_not_mapped",
                                    format!(
                                        "{}.{field} is new and will be created",
                                        operation.resource
                                    ),
                                )
                                .for_resource(&operation.resource),
                            );
                        }
                    }
                }
            }
            ValidationKind::Plan => {}
        }

        ValidationReport::from_findings(errors, warnings)
    }

    /// Read current versions, stamping each read with `read_at(index)`.
    ///
    /// # Errors
    /// Returns an error when a referenced resource does not exist.
    pub fn read_state(
        &self,
        refs: &[ResourceRef],
        read_at: impl Fn(usize) -> time::OffsetDateTime,
    ) -> Result<BTreeMap<ResourceRef, ResourceState>> {
        let mut out = BTreeMap::new();
        for (index, resource) in refs.iter().enumerate() {
            let stored = self
                .resources
                .get(resource)
                .ok_or_else(|| anyhow!("resource {resource} not found in target"))?;
            out.insert(
                resource.clone(),
                ResourceState {
                    version_id: stored.current_version.clone(),
                    read_at: read_at(index),
                },
            );
        }
        Ok(out)
    }

    /// Apply the plan resource by resource, stopping at the first refusal.
    pub fn write_state(
        &mut self,
        plan: &ChangeSet,
        mode: ApplyMode,
        expected_prior_versions: &BTreeMap<ResourceRef, VersionId>,
        refuse: &BTreeSet<ResourceRef>,
    ) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();

        for (resource, fields) in group_operations(plan) {
            if refuse.contains(&resource) {
                outcome.failure = Some(WriteFailure {
                    resource: Some(resource.clone()),
                    message: format!("target refused write to {resource}"),
                });
                break;
            }

            let Some(expected) = expected_prior_versions.get(&resource) else {
                outcome.failure = Some(WriteFailure {
                    resource: Some(resource.clone()),
                    message: format!("no expected prior version supplied for {resource}"),
                });
                break;
            };

            let Some(stored) = self.resources.get_mut(&resource) else {
                outcome.failure = Some(WriteFailure {
                    resource: Some(resource.clone()),
                    message: format!("resource {resource} not found in target"),
                });
                break;
            };

            if &stored.current_version != expected {
                outcome.failure = Some(WriteFailure {
                    resource: Some(resource.clone()),
                    message: format!(
                        "version mismatch on {resource}: expected {expected}, found {}",
                        stored.current_version
                    ),
                });
                break;
            }

            let mut next_fields = stored
                .current()
                .map(|version| version.fields.clone())
                .unwrap_or_default();
            for (field, value) in fields {
                next_fields.insert(field, value);
            }
            let version = stored.push_version(next_fields, mode);
            outcome.written.insert(resource, version);
        }

        outcome
    }

    /// Point a resource back at a prior version. Restoring to the current version is a no-op.
    ///
    /// # Errors
    /// Returns an error when the resource or the version is unknown.
    pub fn restore(&mut self, resource: &ResourceRef, target_version: &VersionId) -> Result<()> {
        let stored = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| anyhow!("resource {resource} not found in target"))?;
        if !stored.history.contains_key(target_version) {
            return Err(anyhow!(
                "version {target_version} of {resource} is not known to the target"
            ));
        }
        stored.current_version = target_version.clone();
        Ok(())
    }

    /// Simulate an out-of-band edit: bump the resource to a fresh version with the same fields.
    fn drift(&mut self, resource: &ResourceRef) {
        if let Some(stored) = self.resources.get_mut(resource) {
            let (fields, mode) = stored
                .current()
                .map(|version| (version.fields.clone(), version.mode))
                .unwrap_or((Map::new(), ApplyMode::Publish));
            stored.push_version(fields, mode);
        }
    }
}

fn group_operations(plan: &ChangeSet) -> Vec<(ResourceRef, Map<String, Value>)> {
    let mut grouped: Vec<(ResourceRef, Map<String, Value>)> = Vec::new();
    for operation in &plan.operations {
        let fields = operation
            .fields
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()));
        if let Some((_, existing)) = grouped
            .iter_mut()
            .find(|(resource, _)| resource == &operation.resource)
        {
            existing.extend(fields);
        } else {
            grouped.push((operation.resource.clone(), fields.collect()));
        }
    }
    grouped
}

/// Faults an [`InMemoryTarget`] injects on demand.
#[derive(Debug, Clone, Default)]
pub struct TargetFaults {
    pub refused_writes: BTreeSet<ResourceRef>,
    pub restore_failures: BTreeMap<ResourceRef, u32>,
    pub validation_errors: BTreeMap<ValidationKind, Vec<Finding>>,
    pub validation_warnings: BTreeMap<ValidationKind, Vec<Finding>>,
    pub drift_after_write: BTreeSet<ResourceRef>,
    pub lost_write_responses: BTreeSet<ResourceRef>,
    pub read_skew_ms: i64,
}

impl TargetFaults {
    #[must_use]
    pub fn refuse_write(mut self, resource: &str) -> Self {
        self.refused_writes.insert(ResourceRef::new(resource));
        self
    }

    /// Fail the next `times` restore attempts for `resource`.
    #[must_use]
    pub fn fail_restore(mut self, resource: &str, times: u32) -> Self {
        self.restore_failures
            .insert(ResourceRef::new(resource), times);
        self
    }

    #[must_use]
    pub fn fail_validation(mut self, kind: ValidationKind, finding: Finding) -> Self {
        self.validation_errors.entry(kind).or_default().push(finding);
        self
    }

    #[must_use]
    pub fn warn_validation(mut self, kind: ValidationKind, finding: Finding) -> Self {
        self.validation_warnings
            .entry(kind)
            .or_default()
            .push(finding);
        self
    }

    #[must_use]
    pub fn drift_after_write(mut self, resource: &str) -> Self {
        self.drift_after_write.insert(ResourceRef::new(resource));
        self
    }

    /// Apply a write touching `resource`, then report a transport error instead of its outcome.
    #[must_use]
    pub fn lose_write_response(mut self, resource: &str) -> Self {
        self.lost_write_responses.insert(ResourceRef::new(resource));
        self
    }

    #[must_use]
    pub fn skew_reads(mut self, millis: i64) -> Self {
        self.read_skew_ms = millis;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCall {
    Validate(ValidationKind),
    ReadState(Vec<ResourceRef>),
    WriteState(Vec<ResourceRef>),
    Restore(ResourceRef, VersionId),
}

/// In-process target with fault injection and a journal of every call.
#[derive(Debug, Default)]
pub struct InMemoryTarget {
    state: Mutex<TargetState>,
    faults: Mutex<TargetFaults>,
    journal: Mutex<Vec<TargetCall>>,
}

impl InMemoryTarget {
    #[must_use]
    pub fn new(state: TargetState, faults: TargetFaults) -> Self {
        Self {
            state: Mutex::new(state),
            faults: Mutex::new(faults),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Replace the injected faults, e.g. to let a previously failing restore succeed.
    ///
    /// # Errors
    /// Returns an error if the fault lock is poisoned.
    pub fn set_faults(&self, faults: TargetFaults) -> Result<()> {
        *lock(&self.faults)? = faults;
        Ok(())
    }

    /// Snapshot of every call issued so far.
    ///
    /// # Errors
    /// Returns an error if the journal lock is poisoned.
    pub fn calls(&self) -> Result<Vec<TargetCall>> {
        Ok(lock(&self.journal)?.clone())
    }

    /// # Errors
    /// Returns an error if the journal lock is poisoned.
    pub fn write_call_count(&self) -> Result<usize> {
        Ok(self
            .calls()?
            .iter()
            .filter(|call| matches!(call, TargetCall::WriteState(_)))
            .count())
    }

    /// # Errors
    /// Returns an error if the journal lock is poisoned.
    pub fn restore_calls(&self) -> Result<Vec<(ResourceRef, VersionId)>> {
        Ok(self
            .calls()?
            .into_iter()
            .filter_map(|call| match call {
                TargetCall::Restore(resource, version) => Some((resource, version)),
                _ => None,
            })
            .collect())
    }

    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn current_version(&self, resource: &str) -> Result<Option<VersionId>> {
        Ok(lock(&self.state)?
            .current_version(&ResourceRef::new(resource))
            .cloned())
    }

    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn state(&self) -> Result<TargetState> {
        Ok(lock(&self.state)?.clone())
    }

    fn record(&self, call: TargetCall) -> Result<()> {
        lock(&self.journal)?.push(call);
        Ok(())
    }
}

impl TargetSystem for InMemoryTarget {
    fn target_name(&self) -> &'static str {
        "in_memory"
    }

    fn validate(
        &self,
        kind: ValidationKind,
        _scope: &Scope,
        plan: &ChangeSet,
    ) -> Result<ValidationReport> {
        self.record(TargetCall::Validate(kind))?;
        let base = lock(&self.state)?.validate(kind, plan);
        let faults = lock(&self.faults)?;
        let injected = ValidationReport::from_findings(
            faults
                .validation_errors
                .get(&kind)
                .cloned()
                .unwrap_or_default(),
            faults
                .validation_warnings
                .get(&kind)
                .cloned()
                .unwrap_or_default(),
        );
        Ok(base.merge(injected))
    }

    fn read_state(&self, refs: &[ResourceRef]) -> Result<BTreeMap<ResourceRef, ResourceState>> {
        self.record(TargetCall::ReadState(refs.to_vec()))?;
        let skew_ms = lock(&self.faults)?.read_skew_ms;
        let base = now_utc();
        lock(&self.state)?.read_state(refs, |index| {
            let offset = i64::try_from(index).unwrap_or(i64::MAX).saturating_mul(skew_ms);
            base + time::Duration::milliseconds(offset)
        })
    }

    fn write_state(
        &self,
        plan: &ChangeSet,
        mode: ApplyMode,
        expected_prior_versions: &BTreeMap<ResourceRef, VersionId>,
    ) -> Result<WriteOutcome> {
        self.record(TargetCall::WriteState(plan.touched_resources()))?;
        let faults = lock(&self.faults)?.clone();
        let mut state = lock(&self.state)?;
        let outcome = state.write_state(plan, mode, expected_prior_versions, &faults.refused_writes);
        for resource in outcome.written.keys() {
            if faults.drift_after_write.contains(resource) {
                state.drift(resource);
            }
        }
        if let Some(resource) = outcome
            .written
            .keys()
            .find(|resource| faults.lost_write_responses.contains(*resource))
        {
            return Err(anyhow!("connection reset after writing {resource}"));
        }
        Ok(outcome)
    }

    fn restore(&self, resource: &ResourceRef, target_version: &VersionId) -> Result<()> {
        self.record(TargetCall::Restore(resource.clone(), target_version.clone()))?;
        {
            let mut faults = lock(&self.faults)?;
            if let Some(remaining) = faults.restore_failures.get_mut(resource) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(anyhow!("injected restore failure for {resource}"));
                }
            }
        }
        lock(&self.state)?.restore(resource, target_version)
    }
}

/// Target backed by a JSON state file, so suspended runs can resume across processes.
#[derive(Debug, Clone)]
pub struct JsonFileTarget {
    path: PathBuf,
}

impl JsonFileTarget {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Write an initial state file.
    ///
    /// # Errors
    /// Returns an error if the state cannot be serialized or written.
    pub fn init(path: &Path, state: &TargetState) -> Result<Self> {
        let target = Self::new(path);
        target.save(state)?;
        Ok(target)
    }

    /// # Errors
    /// Returns an error if the state file is missing or malformed.
    pub fn load(&self) -> Result<TargetState> {
        let body = fs::read_to_string(&self.path).with_context(|| {
            format!("failed to read target state at {}", self.path.display())
        })?;
        serde_json::from_str(&body)
            .with_context(|| format!("invalid target state JSON at {}", self.path.display()))
    }

    fn save(&self, state: &TargetState) -> Result<()> {
        let tmp = self
            .path
            .with_extension(format!("tmp-{}", Ulid::new()));
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to move target state into {}", self.path.display())
        })?;
        Ok(())
    }
}

impl TargetSystem for JsonFileTarget {
    fn target_name(&self) -> &'static str {
        "json_file"
    }

    fn validate(
        &self,
        kind: ValidationKind,
        _scope: &Scope,
        plan: &ChangeSet,
    ) -> Result<ValidationReport> {
        Ok(self.load()?.validate(kind, plan))
    }

    fn read_state(&self, refs: &[ResourceRef]) -> Result<BTreeMap<ResourceRef, ResourceState>> {
        let read_at = now_utc();
        self.load()?.read_state(refs, |_| read_at)
    }

    fn write_state(
        &self,
        plan: &ChangeSet,
        mode: ApplyMode,
        expected_prior_versions: &BTreeMap<ResourceRef, VersionId>,
    ) -> Result<WriteOutcome> {
        let mut state = self.load()?;
        let outcome = state.write_state(plan, mode, expected_prior_versions, &BTreeSet::new());
        if !outcome.written.is_empty() {
            self.save(&state)?;
        }
        Ok(outcome)
    }

    fn restore(&self, resource: &ResourceRef, target_version: &VersionId) -> Result<()> {
        let mut state = self.load()?;
        state.restore(resource, target_version)?;
        self.save(&state)
    }
}

/// Connection settings of an [`HttpJsonTarget`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpTargetParams {
    pub base_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra headers sent with every operation, e.g. a tenant id.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Name of the env var holding a bearer token for the target.
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl HttpTargetParams {
    #[must_use]
    pub fn for_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout_ms: default_http_timeout_ms(),
            headers: BTreeMap::new(),
            auth_bearer_env: None,
        }
    }
}

/// Target reached over HTTP: each operation is a JSON POST to `{base_url}/{operation}`.
#[derive(Debug, Clone)]
pub struct HttpJsonTarget {
    base_url: String,
    agent: ureq::Agent,
    headers: BTreeMap<String, String>,
    bearer_token: Option<String>,
}

impl HttpJsonTarget {
    /// # Errors
    /// Returns an error for a non-http base URL or a missing bearer token env var.
    pub fn new(params: HttpTargetParams) -> Result<Self> {
        let base_url = params.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow!(
                "http_json target base_url must be an http(s) url, got '{}'",
                params.base_url
            ));
        }
        let bearer_token = params
            .auth_bearer_env
            .as_deref()
            .map(|env_name| {
                std::env::var(env_name)
                    .map_err(|_| anyhow!("target token env var '{env_name}' is not set"))
            })
            .transpose()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(params.timeout_ms))
            .build();
        Ok(Self {
            base_url,
            agent,
            headers: params.headers,
            bearer_token,
        })
    }

    /// Build from a JSON params object shaped like [`HttpTargetParams`].
    ///
    /// # Errors
    /// Returns an error when the params are missing fields or malformed.
    pub fn from_params(params: &Value) -> Result<Self> {
        let params: HttpTargetParams = serde_json::from_value(params.clone())
            .context("invalid http_json target params")?;
        Self::new(params)
    }

    fn post<T: DeserializeOwned>(&self, operation: &str, body: &Value) -> Result<T> {
        let url = format!("{}/{operation}", self.base_url);
        let mut req = self
            .agent
            .request("POST", &url)
            .set("content-type", "application/json");
        for (header, value) in &self.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(body) {
            Ok(response) => response
                .into_json::<T>()
                .with_context(|| format!("invalid response body from {url}")),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                tracing::warn!(%url, code, "target rejected request");
                Err(anyhow!("target {operation} failed with http status {code}: {detail}"))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(anyhow!("http transport failure calling {url}: {err}"))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadStateResponse {
    states: BTreeMap<ResourceRef, ResourceState>,
}

impl TargetSystem for HttpJsonTarget {
    fn target_name(&self) -> &'static str {
        "http_json"
    }

    fn validate(
        &self,
        kind: ValidationKind,
        scope: &Scope,
        plan: &ChangeSet,
    ) -> Result<ValidationReport> {
        self.post(
            "validate",
            &json!({"kind": kind, "scope": scope, "plan": plan}),
        )
    }

    fn read_state(&self, refs: &[ResourceRef]) -> Result<BTreeMap<ResourceRef, ResourceState>> {
        let response: ReadStateResponse = self.post("read_state", &json!({"refs": refs}))?;
        Ok(response.states)
    }

    fn write_state(
        &self,
        plan: &ChangeSet,
        mode: ApplyMode,
        expected_prior_versions: &BTreeMap<ResourceRef, VersionId>,
    ) -> Result<WriteOutcome> {
        self.post(
            "write_state",
            &json!({
                "plan": plan,
                "mode": mode,
                "expected_prior_versions": expected_prior_versions,
            }),
        )
    }

    fn restore(&self, resource: &ResourceRef, target_version: &VersionId) -> Result<()> {
        let _: Value = self.post(
            "restore",
            &json!({"resource": resource, "target_version": target_version}),
        )?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("in-memory target lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::{
        HttpJsonTarget, HttpTargetParams, InMemoryTarget, JsonFileTarget, TargetCall,
        TargetFaults, TargetState, TargetSystem,
    };
    use safeguard_domain::{
        ApplyMode, ChangeSet, Finding, PatchOperation, ResourceRef, Scope, ValidationKind,
        VersionId,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use ulid::Ulid;

    fn seeded() -> TargetState {
        TargetState::default()
            .with_resource("R1", &json!({"fieldA": "old-a"}))
            .with_resource("R2", &json!({"fieldB": "old-b"}))
    }

    fn plan_both() -> ChangeSet {
        ChangeSet {
            change_set_name: "cs".to_string(),
            description: None,
            operations: vec![
                PatchOperation {
                    resource: ResourceRef::new("R1"),
                    fields: BTreeMap::from([("fieldA".to_string(), json!("new-a"))]),
                },
                PatchOperation {
                    resource: ResourceRef::new("R2"),
                    fields: BTreeMap::from([("fieldB".to_string(), json!("new-b"))]),
                },
            ],
        }
    }

    fn expected_v1() -> BTreeMap<ResourceRef, VersionId> {
        BTreeMap::from([
            (ResourceRef::new("R1"), VersionId::new("v1")),
            (ResourceRef::new("R2"), VersionId::new("v1")),
        ])
    }

    #[test]
    fn write_then_restore_returns_to_prior_version() {
        let target = InMemoryTarget::new(seeded(), TargetFaults::default());
        let outcome = target.write_state(&plan_both(), ApplyMode::Draft, &expected_v1());
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());
        assert!(outcome.failure.is_none());
        assert_eq!(
            outcome.written.get(&ResourceRef::new("R1")),
            Some(&VersionId::new("v2"))
        );

        assert!(target
            .restore(&ResourceRef::new("R1"), &VersionId::new("v1"))
            .is_ok());
        assert!(target
            .restore(&ResourceRef::new("R1"), &VersionId::new("v1"))
            .is_ok());
        let version = target.current_version("R1");
        assert!(version.is_ok());
        assert_eq!(
            version.unwrap_or_else(|_| unreachable!()),
            Some(VersionId::new("v1"))
        );
    }

    #[test]
    fn version_mismatch_stops_the_write() {
        let target = InMemoryTarget::new(seeded(), TargetFaults::default());
        let mut expected = expected_v1();
        expected.insert(ResourceRef::new("R1"), VersionId::new("v9"));
        let outcome = target.write_state(&plan_both(), ApplyMode::Draft, &expected);
        assert!(outcome.is_ok());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());
        assert!(outcome.written.is_empty());
        assert!(outcome.failure.is_some());
        let version = target.current_version("R2");
        assert_eq!(
            version.unwrap_or_else(|_| unreachable!()),
            Some(VersionId::new("v1"))
        );
    }

    #[test]
    fn refused_write_reports_partial_success() {
        let target = InMemoryTarget::new(seeded(), TargetFaults::default().refuse_write("R2"));
        let outcome = target.write_state(&plan_both(), ApplyMode::Publish, &expected_v1());
        let outcome = outcome.unwrap_or_else(|_| unreachable!());
        assert_eq!(outcome.written.len(), 1);
        assert!(outcome.written.contains_key(&ResourceRef::new("R1")));
        let failure = outcome.failure.unwrap_or_else(|| unreachable!());
        assert_eq!(failure.resource, Some(ResourceRef::new("R2")));
    }

    #[test]
    fn injected_restore_failures_are_consumed() {
        let target =
            InMemoryTarget::new(seeded(), TargetFaults::default().fail_restore("R1", 2));
        let resource = ResourceRef::new("R1");
        let version = VersionId::new("v1");
        assert!(target.restore(&resource, &version).is_err());
        assert!(target.restore(&resource, &version).is_err());
        assert!(target.restore(&resource, &version).is_ok());
        let calls = target.restore_calls().unwrap_or_else(|_| unreachable!());
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn validation_merges_injected_findings() {
        let target = InMemoryTarget::new(
            seeded().with_unhealthy(true),
            TargetFaults::default()
                .fail_validation(ValidationKind::Plan, Finding::new("bad", "bad plan")),
        );
        let health = target.validate(ValidationKind::HealthCheck, &Scope::default(), &plan_both());
        assert!(!health.unwrap_or_else(|_| unreachable!()).passed);
        let plan = target.validate(ValidationKind::Plan, &Scope::default(), &plan_both());
        assert!(!plan.unwrap_or_else(|_| unreachable!()).passed);
        let calls = target.calls().unwrap_or_else(|_| unreachable!());
        assert_eq!(
            calls,
            vec![
                TargetCall::Validate(ValidationKind::HealthCheck),
                TargetCall::Validate(ValidationKind::Plan),
            ]
        );
    }

    #[test]
    fn mapping_warns_on_new_fields_without_failing() {
        let target = InMemoryTarget::new(seeded(), TargetFaults::default());
        let mut plan = plan_both();
        plan.operations[0]
            .fields
            .insert("subtitle".to_string(), json!("x"));
        let report = target
            .validate(ValidationKind::Mapping, &Scope::default(), &plan)
            .unwrap_or_else(|_| unreachable!());
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, "field_not_mapped");
    }

    #[test]
    fn json_file_target_persists_between_instances() {
        let path = std::env::temp_dir().join(format!("safeguard-target-{}.json", Ulid::new()));
        let target = JsonFileTarget::init(&path, &seeded());
        assert!(target.is_ok());
        let target = target.unwrap_or_else(|_| unreachable!());
        let outcome = target.write_state(&plan_both(), ApplyMode::Draft, &expected_v1());
        assert!(outcome.is_ok());

        let reopened = JsonFileTarget::new(&path);
        let states = reopened.read_state(&[ResourceRef::new("R1"), ResourceRef::new("R2")]);
        assert!(states.is_ok());
        let states = states.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            states
                .get(&ResourceRef::new("R1"))
                .map(|state| state.version_id.clone()),
            Some(VersionId::new("v2"))
        );
        assert!(reopened
            .read_state(&[ResourceRef::new("missing")])
            .is_err());
    }

    #[test]
    fn http_target_params_are_checked_up_front() {
        assert!(HttpJsonTarget::from_params(&json!({})).is_err());
        assert!(HttpJsonTarget::from_params(&json!({"base_url": "ftp://localhost:9"})).is_err());
        assert!(HttpJsonTarget::from_params(
            &json!({"base_url": "http://localhost:9", "retries": 3})
        )
        .is_err());
        assert!(HttpJsonTarget::from_params(&json!({
            "base_url": "http://localhost:9",
            "auth_bearer_env": "SAFEGUARD_TEST_TOKEN_THAT_IS_NEVER_SET",
        }))
        .is_err());

        let params: Result<HttpTargetParams, _> = serde_json::from_value(json!({
            "base_url": "https://cms.example/api/",
            "headers": {"x-tenant": "docs"},
        }));
        assert!(params.is_ok());
        let params = params.unwrap_or_else(|_| unreachable!());
        assert_eq!(params.timeout_ms, 30_000);
        assert_eq!(params.headers.get("x-tenant").map(String::as_str), Some("docs"));
        assert!(HttpJsonTarget::new(params).is_ok());
        assert!(HttpJsonTarget::new(HttpTargetParams::for_url("http://localhost:9")).is_ok());
    }

    #[test]
    fn lost_write_response_still_applies_the_write() {
        let target =
            InMemoryTarget::new(seeded(), TargetFaults::default().lose_write_response("R1"));
        let outcome = target.write_state(&plan_both(), ApplyMode::Publish, &expected_v1());
        assert!(outcome.is_err());
        let version = target.current_version("R1");
        assert_eq!(
            version.unwrap_or_else(|_| unreachable!()),
            Some(VersionId::new("v2"))
        );
    }
}
