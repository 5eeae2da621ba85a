#![forbid(unsafe_code)]

use safeguard_domain::{ChangeSet, Finding, ResourceRef, Scope, StepCode};
use serde::Serialize;

/// One pipeline slot: which action runs and whether it suspends for approval.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StepDefinition {
    pub code: StepCode,
    pub requires_gate: bool,
    pub checkpoint_required: bool,
}

const fn step(code: StepCode, requires_gate: bool, checkpoint_required: bool) -> StepDefinition {
    StepDefinition {
        code,
        requires_gate,
        checkpoint_required,
    }
}

/// The fixed change-application pipeline. Gates sit on Plan and Pre-Apply validation;
/// the Pre-Apply gate captures the checkpoint before it is exposed.
pub const DEFAULT_PIPELINE: [StepDefinition; 7] = [
    step(StepCode::PreFlight, false, false),
    step(StepCode::HealthCheck, false, false),
    step(StepCode::MappingValidation, false, false),
    step(StepCode::PlanValidation, true, false),
    step(StepCode::PreApplyValidation, true, true),
    step(StepCode::Apply, false, false),
    step(StepCode::Verify, false, false),
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScopeViolation {
    pub resource: ResourceRef,
    pub field: Option<String>,
    pub reason: String,
}

impl ScopeViolation {
    #[must_use]
    pub fn to_finding(&self) -> Finding {
        let message = match &self.field {
            Some(field) => format!("{}.{}: {}", self.resource, field, self.reason),
            None => format!("{}: {}", self.resource, self.reason),
        };
        Finding::new("invalid_scope", message).for_resource(&self.resource)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ScopeCheckResult {
    pub violations: Vec<ScopeViolation>,
}

impl ScopeCheckResult {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn findings(&self) -> Vec<Finding> {
        self.violations
            .iter()
            .map(ScopeViolation::to_finding)
            .collect()
    }
}

/// Resource-level admission check used when a run is submitted: the scope must be
/// non-empty and every operation must target a resource inside it.
#[must_use]
pub fn check_resources_in_scope(scope: &Scope, change_set: &ChangeSet) -> ScopeCheckResult {
    let mut violations = Vec::new();
    if scope.is_empty() {
        violations.push(ScopeViolation {
            resource: ResourceRef::new("*"),
            field: None,
            reason: "scope_empty".to_string(),
        });
    }

    for resource in change_set.touched_resources() {
        if !scope.contains(&resource) {
            violations.push(ScopeViolation {
                resource,
                field: None,
                reason: "resource_not_in_scope".to_string(),
            });
        }
    }

    ScopeCheckResult { violations }
}

/// Full change-set invariant: every operation targets an in-scope resource and only
/// modifies fields in that resource's allowed set.
#[must_use]
pub fn enforce_plan_scope(scope: &Scope, change_set: &ChangeSet) -> ScopeCheckResult {
    let mut result = check_resources_in_scope(scope, change_set);

    for operation in &change_set.operations {
        let Some(allowed) = scope.allowed_fields(&operation.resource) else {
            continue;
        };
        for field in operation.fields.keys() {
            if !allowed.contains(field) {
                result.violations.push(ScopeViolation {
                    resource: operation.resource.clone(),
                    field: Some(field.clone()),
                    reason: "field_not_allowed".to_string(),
                });
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::{check_resources_in_scope, enforce_plan_scope, DEFAULT_PIPELINE};
    use safeguard_domain::{ChangeSet, PatchOperation, ResourceRef, Scope, StepCode};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn scope_r1_r2() -> Scope {
        let mut resources = BTreeMap::new();
        resources.insert(
            ResourceRef::new("R1"),
            BTreeSet::from(["fieldA".to_string()]),
        );
        resources.insert(
            ResourceRef::new("R2"),
            BTreeSet::from(["fieldB".to_string()]),
        );
        Scope { resources }
    }

    fn plan(resource: &str, field: &str) -> ChangeSet {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), json!("new"));
        ChangeSet {
            change_set_name: "cs".to_string(),
            description: None,
            operations: vec![PatchOperation {
                resource: ResourceRef::new(resource),
                fields,
            }],
        }
    }

    #[test]
    fn plan_touching_allowed_field_is_clean() {
        let result = enforce_plan_scope(&scope_r1_r2(), &plan("R1", "fieldA"));
        assert!(result.is_clean());
    }

    #[test]
    fn plan_touching_disallowed_field_is_flagged() {
        let result = enforce_plan_scope(&scope_r1_r2(), &plan("R1", "fieldX"));
        assert!(!result.is_clean());
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].reason, "field_not_allowed");
        assert_eq!(result.violations[0].field.as_deref(), Some("fieldX"));
        let findings = result.findings();
        assert_eq!(findings[0].code, "invalid_scope");
        assert_eq!(findings[0].resource, Some(ResourceRef::new("R1")));
    }

    #[test]
    fn resource_admission_ignores_fields_but_rejects_unknown_resources() {
        assert!(check_resources_in_scope(&scope_r1_r2(), &plan("R1", "fieldX")).is_clean());
        let result = check_resources_in_scope(&scope_r1_r2(), &plan("R3", "fieldA"));
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].reason, "resource_not_in_scope");
    }

    #[test]
    fn empty_scope_is_a_violation() {
        let result = check_resources_in_scope(&Scope::default(), &plan("R1", "fieldA"));
        assert!(result
            .violations
            .iter()
            .any(|violation| violation.reason == "scope_empty"));
    }

    #[test]
    fn default_pipeline_gates_plan_and_pre_apply_only() {
        let gated: Vec<StepCode> = DEFAULT_PIPELINE
            .iter()
            .filter(|definition| definition.requires_gate)
            .map(|definition| definition.code)
            .collect();
        assert_eq!(
            gated,
            vec![StepCode::PlanValidation, StepCode::PreApplyValidation]
        );
        let checkpointed: Vec<StepCode> = DEFAULT_PIPELINE
            .iter()
            .filter(|definition| definition.checkpoint_required)
            .map(|definition| definition.code)
            .collect();
        assert_eq!(checkpointed, vec![StepCode::PreApplyValidation]);
        assert_eq!(DEFAULT_PIPELINE[5].code, StepCode::Apply);
        assert_eq!(DEFAULT_PIPELINE[6].code, StepCode::Verify);
    }
}
