use crate::error::{SrmaError, SrmaResult};
use crate::model::{
    non_blank, Id, NewOutcomeDefinition, OutcomeDefinition, OutcomeRef, OutcomeType,
};
use std::collections::HashSet;

/// Working copy of a project's outcome allow-list. Additions get provisional
/// ids from the owning working schema and become inserts on commit.
#[derive(Debug, Clone)]
pub struct OutcomeRegistry {
    project_id: Id,
    stored_ids: HashSet<Id>,
    outcomes: Vec<OutcomeDefinition>,
}

impl OutcomeRegistry {
    pub fn new(project_id: Id, outcomes: Vec<OutcomeDefinition>) -> Self {
        Self {
            project_id,
            stored_ids: outcomes.iter().map(|o| o.id).collect(),
            outcomes,
        }
    }

    pub fn outcomes(&self) -> &[OutcomeDefinition] {
        &self.outcomes
    }

    pub fn find_by_name(&self, name: &str) -> Option<&OutcomeDefinition> {
        self.outcomes.iter().find(|o| o.matches_name(name))
    }

    /// Whether `name` is registered with `outcome_type`, ignoring case
    pub fn allows(&self, name: &str, outcome_type: OutcomeType) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.outcome_type == outcome_type && o.matches_name(name))
    }

    /// Register a new outcome. A case-insensitive duplicate is a validation
    /// failure unless `idempotent`, in which case nothing changes and
    /// `Ok(false)` is returned.
    pub fn add(
        &mut self,
        provisional_id: Id,
        name: &str,
        outcome_type: OutcomeType,
        idempotent: bool,
    ) -> SrmaResult<bool> {
        let name = non_blank(Some(name))
            .ok_or_else(|| SrmaError::validation("outcome name must not be empty"))?;
        if let Some(existing) = self.find_by_name(&name) {
            if idempotent {
                return Ok(false);
            }
            return Err(SrmaError::validation(format!(
                "outcome '{}' already exists as '{}'",
                name, existing.name
            )));
        }
        self.outcomes.push(OutcomeDefinition {
            id: provisional_id,
            project_id: self.project_id,
            name,
            outcome_type,
        });
        Ok(true)
    }

    /// Remove by id, falling back to a case-insensitive name match
    pub fn delete(&mut self, target: &OutcomeRef) -> SrmaResult<OutcomeDefinition> {
        if target.outcome_id.is_none() && target.name.is_none() {
            return Err(SrmaError::validation(
                "delete_outcome needs an outcome_id or a name",
            ));
        }
        let position = target
            .outcome_id
            .and_then(|id| self.outcomes.iter().position(|o| o.id == id))
            .or_else(|| {
                target
                    .name
                    .as_deref()
                    .and_then(|name| self.outcomes.iter().position(|o| o.matches_name(name)))
            });
        match position {
            Some(i) => Ok(self.outcomes.remove(i)),
            None => Err(SrmaError::not_found(match (&target.outcome_id, &target.name) {
                (_, Some(name)) => format!("outcome '{}'", name),
                (Some(id), None) => format!("outcome {}", id),
                (None, None) => "outcome".to_string(),
            })),
        }
    }

    /// Split into (inserted, deleted ids) relative to the stored registry
    pub fn into_changes(self) -> (Vec<NewOutcomeDefinition>, Vec<Id>) {
        let current: HashSet<Id> = self.outcomes.iter().map(|o| o.id).collect();
        let mut deleted: Vec<Id> = self
            .stored_ids
            .iter()
            .filter(|id| !current.contains(id))
            .copied()
            .collect();
        deleted.sort_unstable();
        let inserted = self
            .outcomes
            .into_iter()
            .filter(|o| !self.stored_ids.contains(&o.id))
            .map(|o| NewOutcomeDefinition {
                project_id: o.project_id,
                name: o.name,
                outcome_type: o.outcome_type,
            })
            .collect();
        (inserted, deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> OutcomeRegistry {
        OutcomeRegistry::new(
            1,
            vec![OutcomeDefinition {
                id: 10,
                project_id: 1,
                name: "mortality".to_string(),
                outcome_type: OutcomeType::Dichotomous,
            }],
        )
    }

    #[test]
    fn test_duplicate_name_rejected_regardless_of_case() {
        let mut registry = registry();
        let err = registry
            .add(99, "Mortality", OutcomeType::Dichotomous, false)
            .unwrap_err();
        assert!(matches!(err, SrmaError::Validation(_)));
        assert_eq!(registry.outcomes().len(), 1);

        let (inserted, deleted) = registry.into_changes();
        assert!(inserted.is_empty());
        assert!(deleted.is_empty());
    }

    #[test]
    fn test_idempotent_add_is_a_no_op() {
        let mut registry = registry();
        assert!(!registry
            .add(99, "MORTALITY", OutcomeType::Dichotomous, true)
            .unwrap());
        assert!(registry
            .add(100, " BMI ", OutcomeType::Continuous, true)
            .unwrap());
        assert!(registry.allows("bmi", OutcomeType::Continuous));
        assert!(!registry.allows("bmi", OutcomeType::Dichotomous));

        let (inserted, _) = registry.into_changes();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].name, "BMI");
    }

    #[test]
    fn test_delete_by_name_fallback() {
        let mut registry = registry();
        let removed = registry
            .delete(&OutcomeRef {
                outcome_id: None,
                name: Some("MORTALITY".to_string()),
            })
            .unwrap();
        assert_eq!(removed.id, 10);
        assert!(matches!(
            registry.delete(&OutcomeRef {
                outcome_id: Some(10),
                name: None
            }),
            Err(SrmaError::NotFound(_))
        ));
        let (_, deleted) = registry.into_changes();
        assert_eq!(deleted, vec![10]);
    }

    #[test]
    fn test_stale_id_falls_back_to_name() {
        let mut registry = registry();
        let removed = registry
            .delete(&OutcomeRef {
                outcome_id: Some(9999),
                name: Some("mortality".to_string()),
            })
            .unwrap();
        assert_eq!(removed.id, 10);
        assert!(registry.outcomes().is_empty());
    }
}
