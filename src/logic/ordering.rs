//! Structural edits on an in-memory snapshot of a project's form.
//!
//! Every operation works on a [`WorkingSchema`] loaded from the store and is
//! turned into one [`SchemaCommit`] at the end, so a request either lands
//! completely or not at all. Nothing here touches the store.

use std::collections::{HashMap, HashSet};

use crate::error::{SrmaError, SrmaResult};
use crate::logic::outcome_registry::OutcomeRegistry;
use crate::model::{
    group_into_sections, non_blank, validate_options, AddFieldPayload, Direction, FieldChanges,
    FormField, FormSection, Id, NewFormField, OutcomeDefinition, OutcomeRef, OutcomeType,
    UNORDERED_SECTION,
};
use crate::store::traits::{FieldOrderUpdate, SchemaCommit};

/// Rows created in the working copy get ids from here up; real ids never
/// reach it, and they still sort after every stored row.
const PROVISIONAL_ID_BASE: Id = 1 << 62;

#[derive(Debug, Clone)]
pub struct WorkingSchema {
    project_id: Id,
    stored: HashMap<Id, FormField>,
    fields: Vec<FormField>,
    outcomes: OutcomeRegistry,
    next_provisional_id: Id,
}

fn is_provisional(id: Id) -> bool {
    id >= PROVISIONAL_ID_BASE
}

fn to_order(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl WorkingSchema {
    pub fn new(project_id: Id, fields: Vec<FormField>, outcomes: Vec<OutcomeDefinition>) -> Self {
        Self {
            project_id,
            stored: fields.iter().map(|f| (f.id, f.clone())).collect(),
            fields,
            outcomes: OutcomeRegistry::new(project_id, outcomes),
            next_provisional_id: PROVISIONAL_ID_BASE,
        }
    }

    pub fn project_id(&self) -> Id {
        self.project_id
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    pub fn field(&self, field_id: Id) -> Option<&FormField> {
        self.fields.iter().find(|f| f.id == field_id)
    }

    pub fn sections(&self) -> Vec<FormSection> {
        group_into_sections(self.fields.clone())
    }

    pub fn outcomes(&self) -> &OutcomeRegistry {
        &self.outcomes
    }

    fn provisional_id(&mut self) -> Id {
        let id = self.next_provisional_id;
        self.next_provisional_id += 1;
        id
    }

    fn field_index(&self, field_id: Id) -> SrmaResult<usize> {
        self.fields
            .iter()
            .position(|f| f.id == field_id)
            .ok_or_else(|| SrmaError::not_found(format!("field {}", field_id)))
    }

    fn has_section(&self, section: &str) -> bool {
        self.fields.iter().any(|f| f.section == section)
    }

    /// Order a field placed into `section` should carry: the section's own
    /// order when it exists, otherwise one past the current maximum.
    fn section_order_for(&mut self, section: &str, excluding: Option<Id>) -> i32 {
        let existing: Vec<Option<i32>> = self
            .fields
            .iter()
            .filter(|f| f.section == section && Some(f.id) != excluding)
            .map(|f| f.section_order)
            .collect();
        let legacy = if existing.is_empty() {
            self.fields.iter().any(|f| f.section_order.is_none())
        } else {
            existing.iter().any(Option::is_none)
        };
        if legacy {
            self.normalize_section_order();
        }

        let orders = self
            .fields
            .iter()
            .filter(|f| Some(f.id) != excluding)
            .filter(|f| existing.is_empty() || f.section == section)
            .filter_map(|f| f.section_order);
        if existing.is_empty() {
            orders.max().unwrap_or(0).saturating_add(1)
        } else {
            orders.min().unwrap_or(1)
        }
    }

    /// Next free position at the end of `section`
    fn next_sort_order(&mut self, section: &str, excluding: Option<Id>) -> i32 {
        let legacy = self
            .fields
            .iter()
            .any(|f| f.section == section && Some(f.id) != excluding && f.sort_order.is_none());
        if legacy {
            self.normalize_section(section);
        }
        self.fields
            .iter()
            .filter(|f| f.section == section && Some(f.id) != excluding)
            .filter_map(|f| f.sort_order)
            .max()
            .unwrap_or(0)
            .saturating_add(1)
    }

    /// Append a field to the end of its section; a new section is appended
    /// to the end of the form. Returns the provisional id of the new field.
    pub fn add_field(&mut self, payload: &AddFieldPayload) -> SrmaResult<Id> {
        let section = non_blank(Some(&payload.section))
            .ok_or_else(|| SrmaError::validation("section must not be empty"))?;
        let label = non_blank(Some(&payload.label))
            .ok_or_else(|| SrmaError::validation("label must not be empty"))?;
        let options = validate_options(payload.field_type, payload.options.as_ref())
            .map_err(SrmaError::Validation)?;

        let section_order = self.section_order_for(&section, None);
        let sort_order = self.next_sort_order(&section, None);
        let id = self.provisional_id();
        self.fields.push(FormField {
            id,
            project_id: self.project_id,
            section,
            section_order: Some(section_order),
            label,
            field_type: payload.field_type,
            required: payload.required,
            sort_order: Some(sort_order),
            help_text: payload.help_text.as_deref().and_then(|h| non_blank(Some(h))),
            options,
        });
        Ok(id)
    }

    /// Apply the provided attribute changes. A section change moves the
    /// field to the end of the destination section.
    pub fn edit_field(&mut self, field_id: Id, changes: &FieldChanges) -> SrmaResult<()> {
        if changes.is_empty() {
            return Err(SrmaError::validation("no changes provided"));
        }
        let index = self.field_index(field_id)?;
        let current = self.fields[index].clone();

        let label = match &changes.label {
            Some(label) => non_blank(Some(label))
                .ok_or_else(|| SrmaError::validation("label must not be empty"))?,
            None => current.label.clone(),
        };
        let target_section = match &changes.section {
            Some(section) => non_blank(Some(section))
                .ok_or_else(|| SrmaError::validation("section must not be empty"))?,
            None => current.section.clone(),
        };
        let field_type = changes.field_type.unwrap_or(current.field_type);
        let options = if changes.options.is_some() || changes.field_type.is_some() {
            let proposed = changes.options.as_ref().or(current.options.as_ref());
            validate_options(field_type, proposed).map_err(SrmaError::Validation)?
        } else {
            current.options.clone()
        };
        let help_text = match &changes.help_text {
            Some(text) => non_blank(Some(text)),
            None => current.help_text.clone(),
        };

        let moved = target_section != current.section;
        let (section_order, sort_order) = if moved {
            (
                Some(self.section_order_for(&target_section, Some(field_id))),
                Some(self.next_sort_order(&target_section, Some(field_id))),
            )
        } else {
            (current.section_order, current.sort_order)
        };

        // normalization only rewrites orders, `index` still points at the field
        let field = &mut self.fields[index];
        field.label = label;
        field.section = target_section;
        field.field_type = field_type;
        field.required = changes.required.unwrap_or(current.required);
        field.help_text = help_text;
        field.options = options;
        if moved {
            field.section_order = section_order;
            field.sort_order = sort_order;
            self.after_section_vacated(&current.section);
        }
        Ok(())
    }

    /// Remove a field and close the gap it leaves
    pub fn delete_field(&mut self, field_id: Id) -> SrmaResult<FormField> {
        let index = self.field_index(field_id)?;
        let removed = self.fields.remove(index);
        self.after_section_vacated(&removed.section);
        Ok(removed)
    }

    fn after_section_vacated(&mut self, section: &str) {
        if self.has_section(section) {
            self.normalize_section(section);
        } else {
            self.normalize_section_order();
        }
    }

    /// Swap a field with its neighbour inside its section. Returns false
    /// when the field is already at that end.
    pub fn move_field(&mut self, field_id: Id, direction: Direction) -> SrmaResult<bool> {
        let section = self.fields[self.field_index(field_id)?].section.clone();
        self.normalize_section(&section);

        let mut members: Vec<(i32, usize)> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.section == section)
            .map(|(i, f)| (f.sort_order.unwrap_or(0), i))
            .collect();
        members.sort();
        let position = members
            .iter()
            .position(|(_, i)| self.fields[*i].id == field_id)
            .ok_or_else(|| SrmaError::not_found(format!("field {}", field_id)))?;
        let neighbour = match direction {
            Direction::Up if position > 0 => position - 1,
            Direction::Down if position + 1 < members.len() => position + 1,
            _ => return Ok(false),
        };

        let (a, b) = (members[position].1, members[neighbour].1);
        let order_a = self.fields[a].sort_order;
        self.fields[a].sort_order = self.fields[b].sort_order;
        self.fields[b].sort_order = order_a;
        Ok(true)
    }

    /// Swap a whole section with its neighbour. Returns false at either end.
    pub fn move_section(&mut self, section: &str, direction: Direction) -> SrmaResult<bool> {
        let section = section.trim();
        if !self.has_section(section) {
            return Err(SrmaError::not_found(format!("section '{}'", section)));
        }
        let mut names = self.normalize_section_order();
        let position = names
            .iter()
            .position(|name| name == section)
            .ok_or_else(|| SrmaError::not_found(format!("section '{}'", section)))?;
        let neighbour = match direction {
            Direction::Up if position > 0 => position - 1,
            Direction::Down if position + 1 < names.len() => position + 1,
            _ => return Ok(false),
        };
        names.swap(position, neighbour);
        self.assign_section_orders(&names);
        Ok(true)
    }

    /// Re-sequence the positions inside `section` to 1..N, keeping the
    /// current relative order.
    pub fn normalize_section(&mut self, section: &str) {
        let mut members: Vec<((i64, Id), usize)> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.section == section)
            .map(|(i, f)| (f.position_key(), i))
            .collect();
        members.sort();
        for (position, (_, index)) in members.into_iter().enumerate() {
            self.fields[index].sort_order = Some(to_order(position as i64 + 1));
        }
    }

    /// Re-sequence section orders to 1..M. Sections are ranked by their
    /// smallest stored order (unordered ones last), then their oldest field.
    /// Returns the section names in their new order.
    pub fn normalize_section_order(&mut self) -> Vec<String> {
        let mut ranks: HashMap<&str, (i64, Id)> = HashMap::new();
        for field in &self.fields {
            let key = (
                field.section_order.map(i64::from).unwrap_or(UNORDERED_SECTION),
                field.id,
            );
            ranks
                .entry(field.section.as_str())
                .and_modify(|rank| {
                    rank.0 = rank.0.min(key.0);
                    rank.1 = rank.1.min(key.1);
                })
                .or_insert(key);
        }
        let mut ordered: Vec<((i64, Id), String)> = ranks
            .into_iter()
            .map(|(name, rank)| (rank, name.to_string()))
            .collect();
        ordered.sort();
        let names: Vec<String> = ordered.into_iter().map(|(_, name)| name).collect();
        self.assign_section_orders(&names);
        names
    }

    fn assign_section_orders(&mut self, names: &[String]) {
        let orders: HashMap<&str, i32> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), to_order(i as i64 + 1)))
            .collect();
        for field in &mut self.fields {
            if let Some(order) = orders.get(field.section.as_str()) {
                field.section_order = Some(*order);
            }
        }
    }

    /// Full normalization pass over every section
    pub fn normalize_all(&mut self) {
        let names = self.normalize_section_order();
        for name in &names {
            self.normalize_section(name);
        }
    }

    pub fn add_outcome(
        &mut self,
        name: &str,
        outcome_type: OutcomeType,
        idempotent: bool,
    ) -> SrmaResult<bool> {
        let id = self.provisional_id();
        self.outcomes.add(id, name, outcome_type, idempotent)
    }

    pub fn delete_outcome(&mut self, target: &OutcomeRef) -> SrmaResult<OutcomeDefinition> {
        self.outcomes.delete(target)
    }

    /// Diff the working copy against the snapshot it was loaded from
    pub fn into_commit(self) -> SchemaCommit {
        let mut commit = SchemaCommit::new(self.project_id);
        let remaining: HashSet<Id> = self.fields.iter().map(|f| f.id).collect();
        let mut deleted: Vec<Id> = self
            .stored
            .keys()
            .filter(|id| !remaining.contains(id))
            .copied()
            .collect();
        deleted.sort_unstable();
        commit.deleted_field_ids = deleted;

        let mut fields = self.fields;
        fields.sort_by_key(|f| f.id);
        for field in fields {
            if is_provisional(field.id) {
                commit.inserted_fields.push(NewFormField::from(field));
                continue;
            }
            let Some(before) = self.stored.get(&field.id) else {
                continue;
            };
            if !before.same_attributes(&field) {
                commit.updated_fields.push(field);
            } else if before.section_order != field.section_order
                || before.sort_order != field.sort_order
            {
                commit.reordered_fields.push(FieldOrderUpdate {
                    field_id: field.id,
                    section_order: field.section_order,
                    sort_order: field.sort_order,
                });
            }
        }

        let (inserted, deleted) = self.outcomes.into_changes();
        commit.inserted_outcomes = inserted;
        commit.deleted_outcome_ids = deleted;
        commit
    }
}
