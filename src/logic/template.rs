use log::info;
use serde::Deserialize;

use crate::error::{SrmaError, SrmaResult};
use crate::logic::access::AccessControl;
use crate::logic::schema_ops::FormEditor;
use crate::model::{
    non_blank, validate_options, AddFieldPayload, FieldOptions, FieldType, FormField, Id,
    UserContext,
};
use crate::store::traits::Store;

#[derive(Debug, Deserialize)]
struct TemplateDocument {
    sections: Option<Vec<TemplateSection>>,
}

#[derive(Debug, Deserialize)]
struct TemplateSection {
    section_name: Option<String>,
    fields: Option<Vec<TemplateField>>,
}

#[derive(Debug, Deserialize)]
struct TemplateField {
    label: Option<String>,
    field_type: Option<String>,
    #[serde(default)]
    required: bool,
    help: Option<String>,
    help_text: Option<String>,
    options: Option<FieldOptions>,
}

/// Parse and validate a YAML form template into field definitions, in
/// document order. Nothing is written.
pub fn parse_template(yaml: &str) -> SrmaResult<Vec<AddFieldPayload>> {
    let document: TemplateDocument = serde_yaml::from_str(yaml)
        .map_err(|e| SrmaError::validation(format!("invalid template YAML: {}", e)))?;
    let sections = match document.sections {
        Some(sections) if !sections.is_empty() => sections,
        _ => {
            return Err(SrmaError::validation(
                "template must define a non-empty \"sections\" list",
            ))
        }
    };

    let mut payloads = Vec::new();
    for (si, section) in sections.into_iter().enumerate() {
        let section_name = non_blank(section.section_name.as_deref()).ok_or_else(|| {
            SrmaError::validation(format!(
                "section #{} is missing a valid \"section_name\"",
                si + 1
            ))
        })?;
        for (fi, field) in section.fields.unwrap_or_default().into_iter().enumerate() {
            let label = non_blank(field.label.as_deref()).ok_or_else(|| {
                SrmaError::validation(format!(
                    "section \"{}\": field #{} is missing a valid \"label\"",
                    section_name,
                    fi + 1
                ))
            })?;
            let raw_type = field.field_type.as_deref().map(str::trim).unwrap_or("");
            if raw_type.is_empty() {
                return Err(SrmaError::validation(format!(
                    "section \"{}\", field \"{}\": missing \"field_type\"",
                    section_name, label
                )));
            }
            let field_type: FieldType = raw_type.parse().map_err(|e| {
                SrmaError::validation(format!(
                    "section \"{}\", field \"{}\": {}",
                    section_name, label, e
                ))
            })?;
            let options = validate_options(field_type, field.options.as_ref()).map_err(|e| {
                SrmaError::validation(format!(
                    "section \"{}\", field \"{}\": {}",
                    section_name, label, e
                ))
            })?;

            payloads.push(AddFieldPayload {
                section: section_name.clone(),
                label,
                field_type,
                required: field.required,
                help_text: non_blank(field.help.as_deref())
                    .or_else(|| non_blank(field.help_text.as_deref())),
                options,
            });
        }
    }
    Ok(payloads)
}

pub struct TemplateLoader;

impl TemplateLoader {
    /// Append every template field to the project's form in one commit.
    /// Template sections land after the sections already present.
    pub async fn load<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        yaml: &str,
    ) -> SrmaResult<Vec<FormField>> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        let payloads = parse_template(yaml)?;

        let mut working = FormEditor::load(store, project_id).await?;
        for payload in &payloads {
            working.add_field(payload)?;
        }
        let result = FormEditor::commit(store, working, None).await?;
        info!(
            "Project {}: template loaded by {} ({} fields)",
            project_id,
            ctx.label(),
            result.inserted_fields.len()
        );
        Ok(result.inserted_fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::project_with_roles;
    use crate::model::{ChangeAction, FormSection};
    use crate::store::mem::MemoryStore;
    use crate::store::traits::SchemaStore;

    const TEMPLATE: &str = r#"
sections:
  - section_name: Study Identification
    fields:
      - label: Study registration
        field_type: text
        help: Registry identifier
  - section_name: Design
    fields:
      - label: Blinding
        field_type: select
        required: true
        options:
          choices: [Open, Single, Double]
          include_nr: true
      - label: Extractor
        field_type: select_member
"#;

    #[test]
    fn test_parse_template_in_document_order() {
        let payloads = parse_template(TEMPLATE).unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0].help_text.as_deref(), Some("Registry identifier"));
        assert_eq!(payloads[1].field_type, FieldType::Select);
        assert!(payloads[1].required);
        assert_eq!(payloads[2].section, "Design");
    }

    #[test]
    fn test_invalid_templates_are_rejected() {
        for yaml in [
            "sections: []",
            "title: nothing here",
            "sections:\n  - fields: []",
            "sections:\n  - section_name: A\n    fields:\n      - label: X\n        field_type: checkbox",
            "sections:\n  - section_name: A\n    fields:\n      - label: X\n        field_type: select",
            "sections:\n  - section_name: A\n    fields:\n      - field_type: text",
            "sections: [",
        ] {
            assert!(
                matches!(parse_template(yaml), Err(SrmaError::Validation(_))),
                "accepted: {}",
                yaml
            );
        }
    }

    #[tokio::test]
    async fn test_template_sections_follow_existing_ones() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        FormEditor::submit(
            &store,
            &owner,
            project_id,
            ChangeAction::AddField(AddFieldPayload {
                section: "Participants".to_string(),
                label: "Age".to_string(),
                field_type: FieldType::BaselineContinuous,
                required: false,
                help_text: None,
                options: None,
            }),
            None,
        )
        .await
        .unwrap();

        assert!(matches!(
            TemplateLoader::load(&store, &member, project_id, TEMPLATE).await,
            Err(SrmaError::Forbidden(_))
        ));

        let inserted = TemplateLoader::load(&store, &owner, project_id, TEMPLATE)
            .await
            .unwrap();
        assert_eq!(inserted.len(), 3);

        let sections: Vec<FormSection> =
            crate::model::group_into_sections(store.list_fields(project_id).await.unwrap());
        let names: Vec<(&str, Option<i32>)> = sections
            .iter()
            .map(|s| (s.name.as_str(), s.section_order))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Participants", Some(1)),
                ("Study Identification", Some(2)),
                ("Design", Some(3)),
            ]
        );
        let design: Vec<Option<i32>> = sections[2].fields.iter().map(|f| f.sort_order).collect();
        assert_eq!(design, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_bad_template_writes_nothing() {
        let store = MemoryStore::new();
        let (project_id, owner, _) = project_with_roles(&store).await;
        let yaml = "sections:\n  - section_name: A\n    fields:\n      - label: X\n        field_type: text\n  - section_name: B\n    fields:\n      - label: Y\n        field_type: nope\n";
        assert!(TemplateLoader::load(&store, &owner, project_id, yaml).await.is_err());
        assert!(store.list_fields(project_id).await.unwrap().is_empty());
    }
}
