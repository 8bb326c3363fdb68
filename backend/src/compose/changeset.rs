use std::collections::HashSet;

use serde::Deserialize;
use uuid::Uuid;

use crate::staging::StagedFile;
use crate::storage::is_temp_key;

pub const MAX_TITLE_LENGTH: usize = 255;

/// One atomic batch of document mutations as submitted by a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub operation_id: Uuid,
    #[serde(default)]
    pub metadata: Option<MetadataPatch>,
    #[serde(default)]
    pub replace_main: Option<StagedFile>,
    #[serde(default)]
    pub add_attachments: Vec<StagedFile>,
    #[serde(default)]
    pub delete_attachment_ids: Vec<String>,
    #[serde(default)]
    pub reorder: Vec<ReorderEntry>,
}

/// Present fields are written; absent ones are left alone. An empty
/// description clears it.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub category_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderEntry {
    pub attachment_id: Option<String>,
    pub client_id: Option<String>,
    pub order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeMode {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReorderTarget {
    Existing(Uuid),
    /// Matches an `addAttachments` entry by its `clientId`.
    New(String),
}

/// A change set that passed shape validation, with ids parsed and text
/// fields normalized.
#[derive(Debug, Clone)]
pub struct ValidatedChangeSet {
    pub operation_id: Uuid,
    pub metadata: Option<MetadataPatch>,
    pub replace_main: Option<StagedFile>,
    pub add_attachments: Vec<StagedFile>,
    pub delete_attachment_ids: Vec<Uuid>,
    pub reorder: Vec<(ReorderTarget, i32)>,
}

impl ValidatedChangeSet {
    pub fn staged_files(&self) -> impl Iterator<Item = &StagedFile> {
        self.replace_main.iter().chain(self.add_attachments.iter())
    }

    /// True when the merged PDF could differ from the current one.
    pub fn touches_files(&self) -> bool {
        self.replace_main.is_some()
            || !self.add_attachments.is_empty()
            || !self.delete_attachment_ids.is_empty()
            || !self.reorder.is_empty()
    }
}

impl ChangeSet {
    /// Checks the shape of the change set without touching any store. All
    /// problems are reported together.
    pub fn validate(self, mode: ComposeMode) -> Result<ValidatedChangeSet, Vec<String>> {
        let mut errors = Vec::new();

        let metadata = self
            .metadata
            .map(|patch| normalize_metadata(patch, &mut errors));

        match mode {
            ComposeMode::Create => {
                if self.replace_main.is_none() {
                    errors.push("replaceMain is required when creating a document".to_string());
                }
                let has_title = metadata
                    .as_ref()
                    .and_then(|patch| patch.title.as_ref())
                    .is_some();
                if !has_title {
                    errors.push("metadata.title is required when creating a document".to_string());
                }
                if !self.delete_attachment_ids.is_empty() {
                    errors.push("deleteAttachmentIds is not allowed when creating".to_string());
                }
            }
            ComposeMode::Update => {
                let empty = metadata.is_none()
                    && self.replace_main.is_none()
                    && self.add_attachments.is_empty()
                    && self.delete_attachment_ids.is_empty()
                    && self.reorder.is_empty();
                if empty {
                    errors.push("change set contains no operations".to_string());
                }
            }
        }

        let mut temp_keys = HashSet::new();
        if let Some(main) = &self.replace_main {
            check_staged_file("replaceMain", main, &mut temp_keys, &mut errors);
        }

        let mut client_ids = HashSet::new();
        for (position, staged) in self.add_attachments.iter().enumerate() {
            let field = format!("addAttachments[{position}]");
            check_staged_file(&field, staged, &mut temp_keys, &mut errors);
            match staged.client_id.as_deref().map(str::trim) {
                Some("") => errors.push(format!("{field}.clientId must not be blank")),
                Some(client_id) => {
                    if !client_ids.insert(client_id.to_string()) {
                        errors.push(format!("{field}.clientId '{client_id}' is duplicated"));
                    }
                }
                None => {}
            }
        }

        let mut delete_attachment_ids = Vec::new();
        for raw in &self.delete_attachment_ids {
            match Uuid::parse_str(raw.trim()) {
                Ok(id) if !delete_attachment_ids.contains(&id) => delete_attachment_ids.push(id),
                Ok(_) => {}
                Err(_) => errors.push(format!("deleteAttachmentIds: '{raw}' is not a valid id")),
            }
        }

        let mut reorder = Vec::with_capacity(self.reorder.len());
        let mut targets = HashSet::new();
        for (position, entry) in self.reorder.iter().enumerate() {
            let field = format!("reorder[{position}]");
            if entry.order < 0 {
                errors.push(format!("{field}.order must be zero or greater"));
            }
            let target = match (&entry.attachment_id, &entry.client_id) {
                (Some(attachment_id), None) => match Uuid::parse_str(attachment_id.trim()) {
                    Ok(id) if mode == ComposeMode::Create => {
                        errors.push(format!(
                            "{field}.attachmentId {id} cannot be reordered before the document exists"
                        ));
                        None
                    }
                    Ok(id) if delete_attachment_ids.contains(&id) => {
                        errors.push(format!(
                            "{field} reorders attachment {id} that is being deleted"
                        ));
                        None
                    }
                    Ok(id) => Some(ReorderTarget::Existing(id)),
                    Err(_) => {
                        errors.push(format!("{field}.attachmentId is not a valid id"));
                        None
                    }
                },
                (None, Some(client_id)) => {
                    let client_id = client_id.trim();
                    if client_ids.contains(client_id) {
                        Some(ReorderTarget::New(client_id.to_string()))
                    } else {
                        errors.push(format!(
                            "{field}.clientId '{client_id}' does not match any added attachment"
                        ));
                        None
                    }
                }
                _ => {
                    errors.push(format!(
                        "{field} must name exactly one of attachmentId or clientId"
                    ));
                    None
                }
            };
            if let Some(target) = target {
                if !targets.insert(target.clone()) {
                    errors.push(format!("{field} targets the same attachment twice"));
                } else {
                    reorder.push((target, entry.order));
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(ValidatedChangeSet {
            operation_id: self.operation_id,
            metadata,
            replace_main: self.replace_main,
            add_attachments: self
                .add_attachments
                .into_iter()
                .map(|mut staged| {
                    staged.client_id = staged.client_id.map(|id| id.trim().to_string());
                    staged
                })
                .collect(),
            delete_attachment_ids,
            reorder,
        })
    }
}

fn check_staged_file(
    field: &str,
    staged: &StagedFile,
    temp_keys: &mut HashSet<String>,
    errors: &mut Vec<String>,
) {
    if !is_temp_key(&staged.temp_key) {
        errors.push(format!("{field}.tempKey does not reference a staged file"));
    } else if !temp_keys.insert(staged.temp_key.clone()) {
        errors.push(format!("{field}.tempKey is used more than once"));
    }
    if staged.original_name.trim().is_empty() {
        errors.push(format!("{field}.originalName must not be empty"));
    }
    if staged.mime_type.trim().is_empty() {
        errors.push(format!("{field}.mimeType must not be empty"));
    }
    if staged.size <= 0 {
        errors.push(format!("{field}.size must be positive"));
    }
}

fn normalize_metadata(patch: MetadataPatch, errors: &mut Vec<String>) -> MetadataPatch {
    let title = patch.title.map(|title| title.trim().to_string());
    match title.as_deref() {
        Some("") => errors.push("metadata.title must not be empty".to_string()),
        Some(title) if title.chars().count() > MAX_TITLE_LENGTH => errors.push(format!(
            "metadata.title must be at most {MAX_TITLE_LENGTH} characters"
        )),
        _ => {}
    }

    let keywords = patch.keywords.map(|keywords| {
        let mut seen = HashSet::new();
        keywords
            .into_iter()
            .map(|keyword| keyword.trim().to_string())
            .filter(|keyword| !keyword.is_empty() && seen.insert(keyword.to_lowercase()))
            .collect()
    });

    let category_ids = patch.category_ids.map(|ids| {
        let mut unique = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        unique
    });

    MetadataPatch {
        title,
        description: patch.description.map(|text| text.trim().to_string()),
        keywords,
        category_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn staged(key: &str, client_id: Option<&str>) -> serde_json::Value {
        json!({
            "tempKey": key,
            "originalName": "file.pdf",
            "mimeType": "application/pdf",
            "size": 10,
            "clientId": client_id,
        })
    }

    fn parse(value: serde_json::Value) -> ChangeSet {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn accepts_a_complete_create_request() {
        let changes = parse(json!({
            "operationId": Uuid::new_v4(),
            "metadata": { "title": "  Report A ", "keywords": ["tax", "Tax", " "] },
            "replaceMain": staged("temp/a/main.pdf", None),
            "addAttachments": [staged("temp/b/one.pdf", Some("c1"))],
            "reorder": [{ "clientId": "c1", "order": 0 }],
        }));

        let validated = changes.validate(ComposeMode::Create).unwrap();
        let metadata = validated.metadata.unwrap();
        assert_eq!(metadata.title.as_deref(), Some("Report A"));
        assert_eq!(metadata.keywords, Some(vec!["tax".to_string()]));
        assert_eq!(
            validated.reorder,
            vec![(ReorderTarget::New("c1".to_string()), 0)]
        );
    }

    #[test]
    fn create_requires_title_and_main_file() {
        let errors = parse(json!({ "operationId": Uuid::new_v4() }))
            .validate(ComposeMode::Create)
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn update_must_contain_an_operation() {
        let errors = parse(json!({ "operationId": Uuid::new_v4() }))
            .validate(ComposeMode::Update)
            .unwrap_err();
        assert_eq!(errors, vec!["change set contains no operations".to_string()]);
    }

    #[test]
    fn rejects_keys_outside_the_temp_tier_and_reused_keys() {
        let errors = parse(json!({
            "operationId": Uuid::new_v4(),
            "addAttachments": [
                staged("documents/x/original/a.pdf", None),
                staged("temp/k/a.pdf", None),
                staged("temp/k/a.pdf", None),
            ],
        }))
        .validate(ComposeMode::Update)
        .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("addAttachments[0].tempKey"));
        assert!(errors[1].contains("used more than once"));
    }

    #[test]
    fn reorder_entries_must_resolve_to_one_target() {
        let existing = Uuid::new_v4();
        let errors = parse(json!({
            "operationId": Uuid::new_v4(),
            "deleteAttachmentIds": [existing.to_string(), "not-an-id"],
            "addAttachments": [staged("temp/k/a.pdf", Some("c1"))],
            "reorder": [
                { "attachmentId": existing.to_string(), "order": 0 },
                { "clientId": "missing", "order": 1 },
                { "attachmentId": existing.to_string(), "clientId": "c1", "order": 2 },
                { "clientId": "c1", "order": -3 },
            ],
        }))
        .validate(ComposeMode::Update)
        .unwrap_err();

        assert!(errors.iter().any(|e| e.contains("'not-an-id'")));
        assert!(errors.iter().any(|e| e.contains("being deleted")));
        assert!(errors.iter().any(|e| e.contains("does not match any added")));
        assert!(errors.iter().any(|e| e.contains("exactly one of")));
        assert!(errors.iter().any(|e| e.contains("zero or greater")));
    }

    #[test]
    fn duplicate_client_ids_are_rejected() {
        let errors = parse(json!({
            "operationId": Uuid::new_v4(),
            "addAttachments": [
                staged("temp/a/x.pdf", Some("same")),
                staged("temp/b/y.pdf", Some("same")),
            ],
        }))
        .validate(ComposeMode::Update)
        .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("duplicated"));
    }

    #[test]
    fn duplicate_delete_ids_collapse() {
        let id = Uuid::new_v4();
        let validated = parse(json!({
            "operationId": Uuid::new_v4(),
            "deleteAttachmentIds": [id.to_string(), id.to_string()],
        }))
        .validate(ComposeMode::Update)
        .unwrap();
        assert_eq!(validated.delete_attachment_ids, vec![id]);
        assert!(validated.touches_files());
    }

    #[test]
    fn metadata_only_update_does_not_touch_files() {
        let validated = parse(json!({
            "operationId": Uuid::new_v4(),
            "metadata": { "description": "Updated" },
        }))
        .validate(ComposeMode::Update)
        .unwrap();
        assert!(!validated.touches_files());
    }
}
