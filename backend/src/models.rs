use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = categories)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = categories)]
pub struct NewCategory {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(User, foreign_key = author_id))]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub main_pdf_id: Option<Uuid>,
    pub author_id: Uuid,
    pub content: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub author_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = attachments)]
#[diesel(belongs_to(Document))]
pub struct Attachment {
    pub id: Uuid,
    pub document_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub sort_order: i32,
    pub attachment_type: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = attachments)]
pub struct NewAttachment {
    pub id: Uuid,
    pub document_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: i64,
    pub sort_order: i32,
    pub attachment_type: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = converted_documents)]
#[diesel(belongs_to(Document))]
pub struct ConvertedDocument {
    pub id: Uuid,
    pub document_id: Uuid,
    pub conversion_type: String,
    pub file_path: String,
    pub file_size: i64,
    pub original_file: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = converted_documents)]
pub struct NewConvertedDocument {
    pub id: Uuid,
    pub document_id: Uuid,
    pub conversion_type: String,
    pub file_path: String,
    pub file_size: i64,
    pub original_file: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_categories)]
pub struct NewDocumentCategory {
    pub document_id: Uuid,
    pub category_id: Uuid,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_access)]
pub struct NewDocumentAccess {
    pub document_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = compose_operations)]
pub struct NewComposeOperation {
    pub operation_id: Uuid,
    pub document_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = settings)]
#[diesel(primary_key(key))]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: NaiveDateTime,
}
