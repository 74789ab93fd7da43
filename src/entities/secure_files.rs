use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "secure_files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub owner_id: String,
    pub original_name: String,
    pub sanitized_name: String,
    pub size_bytes: i64,
    #[sea_orm(indexed)]
    pub content_hash: String,
    pub mime_type: String,
    pub storage_key: String,
    pub encryption_key_id: String,
    pub encryption_iv: String,
    pub encryption_auth_tag: String,
    #[sea_orm(column_type = "Json")]
    pub validation_verdict: Json,
    pub processing_status: String,
    #[sea_orm(default_value = 0)]
    pub access_count: i64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub deleted_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file_permissions::Entity")]
    FilePermissions,
    #[sea_orm(has_many = "super::processing_jobs::Entity")]
    ProcessingJobs,
}

impl Related<super::file_permissions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FilePermissions.def()
    }
}

impl Related<super::processing_jobs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProcessingJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
