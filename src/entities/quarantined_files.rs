use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Infected uploads, kept encrypted for later analysis. Deliberately not
/// related to `secure_files`: quarantined content never becomes a file record.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quarantined_files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub owner_id: String,
    pub original_name: String,
    pub content_hash: String,
    pub threat_name: String,
    pub risk_level: String,
    pub storage_key: String,
    pub encryption_key_id: String,
    pub encryption_iv: String,
    pub encryption_auth_tag: String,
    #[sea_orm(column_type = "Json")]
    pub validation_verdict: Json,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
