use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "file_permissions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub file_id: Uuid,
    #[sea_orm(indexed)]
    pub grantee_id: String,
    pub granted_by: String,
    pub expires_at: DateTimeUtc,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::secure_files::Entity",
        from = "Column::FileId",
        to = "super::secure_files::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    SecureFiles,
}

impl Related<super::secure_files::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SecureFiles.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
