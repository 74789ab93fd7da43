use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "processing_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub file_id: Uuid,
    pub owner_id: String,
    #[sea_orm(indexed)]
    pub state: String, // queued, active, completed, failed, cancelled
    pub progress: i32,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub created_at: DateTimeUtc,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
    pub next_attempt_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub result_summary: Option<Json>,
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
