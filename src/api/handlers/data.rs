use crate::AppState;
use crate::api::error::AppError;
use crate::models::workbook::SheetSelector;
use crate::services::retrieval::{DataQuery, DataResponse};
use crate::services::workbook_cache::DEFAULT_PAGE_SIZE;
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct DataParams {
    /// `summary` (default), `sheet` or `export`
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub sheet_name: Option<String>,
    /// One-based sheet id; takes precedence over `sheetName`
    pub sheet_id: Option<usize>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    /// `json`, `csv` or `html`
    pub format: Option<String>,
}

impl TryFrom<DataParams> for DataQuery {
    type Error = AppError;

    fn try_from(params: DataParams) -> Result<Self, Self::Error> {
        match params.kind.as_deref().unwrap_or("summary") {
            "summary" => Ok(DataQuery::Summary),
            "sheet" => {
                let selector = match (params.sheet_id, params.sheet_name) {
                    (Some(id), _) => SheetSelector::Id(id),
                    (None, Some(name)) => SheetSelector::Name(name),
                    (None, None) => SheetSelector::Id(1),
                };
                let page = params.page.unwrap_or(1);
                if page == 0 {
                    return Err(AppError::BadRequest("page starts at 1".to_string()));
                }
                Ok(DataQuery::Sheet {
                    selector,
                    page,
                    page_size: params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                })
            }
            "export" => Ok(DataQuery::Export {
                format: params.format.unwrap_or_else(|| "json".to_string()),
            }),
            other => Err(AppError::BadRequest(format!(
                "unknown data type '{}'; expected summary, sheet or export",
                other
            ))),
        }
    }
}

#[utoipa::path(
    get,
    path = "/files/{id}/data",
    params(
        ("id" = Uuid, Path, description = "File ID"),
        DataParams
    ),
    responses(
        (status = 200, description = "Workbook summary, a page of sheet rows, or an export"),
        (status = 400, description = "Bad query or unsupported export format"),
        (status = 403, description = "No access to this file"),
        (status = 404, description = "File, sheet or parsed data not found"),
        (status = 409, description = "File is still being processed"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "data"
)]
pub async fn get_file_data(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Query(params): Query<DataParams>,
) -> Result<Response, AppError> {
    let query = DataQuery::try_from(params)?;

    let response = match state.data.fetch(id, &claims.sub, query).await? {
        DataResponse::Summary(overview) => Json(overview).into_response(),
        DataResponse::Sheet(page) => Json(page).into_response(),
        DataResponse::Export(export) => (
            [
                (header::CONTENT_TYPE, export.format.content_type().to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}.{}\"", id, export.format.extension()),
                ),
            ],
            export.body,
        )
            .into_response(),
    };
    Ok(response)
}
