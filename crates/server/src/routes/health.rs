use axum::Json;
use utils::response::ApiResponse;

pub async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("OK"))
}
