use crate::records::Predicate;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::collections::BTreeMap;

/// `GET /api/v1/records/{key}`
pub async fn get_record(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let key = path.into_inner();
    match state.records.get(&key).await? {
        Some(record) => Ok(HttpResponse::Ok().json(record)),
        None => Err(AppError::NotFound(format!(
            "No record with key '{}' in {}",
            key,
            state.records.table()
        ))),
    }
}

/// `GET /api/v1/records?attribute=value&...`
///
/// Every query parameter becomes one equality predicate, in name order.
pub async fn scan_records(
    state: web::Data<AppState>,
    query: web::Query<BTreeMap<String, String>>,
) -> Result<HttpResponse, AppError> {
    let predicates: Vec<Predicate> = query
        .into_inner()
        .into_iter()
        .map(|(attribute, value)| Predicate { attribute, value })
        .collect();

    let items = state.records.scan(&predicates).await?;
    Ok(HttpResponse::Ok().json(json!({
        "table": state.records.table(),
        "count": items.len(),
        "items": items
    })))
}
