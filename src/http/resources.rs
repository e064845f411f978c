use super::intake::{read_submission, Submission};
use super::AppState;
use crate::auth::AdminUser;
use crate::errors::{AppError, AppResult};
use crate::models::{Document, Event, PageResponse, Pagination, Priority, Reminder, SuccessResponse, WorkplanItem};
use crate::store::Record;
use crate::uploads::UploadKind;
use crate::validation::schemas::{self, completed_flag};
use crate::validation::{validate_and_sanitize, FormFields, Schema};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_PAGE_LIMIT: usize = 50;

/// A content entity managed through the generic CRUD-with-upload handlers.
pub trait Resource: Record + Serialize {
    /// Used in not-found messages and logs.
    const NAME: &'static str;
    const UPLOAD: UploadKind;
    const FILE_FIELD: &'static str;
    const FILE_REQUIRED: bool = false;
    const PAGINATED: bool = false;

    fn schema() -> Schema;

    /// `fields` has already passed `schema()`.
    fn build(id: u64, now: DateTime<Utc>, fields: &FormFields, file_url: Option<String>) -> Self;

    /// Merges validated fields; returns the replaced file, if any.
    fn apply(&mut self, fields: &FormFields, file_url: Option<String>) -> Option<String>;

    fn file_url(&self) -> Option<&str>;
}

fn text(fields: &FormFields, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

/// Absent keeps the current value, empty clears it.
fn merge_optional(current: &mut Option<String>, fields: &FormFields, name: &str) {
    if let Some(value) = fields.get(name) {
        *current = (!value.is_empty()).then(|| value.clone());
    }
}

fn replace_file(current: &mut Option<String>, file_url: Option<String>) -> Option<String> {
    match file_url {
        Some(url) => current.replace(url),
        None => None,
    }
}

impl Resource for Event {
    const NAME: &'static str = "Event";
    const UPLOAD: UploadKind = UploadKind::EventImage;
    const FILE_FIELD: &'static str = "image";
    const PAGINATED: bool = true;

    fn schema() -> Schema {
        schemas::EVENT
    }

    fn build(id: u64, now: DateTime<Utc>, fields: &FormFields, file_url: Option<String>) -> Self {
        Self {
            id,
            title: text(fields, "title"),
            short_description: text(fields, "shortDescription"),
            full_description: text(fields, "fullDescription"),
            date: text(fields, "date"),
            image: file_url,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, fields: &FormFields, file_url: Option<String>) -> Option<String> {
        self.title = text(fields, "title");
        self.short_description = text(fields, "shortDescription");
        self.full_description = text(fields, "fullDescription");
        self.date = text(fields, "date");
        replace_file(&mut self.image, file_url)
    }

    fn file_url(&self) -> Option<&str> {
        self.image.as_deref()
    }
}

impl Resource for Document {
    const NAME: &'static str = "Document";
    const UPLOAD: UploadKind = UploadKind::Document;
    const FILE_FIELD: &'static str = "file";
    const FILE_REQUIRED: bool = true;

    fn schema() -> Schema {
        schemas::DOCUMENT
    }

    fn build(id: u64, now: DateTime<Utc>, fields: &FormFields, file_url: Option<String>) -> Self {
        let optional = |name: &str| fields.get(name).filter(|value| !value.is_empty()).cloned();
        Self {
            id,
            title: text(fields, "title"),
            description: optional("description"),
            file_url: file_url.unwrap_or_default(),
            category: optional("category"),
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, fields: &FormFields, file_url: Option<String>) -> Option<String> {
        self.title = text(fields, "title");
        merge_optional(&mut self.description, fields, "description");
        merge_optional(&mut self.category, fields, "category");
        match file_url {
            Some(url) => Some(std::mem::replace(&mut self.file_url, url)).filter(|old| !old.is_empty()),
            None => None,
        }
    }

    fn file_url(&self) -> Option<&str> {
        Some(self.file_url.as_str()).filter(|url| !url.is_empty())
    }
}

impl Resource for Reminder {
    const NAME: &'static str = "Reminder";
    const UPLOAD: UploadKind = UploadKind::ReminderImage;
    const FILE_FIELD: &'static str = "image";

    fn schema() -> Schema {
        schemas::REMINDER
    }

    fn build(id: u64, now: DateTime<Utc>, fields: &FormFields, file_url: Option<String>) -> Self {
        Self {
            id,
            title: text(fields, "title"),
            description: text(fields, "description"),
            image_url: file_url,
            date: text(fields, "date"),
            priority: fields
                .get("priority")
                .and_then(|value| Priority::parse(value))
                .unwrap_or_default(),
            completed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, fields: &FormFields, file_url: Option<String>) -> Option<String> {
        self.title = text(fields, "title");
        self.description = text(fields, "description");
        self.date = text(fields, "date");
        if let Some(priority) = fields.get("priority").and_then(|value| Priority::parse(value)) {
            self.priority = priority;
        }
        if let Some(completed) = fields.get("completed").filter(|value| !value.is_empty()) {
            self.completed = completed_flag(completed);
        }
        replace_file(&mut self.image_url, file_url)
    }

    fn file_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }
}

impl Resource for WorkplanItem {
    const NAME: &'static str = "Workplan item";
    const UPLOAD: UploadKind = UploadKind::WorkplanFile;
    const FILE_FIELD: &'static str = "file";

    fn schema() -> Schema {
        schemas::WORKPLAN
    }

    fn build(id: u64, now: DateTime<Utc>, fields: &FormFields, file_url: Option<String>) -> Self {
        Self {
            id,
            month: text(fields, "month"),
            year: text(fields, "year").parse().unwrap_or_default(),
            description: text(fields, "description"),
            file_url,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, fields: &FormFields, file_url: Option<String>) -> Option<String> {
        self.month = text(fields, "month");
        if let Ok(year) = text(fields, "year").parse() {
            self.year = year;
        }
        self.description = text(fields, "description");
        replace_file(&mut self.file_url, file_url)
    }

    fn file_url(&self) -> Option<&str> {
        self.file_url.as_deref()
    }
}

pub fn parse_id(raw: &str) -> AppResult<u64> {
    match raw.parse::<u64>() {
        Ok(id) => Ok(id),
        Err(_) if raw.strip_prefix('-').is_some_and(|rest| rest.parse::<u64>().is_ok()) => {
            Err(AppError::BadRequest("ID must not be negative".to_string()))
        }
        Err(_) => Err(AppError::BadRequest("ID must be a number".to_string())),
    }
}

fn not_found<R: Resource>() -> AppError {
    AppError::NotFound(format!("{} not found", R::NAME))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    page: Option<String>,
    limit: Option<String>,
}

impl PageQuery {
    /// `None` unless both parameters were given.
    fn resolve(&self) -> AppResult<Option<(usize, usize)>> {
        let parse = |raw: &Option<String>| -> AppResult<Option<usize>> {
            match raw.as_deref().filter(|value| !value.is_empty()) {
                None => Ok(None),
                Some(value) => match value.parse::<usize>() {
                    Ok(number) if number >= 1 => Ok(Some(number)),
                    _ => Err(AppError::BadRequest("Invalid pagination parameters".to_string())),
                },
            }
        };
        let page = parse(&self.page)?;
        let limit = parse(&self.limit)?;
        if limit.is_some_and(|limit| limit > MAX_PAGE_LIMIT) {
            return Err(AppError::BadRequest(format!("Limit must not exceed {MAX_PAGE_LIMIT}")));
        }
        Ok(page.zip(limit))
    }
}

fn paginate<T: Clone>(records: &[T], page: usize, limit: usize) -> PageResponse<T> {
    let total = records.len();
    let start = (page - 1).saturating_mul(limit).min(total);
    let end = start.saturating_add(limit).min(total);
    PageResponse {
        data: records[start..end].to_vec(),
        pagination: Pagination {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        },
    }
}

pub async fn list<R: Resource>(State(state): State<AppState>, Query(query): Query<PageQuery>) -> AppResult<Response> {
    let records = state.store.all::<R>().await;
    if R::PAGINATED {
        if let Some((page, limit)) = query.resolve()? {
            return Ok(Json(paginate(&records, page, limit)).into_response());
        }
    }
    Ok(Json(records).into_response())
}

pub async fn get_one<R: Resource>(State(state): State<AppState>, Path(raw_id): Path<String>) -> AppResult<Json<R>> {
    let id = parse_id(&raw_id)?;
    state.store.get::<R>(id).await.map(Json).ok_or_else(not_found::<R>)
}

pub async fn create<R: Resource>(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    request: Request,
) -> AppResult<(StatusCode, Json<R>)> {
    let Submission { fields, file } = read_submission(request, &state.uploads, R::UPLOAD, R::FILE_FIELD).await?;
    let fields = validate_and_sanitize(&fields, R::schema()).into_result()?;
    if R::FILE_REQUIRED && file.is_none() {
        return Err(AppError::BadRequest("File is required".to_string()));
    }

    let file_url = file.as_ref().map(|staged| staged.public_url().to_string());
    let record = state
        .store
        .create(move |id, now| R::build(id, now, &fields, file_url))
        .await?;
    if let Some(staged) = file {
        staged.keep();
    }

    tracing::info!(kind = R::LABEL, id = record.id(), admin_id = admin.id, "record created");
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn update<R: Resource>(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(raw_id): Path<String>,
    request: Request,
) -> AppResult<Json<R>> {
    let id = parse_id(&raw_id)?;
    let Submission { fields, file } = read_submission(request, &state.uploads, R::UPLOAD, R::FILE_FIELD).await?;
    let fields = validate_and_sanitize(&fields, R::schema()).into_result()?;

    let file_url = file.as_ref().map(|staged| staged.public_url().to_string());
    let Some((record, replaced)) = state
        .store
        .update(id, move |record: &mut R| record.apply(&fields, file_url))
        .await?
    else {
        return Err(not_found::<R>());
    };
    if let Some(staged) = file {
        staged.keep();
    }
    if let Some(old_url) = replaced {
        state.uploads.schedule_removal(&old_url);
    }

    tracing::info!(kind = R::LABEL, id, admin_id = admin.id, "record updated");
    Ok(Json(record))
}

pub async fn remove<R: Resource>(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(raw_id): Path<String>,
) -> AppResult<Json<SuccessResponse>> {
    let id = parse_id(&raw_id)?;
    let Some(removed) = state.store.delete::<R>(id).await? else {
        return Err(not_found::<R>());
    };
    if let Some(url) = removed.file_url() {
        state.uploads.schedule_removal(url);
    }

    tracing::info!(kind = R::LABEL, id, admin_id = admin.id, "record deleted");
    Ok(Json(SuccessResponse { success: true }))
}
