use super::{ApiError, ApiErrorKind};
use crate::models::Priority;
use crate::validation::schemas::{self, is_known_month};
use crate::validation::{validate_and_sanitize, FormFields, Schema};

/// A file to send along with a form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            mime: mime.into(),
            bytes: bytes.into(),
        }
    }
}

/// Wire-ready multipart content, rebuildable for every attempt.
#[derive(Debug, Clone, Default)]
pub struct FormPayload {
    pub fields: FormFields,
    pub file: Option<(&'static str, Attachment)>,
}

impl FormPayload {
    pub(crate) fn to_multipart(&self) -> Result<reqwest::multipart::Form, ApiError> {
        let mut form = reqwest::multipart::Form::new();
        for (name, value) in &self.fields {
            form = form.text(name.clone(), value.clone());
        }
        if let Some((field, attachment)) = &self.file {
            let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.mime)
                .map_err(|err| ApiError::new(ApiErrorKind::Validation, None, format!("Invalid file type: {err}")))?;
            form = form.part(*field, part);
        }
        Ok(form)
    }
}

/// Admin forms are checked against the server's schemas before any request.
pub trait ContentForm {
    const SCHEMA: Schema;
    const FILE_FIELD: &'static str;

    fn fields(&self) -> FormFields;
    fn attachment(&self) -> Option<&Attachment>;

    fn extra_checks(&self) -> Vec<String> {
        Vec::new()
    }

    fn check(&self) -> Result<(), ApiError> {
        let mut errors = validate_and_sanitize(&self.fields(), Self::SCHEMA).errors;
        errors.extend(self.extra_checks());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::new(ApiErrorKind::Validation, None, errors.join("; ")))
        }
    }

    fn payload(&self) -> Result<FormPayload, ApiError> {
        self.check()?;
        Ok(FormPayload {
            fields: self.fields(),
            file: self.attachment().cloned().map(|file| (Self::FILE_FIELD, file)),
        })
    }
}

fn put(fields: &mut FormFields, name: &str, value: impl Into<String>) {
    fields.insert(name.to_string(), value.into());
}

#[derive(Debug, Clone, Default)]
pub struct EventForm {
    pub title: String,
    pub short_description: String,
    pub full_description: String,
    pub date: String,
    pub image: Option<Attachment>,
}

impl ContentForm for EventForm {
    const SCHEMA: Schema = schemas::EVENT;
    const FILE_FIELD: &'static str = "image";

    fn fields(&self) -> FormFields {
        let mut fields = FormFields::new();
        put(&mut fields, "title", &self.title);
        put(&mut fields, "shortDescription", &self.short_description);
        put(&mut fields, "fullDescription", &self.full_description);
        put(&mut fields, "date", &self.date);
        fields
    }

    fn attachment(&self) -> Option<&Attachment> {
        self.image.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentForm {
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub file: Option<Attachment>,
}

impl ContentForm for DocumentForm {
    const SCHEMA: Schema = schemas::DOCUMENT;
    const FILE_FIELD: &'static str = "file";

    fn fields(&self) -> FormFields {
        let mut fields = FormFields::new();
        put(&mut fields, "title", &self.title);
        if let Some(description) = &self.description {
            put(&mut fields, "description", description);
        }
        if let Some(category) = &self.category {
            put(&mut fields, "category", category);
        }
        fields
    }

    fn attachment(&self) -> Option<&Attachment> {
        self.file.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReminderForm {
    pub title: String,
    pub description: String,
    pub date: String,
    pub priority: Priority,
    pub completed: Option<bool>,
    pub image: Option<Attachment>,
}

impl ContentForm for ReminderForm {
    const SCHEMA: Schema = schemas::REMINDER;
    const FILE_FIELD: &'static str = "image";

    fn fields(&self) -> FormFields {
        let mut fields = FormFields::new();
        put(&mut fields, "title", &self.title);
        put(&mut fields, "description", &self.description);
        put(&mut fields, "date", &self.date);
        put(&mut fields, "priority", self.priority.as_str());
        if let Some(completed) = self.completed {
            put(&mut fields, "completed", if completed { "1" } else { "0" });
        }
        fields
    }

    fn attachment(&self) -> Option<&Attachment> {
        self.image.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkplanForm {
    pub month: String,
    pub year: i32,
    pub description: String,
    pub file: Option<Attachment>,
}

impl ContentForm for WorkplanForm {
    const SCHEMA: Schema = schemas::WORKPLAN;
    const FILE_FIELD: &'static str = "file";

    fn fields(&self) -> FormFields {
        let mut fields = FormFields::new();
        put(&mut fields, "month", &self.month);
        put(&mut fields, "year", self.year.to_string());
        put(&mut fields, "description", &self.description);
        fields
    }

    fn attachment(&self) -> Option<&Attachment> {
        self.file.as_ref()
    }

    fn extra_checks(&self) -> Vec<String> {
        if self.month.is_empty() || is_known_month(&self.month) {
            Vec::new()
        } else {
            vec!["month must be a calendar month name".to_string()]
        }
    }
}
