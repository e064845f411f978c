pub mod schemas;

use crate::errors::{AppError, AppResult};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Raw submitted text fields, keyed by wire name.
pub type FormFields = BTreeMap<String, String>;

const DEFAULT_MAX_LENGTH: usize = 5000;
const FIELD_MAX_LENGTHS: &[(&str, usize)] = &[
    ("title", 255),
    ("description", 5000),
    ("name", 255),
    ("email", 255),
    ("username", 255),
    ("password", 255),
    ("url", 2048),
];

static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid regex"),
        Regex::new(r"(?i)javascript:").expect("valid regex"),
        Regex::new(r"(?i)on\w+\s*=").expect("valid regex"),
    ]
});

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid regex"));
static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Email,
    Date,
}

#[derive(Clone, Copy)]
pub enum Rule {
    Length { min: Option<usize>, max: Option<usize> },
    Pattern(Format),
    CalendarDate,
    OneOf(&'static [&'static str]),
    IntegerRange { min: i64, max: i64 },
    Custom { check: fn(&str) -> bool, message: &'static str },
}

#[derive(Clone, Copy)]
pub struct FieldRules {
    pub field: &'static str,
    pub required: bool,
    pub rules: &'static [Rule],
}

/// Ordered field rules; evaluation follows declaration order.
pub type Schema = &'static [FieldRules];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validated {
    pub sanitized: FormFields,
    pub errors: Vec<String>,
}

impl Validated {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> AppResult<FormFields> {
        if self.errors.is_empty() {
            Ok(self.sanitized)
        } else {
            Err(AppError::Validation(self.errors))
        }
    }
}

/// Removes script blocks, `javascript:` and inline handler attributes, then trims.
pub fn sanitize(raw: &str) -> String {
    let mut value = raw.to_string();
    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.is_match(&value) {
            value = pattern.replace_all(&value, "").into_owned();
        }
    }
    value.trim().to_string()
}

pub fn validate_and_sanitize(data: &FormFields, schema: Schema) -> Validated {
    let mut result = Validated::default();

    for field in schema {
        let value = data.get(field.field);
        let blank = value.map(|v| v.trim().is_empty()).unwrap_or(true);

        if field.required && blank {
            result.errors.push(format!("{} is required", field.field));
            continue;
        }
        let Some(raw) = value else {
            continue;
        };
        if raw.is_empty() {
            result.sanitized.insert(field.field.to_string(), raw.clone());
            continue;
        }

        let cleaned = sanitize(raw);
        match check_field(field, &cleaned) {
            Ok(()) => {
                result.sanitized.insert(field.field.to_string(), cleaned);
            }
            Err(message) => result.errors.push(message),
        }
    }

    result
}

fn check_field(field: &FieldRules, value: &str) -> Result<(), String> {
    let name = field.field;
    let length = value.chars().count();

    let (min, max) = length_bounds(field);
    if length > max {
        return Err(format!("{name} must not exceed {max} characters"));
    }
    if let Some(min) = min {
        if length < min {
            return Err(format!("{name} must be at least {min} characters"));
        }
    }

    for rule in field.rules {
        match rule {
            Rule::Length { .. } => {}
            Rule::Pattern(Format::Email) => {
                if !EMAIL_PATTERN.is_match(value) {
                    return Err(format!("{name} must be a valid email"));
                }
            }
            Rule::Pattern(Format::Date) => {
                if !DATE_PATTERN.is_match(value) {
                    return Err(format!("{name} must be in YYYY-MM-DD format"));
                }
            }
            Rule::CalendarDate => {
                if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
                    return Err(format!("{name} is not a valid date"));
                }
            }
            Rule::OneOf(allowed) => {
                if !allowed.contains(&value) {
                    return Err(format!("{name} must be one of: {}", allowed.join(", ")));
                }
            }
            Rule::IntegerRange { min, max } => {
                let in_range = value
                    .parse::<i64>()
                    .map(|number| (*min..=*max).contains(&number))
                    .unwrap_or(false);
                if !in_range {
                    return Err(format!("{name} must be an integer between {min} and {max}"));
                }
            }
            Rule::Custom { check, message } => {
                if !check(value) {
                    return Err((*message).to_string());
                }
            }
        }
    }

    Ok(())
}

fn length_bounds(field: &FieldRules) -> (Option<usize>, usize) {
    let declared = field.rules.iter().find_map(|rule| match rule {
        Rule::Length { min, max } => Some((*min, *max)),
        _ => None,
    });
    let (min, max) = declared.unwrap_or((None, None));
    let fallback = FIELD_MAX_LENGTHS
        .iter()
        .find(|(name, _)| *name == field.field)
        .map(|(_, max)| *max)
        .unwrap_or(DEFAULT_MAX_LENGTH);
    (min, max.unwrap_or(fallback))
}
