use super::{FieldRules, Format, Rule, Schema};
use crate::models::Priority;

pub const MONTHS: &[&str] = &[
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const COMPLETED_VALUES: &[&str] = &["0", "1", "true", "false"];

pub const EVENT: Schema = &[
    FieldRules {
        field: "title",
        required: true,
        rules: &[Rule::Length { min: Some(3), max: Some(255) }],
    },
    FieldRules {
        field: "shortDescription",
        required: true,
        rules: &[Rule::Length { min: Some(10), max: Some(500) }],
    },
    FieldRules {
        field: "fullDescription",
        required: true,
        rules: &[Rule::Length { min: Some(20), max: Some(5000) }],
    },
    FieldRules {
        field: "date",
        required: true,
        rules: &[Rule::Pattern(Format::Date)],
    },
];

pub const DOCUMENT: Schema = &[
    FieldRules {
        field: "title",
        required: true,
        rules: &[Rule::Length { min: Some(1), max: Some(200) }],
    },
    FieldRules {
        field: "description",
        required: false,
        rules: &[Rule::Length { min: None, max: Some(1000) }],
    },
    FieldRules {
        field: "category",
        required: false,
        rules: &[Rule::Length { min: None, max: Some(50) }],
    },
];

pub const REMINDER: Schema = &[
    FieldRules {
        field: "title",
        required: true,
        rules: &[Rule::Length { min: Some(1), max: Some(200) }],
    },
    FieldRules {
        field: "description",
        required: true,
        rules: &[Rule::Length { min: Some(1), max: Some(5000) }],
    },
    FieldRules {
        field: "date",
        required: true,
        rules: &[Rule::Pattern(Format::Date), Rule::CalendarDate],
    },
    FieldRules {
        field: "priority",
        required: false,
        rules: &[Rule::OneOf(Priority::ALL)],
    },
    FieldRules {
        field: "completed",
        required: false,
        rules: &[Rule::OneOf(COMPLETED_VALUES)],
    },
];

pub const WORKPLAN: Schema = &[
    FieldRules {
        field: "month",
        required: true,
        rules: &[Rule::Length { min: Some(1), max: Some(30) }],
    },
    FieldRules {
        field: "year",
        required: true,
        rules: &[Rule::IntegerRange { min: 2000, max: 2100 }],
    },
    FieldRules {
        field: "description",
        required: true,
        rules: &[Rule::Length { min: Some(1), max: Some(5000) }],
    },
];

pub fn is_known_month(value: &str) -> bool {
    MONTHS.contains(&value)
}

/// `completed` accepts 0/1 and true/false on the wire; stored as 0/1.
pub fn completed_flag(value: &str) -> u8 {
    match value {
        "1" | "true" => 1,
        _ => 0,
    }
}
