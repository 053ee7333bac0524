//! Row-level access rules.
//!
//! Every check takes the acting [`Profile`] and the rows involved and either
//! returns `Ok(())` or a [`BoardError::PolicyDenied`]. Handlers run these
//! inside the same `DbHandle::call` that performs the write, so the rows seen
//! by the check are the rows being written.

use chrono::NaiveDate;
use serde_json::Value;

use super::models::{Comment, CustomField, FieldType, Item, ItemPatch, Profile, Project};
use crate::errors::BoardError;

pub type PolicyResult = Result<(), BoardError>;

/// Admin-only projects are invisible to everyone else.
pub fn can_view_project(actor: &Profile, project: &Project) -> bool {
    !project.admin_only || actor.is_admin
}

pub fn check_project_access(actor: &Profile, project: &Project) -> PolicyResult {
    if can_view_project(actor, project) {
        Ok(())
    } else {
        Err(BoardError::denied(
            format!("access project {}", project.id),
            "project is restricted to admins",
        ))
    }
}

/// Deleting projects and setting or toggling `admin_only`. Creating and
/// renaming a visible project is open to every profile.
pub fn check_project_admin(actor: &Profile, action: &str) -> PolicyResult {
    if actor.is_admin {
        Ok(())
    } else {
        Err(BoardError::denied(action, "admin role required"))
    }
}

/// Open items are writable by anyone who can see the project; closed items
/// only by admins.
pub fn check_item_write(actor: &Profile, project: &Project, item: &Item, action: &str) -> PolicyResult {
    check_project_access(actor, project)?;
    if !item.is_open && !actor.is_admin {
        return Err(BoardError::denied(
            format!("{} item #{}", action, item.number),
            "item is closed",
        ));
    }
    Ok(())
}

/// Reopening is a mutation of a closed item, so it falls under the same
/// admin rule as any other change.
pub fn check_item_patch(actor: &Profile, project: &Project, item: &Item, patch: &ItemPatch) -> PolicyResult {
    let action = if patch.is_open == Some(true) && !item.is_open {
        "reopen"
    } else {
        "update"
    };
    check_item_write(actor, project, item, action)
}

/// Deleting a column deletes its items, including closed ones.
pub fn check_column_delete(actor: &Profile, project: &Project, closed_items: i64) -> PolicyResult {
    check_project_access(actor, project)?;
    if closed_items > 0 && !actor.is_admin {
        return Err(BoardError::denied(
            "delete column",
            format!("column contains {} closed item(s)", closed_items),
        ));
    }
    Ok(())
}

pub fn check_admin_flag_change(actor: &Profile) -> PolicyResult {
    if actor.is_admin {
        Ok(())
    } else {
        Err(BoardError::denied("change admin flag", "admin role required"))
    }
}

pub fn check_profile_rename(actor: &Profile, target_id: &str) -> PolicyResult {
    if actor.is_admin || actor.id == target_id {
        Ok(())
    } else {
        Err(BoardError::denied(
            format!("rename profile '{}'", target_id),
            "only the profile owner or an admin may rename it",
        ))
    }
}

pub fn check_comment_edit(actor: &Profile, comment: &Comment) -> PolicyResult {
    if actor.id == comment.author_id {
        Ok(())
    } else {
        Err(BoardError::denied(
            format!("edit comment {}", comment.id),
            "only the author may edit a comment",
        ))
    }
}

pub fn check_comment_delete(actor: &Profile, comment: &Comment) -> PolicyResult {
    if actor.is_admin || actor.id == comment.author_id {
        Ok(())
    } else {
        Err(BoardError::denied(
            format!("delete comment {}", comment.id),
            "only the author or an admin may delete a comment",
        ))
    }
}

// ── Field validation ──────────────────────────────────────────────────

fn invalid(field: &CustomField, message: impl Into<String>) -> BoardError {
    BoardError::InvalidFieldValue {
        field: field.name.clone(),
        message: message.into(),
    }
}

fn check_scalar<F>(field: &CustomField, value: &Value, profile_exists: &F) -> PolicyResult
where
    F: Fn(&str) -> bool,
{
    match field.field_type {
        FieldType::Text => value
            .as_str()
            .map(|_| ())
            .ok_or_else(|| invalid(field, "expected a string")),
        FieldType::Number => value
            .as_f64()
            .map(|_| ())
            .ok_or_else(|| invalid(field, "expected a number")),
        FieldType::Date => {
            let raw = value
                .as_str()
                .ok_or_else(|| invalid(field, "expected a date string"))?;
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|_| ())
                .map_err(|_| invalid(field, format!("'{}' is not a YYYY-MM-DD date", raw)))
        }
        FieldType::Select | FieldType::Multiselect => {
            let raw = value
                .as_str()
                .ok_or_else(|| invalid(field, "expected an option string"))?;
            if field.options.is_empty() || field.options.iter().any(|o| o == raw) {
                Ok(())
            } else {
                Err(invalid(field, format!("'{}' is not one of the options", raw)))
            }
        }
        FieldType::UserSelect | FieldType::UserMultiselect => {
            let raw = value
                .as_str()
                .ok_or_else(|| invalid(field, "expected a profile id"))?;
            if profile_exists(raw) {
                Ok(())
            } else {
                Err(invalid(field, format!("unknown profile '{}'", raw)))
            }
        }
    }
}

/// Validate a custom field value against the field's type. `null` always
/// clears and is accepted.
pub fn validate_field_value<F>(field: &CustomField, value: &Value, profile_exists: F) -> PolicyResult
where
    F: Fn(&str) -> bool,
{
    if value.is_null() {
        return Ok(());
    }
    if field.field_type.is_multi() {
        let values = value
            .as_array()
            .ok_or_else(|| invalid(field, "expected an array"))?;
        for v in values {
            check_scalar(field, v, &profile_exists)?;
        }
        Ok(())
    } else {
        check_scalar(field, value, &profile_exists)
    }
}
