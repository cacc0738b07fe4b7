//! Instance selection and reaction policies.
//!
//! Batch operations name a set of instances; the selection engine partitions
//! the names into operative, deleted, and missing subsets, and a data-driven
//! reaction table decides the status each subset contributes. Branching on
//! "found where" happens exactly once, here.

use skiff_protocol::{Status, StatusCode};
use std::collections::{HashMap, HashSet};

/// Which table(s) an empty name list selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceGroup {
    /// An empty input selects nothing (behaves as all-missing).
    None,
    Operative,
    Deleted,
    All,
}

/// Where a single requested name was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceTrail {
    Operative(String),
    Deleted(String),
    Missing(String),
}

impl InstanceTrail {
    /// The requested name, wherever it landed.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Operative(name) | Self::Deleted(name) | Self::Missing(name) => name,
        }
    }
}

/// The three-way partition of a batch of requested names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectionReport {
    pub operative: Vec<String>,
    pub deleted: Vec<String>,
    pub missing: Vec<String>,
}

/// Locates one name across the two registry tables.
#[must_use]
pub fn find_instance<V, W>(
    operative: &HashMap<String, V>,
    deleted: &HashMap<String, W>,
    name: &str,
) -> InstanceTrail {
    if operative.contains_key(name) {
        InstanceTrail::Operative(name.to_string())
    } else if deleted.contains_key(name) {
        InstanceTrail::Deleted(name.to_string())
    } else {
        InstanceTrail::Missing(name.to_string())
    }
}

/// Partitions the requested names into operative/deleted/missing subsets.
///
/// Names are deduplicated, first occurrence wins. An empty input selects the
/// group named by `no_name_means`.
#[must_use]
pub fn select_instances<V, W>(
    operative: &HashMap<String, V>,
    deleted: &HashMap<String, W>,
    names: &[String],
    no_name_means: InstanceGroup,
) -> SelectionReport {
    let mut report = SelectionReport::default();

    if names.is_empty() && no_name_means != InstanceGroup::None {
        if matches!(no_name_means, InstanceGroup::Operative | InstanceGroup::All) {
            report.operative = operative.keys().cloned().collect();
        }
        if matches!(no_name_means, InstanceGroup::Deleted | InstanceGroup::All) {
            report.deleted = deleted.keys().cloned().collect();
        }
        return report;
    }

    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.clone()) {
            continue;
        }
        match find_instance(operative, deleted, name) {
            InstanceTrail::Operative(name) => report.operative.push(name),
            InstanceTrail::Deleted(name) => report.deleted.push(name),
            InstanceTrail::Missing(name) => report.missing.push(name),
        }
    }

    report
}

// =============================================================================
// Reactions
// =============================================================================

/// How one partition of a selection contributes to the batch status.
#[derive(Debug, Clone, Copy)]
pub struct ReactionComponent {
    pub code: StatusCode,
    /// Per-instance message; `{}` is replaced with the instance name. A
    /// template paired with an OK code is logged instead of reported.
    pub message_template: Option<&'static str>,
}

/// Reaction table for the three partitions of a selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionReaction {
    pub operative: ReactionComponent,
    pub deleted: ReactionComponent,
    pub missing: ReactionComponent,
}

const OK_REACTION: ReactionComponent = ReactionComponent {
    code: StatusCode::Ok,
    message_template: None,
};

/// Targets must be operative; deleted and missing names fail.
pub const REQUIRE_OPERATIVE: SelectionReaction = SelectionReaction {
    operative: OK_REACTION,
    deleted: ReactionComponent {
        code: StatusCode::InvalidArgument,
        message_template: Some("instance \"{}\" is deleted"),
    },
    missing: ReactionComponent {
        code: StatusCode::NotFound,
        message_template: Some("instance \"{}\" does not exist"),
    },
};

/// Targets must exist in either table; only missing names fail.
pub const REQUIRE_EXISTING: SelectionReaction = SelectionReaction {
    operative: OK_REACTION,
    deleted: OK_REACTION,
    missing: ReactionComponent {
        code: StatusCode::NotFound,
        message_template: Some("instance \"{}\" does not exist"),
    },
};

/// Targets must not exist anywhere.
pub const REQUIRE_MISSING: SelectionReaction = SelectionReaction {
    operative: ReactionComponent {
        code: StatusCode::InvalidArgument,
        message_template: Some("instance \"{}\" already exists"),
    },
    deleted: ReactionComponent {
        code: StatusCode::InvalidArgument,
        message_template: Some("instance \"{}\" already exists"),
    },
    missing: OK_REACTION,
};

/// Appends an error line to a batch error buffer.
pub fn add_error(buffer: &mut String, line: impl AsRef<str>) {
    if !buffer.is_empty() {
        buffer.push('\n');
    }
    buffer.push_str(line.as_ref());
}

/// Builds the composite status for a batch error buffer.
///
/// A non-empty buffer with an OK code is promoted to `fallback_code`. The
/// message leads with the standard batch header.
#[must_use]
pub fn status_for_errors(errors: &str, code: StatusCode, fallback_code: StatusCode) -> Status {
    let code = if !errors.is_empty() && code.is_ok() {
        fallback_code
    } else {
        code
    };

    if code.is_ok() {
        Status::ok()
    } else {
        Status::new(code, format!("The following errors occurred:\n{errors}"))
    }
}

fn react_to_component(
    names: &[String],
    reaction: &ReactionComponent,
    errors: &mut String,
) -> StatusCode {
    if names.is_empty() {
        return StatusCode::Ok;
    }

    if let Some(template) = reaction.message_template {
        for name in names {
            let message = template.replace("{}", name);
            if reaction.code.is_ok() {
                tracing::debug!("{}", message);
            } else {
                add_error(errors, message);
            }
        }
    }

    reaction.code
}

/// Computes the batch status for a selection under a reaction table.
///
/// The final code is OK iff every non-empty partition reacts with OK;
/// otherwise it is the last non-OK code, with all messages concatenated.
#[must_use]
pub fn status_for_selection(report: &SelectionReport, reaction: &SelectionReaction) -> Status {
    let mut errors = String::new();
    let mut code = StatusCode::Ok;

    for (names, component) in [
        (&report.operative, &reaction.operative),
        (&report.deleted, &reaction.deleted),
        (&report.missing, &reaction.missing),
    ] {
        let component_code = react_to_component(names, component, &mut errors);
        if !component_code.is_ok() {
            code = component_code;
        }
    }

    status_for_errors(&errors, code, StatusCode::Ok)
}

/// Computes the status for a single located name under a reaction table.
///
/// Unlike the batch variant, the message is the bare templated line.
#[must_use]
pub fn status_for_trail(trail: &InstanceTrail, reaction: &SelectionReaction) -> Status {
    let (name, component) = match trail {
        InstanceTrail::Operative(name) => (name, &reaction.operative),
        InstanceTrail::Deleted(name) => (name, &reaction.deleted),
        InstanceTrail::Missing(name) => (name, &reaction.missing),
    };

    if let Some(template) = component.message_template {
        let message = template.replace("{}", name);
        if component.code.is_ok() {
            tracing::debug!("{}", message);
        } else {
            return Status::new(component.code, message);
        }
    }

    Status::new(component.code, "")
}

/// Locates one name and reacts to where it was found.
#[must_use]
pub fn find_instance_and_react<V, W>(
    operative: &HashMap<String, V>,
    deleted: &HashMap<String, W>,
    name: &str,
    reaction: &SelectionReaction,
) -> (InstanceTrail, Status) {
    let trail = find_instance(operative, deleted, name);
    let status = status_for_trail(&trail, reaction);
    (trail, status)
}
