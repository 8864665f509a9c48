//! Object metadata validation shared by resource strategies.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::FieldError;
use crate::ObjectMeta;

pub const DNS1123_LABEL_MAX_LEN: usize = 63;
pub const DNS1123_SUBDOMAIN_MAX_LEN: usize = 253;

static DNS1123_LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());
static DNS1123_SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

pub fn is_dns1123_label(s: &str) -> bool {
    s.len() <= DNS1123_LABEL_MAX_LEN && DNS1123_LABEL_RE.is_match(s)
}

pub fn is_dns1123_subdomain(s: &str) -> bool {
    s.len() <= DNS1123_SUBDOMAIN_MAX_LEN && DNS1123_SUBDOMAIN_RE.is_match(s)
}

/// Reason a name cannot be used as a single storage path segment, if any.
pub fn path_segment_violation(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("name must not be empty");
    }
    if name == "." || name == ".." {
        return Some("may not be '.' or '..'");
    }
    if name.contains('/') {
        return Some("may not contain '/'");
    }
    if name.contains('%') {
        return Some("may not contain '%'");
    }
    None
}

/// Validate name and namespace of a new object.
pub fn validate_object_meta(meta: &ObjectMeta, namespace_required: bool) -> Vec<FieldError> {
    let mut errs = Vec::new();

    match meta.name.as_deref().filter(|n| !n.is_empty()) {
        None => {
            if meta.generate_name.as_deref().map_or(true, str::is_empty) {
                errs.push(FieldError::required("metadata.name", "name or generateName is required"));
            }
        }
        Some(name) => {
            if !is_dns1123_subdomain(name) {
                errs.push(FieldError::invalid(
                    "metadata.name",
                    name,
                    "a DNS-1123 subdomain must consist of lower case alphanumeric characters, '-' or '.'",
                ));
            }
        }
    }

    let namespace = meta.namespace.as_deref().filter(|ns| !ns.is_empty());
    match (namespace_required, namespace) {
        (true, None) => errs.push(FieldError::required("metadata.namespace", "")),
        (true, Some(ns)) if !is_dns1123_label(ns) => errs.push(FieldError::invalid(
            "metadata.namespace",
            ns,
            "a DNS-1123 label must consist of lower case alphanumeric characters or '-'",
        )),
        (false, Some(_)) => errs.push(FieldError::forbidden("metadata.namespace", "not allowed on this type")),
        _ => {}
    }

    errs
}

/// Fields of metadata that must not change across updates.
pub fn validate_object_meta_update(new: &ObjectMeta, old: &ObjectMeta) -> Vec<FieldError> {
    let mut errs = Vec::new();
    if new.name != old.name {
        errs.push(FieldError::immutable("metadata.name"));
    }
    if new.namespace.as_deref().unwrap_or("") != old.namespace.as_deref().unwrap_or("") {
        errs.push(FieldError::immutable("metadata.namespace"));
    }
    if new.uid != old.uid {
        errs.push(FieldError::immutable("metadata.uid"));
    }
    if new.creation_timestamp != old.creation_timestamp {
        errs.push(FieldError::immutable("metadata.creationTimestamp"));
    }
    errs
}
