//! Path-template matching shared by the HTTP route table and the upgrade
//! router.
//!
//! Templates are `/`-separated segments. Each segment is one of:
//!
//! - a literal (`version`)
//! - a parameter (`{namespace}`), matching exactly one non-empty segment
//! - an optional parameter (`{name?}`), matching zero or one segment; only
//!   allowed as the last segment
//! - a wildcard (`{path*}`), matching the remaining segments (possibly none);
//!   only allowed as the last segment
//!
//! When several templates match a path, the one with the most literal
//! segments wins. Ties go to the template registered first.

use std::collections::HashMap;

use axum::http::Method;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouteError {
    #[error("route template must start with '/': {0}")]
    MissingLeadingSlash(String),

    #[error("malformed segment '{segment}' in template {template}")]
    MalformedSegment { template: String, segment: String },

    #[error("'{segment}' must be the last segment of template {template}")]
    NotLast { template: String, segment: String },

    #[error("duplicate parameter '{name}' in template {template}")]
    DuplicateParam { template: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Optional(String),
    Wildcard(String),
}

/// A parsed route template such as `/api/v2/releases/{namespace}/{release}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// Parameters captured by a successful match.
pub type Params = HashMap<String, String>;

/// Split a path into segments, ignoring the leading and a trailing slash.
fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, RouteError> {
        if !template.starts_with('/') {
            return Err(RouteError::MissingLeadingSlash(template.to_string()));
        }

        let raw = split_path(template);
        let mut segments = Vec::with_capacity(raw.len());
        let mut seen = Vec::new();

        for (i, seg) in raw.iter().enumerate() {
            let is_last = i + 1 == raw.len();
            let parsed = match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                None => {
                    if seg.contains('{') || seg.contains('}') || seg.is_empty() {
                        return Err(RouteError::MalformedSegment {
                            template: template.to_string(),
                            segment: seg.to_string(),
                        });
                    }
                    Segment::Literal(seg.to_string())
                }
                Some(inner) => {
                    let (name, kind) = if let Some(name) = inner.strip_suffix('?') {
                        (name, Segment::Optional(name.to_string()))
                    } else if let Some(name) = inner.strip_suffix('*') {
                        (name, Segment::Wildcard(name.to_string()))
                    } else {
                        (inner, Segment::Param(inner.to_string()))
                    };
                    if name.is_empty()
                        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(RouteError::MalformedSegment {
                            template: template.to_string(),
                            segment: seg.to_string(),
                        });
                    }
                    if matches!(kind, Segment::Optional(_) | Segment::Wildcard(_)) && !is_last {
                        return Err(RouteError::NotLast {
                            template: template.to_string(),
                            segment: seg.to_string(),
                        });
                    }
                    if seen.contains(&name) {
                        return Err(RouteError::DuplicateParam {
                            template: template.to_string(),
                            name: name.to_string(),
                        });
                    }
                    seen.push(name);
                    kind
                }
            };
            segments.push(parsed);
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Number of literal segments; higher means more specific.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Match a request path (without query string) against this template.
    pub fn matches(&self, path: &str) -> Option<Params> {
        let parts = split_path(path);
        let mut params = Params::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(lit) => {
                    if parts.get(i) != Some(&lit.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => match parts.get(i) {
                    Some(value) if !value.is_empty() => {
                        params.insert(name.clone(), value.to_string());
                    }
                    _ => return None,
                },
                Segment::Optional(name) => {
                    if parts.len() > i + 1 {
                        return None;
                    }
                    if let Some(value) = parts.get(i) {
                        params.insert(name.clone(), value.to_string());
                    }
                    return Some(params);
                }
                Segment::Wildcard(name) => {
                    let rest = parts.get(i..).unwrap_or_default().join("/");
                    params.insert(name.clone(), rest);
                    return Some(params);
                }
            }
        }

        if parts.len() == self.segments.len() {
            Some(params)
        } else {
            None
        }
    }
}

struct Entry<T> {
    method: Method,
    template: PathTemplate,
    value: T,
}

/// A successful lookup: the registered value plus captured parameters.
#[derive(Debug)]
pub struct RouteMatch<'a, T> {
    pub value: &'a T,
    pub template: &'a PathTemplate,
    pub params: Params,
}

/// Immutable-after-startup table of `(method, template, value)` triples.
pub struct RouteTable<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RouteTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, method: Method, template: &str, value: T) -> Result<(), RouteError> {
        let template = PathTemplate::parse(template)?;
        self.entries.push(Entry {
            method,
            template,
            value,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the most specific route for `method` and `path`.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch<'_, T>> {
        let mut best: Option<(usize, RouteMatch<'_, T>)> = None;
        for entry in &self.entries {
            if entry.method != *method {
                continue;
            }
            let Some(params) = entry.template.matches(path) else {
                continue;
            };
            let score = entry.template.specificity();
            // Strictly greater keeps the earlier registration on ties.
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((
                    score,
                    RouteMatch {
                        value: &entry.value,
                        template: &entry.template,
                        params,
                    },
                ));
            }
        }
        best.map(|(_, m)| m)
    }
}
