//! Name and ID-prefix matching for networks and containers.

use regex::Regex;

use crate::error::{TernError, TernResult};

/// Length of the short form of an ID.
pub const SHORT_ID_LENGTH: usize = 12;

/// Algorithm prefix accepted in front of long IDs.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Anything that can be found by exact name or by ID prefix.
pub trait Identifiable {
    /// The user-facing name.
    fn name(&self) -> &str;

    /// The opaque ID, if the resource has one.
    fn id(&self) -> Option<&str>;
}

impl<T: Identifiable + ?Sized> Identifiable for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn id(&self) -> Option<&str> {
        (**self).id()
    }
}

/// Which kind of resource a lookup is for, used to build errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// A CNI network.
    Network,
    /// A container.
    Container,
}

impl ResourceKind {
    /// The not-found error for this kind of resource.
    #[must_use]
    pub fn not_found(self, query: &str) -> TernError {
        match self {
            Self::Network => TernError::NetworkNotFound {
                query: query.to_string(),
            },
            Self::Container => TernError::ContainerNotFound {
                query: query.to_string(),
            },
        }
    }
}

/// Matches a user-supplied query against names and IDs.
///
/// A resource matches when its name equals the query, when its ID matches
/// `^sha256:<query>`, or when its ID starts with the query. Resources without
/// an ID only match by name.
#[derive(Debug, Clone)]
pub struct IdMatcher {
    query: String,
    long_id: Regex,
    short_id: Regex,
}

impl IdMatcher {
    /// Build the matchers for a query.
    ///
    /// # Errors
    ///
    /// Returns an error if the query is empty.
    pub fn new(query: impl Into<String>) -> TernResult<Self> {
        let query = query.into();
        if query.is_empty() {
            return Err(TernError::InvalidArgument {
                message: "name or ID must not be empty".to_string(),
            });
        }

        let escaped = regex::escape(&query);
        let long_id = compile(&format!("^{}{escaped}", regex::escape(DIGEST_PREFIX)))?;
        let short_id = compile(&format!("^{escaped}"))?;

        Ok(Self {
            query,
            long_id,
            short_id,
        })
    }

    /// The raw query string.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Returns true if the item matches by name or ID prefix.
    pub fn matches<T: Identifiable + ?Sized>(&self, item: &T) -> bool {
        if item.name() == self.query {
            return true;
        }
        item.id()
            .is_some_and(|id| self.long_id.is_match(id) || self.short_id.is_match(id))
    }

    /// Resolve the query to exactly one item.
    ///
    /// # Errors
    ///
    /// Returns a not-found error for zero matches and
    /// [`TernError::Ambiguous`] for more than one.
    pub fn resolve_one<T, I>(&self, kind: ResourceKind, items: I) -> TernResult<T>
    where
        T: Identifiable,
        I: IntoIterator<Item = T>,
    {
        let mut found: Vec<T> = items.into_iter().filter(|item| self.matches(item)).collect();

        match found.len() {
            0 => Err(kind.not_found(&self.query)),
            1 => Ok(found.remove(0)),
            _ => Err(TernError::Ambiguous {
                query: self.query.clone(),
                matches: found.iter().map(|item| item.name().to_string()).collect(),
            }),
        }
    }
}

fn compile(pattern: &str) -> TernResult<Regex> {
    Regex::new(pattern).map_err(|e| TernError::Internal {
        message: format!("invalid ID pattern '{pattern}': {e}"),
    })
}

/// Returns a short version of an ID (first 12 characters).
#[must_use]
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix(DIGEST_PREFIX).unwrap_or(id);
    id.get(..SHORT_ID_LENGTH).unwrap_or(id)
}
