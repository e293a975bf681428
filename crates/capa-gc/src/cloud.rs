//! Cloud API abstraction
//!
//! The garbage collector never talks to an SDK directly. Everything it needs
//! from the provider goes through [`CloudApi`]: paginated tag-filtered
//! listing, a fresh tag read, the detach helpers that break dependencies, and
//! an idempotent delete. Implementations classify every failure into a
//! [`CloudErrorKind`] so retry policy lives in one place.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::tags::Tags;
use crate::tasks::GcTaskKind;

/// Classification of a cloud API failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudErrorKind {
    /// Request rate exceeded; always safe to retry later
    Throttling,
    /// Resource state does not yet reflect an earlier mutation
    /// (dependency violation, resource in use)
    TransientConsistency,
    /// The resource does not exist
    NotFound,
    /// The credentials may not perform the call
    PermissionDenied,
    /// The resource belongs to a different account
    AccountMismatch,
    /// Anything else
    Other,
}

impl CloudErrorKind {
    /// Errors that must never be retried within a run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::AccountMismatch)
    }

    /// Stable label used in logs, metrics and run reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Throttling => "throttling",
            Self::TransientConsistency => "transient-consistency",
            Self::NotFound => "not-found",
            Self::PermissionDenied => "permission-denied",
            Self::AccountMismatch => "account-mismatch",
            Self::Other => "other",
        }
    }

    /// Classify an AWS error code
    pub fn from_aws_code(code: &str) -> Self {
        match code {
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
            | "TooManyRequestsException" | "RequestThrottled" | "SlowDown" => Self::Throttling,
            "DependencyViolation" | "ResourceInUse" | "IncorrectState" | "OperationNotPermitted" => {
                Self::TransientConsistency
            }
            "LoadBalancerNotFound" | "TargetGroupNotFound" | "ListenerNotFound"
            | "AccessPointNotFound" | "InvalidGroup.NotFound" | "InvalidPermission.NotFound" => {
                Self::NotFound
            }
            "AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation" | "AuthFailure" => {
                Self::PermissionDenied
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified cloud API failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CloudError {
    /// Classification driving retry decisions
    pub kind: CloudErrorKind,
    /// Provider error message
    pub message: String,
}

impl CloudError {
    /// Create an error of the given kind
    pub fn new(kind: CloudErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an error from an AWS error code and message
    pub fn from_aws(code: &str, message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::from_aws_code(code), format!("{code}: {}", message.into()))
    }

    /// Shorthand for a throttling error
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Throttling, message)
    }

    /// Shorthand for a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, message)
    }

    /// Whether the call is worth retrying
    pub fn is_retryable(&self) -> bool {
        !self.kind.is_fatal() && self.kind != CloudErrorKind::NotFound
    }
}

/// Tag filter for list calls: resources carrying `key`, with any of `values`
/// (any value when empty)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFilter {
    /// Tag key that must be present
    pub key: String,
    /// Accepted values; empty accepts any value
    pub values: Vec<String>,
}

impl TagFilter {
    /// Filter on key presence only
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: Vec::new(),
        }
    }

    /// Whether a tag map passes the filter
    pub fn matches(&self, tags: &Tags) -> bool {
        match tags.get(&self.key) {
            Some(value) => self.values.is_empty() || self.values.iter().any(|v| v == value),
            None => false,
        }
    }
}

/// Position in a paginated listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Continuation token from the previous page
    pub token: Option<String>,
    /// Maximum items per page
    pub page_size: u32,
}

/// Resource as described by the provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceDescription {
    /// ARN of the resource
    pub provider_id: String,
    /// Current tags
    pub tags: Tags,
    /// Provider IDs this resource points at
    pub references: BTreeSet<String>,
}

/// One page of a listing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourcePage {
    /// Resources on this page
    pub items: Vec<ResourceDescription>,
    /// Token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Provider operations needed by the garbage collector
///
/// Every mutating call must be idempotent: repeating a call for a resource
/// that is already gone returns a `NotFound` error (or `Ok`), never a fatal
/// one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// List one page of `kind` resources matching `filter`
    ///
    /// Implementations filter server side where the API supports it; callers
    /// re-check the filter on every returned item.
    async fn list_tagged(
        &self,
        kind: GcTaskKind,
        filter: &TagFilter,
        page: PageRequest,
    ) -> Result<ResourcePage, CloudError>;

    /// Read a resource's current tags and references
    ///
    /// Returns `Ok(None)` when the resource no longer exists.
    async fn describe(
        &self,
        kind: GcTaskKind,
        provider_id: &str,
    ) -> Result<Option<ResourceDescription>, CloudError>;

    /// Remove every listener of a load balancer
    async fn detach_listeners(&self, load_balancer_id: &str) -> Result<(), CloudError>;

    /// Deregister every target from a target group
    async fn deregister_targets(&self, target_group_id: &str) -> Result<(), CloudError>;

    /// Revoke every rule, in any group, that uses this group as a source
    async fn revoke_references(&self, security_group_id: &str) -> Result<(), CloudError>;

    /// Delete the resource
    async fn delete(&self, kind: GcTaskKind, provider_id: &str) -> Result<(), CloudError>;
}
