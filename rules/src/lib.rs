//! Proxy rule model and the pure pieces of rule routing: path matching, first-match
//! resolution, target validation, outbound header computation and the
//! cookie-to-bearer edge contract.
//!
//! Nothing in this crate performs I/O, so every function is safe to call
//! concurrently on a shared rule-set snapshot.

pub mod auth_transform;
pub mod headers;
pub mod model;
pub mod pattern;
pub mod resolver;
pub mod validation;

pub use auth_transform::{AuthTransform, EdgeAuthBinding, compute_auth_header, edge_bindings};
pub use headers::{RevealedHeader, compute_headers};
pub use model::{
    EmailHandlerConfig, ExternalProxy, HeaderConfig, InternalRewrite, MisconfiguredRule,
    ProxyRule, ProxyRuleSet, ProxyType, ReorderError, RuleAction, RuleRecord, RuleSetRecord,
    SealedValue,
};
pub use pattern::{PathPattern, matches};
pub use resolver::resolve;
pub use validation::{FieldError, TargetError, ValidationError, ValidationErrors, validate_rule, validate_target};
