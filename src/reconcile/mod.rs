//! Reconciliation engine
//!
//! Rule-driven core shared by every resource module:
//! - Value normalization and unit conversion
//! - Collection reconciliation (replace or merge)
//! - Principal and certificate resolution
//! - Field diffing, quota and file-matching rules
//! - The converge state machine

pub mod collection;
pub mod criteria;
pub mod desired;
pub mod diff;
pub mod identity;
pub mod normalize;
pub mod orchestrator;
pub mod quota;

pub use collection::{MemberState, Members, Reconciled, Sequence, Tagged};
pub use desired::{Constraint, Desired, DesiredState};
pub use diff::{field, fixed, FieldDiff, FieldRule, FieldSpec, Identity};
pub use identity::{IdentityResolver, Trustee, TrusteeRef};
pub use normalize::{DurationUnit, SizeUnit, ValueKind};
pub use orchestrator::{
    check, converge, ConvergeReport, FollowUp, Mutation, MutationKind, Operation, Resource, Session,
};
