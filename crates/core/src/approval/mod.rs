//! Human-in-the-loop approval workflow & signed one-time tokens.

pub mod token;
pub mod workflow;

pub use token::{BindingContext, TokenClaims, TokenSigner, TOKEN_TYPE};
pub use workflow::{
    ApprovalRequest, ApprovalStatus, ApprovalStore, ApprovalWorkflow, PostgresApprovalStore, ReviewVote,
};
