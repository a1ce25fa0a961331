//! Human-in-the-loop approval workflow: routing, maker-checker
//! quorum, and token issuance on approval.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::approval::token::{BindingContext, TokenClaims, TokenSigner, TOKEN_TYPE};
use crate::decision::model::Decision;
use crate::error::{CoreError, Result};
use crate::policy::RoutingRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Consumed,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Denied => "DENIED",
            ApprovalStatus::Expired => "EXPIRED",
            ApprovalStatus::Consumed => "CONSUMED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(ApprovalStatus::Pending),
            "APPROVED" => Some(ApprovalStatus::Approved),
            "DENIED" => Some(ApprovalStatus::Denied),
            "EXPIRED" => Some(ApprovalStatus::Expired),
            "CONSUMED" => Some(ApprovalStatus::Consumed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub tenant_id: String,
    pub requester_id: String,
    pub status: ApprovalStatus,
    pub routing_rule_id: String,
    pub routing_trace: String,
    pub reviewer_id: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub quorum_required: u8,
    pub quorum_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVote {
    Approve,
    Deny,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, request: ApprovalRequest) -> Result<ApprovalRequest>;
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>>;
    /// Atomically records `reviewer_id`'s vote, rejecting a second vote from
    /// the same reviewer. Returns the updated request.
    async fn record_vote(&self, id: Uuid, reviewer_id: &str, vote: ReviewVote) -> Result<ApprovalRequest>;
    /// Compare-and-swap: marks the approval's token consumed exactly once.
    /// Returns `Ok(true)` if this call performed the transition, `Ok(false)`
    /// if it was already consumed.
    async fn try_consume(&self, id: Uuid) -> Result<bool>;
}

pub struct PostgresApprovalStore {
    pool: PgPool,
}

impl PostgresApprovalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<ApprovalRequest> {
    let status: String = row.get("status");
    Ok(ApprovalRequest {
        id: row.get("id"),
        decision_id: row.get("decision_id"),
        tenant_id: row.get("tenant_id"),
        requester_id: row.get("requester_id"),
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| CoreError::InvariantViolation(format!("unknown approval status: {status}")))?,
        routing_rule_id: row.get("routing_rule_id"),
        routing_trace: row.get("routing_trace"),
        reviewer_id: row.get("reviewer_id"),
        reviewed_at: row.get("reviewed_at"),
        expires_at: row.get("expires_at"),
        quorum_required: row.get::<i16, _>("quorum_required") as u8,
        quorum_count: row.get::<i16, _>("quorum_count") as u8,
    })
}

#[async_trait]
impl ApprovalStore for PostgresApprovalStore {
    async fn create(&self, request: ApprovalRequest) -> Result<ApprovalRequest> {
        sqlx::query(
            r#"
            insert into approval_requests (
                id, decision_id, tenant_id, requester_id, status, routing_rule_id, routing_trace,
                reviewer_id, reviewed_at, expires_at, quorum_required, quorum_count
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(request.id)
        .bind(request.decision_id)
        .bind(&request.tenant_id)
        .bind(&request.requester_id)
        .bind(request.status.as_str())
        .bind(&request.routing_rule_id)
        .bind(&request.routing_trace)
        .bind(&request.reviewer_id)
        .bind(request.reviewed_at)
        .bind(request.expires_at)
        .bind(request.quorum_required as i16)
        .bind(request.quorum_count as i16)
        .execute(&self.pool)
        .await?;
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let row = sqlx::query("select * from approval_requests where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_request).transpose()
    }

    /// `approval_votes`'s `(approval_id, reviewer_id)` primary key rejects a
    /// second vote from the same reviewer with a unique-violation, which is
    /// surfaced here as `Conflict`.
    async fn record_vote(&self, id: Uuid, reviewer_id: &str, vote: ReviewVote) -> Result<ApprovalRequest> {
        let vote_str = match vote {
            ReviewVote::Approve => "APPROVE",
            ReviewVote::Deny => "DENY",
        };

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query("insert into approval_votes (approval_id, reviewer_id, vote) values ($1, $2, $3)")
            .bind(id)
            .bind(reviewer_id)
            .bind(vote_str)
            .execute(&mut *tx)
            .await;
        if let Err(sqlx::Error::Database(db_err)) = &insert {
            if db_err.is_unique_violation() {
                return Err(CoreError::Conflict(format!("{reviewer_id} already voted on approval {id}")));
            }
        }
        insert?;

        let row = match vote {
            ReviewVote::Deny => {
                sqlx::query(
                    r#"
                    update approval_requests
                    set status = 'DENIED', reviewer_id = $2, reviewed_at = now()
                    where id = $1
                    returning *
                    "#,
                )
                .bind(id)
                .bind(reviewer_id)
                .fetch_one(&mut *tx)
                .await?
            }
            ReviewVote::Approve => {
                sqlx::query(
                    r#"
                    update approval_requests
                    set
                        quorum_count = quorum_count + 1,
                        reviewer_id = $2,
                        status = case
                            when quorum_count + 1 >= quorum_required then 'APPROVED'
                            else status
                        end,
                        reviewed_at = case
                            when quorum_count + 1 >= quorum_required then now()
                            else reviewed_at
                        end
                    where id = $1
                    returning *
                    "#,
                )
                .bind(id)
                .bind(reviewer_id)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        row_to_request(&row)
    }

    async fn try_consume(&self, id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r#"
            update approval_requests
            set status = 'CONSUMED', token_consumed_at = now()
            where id = $1 and status = 'APPROVED'
            returning id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

pub struct ApprovalWorkflow {
    store: std::sync::Arc<dyn ApprovalStore>,
    signer: TokenSigner,
    default_ttl: ChronoDuration,
}

impl ApprovalWorkflow {
    pub fn new(store: std::sync::Arc<dyn ApprovalStore>, signer: TokenSigner, default_ttl: ChronoDuration) -> Self {
        Self { store, signer, default_ttl }
    }

    pub async fn create_for_decision(
        &self,
        decision: &Decision,
        requester_id: &str,
        rule: &RoutingRule,
    ) -> Result<ApprovalRequest> {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            decision_id: decision.id,
            tenant_id: decision.tenant_id.clone(),
            requester_id: requester_id.to_string(),
            status: ApprovalStatus::Pending,
            routing_rule_id: rule.id.clone(),
            routing_trace: format!(
                "matched rule {} (env={}, action_prefix={}, risk_level={})",
                rule.id, rule.env, rule.action_prefix, rule.risk_level
            ),
            reviewer_id: None,
            reviewed_at: None,
            expires_at: Utc::now() + self.default_ttl,
            quorum_required: rule.quorum.max(1),
            quorum_count: 0,
        };
        self.store.create(request).await
    }

    pub async fn get(&self, approval_id: Uuid) -> Result<Option<ApprovalRequest>> {
        self.store.get(approval_id).await
    }

    /// Casts one reviewer's vote, enforcing requester/reviewer separation
    /// when `separation_required` is set for the decision's environment.
    /// A single `Deny` vote denies the request outright; quorum is reached
    /// only once `quorum_required` distinct `Approve` votes have landed.
    pub async fn submit_review(
        &self,
        approval_id: Uuid,
        reviewer_id: &str,
        reviewer_roles: &[String],
        allowed_roles: &[String],
        separation_required: bool,
        vote: ReviewVote,
    ) -> Result<ApprovalRequest> {
        let request = self
            .store
            .get(approval_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("approval request {approval_id} not found")))?;

        if request.status != ApprovalStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "approval request {approval_id} is already {:?}", request.status
            )));
        }
        if request.expires_at <= Utc::now() {
            return Err(CoreError::Conflict(format!("approval request {approval_id} has expired")));
        }
        if separation_required && reviewer_id == request.requester_id {
            return Err(CoreError::InvalidRequest(
                "requester cannot review their own request".into(),
            ));
        }
        if !allowed_roles.is_empty() && !reviewer_roles.iter().any(|r| allowed_roles.contains(r)) {
            return Err(CoreError::InvalidRequest(
                "reviewer does not hold an allowed role for this routing rule".into(),
            ));
        }

        let updated = self.store.record_vote(approval_id, reviewer_id, vote).await?;
        if vote == ReviewVote::Deny {
            return Ok(updated);
        }
        Ok(updated)
    }

    /// Issues a one-time approval token for a request already at
    /// `Approved`. The caller is responsible for the approval→token hop
    /// happening exactly once per request.
    pub fn issue_token(
        &self,
        request: &ApprovalRequest,
        decision: &Decision,
        project_id: Option<&str>,
    ) -> Result<String> {
        if request.status != ApprovalStatus::Approved {
            return Err(CoreError::Conflict(format!(
                "approval request {} is not in Approved state", request.id
            )));
        }
        let issued_at = Utc::now();
        let max_expires_at = issued_at + ChronoDuration::hours(24);
        let claims = TokenClaims {
            tenant_id: request.tenant_id.clone(),
            project_id: project_id.map(str::to_string),
            environment: decision.environment.as_str().to_string(),
            source: decision.source.as_str().to_string(),
            decision_id: decision.id,
            approval_id: request.id,
            fingerprint: decision.request_fingerprint.clone(),
            max_monthly_delta_usd: decision.estimated_monthly_delta_usd,
            max_hourly_delta_usd: decision.estimated_hourly_delta_usd,
            token_type: TOKEN_TYPE.to_string(),
            issued_at,
            expires_at: request.expires_at.min(max_expires_at),
            kid: String::new(),
        };
        self.signer.issue(&claims)
    }

    pub fn verify_and_bind(&self, token: &str, ctx: &BindingContext<'_>) -> Result<TokenClaims> {
        let claims = self.signer.verify(token)?;
        crate::approval::token::verify_binding(&claims, ctx)?;
        Ok(claims)
    }

    /// Atomically marks the token consumed; a second call for the same
    /// approval fails closed with `TokenAlreadyConsumed`.
    pub async fn consume(&self, approval_id: Uuid) -> Result<()> {
        if self.store.try_consume(approval_id).await? {
            Ok(())
        } else {
            Err(CoreError::TokenAlreadyConsumed)
        }
    }
}

/// Determines whether `quorum_count` (after incrementing for a fresh
/// `Approve` vote) has met `quorum_required`.
pub fn quorum_met(quorum_count: u8, quorum_required: u8) -> bool {
    quorum_count >= quorum_required
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        requests: Mutex<std::collections::HashMap<Uuid, ApprovalRequest>>,
        voters: Mutex<std::collections::HashMap<Uuid, Vec<String>>>,
        consumed: Mutex<std::collections::HashSet<Uuid>>,
    }

    #[async_trait]
    impl ApprovalStore for FakeStore {
        async fn create(&self, request: ApprovalRequest) -> Result<ApprovalRequest> {
            self.requests.lock().unwrap().insert(request.id, request.clone());
            Ok(request)
        }

        async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
            Ok(self.requests.lock().unwrap().get(&id).cloned())
        }

        async fn record_vote(&self, id: Uuid, reviewer_id: &str, vote: ReviewVote) -> Result<ApprovalRequest> {
            let mut voters = self.voters.lock().unwrap();
            let entry = voters.entry(id).or_default();
            if entry.iter().any(|v| v == reviewer_id) {
                return Err(CoreError::Conflict("reviewer already voted".into()));
            }
            entry.push(reviewer_id.to_string());

            let mut requests = self.requests.lock().unwrap();
            let request = requests.get_mut(&id).unwrap();
            match vote {
                ReviewVote::Deny => {
                    request.status = ApprovalStatus::Denied;
                    request.reviewer_id = Some(reviewer_id.to_string());
                    request.reviewed_at = Some(Utc::now());
                }
                ReviewVote::Approve => {
                    request.quorum_count += 1;
                    request.reviewer_id = Some(reviewer_id.to_string());
                    if quorum_met(request.quorum_count, request.quorum_required) {
                        request.status = ApprovalStatus::Approved;
                        request.reviewed_at = Some(Utc::now());
                    }
                }
            }
            Ok(request.clone())
        }

        async fn try_consume(&self, id: Uuid) -> Result<bool> {
            Ok(self.consumed.lock().unwrap().insert(id))
        }
    }

    fn sample_rule() -> RoutingRule {
        RoutingRule {
            id: "rule-1".to_string(),
            env: "prod".to_string(),
            action_prefix: "create".to_string(),
            monthly_delta_threshold: "100.000000".to_string(),
            risk_level: "high".to_string(),
            allowed_reviewer_roles: vec!["billing_admin".to_string()],
            quorum: 1,
        }
    }

    fn sample_decision(id: Uuid) -> Decision {
        use crate::context::ComputedContext;
        use crate::decision::model::{DecisionStatus, Environment, Source};
        use crate::failsafe::{Mode, ModeScope};
        use crate::waterfall::WaterfallOutcome;
        use rust_decimal::Decimal;

        Decision {
            id,
            tenant_id: "tenant-1".to_string(),
            source: Source::Terraform,
            action: "create_instance".to_string(),
            project_id: Some("p-alpha".to_string()),
            environment: Environment::new("prod"),
            resource_ref: "aws_instance.web".to_string(),
            idempotency_key: "terraform:run-1:plan".to_string(),
            request_fingerprint: "fp-1".to_string(),
            status: DecisionStatus::RequireApproval,
            reason_code: "approval_routing_rule_matched".to_string(),
            estimated_monthly_delta_usd: Decimal::from(400),
            estimated_hourly_delta_usd: Decimal::new(56, 2),
            computed_context: ComputedContext::unavailable(),
            entitlement_waterfall: WaterfallOutcome {
                stages: Vec::new(),
                overall_pass: true,
                reason_code: "ok".to_string(),
                credit_allocations: Vec::new(),
            },
            credit_allocations: Vec::new(),
            policy_version: 1,
            policy_document_sha256: "abc".to_string(),
            policy_document_schema_version: 1,
            mode_scope: ModeScope { mode: Mode::Soft, scope: "terraform_mode_prod" },
            approval_request_id: None,
            created_at: Utc::now(),
        }
    }

    fn workflow() -> ApprovalWorkflow {
        ApprovalWorkflow::new(
            std::sync::Arc::new(FakeStore::default()),
            TokenSigner::new("kid-1", "secret", vec![]),
            ChronoDuration::minutes(30),
        )
    }

    #[tokio::test]
    async fn requester_cannot_review_own_request() {
        let wf = workflow();
        let decision_id = Uuid::new_v4();
        let decision = sample_decision(decision_id);
        let rule = sample_rule();
        let req = wf.create_for_decision(&decision, "alice", &rule).await.unwrap();
        let result = wf
            .submit_review(req.id, "alice", &["billing_admin".to_string()], &rule.allowed_reviewer_roles, true, ReviewVote::Approve)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn quorum_of_one_approves_and_issues_token() {
        let wf = workflow();
        let decision_id = Uuid::new_v4();
        let decision = sample_decision(decision_id);
        let rule = sample_rule();
        let req = wf.create_for_decision(&decision, "alice", &rule).await.unwrap();
        let reviewed = wf
            .submit_review(req.id, "bob", &["billing_admin".to_string()], &rule.allowed_reviewer_roles, true, ReviewVote::Approve)
            .await
            .unwrap();
        assert_eq!(reviewed.status, ApprovalStatus::Approved);
        let token = wf.issue_token(&reviewed, &decision, Some("p-alpha")).unwrap();
        assert!(token.split('.').count() == 3);
    }

    #[tokio::test]
    async fn deny_vote_short_circuits_quorum() {
        let wf = workflow();
        let decision = sample_decision(Uuid::new_v4());
        let mut rule = sample_rule();
        rule.quorum = 2;
        let req = wf.create_for_decision(&decision, "alice", &rule).await.unwrap();
        let reviewed = wf
            .submit_review(req.id, "bob", &["billing_admin".to_string()], &rule.allowed_reviewer_roles, true, ReviewVote::Deny)
            .await
            .unwrap();
        assert_eq!(reviewed.status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn token_consumed_at_most_once() {
        let wf = workflow();
        let id = Uuid::new_v4();
        assert!(wf.consume(id).await.is_ok());
        assert!(matches!(wf.consume(id).await, Err(CoreError::TokenAlreadyConsumed)));
    }
}
