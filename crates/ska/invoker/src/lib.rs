//! SKA Invoker - The single orchestration entry point
//!
//! One request flows through a fixed pipeline: batch shape, calls-hash
//! binding, expiry, signature recovery, (voucher co-signature), ceiling
//! sanity, policy verdict, nonce write, execution, cost measurement,
//! sponsorship settlement, audit record, advisory hooks. Every check before
//! the nonce write is a hard precondition with no state change on failure;
//! the nonce write is the first mutation.
//!
//! The execution substrate is abstracted behind [`CallExecutor`]; an
//! in-memory substrate, [`MemoryExecutor`], ships for tests and demos.

#![deny(unsafe_code)]

use chrono::Utc;
use ska_audit::{AuditError, AuditLog};
use ska_crypto::{batch_content_hash, execution_digest, recover, voucher_digest, CryptoError};
use ska_nonce::{channel_key, ChannelNonceStore, NonceError};
use ska_policy::{
    CodeInspector, Policy, PolicyError, PolicyRegistry, RegistryError, ValidationContext,
};
use ska_sponsor::{PayoutSink, SponsorError, SponsorLedger};
use ska_types::{
    Address, AuditEvent, CallBatch, ChainId, ExecutionRecord, Hash32, SessionAuthorization,
    Signature, SponsorVoucher, VerdictCode, MAX_BATCH_CALLS,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Fixed substrate overhead added to the measured per-call cost.
pub const BASE_OVERHEAD_COST: u64 = 21_000;

/// Outcome of one executed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub cost_used: u64,
}

/// The external execution substrate. One instance carries the state a batch
/// executes against; `checkpoint`/`revert_to` give the all-or-nothing
/// semantics of the revert-on-fail path.
pub trait CallExecutor {
    /// Whether `target` is an executable entity rather than a bare identity.
    fn is_executable(&self, target: Address) -> bool;

    /// Content hash of the target's executable code, when it has any.
    fn code_hash(&self, target: Address) -> Option<Hash32>;

    /// Mark a revert point covering all subsequent effects.
    fn checkpoint(&mut self) -> u64;

    /// Discard every effect since `checkpoint`.
    fn revert_to(&mut self, checkpoint: u64);

    fn execute(&mut self, call: &ska_types::Call) -> CallOutcome;

    /// Deliver a reimbursement. Returning false refuses the funds.
    fn credit(&mut self, payee: Address, amount: u128) -> bool;
}

/// Shape checks on a submitted batch. Pure; runs before anything else.
pub fn validate_batch(batch: &CallBatch) -> Result<(), InvokeError> {
    if batch.is_empty() {
        return Err(InvokeError::EmptyBatch);
    }
    if batch.len() > MAX_BATCH_CALLS {
        return Err(InvokeError::BatchTooLarge(batch.len()));
    }
    for (index, call) in batch.calls().iter().enumerate() {
        if call.target.is_zero() {
            return Err(InvokeError::ZeroAddressTarget(index));
        }
    }
    Ok(())
}

struct InspectorAdapter<'a>(&'a dyn CallExecutor);

impl CodeInspector for InspectorAdapter<'_> {
    fn is_executable(&self, target: Address) -> bool {
        self.0.is_executable(target)
    }

    fn code_hash(&self, target: Address) -> Option<Hash32> {
        self.0.code_hash(target)
    }
}

struct PayoutAdapter<'a>(&'a mut dyn CallExecutor);

impl PayoutSink for PayoutAdapter<'_> {
    fn credit(&mut self, payee: Address, amount: u128) -> bool {
        self.0.credit(payee, amount)
    }
}

/// Result of one settled request.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub principal: Address,
    pub cost_used: u64,
    /// True only when every call succeeded.
    pub all_succeeded: bool,
    pub outcomes: Vec<CallOutcome>,
}

/// The orchestrator. Holds the shared stores and the signing domain it
/// verifies against.
pub struct Invoker {
    registry: Arc<PolicyRegistry>,
    nonces: Arc<ChannelNonceStore>,
    sponsor: Arc<SponsorLedger>,
    audit: Arc<AuditLog>,
    chain_id: ChainId,
    verifier: Address,
}

impl Invoker {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        nonces: Arc<ChannelNonceStore>,
        sponsor: Arc<SponsorLedger>,
        audit: Arc<AuditLog>,
        chain_id: ChainId,
        verifier: Address,
    ) -> Self {
        Self {
            registry,
            nonces,
            sponsor,
            audit,
            chain_id,
            verifier,
        }
    }

    /// Execute one principal-signed batch. The submitting relayer is the
    /// reimbursement payee.
    pub fn execute_batch(
        &self,
        executor: &mut dyn CallExecutor,
        batch: &CallBatch,
        auth: &SessionAuthorization,
        signature: &Signature,
        revert_on_fail: bool,
        relayer: Address,
    ) -> Result<ExecutionReport, InvokeError> {
        self.dispatch(
            executor,
            batch,
            auth,
            signature,
            revert_on_fail,
            relayer,
            None,
            Some(relayer),
        )
    }

    /// Execute one funder-co-signed batch. The voucher pins the cost terms
    /// the funder agreed to; reimbursement is settled off this path, so no
    /// payee is reported.
    #[allow(clippy::too_many_arguments)]
    pub fn sponsored_execute(
        &self,
        executor: &mut dyn CallExecutor,
        batch: &CallBatch,
        auth: &SessionAuthorization,
        voucher: &SponsorVoucher,
        signature: &Signature,
        voucher_signature: &Signature,
        revert_on_fail: bool,
        relayer: Address,
    ) -> Result<ExecutionReport, InvokeError> {
        self.dispatch(
            executor,
            batch,
            auth,
            signature,
            revert_on_fail,
            relayer,
            Some((voucher, voucher_signature)),
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        executor: &mut dyn CallExecutor,
        batch: &CallBatch,
        auth: &SessionAuthorization,
        signature: &Signature,
        revert_on_fail: bool,
        relayer: Address,
        voucher: Option<(&SponsorVoucher, &Signature)>,
        payee: Option<Address>,
    ) -> Result<ExecutionReport, InvokeError> {
        let now = Utc::now();

        validate_batch(batch)?;

        let batch_hash = batch_content_hash(batch);
        if auth.calls_hash != batch_hash {
            return Err(InvokeError::CallsHashMismatch);
        }

        if auth.expires_at <= now.timestamp() {
            return Err(InvokeError::Expired(auth.expires_at));
        }

        let digest = execution_digest(self.chain_id, self.verifier, auth, batch, revert_on_fail);
        let recovered = recover(&digest, signature)?;
        if recovered != auth.principal {
            return Err(InvokeError::PrincipalMismatch {
                recovered,
                declared: auth.principal,
            });
        }

        if let Some((voucher, voucher_signature)) = voucher {
            if !voucher.matches_terms(auth) {
                return Err(InvokeError::VoucherTermMismatch);
            }
            let digest = voucher_digest(self.chain_id, self.verifier, voucher, auth);
            let signer = recover(&digest, voucher_signature)?;
            if signer != voucher.funder {
                return Err(InvokeError::VoucherSignerMismatch {
                    recovered: signer,
                    declared: voucher.funder,
                });
            }
        }

        if auth.call_cost_ceiling == 0 {
            return Err(InvokeError::ZeroCallCeiling);
        }
        if auth.total_cost_ceiling < auth.call_cost_ceiling {
            return Err(InvokeError::TotalBelowPerCall {
                total: auth.total_cost_ceiling,
                per_call: auth.call_cost_ceiling,
            });
        }
        for (index, call) in batch.calls().iter().enumerate() {
            if call.cost_ceiling > auth.call_cost_ceiling {
                return Err(InvokeError::CallCeilingTooHigh {
                    index,
                    ceiling: call.cost_ceiling,
                    limit: auth.call_cost_ceiling,
                });
            }
        }

        // Resolved fresh every request; a registry swap takes effect on the
        // very next submission.
        let policy = self.registry.get(auth.policy_id)?;
        let verdict = {
            let inspector = InspectorAdapter(&*executor);
            let ctx = ValidationContext {
                chain_id: self.chain_id,
                now,
                code: &inspector,
            };
            policy.validate(auth, batch, &ctx)?
        };
        if !verdict.ok {
            return Err(InvokeError::PolicyRejected(verdict.code));
        }

        // First state mutation. The nonce is consumed from here on, even if
        // execution reverts or funding is later refused.
        let channel = channel_key(auth.principal, auth.policy_id, auth.session_id);
        self.nonces.enforce(channel, auth.nonce)?;

        let checkpoint = if revert_on_fail {
            Some(executor.checkpoint())
        } else {
            None
        };
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut call_cost = 0u64;
        let mut all_succeeded = true;
        for (index, call) in batch.calls().iter().enumerate() {
            let outcome = if !call.payload.is_empty() && !executor.is_executable(call.target) {
                CallOutcome {
                    success: false,
                    cost_used: 0,
                }
            } else {
                executor.execute(call)
            };
            call_cost = call_cost.saturating_add(outcome.cost_used);
            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed {
                all_succeeded = false;
                tracing::debug!(index, target = %call.target, "call failed");
                if let Some(checkpoint) = checkpoint {
                    executor.revert_to(checkpoint);
                    break;
                }
            }
        }
        let cost_used = BASE_OVERHEAD_COST.saturating_add(call_cost);

        let funding = {
            let mut payout = PayoutAdapter(&mut *executor);
            self.sponsor.handle_sponsorship(
                auth.principal,
                cost_used,
                auth.policy_id,
                payee,
                now,
                &mut payout,
            )
        };

        let record = ExecutionRecord {
            principal: auth.principal,
            policy_id: auth.policy_id,
            batch_hash,
            snapshot_hash: auth.snapshot_hash,
            all_succeeded,
        };

        if let Err(err) = funding {
            // Execution already happened; only the funding step is refused.
            // Count the refusal against the breaker and surface it.
            if let Ok(Some(funder)) = self.sponsor.funder_of(auth.policy_id) {
                if let Err(record_err) = self.sponsor.record_failure(funder, auth.policy_id, now) {
                    tracing::warn!(error = %record_err, "failure recording failed");
                }
            }
            self.audit.append(now, AuditEvent::Execution(record))?;
            self.advise_failed(policy.as_ref(), relayer, auth, batch, "sponsorship refused");
            return Err(InvokeError::Sponsorship(err));
        }

        self.audit.append(now, AuditEvent::Execution(record))?;

        if all_succeeded {
            if let Err(err) = policy.on_executed(relayer, auth, batch, cost_used) {
                tracing::warn!(error = %err, "on_executed hook failed");
            }
        } else {
            self.advise_failed(policy.as_ref(), relayer, auth, batch, "per-call failure");
        }

        tracing::info!(
            principal = %auth.principal,
            policy = %auth.policy_id,
            cost_used,
            all_succeeded,
            "batch settled"
        );

        Ok(ExecutionReport {
            principal: auth.principal,
            cost_used,
            all_succeeded,
            outcomes,
        })
    }

    /// Failure hooks are advisory. A misbehaving hook never un-does a batch
    /// that already executed.
    fn advise_failed(
        &self,
        policy: &dyn Policy,
        relayer: Address,
        auth: &SessionAuthorization,
        batch: &CallBatch,
        reason: &str,
    ) {
        if let Err(err) = policy.on_failed(relayer, auth, batch, reason) {
            tracing::warn!(error = %err, "on_failed hook failed");
        }
    }
}

/// In-memory execution substrate. Contracts are addresses with a registered
/// code hash, a fixed execution cost, and an optional always-fail switch;
/// everything else is a bare identity holding a balance.
pub struct MemoryExecutor {
    balances: HashMap<Address, u128>,
    contracts: HashMap<Address, MemoryContract>,
    refuse_credit: std::collections::HashSet<Address>,
    snapshots: Vec<HashMap<Address, u128>>,
}

#[derive(Clone, Debug)]
struct MemoryContract {
    code_hash: Hash32,
    cost: u64,
    fail: bool,
}

/// Cost charged for a bare value transfer.
pub const TRANSFER_COST: u64 = 9_000;

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            balances: HashMap::new(),
            contracts: HashMap::new(),
            refuse_credit: std::collections::HashSet::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn install_contract(&mut self, target: Address, code_hash: Hash32, cost: u64, fail: bool) {
        self.contracts.insert(
            target,
            MemoryContract {
                code_hash,
                cost,
                fail,
            },
        );
    }

    /// Make a payee refuse reimbursement credits.
    pub fn refuse_credits(&mut self, payee: Address) {
        self.refuse_credit.insert(payee);
    }

    pub fn balance_of(&self, who: Address) -> u128 {
        self.balances.get(&who).copied().unwrap_or(0)
    }
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CallExecutor for MemoryExecutor {
    fn is_executable(&self, target: Address) -> bool {
        self.contracts.contains_key(&target)
    }

    fn code_hash(&self, target: Address) -> Option<Hash32> {
        self.contracts.get(&target).map(|c| c.code_hash)
    }

    fn checkpoint(&mut self) -> u64 {
        self.snapshots.push(self.balances.clone());
        (self.snapshots.len() - 1) as u64
    }

    fn revert_to(&mut self, checkpoint: u64) {
        if let Some(snapshot) = self.snapshots.get(checkpoint as usize) {
            self.balances = snapshot.clone();
            self.snapshots.truncate(checkpoint as usize);
        }
    }

    fn execute(&mut self, call: &ska_types::Call) -> CallOutcome {
        match self.contracts.get(&call.target) {
            Some(contract) => {
                let cost = contract.cost;
                if contract.fail {
                    return CallOutcome {
                        success: false,
                        cost_used: cost,
                    };
                }
                *self.balances.entry(call.target).or_insert(0) += call.value;
                CallOutcome {
                    success: true,
                    cost_used: cost,
                }
            }
            None => {
                *self.balances.entry(call.target).or_insert(0) += call.value;
                CallOutcome {
                    success: true,
                    cost_used: TRANSFER_COST,
                }
            }
        }
    }

    fn credit(&mut self, payee: Address, amount: u128) -> bool {
        if self.refuse_credit.contains(&payee) {
            return false;
        }
        *self.balances.entry(payee).or_insert(0) += amount;
        true
    }
}

/// Orchestration errors. One stable variant per hard failure; nothing is a
/// generic catch-all.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Empty call batch")]
    EmptyBatch,

    #[error("Batch of {0} calls exceeds the limit of {MAX_BATCH_CALLS}")]
    BatchTooLarge(usize),

    #[error("Call {0} targets the zero address")]
    ZeroAddressTarget(usize),

    #[error("Authorization does not cover the submitted batch")]
    CallsHashMismatch,

    #[error("Authorization expired at {0}")]
    Expired(i64),

    #[error("Recovered signer {recovered} is not the declared principal {declared}")]
    PrincipalMismatch {
        recovered: Address,
        declared: Address,
    },

    #[error("Voucher cost terms do not match the authorization")]
    VoucherTermMismatch,

    #[error("Voucher signer {recovered} is not the declared funder {declared}")]
    VoucherSignerMismatch {
        recovered: Address,
        declared: Address,
    },

    #[error("Per-call cost ceiling must be nonzero")]
    ZeroCallCeiling,

    #[error("Total cost ceiling {total} below per-call ceiling {per_call}")]
    TotalBelowPerCall { total: u64, per_call: u64 },

    #[error("Call {index} ceiling {ceiling} exceeds the authorized per-call ceiling {limit}")]
    CallCeilingTooHigh {
        index: usize,
        ceiling: u64,
        limit: u64,
    },

    #[error("Policy rejected the request: {0}")]
    PolicyRejected(VerdictCode),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Nonce(#[from] NonceError),

    #[error(transparent)]
    Sponsorship(#[from] SponsorError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}
