//! SKA Types - The shared data model of the Session Key Authority
//!
//! A principal signs a [`SessionAuthorization`] once; an untrusted relayer
//! may then submit bounded [`CallBatch`]es on the principal's behalf while a
//! tiered funding hierarchy tracks who pays for execution.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Largest number of calls a single batch may carry (denial-of-service bound).
pub const MAX_BATCH_CALLS: usize = 64;

/// Longest lifetime an authorization may declare, in seconds.
pub const MAX_SESSION_TTL_SECS: i64 = 30 * 24 * 3600;

/// A 20-byte account identity (principal, funder, relayer, or call target).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The null identity. Never a legal call target.
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A 32-byte hash value (content hashes, channel keys, snapshot commitments).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32(pub [u8; 32]);

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Domain (chain) identifier baked into every signed digest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered validation policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub Hash32);

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one session under a (principal, policy) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One requested action. Immutable once included in a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    /// Target identity. The zero address is rejected by batch validation.
    pub target: Address,
    /// Native value forwarded with the call.
    pub value: u128,
    /// Opaque payload. Non-empty payloads require an executable target.
    pub payload: Vec<u8>,
    /// Per-call cost ceiling. Zero inherits the authorization's ceiling.
    pub cost_ceiling: u64,
}

impl Call {
    /// First four payload bytes, the action selector, when present.
    pub fn selector(&self) -> Option<[u8; 4]> {
        if self.payload.len() >= 4 {
            let mut sel = [0u8; 4];
            sel.copy_from_slice(&self.payload[..4]);
            Some(sel)
        } else {
            None
        }
    }

    /// Cost ceiling this call runs under, given the batch-wide fallback.
    pub fn effective_cost_ceiling(&self, batch_ceiling: u64) -> u64 {
        if self.cost_ceiling == 0 {
            batch_ceiling
        } else {
            self.cost_ceiling
        }
    }
}

/// An ordered sequence of calls. Execution order is list order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBatch(pub Vec<Call>);

impl CallBatch {
    pub fn new(calls: Vec<Call>) -> Self {
        Self(calls)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn calls(&self) -> &[Call] {
        &self.0
    }
}

/// A signed, time-boxed credential scoping what a relayer may submit on a
/// principal's behalf. Single-use per (principal, policy, session, nonce).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAuthorization {
    pub chain_id: ChainId,
    pub principal: Address,
    pub session_id: SessionId,
    /// Monotonic per-channel replay nonce.
    pub nonce: u64,
    /// Unix seconds after which the authorization is dead.
    pub expires_at: i64,
    pub policy_id: PolicyId,
    /// Commitment to the policy's rule set at signing time.
    pub snapshot_hash: Hash32,
    /// Canonical content hash of the exact batch this credential covers.
    pub calls_hash: Hash32,
    /// Per-call execution cost ceiling. Must be nonzero.
    pub call_cost_ceiling: u64,
    /// Fee-rate ceiling per cost unit.
    pub fee_per_cost_ceiling: u64,
    /// Priority-fee ceiling per cost unit.
    pub priority_fee_ceiling: u64,
    /// Whole-batch cost ceiling. Must be at least the per-call ceiling.
    pub total_cost_ceiling: u64,
}

/// A funder's own signed commitment to the same ceiling fields as a
/// [`SessionAuthorization`], required only for funder-co-signed flows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorVoucher {
    pub funder: Address,
    pub call_cost_ceiling: u64,
    pub fee_per_cost_ceiling: u64,
    pub priority_fee_ceiling: u64,
    pub total_cost_ceiling: u64,
}

impl SponsorVoucher {
    /// A voucher binds only if its ceiling terms mirror the authorization's.
    pub fn matches_terms(&self, auth: &SessionAuthorization) -> bool {
        self.call_cost_ceiling == auth.call_cost_ceiling
            && self.fee_per_cost_ceiling == auth.fee_per_cost_ceiling
            && self.priority_fee_ceiling == auth.priority_fee_ceiling
            && self.total_cost_ceiling == auth.total_cost_ceiling
    }
}

/// A recoverable ECDSA signature in (r, s, v) form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// Recovery id. Only 27 and 28 are legal.
    pub v: u8,
}

/// Closed enumeration of policy verdict codes. Discriminants are stable and
/// part of the external interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum VerdictCode {
    Ok = 0,
    PolicyNotFound = 1,
    DomainMismatch = 2,
    Expired = 3,
    ExpiryTooLong = 4,
    NonceReused = 5,
    ValueExceeded = 6,
    TargetNotAllowed = 7,
    ActionNotAllowed = 8,
    PairNotAllowed = 9,
    TotalCostExceeded = 10,
    SnapshotMismatch = 11,
    DelegationNotAllowed = 12,
    TargetNotExecutable = 13,
}

impl VerdictCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for VerdictCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

/// A policy's validation outcome: boolean verdict plus the reason code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub ok: bool,
    pub code: VerdictCode,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            ok: true,
            code: VerdictCode::Ok,
        }
    }

    pub fn fail(code: VerdictCode) -> Self {
        Self { ok: false, code }
    }
}

/// Structured record of one completed execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub principal: Address,
    pub policy_id: PolicyId,
    pub batch_hash: Hash32,
    pub snapshot_hash: Hash32,
    /// True only when every call in the batch succeeded.
    pub all_succeeded: bool,
}

/// Record of a sponsor budget debit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SponsorshipUsedRecord {
    pub funder: Address,
    pub principal: Address,
    pub cost_used: u64,
    pub policy_id: PolicyId,
}

/// Record of a second-tier subsidy computation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubsidyPaidRecord {
    pub funder: Address,
    pub cost_used: u64,
    pub amount: u128,
    pub rate_bps: u16,
    pub policy_id: PolicyId,
    /// False when the engine balance could not cover the payout; the event
    /// still fires for off-system reconciliation.
    pub settled: bool,
}

/// Record of a reimbursement that could not be delivered. Soft by design.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReimbursementFailedRecord {
    pub payee: Address,
    pub amount: u128,
}

/// One append-only accounting event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditEvent {
    Execution(ExecutionRecord),
    SponsorshipUsed(SponsorshipUsedRecord),
    SubsidyPaid(SubsidyPaidRecord),
    ReimbursementFailed(ReimbursementFailedRecord),
}

/// Envelope for audit events: unique id plus timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: String,
    pub at: chrono::DateTime<chrono::Utc>,
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(at: chrono::DateTime<chrono::Utc>, event: AuditEvent) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            at,
            event,
        }
    }
}
