//! SKA Crypto - Digest construction and signature verification
//!
//! The digest layout is fixed and versioned: a domain separator binds the
//! authority name, version, chain id, and verifying identity; struct hashes
//! cover the authorization and every call; the signed digest is
//! `0x19 0x01 ‖ domain separator ‖ combined hash`. Any single-field mutation
//! anywhere in the authorization or batch changes the recovered signer.
//!
//! Verification rejects malformed encodings, non-canonical high-order `s`
//! values, and recovery ids other than 27/28 before attempting recovery, so
//! malleated signatures can never alias an already-used channel nonce.

#![deny(unsafe_code)]

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use ska_types::{
    Address, CallBatch, ChainId, Hash32, SessionAuthorization, Signature, SponsorVoucher,
};
use thiserror::Error;

pub use k256::ecdsa::SigningKey;

/// Fixed authority name bound into every domain separator.
pub const DOMAIN_NAME: &str = "SessionKeyAuthority";

/// Fixed encoding version bound into every domain separator.
pub const DOMAIN_VERSION: &str = "1";

const DOMAIN_TYPE: &[u8] = b"SkaDomain(string name,string version,uint64 chainId,address verifier)";
const AUTH_TYPE: &[u8] = b"SessionAuthorization(uint64 chainId,address principal,uint64 sessionId,uint64 nonce,uint64 expiresAt,bytes32 policyId,bytes32 snapshotHash,bytes32 callsHash,uint64 callCostCeiling,uint64 feePerCostCeiling,uint64 priorityFeeCeiling,uint64 totalCostCeiling)";
const CALL_TYPE: &[u8] = b"Call(address target,uint128 value,bytes32 payloadHash,uint64 costCeiling)";
const EXEC_TYPE: &[u8] =
    b"Execution(bytes32 authHash,bytes32 callsArrayHash,bool revertOnFail,bytes32 callsContentHash)";
const VOUCHER_TYPE: &[u8] = b"SponsorVoucher(address funder,uint64 callCostCeiling,uint64 feePerCostCeiling,uint64 priorityFeeCeiling,uint64 totalCostCeiling,bytes32 authHash)";

/// Signature or recovery failures. Each malformed shape is distinct.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Malformed signature encoding")]
    MalformedSignature,

    #[error("Invalid recovery id: {0} (only 27 and 28 are legal)")]
    InvalidRecoveryId(u8),

    #[error("Non-canonical high-order s value")]
    NonCanonicalS,

    #[error("Signer recovery failed")]
    RecoveryFailed,

    #[error("Signing failed")]
    SigningFailed,
}

/// Keccak-256 convenience wrapper.
pub fn keccak256(data: impl AsRef<[u8]>) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    Hash32(hasher.finalize().into())
}

fn push_hash(buf: &mut Vec<u8>, hash: &Hash32) {
    buf.extend_from_slice(&hash.0);
}

fn push_address(buf: &mut Vec<u8>, addr: &Address) {
    buf.extend_from_slice(&[0u8; 12]);
    buf.extend_from_slice(&addr.0);
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&[0u8; 24]);
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_u128(buf: &mut Vec<u8>, value: u128) {
    buf.extend_from_slice(&[0u8; 16]);
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_bool(buf: &mut Vec<u8>, value: bool) {
    buf.extend_from_slice(&[0u8; 31]);
    buf.push(u8::from(value));
}

/// Domain separator over the fixed name/version plus chain id and verifier.
pub fn domain_separator(chain_id: ChainId, verifier: Address) -> Hash32 {
    let mut buf = Vec::with_capacity(5 * 32);
    push_hash(&mut buf, &keccak256(DOMAIN_TYPE));
    push_hash(&mut buf, &keccak256(DOMAIN_NAME.as_bytes()));
    push_hash(&mut buf, &keccak256(DOMAIN_VERSION.as_bytes()));
    push_u64(&mut buf, chain_id.0);
    push_address(&mut buf, &verifier);
    keccak256(&buf)
}

/// Struct hash over the authorization fields in their fixed order.
pub fn auth_struct_hash(auth: &SessionAuthorization) -> Hash32 {
    let mut buf = Vec::with_capacity(13 * 32);
    push_hash(&mut buf, &keccak256(AUTH_TYPE));
    push_u64(&mut buf, auth.chain_id.0);
    push_address(&mut buf, &auth.principal);
    push_u64(&mut buf, auth.session_id.0);
    push_u64(&mut buf, auth.nonce);
    push_u64(&mut buf, auth.expires_at as u64);
    push_hash(&mut buf, &auth.policy_id.0);
    push_hash(&mut buf, &auth.snapshot_hash);
    push_hash(&mut buf, &auth.calls_hash);
    push_u64(&mut buf, auth.call_cost_ceiling);
    push_u64(&mut buf, auth.fee_per_cost_ceiling);
    push_u64(&mut buf, auth.priority_fee_ceiling);
    push_u64(&mut buf, auth.total_cost_ceiling);
    keccak256(&buf)
}

/// Struct hash over one call. The payload enters through its hash only.
pub fn call_struct_hash(call: &ska_types::Call) -> Hash32 {
    let mut buf = Vec::with_capacity(5 * 32);
    push_hash(&mut buf, &keccak256(CALL_TYPE));
    push_address(&mut buf, &call.target);
    push_u128(&mut buf, call.value);
    push_hash(&mut buf, &keccak256(&call.payload));
    push_u64(&mut buf, call.cost_ceiling);
    keccak256(&buf)
}

/// Hash of the concatenated per-call struct hashes, in batch order.
pub fn calls_array_hash(batch: &CallBatch) -> Hash32 {
    let mut buf = Vec::with_capacity(batch.len() * 32);
    for call in batch.calls() {
        push_hash(&mut buf, &call_struct_hash(call));
    }
    keccak256(&buf)
}

/// Deterministic content hash of a batch under its canonical raw encoding.
/// This is the value a principal commits to in `calls_hash`.
pub fn batch_content_hash(batch: &CallBatch) -> Hash32 {
    let mut buf = Vec::new();
    for call in batch.calls() {
        buf.extend_from_slice(&call.target.0);
        buf.extend_from_slice(&call.value.to_be_bytes());
        buf.extend_from_slice(&(call.payload.len() as u64).to_be_bytes());
        buf.extend_from_slice(&call.payload);
        buf.extend_from_slice(&call.cost_ceiling.to_be_bytes());
    }
    keccak256(&buf)
}

fn prefixed_digest(separator: &Hash32, combined: &Hash32) -> Hash32 {
    let mut buf = Vec::with_capacity(2 + 64);
    buf.push(0x19);
    buf.push(0x01);
    buf.extend_from_slice(&separator.0);
    buf.extend_from_slice(&combined.0);
    keccak256(&buf)
}

/// The digest a principal signs to authorize one batch execution.
pub fn execution_digest(
    chain_id: ChainId,
    verifier: Address,
    auth: &SessionAuthorization,
    batch: &CallBatch,
    revert_on_fail: bool,
) -> Hash32 {
    let mut buf = Vec::with_capacity(5 * 32);
    push_hash(&mut buf, &keccak256(EXEC_TYPE));
    push_hash(&mut buf, &auth_struct_hash(auth));
    push_hash(&mut buf, &calls_array_hash(batch));
    push_bool(&mut buf, revert_on_fail);
    push_hash(&mut buf, &batch_content_hash(batch));
    prefixed_digest(&domain_separator(chain_id, verifier), &keccak256(&buf))
}

/// The digest a funder signs to co-authorize the cost terms of one session.
/// Binding the authorization struct hash in prevents a voucher issued for
/// different terms (or a different session) from being reused.
pub fn voucher_digest(
    chain_id: ChainId,
    verifier: Address,
    voucher: &SponsorVoucher,
    auth: &SessionAuthorization,
) -> Hash32 {
    let mut buf = Vec::with_capacity(7 * 32);
    push_hash(&mut buf, &keccak256(VOUCHER_TYPE));
    push_address(&mut buf, &voucher.funder);
    push_u64(&mut buf, voucher.call_cost_ceiling);
    push_u64(&mut buf, voucher.fee_per_cost_ceiling);
    push_u64(&mut buf, voucher.priority_fee_ceiling);
    push_u64(&mut buf, voucher.total_cost_ceiling);
    push_hash(&mut buf, &auth_struct_hash(auth));
    prefixed_digest(&domain_separator(chain_id, verifier), &keccak256(&buf))
}

/// Recover the signer identity from a digest and an (r, s, v) signature.
///
/// Pure function of its inputs. Malleability guards run before recovery.
pub fn recover(digest: &Hash32, signature: &Signature) -> Result<Address, CryptoError> {
    let parity = match signature.v {
        27 => 0u8,
        28 => 1u8,
        other => return Err(CryptoError::InvalidRecoveryId(other)),
    };

    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(&signature.r);
    raw[32..].copy_from_slice(&signature.s);
    let sig = EcdsaSignature::from_slice(&raw).map_err(|_| CryptoError::MalformedSignature)?;

    if sig.normalize_s().is_some() {
        return Err(CryptoError::NonCanonicalS);
    }

    let recovery_id = RecoveryId::from_byte(parity).ok_or(CryptoError::InvalidRecoveryId(signature.v))?;
    let key = VerifyingKey::recover_from_prehash(&digest.0, &sig, recovery_id)
        .map_err(|_| CryptoError::RecoveryFailed)?;

    Ok(address_of(&key))
}

/// Identity of a verifying key: trailing 20 bytes of the hashed public point.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash.0[12..]);
    Address(addr)
}

/// Produce a canonical (low-s) recoverable signature over a digest.
pub fn sign_digest(key: &SigningKey, digest: &Hash32) -> Result<Signature, CryptoError> {
    let (sig, recovery_id) = key
        .sign_prehash_recoverable(&digest.0)
        .map_err(|_| CryptoError::SigningFailed)?;

    let bytes = sig.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);

    Ok(Signature {
        r,
        s,
        v: 27 + recovery_id.to_byte(),
    })
}
