//! Step credentials and request authenticators.
//!
//! A credential is a bearer token the controller issues at step creation. It
//! binds (job, step, uid, gid, node list, per-node task counts, expiry) under
//! a keyed SHA-256 signature. The step manager refuses a launch whose
//! credential does not verify, whose node list does not name the local node,
//! or whose identity differs from the launch payload. The stdio plane reuses
//! only the signature bytes as a connection token.
//!
//! Plugin identity travels as a "type/method" string prefix and is checked on
//! unpack, so a future capability can coexist with this one on the wire.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::codec::{PackBuf, UnpackBuf, UnpackError};

pub const CRED_SIGLEN: usize = 32;

const CRED_IDENTITY: &str = "auth/sha256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredError {
    #[error("credential plugin identity {0:?} not supported")]
    BadIdentity(String),
    #[error("credential signature mismatch")]
    BadSignature,
    #[error("credential expired")]
    Expired,
    #[error(transparent)]
    Unpack(#[from] UnpackError),
}

/// Cluster-wide signing key, loaded from the configuration (hex string).
#[derive(Clone)]
pub struct AuthKey {
    key: Vec<u8>,
}

impl AuthKey {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self { key: hex::decode(s)? })
    }

    pub fn from_bytes(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn sign(&self, payload: &[u8]) -> [u8; CRED_SIGLEN] {
        let mut h = Sha256::new();
        h.update(&self.key);
        h.update(payload);
        let digest = h.finalize();
        let mut sig = [0u8; CRED_SIGLEN];
        sig.copy_from_slice(&digest);
        sig
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Compare signatures without an early exit on the first differing byte.
pub fn sig_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub node_names: Vec<String>,
    pub tasks_per_node: Vec<u32>,
    /// Unix seconds; the credential dies with the step's time limit.
    pub expires: i64,
    signature: [u8; CRED_SIGLEN],
}

impl Credential {
    pub fn issue(
        key: &AuthKey,
        job_id: u32,
        step_id: u32,
        uid: u32,
        gid: u32,
        node_names: Vec<String>,
        tasks_per_node: Vec<u32>,
        expires: i64,
    ) -> Self {
        let mut cred = Self {
            job_id,
            step_id,
            uid,
            gid,
            node_names,
            tasks_per_node,
            expires,
            signature: [0; CRED_SIGLEN],
        };
        cred.signature = key.sign(&cred.signed_payload());
        cred
    }

    pub fn signature(&self) -> &[u8; CRED_SIGLEN] {
        &self.signature
    }

    /// Verify the signature and expiry against `now`.
    pub fn verify(&self, key: &AuthKey, now: i64) -> Result<(), CredError> {
        let expect = key.sign(&self.signed_payload());
        if !sig_eq(&expect, &self.signature) {
            return Err(CredError::BadSignature);
        }
        if self.expires != 0 && now > self.expires {
            return Err(CredError::Expired);
        }
        Ok(())
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_names.iter().any(|n| n == name)
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut p = PackBuf::new();
        self.pack_fields(&mut p);
        p.into_inner()
    }

    fn pack_fields(&self, p: &mut PackBuf) {
        p.pack_u32(self.job_id);
        p.pack_u32(self.step_id);
        p.pack_u32(self.uid);
        p.pack_u32(self.gid);
        p.pack_str_array(&self.node_names);
        p.pack_u32_array(&self.tasks_per_node);
        p.pack_time(self.expires);
    }

    pub fn pack(&self, p: &mut PackBuf) {
        p.pack_str(CRED_IDENTITY);
        self.pack_fields(p);
        p.pack_mem(&self.signature);
    }

    pub fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, CredError> {
        let identity = u.unpack_str()?;
        if identity != CRED_IDENTITY {
            return Err(CredError::BadIdentity(identity));
        }
        let job_id = u.unpack_u32()?;
        let step_id = u.unpack_u32()?;
        let uid = u.unpack_u32()?;
        let gid = u.unpack_u32()?;
        let node_names = u.unpack_str_array()?;
        let tasks_per_node = u.unpack_u32_array()?;
        let expires = u.unpack_time()?;
        let sig_bytes = u.unpack_mem()?;
        if sig_bytes.len() != CRED_SIGLEN {
            return Err(CredError::Unpack(UnpackError::BadValue("signature length")));
        }
        let mut signature = [0u8; CRED_SIGLEN];
        signature.copy_from_slice(&sig_bytes);
        Ok(Self {
            job_id,
            step_id,
            uid,
            gid,
            node_names,
            tasks_per_node,
            expires,
            signature,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut p = PackBuf::new();
        self.pack(&mut p);
        p.into_inner()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CredError> {
        let mut u = UnpackBuf::new(data);
        let cred = Self::unpack(&mut u)?;
        u.expect_done()?;
        Ok(cred)
    }
}

/// Per-request caller identity: uid/gid signed with the cluster key. Every
/// RPC envelope carries one; the receiver extracts the identity only after
/// the signature checks out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub uid: u32,
    pub gid: u32,
    signature: [u8; CRED_SIGLEN],
}

impl AuthToken {
    pub fn issue(key: &AuthKey, uid: u32, gid: u32) -> Self {
        let mut payload = PackBuf::new();
        payload.pack_u32(uid);
        payload.pack_u32(gid);
        Self {
            uid,
            gid,
            signature: key.sign(&payload.into_inner()),
        }
    }

    pub fn verify(&self, key: &AuthKey) -> Result<(), CredError> {
        let mut payload = PackBuf::new();
        payload.pack_u32(self.uid);
        payload.pack_u32(self.gid);
        let expect = key.sign(&payload.into_inner());
        if !sig_eq(&expect, &self.signature) {
            return Err(CredError::BadSignature);
        }
        Ok(())
    }

    pub fn pack(&self, p: &mut PackBuf) {
        p.pack_u32(self.uid);
        p.pack_u32(self.gid);
        p.pack_mem(&self.signature);
    }

    pub fn unpack(u: &mut UnpackBuf<'_>) -> Result<Self, CredError> {
        let uid = u.unpack_u32()?;
        let gid = u.unpack_u32()?;
        let sig_bytes = u.unpack_mem()?;
        if sig_bytes.len() != CRED_SIGLEN {
            return Err(CredError::Unpack(UnpackError::BadValue("signature length")));
        }
        let mut signature = [0u8; CRED_SIGLEN];
        signature.copy_from_slice(&sig_bytes);
        Ok(Self { uid, gid, signature })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        AuthKey::from_bytes(b"0123456789abcdef0123456789abcdef".to_vec())
    }

    fn sample(key: &AuthKey) -> Credential {
        Credential::issue(
            key,
            42,
            0,
            1000,
            1000,
            vec!["n0".into(), "n1".into()],
            vec![2, 2],
            2_000_000_000,
        )
    }

    #[test]
    fn pack_unpack_verifies() {
        let key = key();
        let cred = sample(&key);
        let bytes = cred.to_bytes();
        let back = Credential::from_bytes(&bytes).unwrap();
        assert_eq!(back, cred);
        back.verify(&key, 1_900_000_000).unwrap();
    }

    #[test]
    fn tamper_fails_verify() {
        let key = key();
        let mut cred = sample(&key);
        cred.job_id = 43;
        assert_eq!(
            cred.verify(&key, 1_900_000_000),
            Err(CredError::BadSignature)
        );
    }

    #[test]
    fn wrong_key_fails_verify() {
        let cred = sample(&key());
        let other = AuthKey::from_bytes(b"ffffffffffffffffffffffffffffffff".to_vec());
        assert_eq!(
            cred.verify(&other, 1_900_000_000),
            Err(CredError::BadSignature)
        );
    }

    #[test]
    fn expiry_enforced() {
        let key = key();
        let cred = sample(&key);
        assert_eq!(cred.verify(&key, 2_000_000_001), Err(CredError::Expired));
    }

    #[test]
    fn identity_prefix_checked() {
        let key = key();
        let cred = sample(&key);
        let mut p = PackBuf::new();
        p.pack_str("auth/none");
        cred.pack_fields(&mut p);
        p.pack_mem(cred.signature());
        let err = Credential::from_bytes(&p.into_inner()).unwrap_err();
        assert!(matches!(err, CredError::BadIdentity(_)));
    }

    #[test]
    fn node_membership() {
        let cred = sample(&key());
        assert!(cred.has_node("n1"));
        assert!(!cred.has_node("n9"));
    }

    #[test]
    fn auth_token_round_trip() {
        let key = key();
        let tok = AuthToken::issue(&key, 500, 500);
        let mut p = PackBuf::new();
        tok.pack(&mut p);
        let bytes = p.into_inner();
        let mut u = UnpackBuf::new(&bytes);
        let back = AuthToken::unpack(&mut u).unwrap();
        assert_eq!(back, tok);
        back.verify(&key).unwrap();
        let other = AuthKey::from_bytes(vec![1, 2, 3]);
        assert!(back.verify(&other).is_err());
    }

    #[test]
    fn constant_time_compare_basics() {
        assert!(sig_eq(b"abc", b"abc"));
        assert!(!sig_eq(b"abc", b"abd"));
        assert!(!sig_eq(b"abc", b"ab"));
    }
}
